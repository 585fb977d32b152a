use crate::auth;
use crate::db;
use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::handlers::setup::SetupSection;
use crate::ipc::handlers::users::{insert_user, load_user_json};
use crate::ipc::helpers::{
    get_required_str, get_required_text, require_session, setting_i64, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn check_password_policy(conn: &Connection, password: &str) -> Result<(), HandlerErr> {
    let min = setting_i64(conn, SetupSection::Security, "minPasswordLength", 8)?;
    if (password.chars().count() as i64) < min {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            min
        )));
    }
    Ok(())
}

fn start_session(conn: &Connection, user_id: &str) -> Result<(String, String), HandlerErr> {
    let ttl_hours = setting_i64(conn, SetupSection::Security, "sessionTtlHours", 24)?;
    let now = chrono::Utc::now();
    let expires = now + chrono::Duration::hours(ttl_hours);
    let (token, token_hash) = auth::new_session_token();
    // Opportunistic cleanup of stale sessions.
    conn.execute(
        "DELETE FROM sessions WHERE expires_at <= ?",
        [db::now_ts()],
    )
    .map_err(db_table_err("db_delete_failed", "sessions"))?;
    let expires_at = expires.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    conn.execute(
        "INSERT INTO sessions(token_hash, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (&token_hash, user_id, db::now_ts(), &expires_at),
    )
    .map_err(db_table_err("db_insert_failed", "sessions"))?;
    Ok((token, expires_at))
}

fn auth_bootstrap(conn: &Connection, req: &Request) -> HandlerResult {
    let users: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(db_err("db_query_failed"))?;
    if users > 0 {
        return Err(HandlerErr::conflict("workspace already has users"));
    }
    let email = get_required_str(&req.params, "email")?;
    let name = get_required_text(&req.params, "name", 120)?;
    let password = get_required_str(&req.params, "password")?;
    check_password_policy(conn, &password)?;
    let user_id = insert_user(conn, &email, &name, Role::Admin, &password)?;
    tracing::info!(user_id = %user_id, "bootstrap admin created");
    let (token, expires_at) = start_session(conn, &user_id)?;
    Ok(json!({
        "session": token,
        "expiresAt": expires_at,
        "user": load_user_json(conn, &user_id)?,
    }))
}

fn auth_login(conn: &Connection, req: &Request) -> HandlerResult {
    let email = get_required_str(&req.params, "email")?;
    let password = get_required_str(&req.params, "password")?;
    let Some(email) = auth::normalize_email(&email) else {
        return Err(HandlerErr::new("unauthorized", "invalid email or password"));
    };
    let row: Option<(String, String, String, i64)> = conn
        .query_row(
            "SELECT id, password_hash, password_salt, active FROM users WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((user_id, hash, salt, active)) = row else {
        return Err(HandlerErr::new("unauthorized", "invalid email or password"));
    };
    if !auth::verify_password(&password, &salt, &hash) {
        return Err(HandlerErr::new("unauthorized", "invalid email or password"));
    }
    if active == 0 {
        return Err(HandlerErr::new("unauthorized", "account is deactivated"));
    }
    let (token, expires_at) = start_session(conn, &user_id)?;
    tracing::info!(user_id = %user_id, "login");
    Ok(json!({
        "session": token,
        "expiresAt": expires_at,
        "user": load_user_json(conn, &user_id)?,
    }))
}

fn auth_logout(conn: &Connection, req: &Request) -> HandlerResult {
    require_session(conn, req)?;
    if let Some(token) = req.session.as_deref() {
        conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?",
            [auth::session_token_hash(token)],
        )
        .map_err(db_table_err("db_delete_failed", "sessions"))?;
    }
    Ok(json!({ "ok": true }))
}

fn auth_me(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    Ok(json!({ "user": load_user_json(conn, &caller.user_id)? }))
}

fn auth_change_password(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let current = get_required_str(&req.params, "currentPassword")?;
    let next = get_required_str(&req.params, "newPassword")?;
    let (hash, salt): (String, String) = conn
        .query_row(
            "SELECT password_hash, password_salt FROM users WHERE id = ?",
            [&caller.user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err("db_query_failed"))?;
    if !auth::verify_password(&current, &salt, &hash) {
        return Err(HandlerErr::new("unauthorized", "current password is incorrect"));
    }
    check_password_policy(conn, &next)?;
    let new_salt = auth::new_salt();
    let new_hash = auth::hash_password(&next, &new_salt);
    conn.execute(
        "UPDATE users SET password_hash = ?, password_salt = ? WHERE id = ?",
        (&new_hash, &new_salt, &caller.user_id),
    )
    .map_err(db_table_err("db_update_failed", "users"))?;
    // Other sessions of this user are revoked.
    let keep = req
        .session
        .as_deref()
        .map(auth::session_token_hash)
        .unwrap_or_default();
    conn.execute(
        "DELETE FROM sessions WHERE user_id = ? AND token_hash <> ?",
        (&caller.user_id, &keep),
    )
    .map_err(db_table_err("db_delete_failed", "sessions"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.bootstrap" => Some(with_db(state, req, auth_bootstrap)),
        "auth.login" => Some(with_db(state, req, auth_login)),
        "auth.logout" => Some(with_db(state, req, auth_logout)),
        "auth.me" => Some(with_db(state, req, auth_me)),
        "auth.changePassword" => Some(with_db(state, req, auth_change_password)),
        _ => None,
    }
}
