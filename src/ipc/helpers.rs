use crate::auth;
use crate::db;
use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::setup::{load_section, SetupSection};
use crate::ipc::types::{AppState, Request};
use crate::model::{ProjectStatus, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::Path;
use uuid::Uuid;

pub type HandlerResult = Result<Value, HandlerErr>;

pub fn with_db(
    state: &mut AppState,
    req: &Request,
    op: fn(&Connection, &Request) -> HandlerResult,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match op(conn, req) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn with_workspace(
    state: &mut AppState,
    req: &Request,
    op: fn(&Connection, &Path, &Request) -> HandlerResult,
) -> Value {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match op(conn, workspace, req) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

// ---- params ----

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed, non-empty, at most `max_len` characters.
pub fn get_required_text(params: &Value, key: &str, max_len: usize) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    let t = raw.trim();
    if t.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    if t.chars().count() > max_len {
        return Err(HandlerErr::bad_params(format!(
            "{} length must be <= {}",
            key, max_len
        )));
    }
    Ok(t.to_string())
}

/// Absent and `null` both read as `None`.
pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!(
            "{} must be string or null",
            key
        ))),
    }
}

pub fn get_optional_text(
    params: &Value,
    key: &str,
    max_len: usize,
) -> Result<Option<String>, HandlerErr> {
    let Some(s) = get_optional_str(params, key)? else {
        return Ok(None);
    };
    if s.chars().count() > max_len {
        return Err(HandlerErr::bad_params(format!(
            "{} length must be <= {}",
            key, max_len
        )));
    }
    Ok(Some(s))
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing numeric {}", key)))
}

pub fn parse_date(raw: &str, key: &str) -> Result<chrono::NaiveDate, HandlerErr> {
    chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

/// Accepts RFC 3339 or a local `YYYY-MM-DDTHH:MM`; stored as `YYYY-MM-DDTHH:MM`.
pub fn parse_datetime(raw: &str, key: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(t) {
        return Ok(dt
            .with_timezone(&chrono::Utc)
            .naive_utc()
            .format("%Y-%m-%dT%H:%M")
            .to_string());
    }
    chrono::NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M")
        .map(|dt| dt.format("%Y-%m-%dT%H:%M").to_string())
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DDTHH:MM", key)))
}

pub fn now_minute() -> String {
    chrono::Utc::now()
        .naive_utc()
        .format("%Y-%m-%dT%H:%M")
        .to_string()
}

pub fn today() -> String {
    chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

// ---- sessions & roles ----

#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub name: String,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn require_session(conn: &Connection, req: &Request) -> Result<Caller, HandlerErr> {
    let Some(token) = req.session.as_deref().filter(|t| !t.is_empty()) else {
        return Err(HandlerErr::new("unauthorized", "missing session"));
    };
    let token_hash = auth::session_token_hash(token);
    let row: Option<(String, String, String, i64, String)> = conn
        .query_row(
            "SELECT u.id, u.name, u.role, u.active, s.expires_at
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ?",
            [&token_hash],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((user_id, name, role_raw, active, expires_at)) = row else {
        return Err(HandlerErr::new("unauthorized", "invalid session"));
    };
    let expired = chrono::DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| t.with_timezone(&chrono::Utc) <= chrono::Utc::now())
        .unwrap_or(true);
    if expired || active == 0 {
        if let Err(e) = conn.execute("DELETE FROM sessions WHERE token_hash = ?", [&token_hash]) {
            tracing::warn!(error = %e, "failed to purge expired session");
        }
        return Err(HandlerErr::new("unauthorized", "session expired"));
    }
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::new("unauthorized", "unknown role on account"))?;
    Ok(Caller {
        user_id,
        name,
        role,
    })
}

pub fn require_role(caller: &Caller, allowed: &[Role]) -> Result<(), HandlerErr> {
    if allowed.contains(&caller.role) {
        Ok(())
    } else {
        Err(HandlerErr::forbidden(format!(
            "role {} may not perform this action",
            caller.role.as_str()
        )))
    }
}

pub fn session_with_role(
    conn: &Connection,
    req: &Request,
    allowed: &[Role],
) -> Result<Caller, HandlerErr> {
    let caller = require_session(conn, req)?;
    require_role(&caller, allowed)?;
    Ok(caller)
}

pub fn user_role(conn: &Connection, user_id: &str) -> Result<Option<Role>, HandlerErr> {
    let raw: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()
        .map_err(db_err("db_query_failed"))?;
    Ok(raw.as_deref().and_then(Role::parse))
}

// ---- projects & groups ----

#[derive(Debug, Clone)]
pub struct ProjectRef {
    pub id: String,
    pub group_id: String,
    pub guide_id: Option<String>,
    pub title: String,
    pub status: ProjectStatus,
}

pub fn load_project(conn: &Connection, project_id: &str) -> Result<ProjectRef, HandlerErr> {
    let row: Option<(String, String, Option<String>, String, String)> = conn
        .query_row(
            "SELECT id, group_id, guide_id, title, status FROM projects WHERE id = ?",
            [project_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((id, group_id, guide_id, title, status_raw)) = row else {
        return Err(HandlerErr::not_found("project"));
    };
    let status = ProjectStatus::parse(&status_raw).ok_or_else(|| {
        HandlerErr::new("db_query_failed", format!("unknown project status {}", status_raw))
    })?;
    Ok(ProjectRef {
        id,
        group_id,
        guide_id,
        title,
        status,
    })
}

pub fn student_group(conn: &Connection, student_id: &str) -> Result<Option<(String, bool)>, HandlerErr> {
    conn.query_row(
        "SELECT group_id, is_leader FROM student_profiles WHERE user_id = ? AND group_id IS NOT NULL",
        [student_id],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0)),
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

pub fn group_member_ids(conn: &Connection, group_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT sp.user_id
             FROM student_profiles sp
             JOIN users u ON u.id = sp.user_id
             WHERE sp.group_id = ?
             ORDER BY sp.is_leader DESC, u.name",
        )
        .map_err(db_err("db_query_failed"))?;
    stmt.query_map([group_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))
}

pub fn group_members_json(conn: &Connection, group_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name, u.email, sp.roll_no, sp.is_leader
             FROM student_profiles sp
             JOIN users u ON u.id = sp.user_id
             WHERE sp.group_id = ?
             ORDER BY sp.is_leader DESC, u.name",
        )
        .map_err(db_err("db_query_failed"))?;
    stmt.query_map([group_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "email": r.get::<_, String>(2)?,
            "rollNo": r.get::<_, Option<String>>(3)?,
            "isLeader": r.get::<_, i64>(4)? != 0,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err("db_query_failed"))
}

pub fn is_participant(conn: &Connection, caller: &Caller, project: &ProjectRef) -> Result<bool, HandlerErr> {
    match caller.role {
        Role::Admin => Ok(true),
        Role::Faculty => Ok(project.guide_id.as_deref() == Some(caller.user_id.as_str())),
        Role::Student => Ok(student_group(conn, &caller.user_id)?
            .map(|(g, _)| g == project.group_id)
            .unwrap_or(false)),
    }
}

pub fn require_participant(
    conn: &Connection,
    caller: &Caller,
    project: &ProjectRef,
) -> Result<(), HandlerErr> {
    if is_participant(conn, caller, project)? {
        Ok(())
    } else {
        Err(HandlerErr::forbidden("not a participant of this project"))
    }
}

pub fn require_guide_or_admin(caller: &Caller, project: &ProjectRef) -> Result<(), HandlerErr> {
    if caller.is_admin() || project.guide_id.as_deref() == Some(caller.user_id.as_str()) {
        Ok(())
    } else {
        Err(HandlerErr::forbidden("only the project guide or an admin may do this"))
    }
}

/// Group members plus guide, excluding `except`.
pub fn project_audience(
    conn: &Connection,
    project: &ProjectRef,
    except: Option<&str>,
) -> Result<Vec<String>, HandlerErr> {
    let mut out = group_member_ids(conn, &project.group_id)?;
    if let Some(g) = project.guide_id.as_ref() {
        out.push(g.clone());
    }
    out.retain(|u| Some(u.as_str()) != except);
    out.dedup();
    Ok(out)
}

pub fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(db_err("db_query_failed"))
}

// ---- notifications ----

pub fn notify(
    conn: &Connection,
    user_id: &str,
    kind: &str,
    message: &str,
    project_id: Option<&str>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO notifications(id, user_id, kind, message, project_id, read, created_at)
         VALUES(?, ?, ?, ?, ?, 0, ?)",
        (
            Uuid::new_v4().to_string(),
            user_id,
            kind,
            message,
            project_id,
            db::now_ts(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "notifications" }))
    })?;
    Ok(())
}

pub fn notify_all(
    conn: &Connection,
    user_ids: &[String],
    kind: &str,
    message: &str,
    project_id: Option<&str>,
) -> Result<(), HandlerErr> {
    for u in user_ids {
        notify(conn, u, kind, message, project_id)?;
    }
    Ok(())
}

// ---- settings ----

pub fn setting_i64(
    conn: &Connection,
    section: SetupSection,
    key: &str,
    default: i64,
) -> Result<i64, HandlerErr> {
    let v = load_section(conn, section).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(v.get(key).and_then(|x| x.as_i64()).unwrap_or(default))
}

pub fn setting_value(conn: &Connection, section: SetupSection, key: &str) -> Result<Value, HandlerErr> {
    let v = load_section(conn, section).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(v.get(key).cloned().unwrap_or(Value::Null))
}
