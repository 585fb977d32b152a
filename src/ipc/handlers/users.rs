use crate::auth;
use crate::db;
use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::handlers::auth::check_password_policy;
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_optional_text, get_required_str, get_required_text,
    row_exists, session_with_role, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn insert_user(
    conn: &Connection,
    email: &str,
    name: &str,
    role: Role,
    password: &str,
) -> Result<String, HandlerErr> {
    let Some(email) = auth::normalize_email(email) else {
        return Err(HandlerErr::bad_params("email is not valid"));
    };
    let taken = row_exists(conn, "SELECT 1 FROM users WHERE email = ?", &email)?;
    if taken {
        return Err(HandlerErr::conflict("email already registered"));
    }
    let user_id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    let hash = auth::hash_password(password, &salt);
    conn.execute(
        "INSERT INTO users(id, email, name, role, password_hash, password_salt, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &user_id,
            &email,
            name,
            role.as_str(),
            &hash,
            &salt,
            db::now_ts(),
        ),
    )
    .map_err(db_table_err("db_insert_failed", "users"))?;
    match role {
        Role::Student => {
            conn.execute(
                "INSERT INTO student_profiles(user_id, is_leader) VALUES(?, 0)",
                [&user_id],
            )
            .map_err(db_table_err("db_insert_failed", "student_profiles"))?;
        }
        Role::Faculty => {
            conn.execute(
                "INSERT INTO faculty_profiles(user_id) VALUES(?)",
                [&user_id],
            )
            .map_err(db_table_err("db_insert_failed", "faculty_profiles"))?;
        }
        Role::Admin => {}
    }
    Ok(user_id)
}

fn student_profile_json(conn: &Connection, user_id: &str) -> Result<Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT sp.roll_no, sp.department_id, d.name, sp.academic_year_id, ay.label,
                    sp.group_id, g.name, sp.is_leader
             FROM student_profiles sp
             LEFT JOIN departments d ON d.id = sp.department_id
             LEFT JOIN academic_years ay ON ay.id = sp.academic_year_id
             LEFT JOIN project_groups g ON g.id = sp.group_id
             WHERE sp.user_id = ?",
            [user_id],
            |r| {
                Ok(json!({
                    "rollNo": r.get::<_, Option<String>>(0)?,
                    "departmentId": r.get::<_, Option<String>>(1)?,
                    "departmentName": r.get::<_, Option<String>>(2)?,
                    "academicYearId": r.get::<_, Option<String>>(3)?,
                    "academicYearLabel": r.get::<_, Option<String>>(4)?,
                    "groupId": r.get::<_, Option<String>>(5)?,
                    "groupName": r.get::<_, Option<String>>(6)?,
                    "isLeader": r.get::<_, i64>(7)? != 0,
                }))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    Ok(row.unwrap_or(Value::Null))
}

fn faculty_profile_json(conn: &Connection, user_id: &str) -> Result<Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT fp.employee_no, fp.department_id, d.name, fp.designation, fp.max_load
             FROM faculty_profiles fp
             LEFT JOIN departments d ON d.id = fp.department_id
             WHERE fp.user_id = ?",
            [user_id],
            |r| {
                Ok(json!({
                    "employeeNo": r.get::<_, Option<String>>(0)?,
                    "departmentId": r.get::<_, Option<String>>(1)?,
                    "departmentName": r.get::<_, Option<String>>(2)?,
                    "designation": r.get::<_, Option<String>>(3)?,
                    "maxLoad": r.get::<_, Option<i64>>(4)?,
                }))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    Ok(row.unwrap_or(Value::Null))
}

pub fn load_user_json(conn: &Connection, user_id: &str) -> Result<Value, HandlerErr> {
    let row: Option<(String, String, String, i64, String)> = conn
        .query_row(
            "SELECT email, name, role, active, created_at FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((email, name, role, active, created_at)) = row else {
        return Err(HandlerErr::not_found("user"));
    };
    let profile = match Role::parse(&role) {
        Some(Role::Student) => student_profile_json(conn, user_id)?,
        Some(Role::Faculty) => faculty_profile_json(conn, user_id)?,
        _ => Value::Null,
    };
    Ok(json!({
        "id": user_id,
        "email": email,
        "name": name,
        "role": role,
        "active": active != 0,
        "createdAt": created_at,
        "profile": profile,
    }))
}

fn check_ref(conn: &Connection, sql: &str, id: &Option<String>, what: &str) -> Result<(), HandlerErr> {
    if let Some(id) = id.as_deref() {
        if !row_exists(conn, sql, id)? {
            return Err(HandlerErr::not_found(what));
        }
    }
    Ok(())
}

/// Applies the fields present in `profile`; absent keys are left untouched.
fn apply_profile(conn: &Connection, user_id: &str, role: Role, profile: &Value) -> Result<(), HandlerErr> {
    if profile.is_null() {
        return Ok(());
    }
    if !profile.is_object() {
        return Err(HandlerErr::bad_params("profile must be an object"));
    }
    let department_id = get_optional_str(profile, "departmentId")?;
    check_ref(conn, "SELECT 1 FROM departments WHERE id = ?", &department_id, "department")?;
    match role {
        Role::Student => {
            let roll_no = get_optional_text(profile, "rollNo", 40)?;
            let academic_year_id = get_optional_str(profile, "academicYearId")?;
            check_ref(
                conn,
                "SELECT 1 FROM academic_years WHERE id = ?",
                &academic_year_id,
                "academic year",
            )?;
            if let Some(r) = roll_no.as_ref() {
                let clash: Option<String> = conn
                    .query_row(
                        "SELECT user_id FROM student_profiles WHERE roll_no = ? AND user_id <> ?",
                        (r, user_id),
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err("db_query_failed"))?;
                if clash.is_some() {
                    return Err(HandlerErr::conflict("rollNo already in use"));
                }
            }
            if profile.get("rollNo").is_some() {
                conn.execute(
                    "UPDATE student_profiles SET roll_no = ? WHERE user_id = ?",
                    (&roll_no, user_id),
                )
                .map_err(db_table_err("db_update_failed", "student_profiles"))?;
            }
            if profile.get("departmentId").is_some() {
                conn.execute(
                    "UPDATE student_profiles SET department_id = ? WHERE user_id = ?",
                    (&department_id, user_id),
                )
                .map_err(db_table_err("db_update_failed", "student_profiles"))?;
            }
            if profile.get("academicYearId").is_some() {
                conn.execute(
                    "UPDATE student_profiles SET academic_year_id = ? WHERE user_id = ?",
                    (&academic_year_id, user_id),
                )
                .map_err(db_table_err("db_update_failed", "student_profiles"))?;
            }
        }
        Role::Faculty => {
            let employee_no = get_optional_text(profile, "employeeNo", 40)?;
            let designation = get_optional_text(profile, "designation", 80)?;
            let max_load = match profile.get("maxLoad") {
                None | Some(Value::Null) => None,
                Some(v) => {
                    let n = v
                        .as_i64()
                        .ok_or_else(|| HandlerErr::bad_params("maxLoad must be integer"))?;
                    if !(0..=50).contains(&n) {
                        return Err(HandlerErr::bad_params("maxLoad must be in 0..=50"));
                    }
                    Some(n)
                }
            };
            if let Some(e) = employee_no.as_ref() {
                let clash: Option<String> = conn
                    .query_row(
                        "SELECT user_id FROM faculty_profiles WHERE employee_no = ? AND user_id <> ?",
                        (e, user_id),
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err("db_query_failed"))?;
                if clash.is_some() {
                    return Err(HandlerErr::conflict("employeeNo already in use"));
                }
            }
            for (key, sql, value) in [
                (
                    "employeeNo",
                    "UPDATE faculty_profiles SET employee_no = ? WHERE user_id = ?",
                    employee_no,
                ),
                (
                    "departmentId",
                    "UPDATE faculty_profiles SET department_id = ? WHERE user_id = ?",
                    department_id,
                ),
                (
                    "designation",
                    "UPDATE faculty_profiles SET designation = ? WHERE user_id = ?",
                    designation,
                ),
            ] {
                if profile.get(key).is_some() {
                    conn.execute(sql, (&value, user_id))
                        .map_err(db_table_err("db_update_failed", "faculty_profiles"))?;
                }
            }
            if profile.get("maxLoad").is_some() {
                conn.execute(
                    "UPDATE faculty_profiles SET max_load = ? WHERE user_id = ?",
                    (max_load, user_id),
                )
                .map_err(db_table_err("db_update_failed", "faculty_profiles"))?;
            }
        }
        Role::Admin => {
            return Err(HandlerErr::bad_params("admins do not have a profile"));
        }
    }
    Ok(())
}

fn users_list(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let role_filter = match get_optional_str(&req.params, "role")? {
        Some(r) => Some(
            Role::parse(&r).ok_or_else(|| HandlerErr::bad_params("unknown role"))?,
        ),
        None => None,
    };
    let mut stmt = conn
        .prepare(
            "SELECT id FROM users
             WHERE (?1 IS NULL OR role = ?1)
             ORDER BY role, name",
        )
        .map_err(db_err("db_query_failed"))?;
    let ids = stmt
        .query_map([role_filter.map(|r| r.as_str())], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut users = Vec::with_capacity(ids.len());
    for id in ids {
        users.push(load_user_json(conn, &id)?);
    }
    Ok(json!({ "users": users }))
}

fn users_get(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let user_id = get_required_str(&req.params, "userId")?;
    Ok(json!({ "user": load_user_json(conn, &user_id)? }))
}

fn users_create(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let email = get_required_str(&req.params, "email")?;
    let name = get_required_text(&req.params, "name", 120)?;
    let role_raw = get_required_str(&req.params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params("role must be one of: admin, faculty, student"))?;
    let password = get_required_str(&req.params, "password")?;
    check_password_policy(conn, &password)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let user_id = insert_user(&tx, &email, &name, role, &password)?;
    if let Some(profile) = req.params.get("profile") {
        apply_profile(&tx, &user_id, role, profile)?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    tracing::info!(user_id = %user_id, role = role.as_str(), "user created");
    Ok(json!({ "user": load_user_json(conn, &user_id)? }))
}

fn users_update(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Admin])?;
    let user_id = get_required_str(&req.params, "userId")?;
    let role_raw: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(role) = role_raw.as_deref().and_then(Role::parse) else {
        return Err(HandlerErr::not_found("user"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    if let Some(name) = get_optional_text(&req.params, "name", 120)? {
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        tx.execute("UPDATE users SET name = ? WHERE id = ?", (&name, &user_id))
            .map_err(db_table_err("db_update_failed", "users"))?;
    }
    if let Some(email_raw) = get_optional_str(&req.params, "email")? {
        let email = auth::normalize_email(&email_raw)
            .ok_or_else(|| HandlerErr::bad_params("email is not valid"))?;
        let clash: Option<String> = tx
            .query_row(
                "SELECT id FROM users WHERE email = ? AND id <> ?",
                (&email, &user_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err("db_query_failed"))?;
        if clash.is_some() {
            return Err(HandlerErr::conflict("email already registered"));
        }
        tx.execute("UPDATE users SET email = ? WHERE id = ?", (&email, &user_id))
            .map_err(db_table_err("db_update_failed", "users"))?;
    }
    if let Some(active) = get_optional_bool(&req.params, "active")? {
        if !active && user_id == caller.user_id {
            return Err(HandlerErr::conflict("cannot deactivate your own account"));
        }
        tx.execute(
            "UPDATE users SET active = ? WHERE id = ?",
            (active as i64, &user_id),
        )
        .map_err(db_table_err("db_update_failed", "users"))?;
        if !active {
            tx.execute("DELETE FROM sessions WHERE user_id = ?", [&user_id])
                .map_err(db_table_err("db_delete_failed", "sessions"))?;
        }
    }
    if let Some(profile) = req.params.get("profile") {
        apply_profile(&tx, &user_id, role, profile)?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "user": load_user_json(conn, &user_id)? }))
}

fn users_delete(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Admin])?;
    let user_id = get_required_str(&req.params, "userId")?;
    if user_id == caller.user_id {
        return Err(HandlerErr::conflict("cannot delete your own account"));
    }
    if !row_exists(conn, "SELECT 1 FROM users WHERE id = ?", &user_id)? {
        return Err(HandlerErr::not_found("user"));
    }

    let history_checks: [(&str, &str); 8] = [
        ("SELECT 1 FROM student_profiles WHERE user_id = ? AND is_leader = 1", "leads a group"),
        ("SELECT 1 FROM projects WHERE guide_id = ? LIMIT 1", "guides a project"),
        ("SELECT 1 FROM grades WHERE student_id = ? LIMIT 1", "has grades"),
        ("SELECT 1 FROM grades WHERE faculty_id = ? LIMIT 1", "has awarded grades"),
        ("SELECT 1 FROM documents WHERE uploaded_by = ? LIMIT 1", "has uploaded documents"),
        ("SELECT 1 FROM chat_messages WHERE sender_id = ? LIMIT 1", "has chat messages"),
        ("SELECT 1 FROM meetings WHERE created_by = ? LIMIT 1", "has scheduled meetings"),
        ("SELECT 1 FROM project_groups WHERE created_by = ? LIMIT 1", "created a group"),
    ];
    for (sql, reason) in history_checks {
        if row_exists(conn, sql, &user_id)? {
            return Err(HandlerErr::conflict(format!(
                "user {}; deactivate the account instead",
                reason
            )));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    for (sql, table) in [
        ("DELETE FROM sessions WHERE user_id = ?", "sessions"),
        ("DELETE FROM notifications WHERE user_id = ?", "notifications"),
        ("DELETE FROM meeting_attendance WHERE student_id = ?", "meeting_attendance"),
        ("DELETE FROM student_profiles WHERE user_id = ?", "student_profiles"),
        ("DELETE FROM faculty_profiles WHERE user_id = ?", "faculty_profiles"),
        ("DELETE FROM users WHERE id = ?", "users"),
    ] {
        tx.execute(sql, [&user_id])
            .map_err(db_table_err("db_delete_failed", table))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    tracing::info!(user_id = %user_id, "user deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(with_db(state, req, users_list)),
        "users.get" => Some(with_db(state, req, users_get)),
        "users.create" => Some(with_db(state, req, users_create)),
        "users.update" => Some(with_db(state, req, users_update)),
        "users.delete" => Some(with_db(state, req, users_delete)),
        _ => None,
    }
}
