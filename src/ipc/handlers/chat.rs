use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::helpers::{
    get_optional_i64, get_optional_str, get_required_str, load_project, notify_all,
    project_audience, require_participant, require_session, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

const MAX_BODY_CHARS: usize = 2000;
const DEFAULT_PAGE: i64 = 200;
const MAX_PAGE: i64 = 500;

/// UTC, millisecond precision. `since` filters compare these strings lexically.
/// Several messages can share one stamp, so `since` is inclusive and the exact
/// poll cursor is the per-message `seq`.
fn message_ts(t: chrono::DateTime<chrono::Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn chat_list(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;
    let since = match get_optional_str(&req.params, "since")? {
        Some(s) => Some(
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|t| message_ts(t.with_timezone(&chrono::Utc)))
                .map_err(|_| HandlerErr::bad_params("since must be an RFC 3339 timestamp"))?,
        ),
        None => None,
    };
    let after_seq = get_optional_i64(&req.params, "afterSeq")?;
    let limit = get_optional_i64(&req.params, "limit")?
        .unwrap_or(DEFAULT_PAGE)
        .clamp(1, MAX_PAGE);

    // Newest `limit` messages past the cursor, returned oldest first.
    let mut stmt = conn
        .prepare(
            "SELECT id, sender_id, sender_name, sender_role, body, created_at, seq FROM (
               SELECT m.id, m.sender_id, u.name AS sender_name, u.role AS sender_role,
                      m.body, m.created_at, m.rowid AS seq
               FROM chat_messages m
               LEFT JOIN users u ON u.id = m.sender_id
               WHERE m.project_id = ?1
                 AND (?2 IS NULL OR m.created_at >= ?2)
                 AND (?3 IS NULL OR m.rowid > ?3)
               ORDER BY m.rowid DESC
               LIMIT ?4
             )
             ORDER BY seq",
        )
        .map_err(db_err("db_query_failed"))?;
    let messages = stmt
        .query_map((&project_id, &since, after_seq, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "seq": r.get::<_, i64>(6)?,
                "senderId": r.get::<_, String>(1)?,
                "senderName": r.get::<_, Option<String>>(2)?,
                "senderRole": r.get::<_, Option<String>>(3)?,
                "body": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "messages": messages }))
}

fn chat_send(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;
    let raw = get_required_str(&req.params, "body")?;
    let body = raw.trim();
    if body.is_empty() {
        return Err(HandlerErr::bad_params("body must not be empty"));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(HandlerErr::bad_params(format!(
            "body length must be <= {}",
            MAX_BODY_CHARS
        )));
    }

    let message_id = Uuid::new_v4().to_string();
    let created_at = message_ts(chrono::Utc::now());
    conn.execute(
        "INSERT INTO chat_messages(id, project_id, sender_id, body, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&message_id, &project_id, &caller.user_id, body, &created_at),
    )
    .map_err(db_table_err("db_insert_failed", "chat_messages"))?;
    let seq = conn.last_insert_rowid();

    let preview: String = body.chars().take(80).collect();
    let audience = project_audience(conn, &project, Some(caller.user_id.as_str()))?;
    notify_all(
        conn,
        &audience,
        "chat.message",
        &format!("{}: {}", caller.name, preview),
        Some(project_id.as_str()),
    )?;
    Ok(json!({
        "message": {
            "id": message_id,
            "seq": seq,
            "senderId": caller.user_id,
            "senderName": caller.name,
            "senderRole": caller.role.as_str(),
            "body": body,
            "createdAt": created_at,
        }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "chat.list" => Some(with_db(state, req, chat_list)),
        "chat.send" => Some(with_db(state, req, chat_send)),
        _ => None,
    }
}
