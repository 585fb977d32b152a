use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_i64, get_required_str, require_session, with_db,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn notifications_list(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let unread_only = get_optional_bool(&req.params, "unreadOnly")?.unwrap_or(false);
    let limit = get_optional_i64(&req.params, "limit")?
        .unwrap_or(100)
        .clamp(1, 500);
    let mut stmt = conn
        .prepare(
            "SELECT id, kind, message, project_id, read, created_at
             FROM notifications
             WHERE user_id = ?1 AND (?2 = 0 OR read = 0)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3",
        )
        .map_err(db_err("db_query_failed"))?;
    let notifications = stmt
        .query_map((&caller.user_id, unread_only as i64, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
                "projectId": r.get::<_, Option<String>>(3)?,
                "read": r.get::<_, i64>(4)? != 0,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let unread: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0",
            [&caller.user_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "notifications": notifications, "unreadCount": unread }))
}

fn notifications_mark_read(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let notification_id = get_required_str(&req.params, "notificationId")?;
    // Scoped by owner: someone else's id reads as missing.
    let changed = conn
        .execute(
            "UPDATE notifications SET read = 1 WHERE id = ? AND user_id = ?",
            (&notification_id, &caller.user_id),
        )
        .map_err(db_table_err("db_update_failed", "notifications"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("notification"));
    }
    Ok(json!({ "ok": true }))
}

fn notifications_mark_all_read(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let changed = conn
        .execute(
            "UPDATE notifications SET read = 1 WHERE user_id = ? AND read = 0",
            [&caller.user_id],
        )
        .map_err(db_table_err("db_update_failed", "notifications"))?;
    Ok(json!({ "ok": true, "updated": changed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(with_db(state, req, notifications_list)),
        "notifications.markRead" => Some(with_db(state, req, notifications_mark_read)),
        "notifications.markAllRead" => Some(with_db(state, req, notifications_mark_all_read)),
        _ => None,
    }
}
