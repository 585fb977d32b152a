use crate::db;
use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_optional_text, get_required_str, get_required_text,
    group_member_ids, load_project, notify_all, parse_date, require_participant,
    require_guide_or_admin, require_session, today, with_db, HandlerResult, ProjectRef,
};
use crate::ipc::types::{AppState, Request};
use crate::model::ProjectStatus;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn milestone_project(conn: &Connection, milestone_id: &str) -> Result<ProjectRef, HandlerErr> {
    let project_id: Option<String> = conn
        .query_row(
            "SELECT project_id FROM milestones WHERE id = ?",
            [milestone_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(project_id) = project_id else {
        return Err(HandlerErr::not_found("milestone"));
    };
    load_project(conn, &project_id)
}

fn milestone_json(conn: &Connection, milestone_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let today = today();
    conn.query_row(
        "SELECT id, project_id, title, description, due_date, completed, completed_at, sort_order
         FROM milestones WHERE id = ?",
        [milestone_id],
        |r| {
            let due: String = r.get(4)?;
            let completed = r.get::<_, i64>(5)? != 0;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "projectId": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
                "overdue": !completed && due < today,
                "dueDate": due,
                "completed": completed,
                "completedAt": r.get::<_, Option<String>>(6)?,
                "sortOrder": r.get::<_, i64>(7)?,
            }))
        },
    )
    .map_err(db_err("db_query_failed"))
}

fn milestones_list(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;
    let today = today();
    let mut stmt = conn
        .prepare(
            "SELECT id, title, description, due_date, completed, completed_at, sort_order
             FROM milestones
             WHERE project_id = ?
             ORDER BY due_date, sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let milestones = stmt
        .query_map([&project_id], |r| {
            let due: String = r.get(3)?;
            let completed = r.get::<_, i64>(4)? != 0;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "projectId": project_id,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "overdue": !completed && due < today,
                "dueDate": due,
                "completed": completed,
                "completedAt": r.get::<_, Option<String>>(5)?,
                "sortOrder": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "milestones": milestones }))
}

fn milestones_create(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_guide_or_admin(&caller, &project)?;
    if !matches!(
        project.status,
        ProjectStatus::Approved | ProjectStatus::InProgress
    ) {
        return Err(HandlerErr::invalid_state(format!(
            "milestones can only be added to approved projects (current: {})",
            project.status.as_str()
        )));
    }
    let title = get_required_text(&req.params, "title", 200)?;
    let description = get_optional_text(&req.params, "description", 2000)?;
    let due = parse_date(&get_required_str(&req.params, "dueDate")?, "dueDate")?;

    let next_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM milestones WHERE project_id = ?",
            [&project_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let milestone_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO milestones(id, project_id, title, description, due_date, completed, completed_at, sort_order)
         VALUES(?, ?, ?, ?, ?, 0, NULL, ?)",
        (
            &milestone_id,
            &project_id,
            &title,
            &description,
            due.format("%Y-%m-%d").to_string(),
            next_order,
        ),
    )
    .map_err(db_table_err("db_insert_failed", "milestones"))?;

    let members = group_member_ids(conn, &project.group_id)?;
    notify_all(
        conn,
        &members,
        "milestone.created",
        &format!("New milestone \"{}\" due {}", title, due.format("%Y-%m-%d")),
        Some(project_id.as_str()),
    )?;
    Ok(json!({ "milestone": milestone_json(conn, &milestone_id)? }))
}

fn milestones_update(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let milestone_id = get_required_str(&req.params, "milestoneId")?;
    let project = milestone_project(conn, &milestone_id)?;
    require_guide_or_admin(&caller, &project)?;

    let title = get_optional_text(&req.params, "title", 200)?;
    if title.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let description = get_optional_text(&req.params, "description", 2000)?;
    let due = match get_optional_str(&req.params, "dueDate")? {
        Some(d) => Some(parse_date(&d, "dueDate")?.format("%Y-%m-%d").to_string()),
        None => None,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    if let Some(t) = title.as_ref() {
        tx.execute("UPDATE milestones SET title = ? WHERE id = ?", (t, &milestone_id))
            .map_err(db_table_err("db_update_failed", "milestones"))?;
    }
    if req.params.get("description").is_some() {
        tx.execute(
            "UPDATE milestones SET description = ? WHERE id = ?",
            (&description, &milestone_id),
        )
        .map_err(db_table_err("db_update_failed", "milestones"))?;
    }
    if let Some(d) = due.as_ref() {
        tx.execute(
            "UPDATE milestones SET due_date = ? WHERE id = ?",
            (d, &milestone_id),
        )
        .map_err(db_table_err("db_update_failed", "milestones"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "milestone": milestone_json(conn, &milestone_id)? }))
}

fn milestones_complete(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let milestone_id = get_required_str(&req.params, "milestoneId")?;
    let project = milestone_project(conn, &milestone_id)?;
    require_guide_or_admin(&caller, &project)?;
    let completed = get_optional_bool(&req.params, "completed")?.unwrap_or(true);
    let completed_at = if completed { Some(db::now_ts()) } else { None };
    conn.execute(
        "UPDATE milestones SET completed = ?, completed_at = ? WHERE id = ?",
        (completed as i64, &completed_at, &milestone_id),
    )
    .map_err(db_table_err("db_update_failed", "milestones"))?;
    let milestone = milestone_json(conn, &milestone_id)?;
    if completed {
        let title = milestone
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("milestone");
        let members = group_member_ids(conn, &project.group_id)?;
        notify_all(
            conn,
            &members,
            "milestone.completed",
            &format!("Milestone completed: {}", title),
            Some(project.id.as_str()),
        )?;
    }
    Ok(json!({ "milestone": milestone }))
}

fn milestones_delete(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let milestone_id = get_required_str(&req.params, "milestoneId")?;
    let project = milestone_project(conn, &milestone_id)?;
    require_guide_or_admin(&caller, &project)?;
    conn.execute("DELETE FROM milestones WHERE id = ?", [&milestone_id])
        .map_err(db_table_err("db_delete_failed", "milestones"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "milestones.list" => Some(with_db(state, req, milestones_list)),
        "milestones.create" => Some(with_db(state, req, milestones_create)),
        "milestones.update" => Some(with_db(state, req, milestones_update)),
        "milestones.complete" => Some(with_db(state, req, milestones_complete)),
        "milestones.delete" => Some(with_db(state, req, milestones_delete)),
        _ => None,
    }
}
