//! Role-specific landing counters.

use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::groups::group_json;
use crate::ipc::handlers::projects::{faculty_active_load, faculty_capacity};
use crate::ipc::helpers::{
    now_minute, require_session, student_group, today, with_db, Caller, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{ProjectStatus, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

fn count(conn: &Connection, sql: &str, param: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [param], |r| r.get(0))
        .map_err(db_err("db_query_failed"))
}

fn unread_notifications(conn: &Connection, user_id: &str) -> Result<i64, HandlerErr> {
    count(
        conn,
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0",
        user_id,
    )
}

fn grouped_counts(conn: &Connection, sql: &str, keys: &[&str]) -> Result<Value, HandlerErr> {
    let mut out = Map::new();
    for k in keys {
        out.insert((*k).to_string(), json!(0));
    }
    let mut stmt = conn.prepare(sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    for (k, n) in rows {
        out.insert(k, json!(n));
    }
    Ok(Value::Object(out))
}

fn admin_summary(conn: &Connection) -> HandlerResult {
    let users = grouped_counts(
        conn,
        "SELECT role, COUNT(*) FROM users WHERE active = 1 GROUP BY role",
        &[
            Role::Admin.as_str(),
            Role::Faculty.as_str(),
            Role::Student.as_str(),
        ],
    )?;
    let projects = grouped_counts(
        conn,
        "SELECT status, COUNT(*) FROM projects GROUP BY status",
        &[
            ProjectStatus::Proposed.as_str(),
            ProjectStatus::Approved.as_str(),
            ProjectStatus::Rejected.as_str(),
            ProjectStatus::InProgress.as_str(),
            ProjectStatus::Completed.as_str(),
        ],
    )?;
    let (unassigned, groups_without_project, students_without_group): (i64, i64, i64) = conn
        .query_row(
            "SELECT
               (SELECT COUNT(*) FROM projects WHERE status = 'PROPOSED' AND guide_id IS NULL),
               (SELECT COUNT(*) FROM project_groups g
                  WHERE NOT EXISTS (SELECT 1 FROM projects p WHERE p.group_id = g.id)),
               (SELECT COUNT(*) FROM student_profiles sp
                  JOIN users u ON u.id = sp.user_id
                  WHERE sp.group_id IS NULL AND u.active = 1)",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({
        "role": "admin",
        "usersByRole": users,
        "projectsByStatus": projects,
        "unassignedProposals": unassigned,
        "groupsWithoutProject": groups_without_project,
        "studentsWithoutGroup": students_without_group,
    }))
}

fn faculty_summary(conn: &Connection, caller: &Caller) -> HandlerResult {
    let active = faculty_active_load(conn, &caller.user_id, None)?;
    let capacity = faculty_capacity(conn, &caller.user_id)?;
    let pending_reviews = count(
        conn,
        "SELECT COUNT(*) FROM projects WHERE guide_id = ? AND status = 'PROPOSED'",
        &caller.user_id,
    )?;
    let upcoming: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM meetings m
             JOIN projects p ON p.id = m.project_id
             WHERE p.guide_id = ? AND m.status = 'scheduled' AND m.scheduled_at >= ?",
            (&caller.user_id, now_minute()),
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let overdue: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM milestones ms
             JOIN projects p ON p.id = ms.project_id
             WHERE p.guide_id = ? AND ms.completed = 0 AND ms.due_date < ?",
            (&caller.user_id, today()),
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({
        "role": "faculty",
        "guidedProjects": active,
        "capacity": capacity,
        "available": (capacity - active).max(0),
        "pendingReviews": pending_reviews,
        "upcomingMeetings": upcoming,
        "overdueMilestones": overdue,
        "unreadNotifications": unread_notifications(conn, &caller.user_id)?,
    }))
}

fn student_summary(conn: &Connection, caller: &Caller) -> HandlerResult {
    let unread = unread_notifications(conn, &caller.user_id)?;
    let Some((group_id, is_leader)) = student_group(conn, &caller.user_id)? else {
        return Ok(json!({
            "role": "student",
            "group": Value::Null,
            "isLeader": false,
            "project": Value::Null,
            "nextMilestone": Value::Null,
            "upcomingMeetings": 0,
            "unreadNotifications": unread,
        }));
    };
    let group = group_json(conn, &group_id)?;
    let project: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT p.id, p.title, p.status, u.name
             FROM projects p
             LEFT JOIN users u ON u.id = p.guide_id
             WHERE p.group_id = ?",
            [&group_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;

    let (project_json, next_milestone, upcoming) = match project {
        None => (Value::Null, Value::Null, 0),
        Some((id, title, status, guide_name)) => {
            let next = conn
                .query_row(
                    "SELECT id, title, due_date FROM milestones
                     WHERE project_id = ? AND completed = 0
                     ORDER BY due_date, sort_order
                     LIMIT 1",
                    [&id],
                    |r| {
                        let due: String = r.get(2)?;
                        Ok(json!({
                            "id": r.get::<_, String>(0)?,
                            "title": r.get::<_, String>(1)?,
                            "overdue": due < today(),
                            "dueDate": due,
                        }))
                    },
                )
                .optional()
                .map_err(db_err("db_query_failed"))?
                .unwrap_or(Value::Null);
            let upcoming: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM meetings
                     WHERE project_id = ? AND status = 'scheduled' AND scheduled_at >= ?",
                    (&id, now_minute()),
                    |r| r.get(0),
                )
                .map_err(db_err("db_query_failed"))?;
            (
                json!({
                    "id": id,
                    "title": title,
                    "status": status,
                    "guideName": guide_name,
                }),
                next,
                upcoming,
            )
        }
    };
    Ok(json!({
        "role": "student",
        "group": group,
        "isLeader": is_leader,
        "project": project_json,
        "nextMilestone": next_milestone,
        "upcomingMeetings": upcoming,
        "unreadNotifications": unread,
    }))
}

fn dashboard_summary(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    match caller.role {
        Role::Admin => admin_summary(conn),
        Role::Faculty => faculty_summary(conn, &caller),
        Role::Student => student_summary(conn, &caller),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.summary" => Some(with_db(state, req, dashboard_summary)),
        _ => None,
    }
}
