use crate::db;
use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::handlers::setup::{SetupSection, DEFAULT_MAX_FACULTY_LOAD};
use crate::ipc::helpers::{
    get_optional_str, get_optional_text, get_required_str, get_required_text, group_member_ids,
    group_members_json, is_participant, load_project, notify, notify_all, project_audience,
    require_guide_or_admin, require_session, row_exists, session_with_role, setting_i64,
    setting_value, student_group, user_role, with_db, with_workspace, Caller, HandlerResult,
    ProjectRef,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{check_faculty_capacity, check_transition, percent, ProjectStatus, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::Path;
use uuid::Uuid;

pub fn faculty_capacity(conn: &Connection, faculty_id: &str) -> Result<i64, HandlerErr> {
    let own: Option<Option<i64>> = conn
        .query_row(
            "SELECT max_load FROM faculty_profiles WHERE user_id = ?",
            [faculty_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    match own.flatten() {
        Some(n) => Ok(n),
        None => setting_i64(
            conn,
            SetupSection::Allocation,
            "maxFacultyLoad",
            DEFAULT_MAX_FACULTY_LOAD,
        ),
    }
}

/// Projects occupying the faculty member's workload, not counting `exclude_project`.
pub fn faculty_active_load(
    conn: &Connection,
    faculty_id: &str,
    exclude_project: Option<&str>,
) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM projects
         WHERE guide_id = ?1
           AND status NOT IN ('REJECTED', 'COMPLETED')
           AND (?2 IS NULL OR id <> ?2)",
        (faculty_id, exclude_project),
        |r| r.get(0),
    )
    .map_err(db_err("db_query_failed"))
}

fn milestone_progress(conn: &Connection, project_id: &str) -> Result<Value, HandlerErr> {
    let (total, done): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(completed), 0) FROM milestones WHERE project_id = ?",
            [project_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({
        "total": total,
        "completed": done,
        "percent": percent(done as f64, total as f64),
    }))
}

pub fn project_json(conn: &Connection, project_id: &str) -> Result<Value, HandlerErr> {
    #[allow(clippy::type_complexity)]
    let row: Option<(
        String,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
        Option<String>,
        String,
        String,
    )> = conn
        .query_row(
            "SELECT p.group_id, g.name, p.title, p.description, p.project_type_id, t.name,
                    p.guide_id, u.name, p.status, p.feedback, p.created_at, p.updated_at
             FROM projects p
             JOIN project_groups g ON g.id = p.group_id
             LEFT JOIN project_types t ON t.id = p.project_type_id
             LEFT JOIN users u ON u.id = p.guide_id
             WHERE p.id = ?",
            [project_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                    r.get(11)?,
                ))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((
        group_id,
        group_name,
        title,
        description,
        type_id,
        type_name,
        guide_id,
        guide_name,
        status,
        feedback,
        created_at,
        updated_at,
    )) = row
    else {
        return Err(HandlerErr::not_found("project"));
    };
    Ok(json!({
        "id": project_id,
        "title": title,
        "description": description,
        "status": status,
        "feedback": feedback,
        "projectTypeId": type_id,
        "projectTypeName": type_name,
        "guide": guide_id.map(|id| json!({ "id": id, "name": guide_name })),
        "group": {
            "id": group_id,
            "name": group_name,
            "members": group_members_json(conn, &group_id)?,
        },
        "milestones": milestone_progress(conn, project_id)?,
        "createdAt": created_at,
        "updatedAt": updated_at,
    }))
}

fn admin_ids(conn: &Connection) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM users WHERE role = 'admin' AND active = 1")
        .map_err(db_err("db_query_failed"))?;
    stmt.query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))
}

fn check_project_type(conn: &Connection, type_id: &Option<String>) -> Result<(), HandlerErr> {
    if let Some(t) = type_id.as_deref() {
        if !row_exists(conn, "SELECT 1 FROM project_types WHERE id = ?", t)? {
            return Err(HandlerErr::not_found("project type"));
        }
    }
    Ok(())
}

fn projects_propose(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Student])?;
    let Some((group_id, is_leader)) = student_group(conn, &caller.user_id)? else {
        return Err(HandlerErr::conflict("join or create a group first"));
    };
    if !is_leader {
        return Err(HandlerErr::forbidden("only the group leader may submit a proposal"));
    }
    if row_exists(conn, "SELECT 1 FROM projects WHERE group_id = ?", &group_id)? {
        return Err(HandlerErr::conflict("your group already has a project"));
    }
    let title = get_required_text(&req.params, "title", 200)?;
    let description = get_required_text(&req.params, "description", 5000)?;
    let project_type_id = get_optional_str(&req.params, "projectTypeId")?;
    check_project_type(conn, &project_type_id)?;

    let project_id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO projects(id, group_id, title, description, project_type_id, guide_id, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, NULL, ?, ?, ?)",
        (
            &project_id,
            &group_id,
            &title,
            &description,
            &project_type_id,
            ProjectStatus::Proposed.as_str(),
            &now,
            &now,
        ),
    )
    .map_err(db_table_err("db_insert_failed", "projects"))?;
    notify_all(
        conn,
        &admin_ids(conn)?,
        "project.proposed",
        &format!("New proposal: {}", title),
        Some(project_id.as_str()),
    )?;
    tracing::info!(project_id = %project_id, group_id = %group_id, "proposal submitted");
    Ok(json!({ "project": project_json(conn, &project_id)? }))
}

fn projects_list(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let status = match get_optional_str(&req.params, "status")? {
        Some(s) => Some(
            ProjectStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params("unknown status"))?
                .as_str(),
        ),
        None => None,
    };
    let (scope_sql, scope_param): (&str, Option<String>) = match caller.role {
        Role::Admin => ("?2 IS NULL", None),
        Role::Faculty => (
            "p.guide_id = ?2 OR (p.guide_id IS NULL AND p.status = 'PROPOSED')",
            Some(caller.user_id.clone()),
        ),
        Role::Student => (
            "p.group_id = ?2",
            Some(
                student_group(conn, &caller.user_id)?
                    .map(|(g, _)| g)
                    .unwrap_or_default(),
            ),
        ),
    };
    let sql = format!(
        "SELECT p.id, p.title, p.status, g.id, g.name, p.guide_id, u.name, t.name, p.updated_at,
           (SELECT COUNT(*) FROM milestones m WHERE m.project_id = p.id),
           (SELECT COUNT(*) FROM milestones m WHERE m.project_id = p.id AND m.completed = 1)
         FROM projects p
         JOIN project_groups g ON g.id = p.group_id
         LEFT JOIN users u ON u.id = p.guide_id
         LEFT JOIN project_types t ON t.id = p.project_type_id
         WHERE (?1 IS NULL OR p.status = ?1) AND ({})
         ORDER BY p.updated_at DESC",
        scope_sql
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let projects = stmt
        .query_map((status, scope_param), |r| {
            let total: i64 = r.get(9)?;
            let done: i64 = r.get(10)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "groupId": r.get::<_, String>(3)?,
                "groupName": r.get::<_, String>(4)?,
                "guideId": r.get::<_, Option<String>>(5)?,
                "guideName": r.get::<_, Option<String>>(6)?,
                "projectTypeName": r.get::<_, Option<String>>(7)?,
                "updatedAt": r.get::<_, String>(8)?,
                "milestonesTotal": total,
                "milestonesCompleted": done,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "projects": projects }))
}

fn can_view(conn: &Connection, caller: &Caller, project: &ProjectRef) -> Result<bool, HandlerErr> {
    if is_participant(conn, caller, project)? {
        return Ok(true);
    }
    // Faculty browse unassigned proposals.
    Ok(caller.role == Role::Faculty
        && project.guide_id.is_none()
        && project.status == ProjectStatus::Proposed)
}

fn projects_get(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    if !can_view(conn, &caller, &project)? {
        return Err(HandlerErr::forbidden("not a participant of this project"));
    }
    Ok(json!({ "project": project_json(conn, &project_id)? }))
}

fn projects_update(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Student, Role::Admin])?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    let mut resubmit = false;
    if !caller.is_admin() {
        match student_group(conn, &caller.user_id)? {
            Some((g, true)) if g == project.group_id => {}
            _ => return Err(HandlerErr::forbidden("only the group leader may edit the proposal")),
        }
        match project.status {
            ProjectStatus::Proposed => {}
            ProjectStatus::Rejected => resubmit = true,
            other => {
                return Err(HandlerErr::invalid_state(format!(
                    "proposal cannot be edited once {}",
                    other.as_str()
                )))
            }
        }
    }

    let title = get_optional_text(&req.params, "title", 200)?;
    let description = get_optional_text(&req.params, "description", 5000)?;
    let project_type_id = get_optional_str(&req.params, "projectTypeId")?;
    if title.as_deref() == Some("") || description.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("title and description must not be empty"));
    }
    check_project_type(conn, &project_type_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    if let Some(t) = title.as_ref() {
        tx.execute("UPDATE projects SET title = ? WHERE id = ?", (t, &project_id))
            .map_err(db_table_err("db_update_failed", "projects"))?;
    }
    if let Some(d) = description.as_ref() {
        tx.execute(
            "UPDATE projects SET description = ? WHERE id = ?",
            (d, &project_id),
        )
        .map_err(db_table_err("db_update_failed", "projects"))?;
    }
    if req.params.get("projectTypeId").is_some() {
        tx.execute(
            "UPDATE projects SET project_type_id = ? WHERE id = ?",
            (&project_type_id, &project_id),
        )
        .map_err(db_table_err("db_update_failed", "projects"))?;
    }
    if resubmit {
        check_transition(project.status, ProjectStatus::Proposed)?;
        tx.execute(
            "UPDATE projects SET status = ?, feedback = NULL WHERE id = ?",
            (ProjectStatus::Proposed.as_str(), &project_id),
        )
        .map_err(db_table_err("db_update_failed", "projects"))?;
    }
    tx.execute(
        "UPDATE projects SET updated_at = ? WHERE id = ?",
        (db::now_ts(), &project_id),
    )
    .map_err(db_table_err("db_update_failed", "projects"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    if resubmit {
        let mut to = admin_ids(conn)?;
        if let Some(g) = project.guide_id.as_ref() {
            to.push(g.clone());
        }
        notify_all(
            conn,
            &to,
            "project.resubmitted",
            &format!("Proposal resubmitted: {}", title.as_deref().unwrap_or(&project.title)),
            Some(project_id.as_str()),
        )?;
    }
    Ok(json!({ "project": project_json(conn, &project_id)? }))
}

/// Removes a project and everything hanging off it, including stored files.
fn projects_delete(conn: &Connection, workspace: &Path, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    let audience = project_audience(conn, &project, None)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    for (sql, table) in [
        (
            "DELETE FROM meeting_attendance WHERE meeting_id IN (SELECT id FROM meetings WHERE project_id = ?)",
            "meeting_attendance",
        ),
        ("DELETE FROM meetings WHERE project_id = ?", "meetings"),
        ("DELETE FROM milestones WHERE project_id = ?", "milestones"),
        ("DELETE FROM documents WHERE project_id = ?", "documents"),
        ("DELETE FROM grades WHERE project_id = ?", "grades"),
        ("DELETE FROM chat_messages WHERE project_id = ?", "chat_messages"),
        ("UPDATE notifications SET project_id = NULL WHERE project_id = ?", "notifications"),
        ("DELETE FROM projects WHERE id = ?", "projects"),
    ] {
        tx.execute(sql, [&project_id])
            .map_err(db_table_err("db_delete_failed", table))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;

    let dir = workspace.join(db::DOCUMENTS_DIR).join(&project_id);
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(dir = %dir.to_string_lossy(), error = %e, "failed to remove project documents");
        }
    }
    notify_all(
        conn,
        &audience,
        "project.deleted",
        &format!("Project deleted: {}", project.title),
        None,
    )?;
    tracing::info!(project_id = %project_id, "project deleted");
    Ok(json!({ "ok": true }))
}

fn projects_assign_guide(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let faculty_id = get_required_str(&req.params, "facultyId")?;
    let project = load_project(conn, &project_id)?;
    match user_role(conn, &faculty_id)? {
        Some(Role::Faculty) => {}
        Some(_) => return Err(HandlerErr::bad_params("guide must be a faculty member")),
        None => return Err(HandlerErr::not_found("faculty")),
    }
    let active: i64 = conn
        .query_row("SELECT active FROM users WHERE id = ?", [&faculty_id], |r| r.get(0))
        .map_err(db_err("db_query_failed"))?;
    if active == 0 {
        return Err(HandlerErr::conflict("faculty account is deactivated"));
    }
    if !project.status.counts_toward_load() {
        return Err(HandlerErr::invalid_state(format!(
            "cannot assign a guide to a {} project",
            project.status.as_str()
        )));
    }
    if project.guide_id.as_deref() == Some(faculty_id.as_str()) {
        return Ok(json!({ "project": project_json(conn, &project_id)? }));
    }

    let load = faculty_active_load(conn, &faculty_id, Some(project_id.as_str()))?;
    let capacity = faculty_capacity(conn, &faculty_id)?;
    check_faculty_capacity(load, capacity).map_err(|e| {
        HandlerErr::from(e).with_details(json!({ "activeProjects": load, "capacity": capacity }))
    })?;

    conn.execute(
        "UPDATE projects SET guide_id = ?, updated_at = ? WHERE id = ?",
        (&faculty_id, db::now_ts(), &project_id),
    )
    .map_err(db_table_err("db_update_failed", "projects"))?;

    notify(
        conn,
        &faculty_id,
        "project.guideAssigned",
        &format!("You have been assigned as guide for: {}", project.title),
        Some(project_id.as_str()),
    )?;
    if let Some(prev) = project.guide_id.as_ref() {
        notify(
            conn,
            prev,
            "project.guideRemoved",
            &format!("You are no longer the guide for: {}", project.title),
            Some(project_id.as_str()),
        )?;
    }
    let members = group_member_ids(conn, &project.group_id)?;
    notify_all(
        conn,
        &members,
        "project.guideAssigned",
        &format!("A guide has been assigned to {}", project.title),
        Some(project_id.as_str()),
    )?;
    tracing::info!(project_id = %project_id, faculty_id = %faculty_id, load = load + 1, capacity, "guide assigned");
    Ok(json!({ "project": project_json(conn, &project_id)? }))
}

fn projects_unassign_guide(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    let Some(prev) = project.guide_id.as_ref() else {
        return Ok(json!({ "project": project_json(conn, &project_id)? }));
    };
    conn.execute(
        "UPDATE projects SET guide_id = NULL, updated_at = ? WHERE id = ?",
        (db::now_ts(), &project_id),
    )
    .map_err(db_table_err("db_update_failed", "projects"))?;
    notify(
        conn,
        prev,
        "project.guideRemoved",
        &format!("You are no longer the guide for: {}", project.title),
        Some(project_id.as_str()),
    )?;
    Ok(json!({ "project": project_json(conn, &project_id)? }))
}

fn projects_review(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Admin, Role::Faculty])?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_guide_or_admin(&caller, &project)?;
    let decision = get_required_str(&req.params, "decision")?;
    let next = match decision.as_str() {
        "approve" => ProjectStatus::Approved,
        "reject" => ProjectStatus::Rejected,
        _ => return Err(HandlerErr::bad_params("decision must be approve or reject")),
    };
    let feedback = get_optional_text(&req.params, "feedback", 2000)?;
    if project.status != ProjectStatus::Proposed {
        return Err(HandlerErr::invalid_state(format!(
            "only PROPOSED projects can be reviewed (current: {})",
            project.status.as_str()
        )));
    }
    check_transition(project.status, next)?;
    if next == ProjectStatus::Approved
        && project.guide_id.is_none()
        && setting_value(conn, SetupSection::Allocation, "requireGuideBeforeApproval")?
            .as_bool()
            .unwrap_or(false)
    {
        return Err(HandlerErr::invalid_state("assign a guide before approving"));
    }

    conn.execute(
        "UPDATE projects SET status = ?, feedback = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), &feedback, db::now_ts(), &project_id),
    )
    .map_err(db_table_err("db_update_failed", "projects"))?;

    let audience = project_audience(conn, &project, Some(caller.user_id.as_str()))?;
    let verb = if next == ProjectStatus::Approved {
        "approved"
    } else {
        "rejected"
    };
    notify_all(
        conn,
        &audience,
        "project.reviewed",
        &format!("Proposal {}: {}", verb, project.title),
        Some(project_id.as_str()),
    )?;
    tracing::info!(project_id = %project_id, status = next.as_str(), "proposal reviewed");
    Ok(json!({ "project": project_json(conn, &project_id)? }))
}

fn projects_set_status(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Admin, Role::Faculty])?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_guide_or_admin(&caller, &project)?;
    let raw = get_required_str(&req.params, "status")?;
    let next = ProjectStatus::parse(&raw).ok_or_else(|| HandlerErr::bad_params("unknown status"))?;
    if matches!(next, ProjectStatus::Approved | ProjectStatus::Rejected) {
        return Err(HandlerErr::bad_params("use projects.review to approve or reject"));
    }
    check_transition(project.status, next)?;
    conn.execute(
        "UPDATE projects SET status = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), db::now_ts(), &project_id),
    )
    .map_err(db_table_err("db_update_failed", "projects"))?;
    let audience = project_audience(conn, &project, Some(caller.user_id.as_str()))?;
    notify_all(
        conn,
        &audience,
        "project.status",
        &format!("{} is now {}", project.title, next.as_str()),
        Some(project_id.as_str()),
    )?;
    Ok(json!({ "project": project_json(conn, &project_id)? }))
}

fn faculty_workload(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin, Role::Faculty])?;
    let default_capacity = setting_i64(
        conn,
        SetupSection::Allocation,
        "maxFacultyLoad",
        DEFAULT_MAX_FACULTY_LOAD,
    )?;
    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name, d.name, fp.designation, fp.max_load,
               (SELECT COUNT(*) FROM projects p
                 WHERE p.guide_id = u.id AND p.status NOT IN ('REJECTED', 'COMPLETED')),
               (SELECT COUNT(*) FROM projects p WHERE p.guide_id = u.id AND p.status = 'COMPLETED')
             FROM users u
             LEFT JOIN faculty_profiles fp ON fp.user_id = u.id
             LEFT JOIN departments d ON d.id = fp.department_id
             WHERE u.role = 'faculty' AND u.active = 1
             ORDER BY u.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let faculty = stmt
        .query_map([], |r| {
            let capacity = r.get::<_, Option<i64>>(4)?.unwrap_or(default_capacity);
            let active: i64 = r.get(5)?;
            Ok(json!({
                "facultyId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "departmentName": r.get::<_, Option<String>>(2)?,
                "designation": r.get::<_, Option<String>>(3)?,
                "activeProjects": active,
                "completedProjects": r.get::<_, i64>(6)?,
                "capacity": capacity,
                "available": (capacity - active).max(0),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "faculty": faculty, "defaultCapacity": default_capacity }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "projects.propose" => Some(with_db(state, req, projects_propose)),
        "projects.list" => Some(with_db(state, req, projects_list)),
        "projects.get" => Some(with_db(state, req, projects_get)),
        "projects.update" => Some(with_db(state, req, projects_update)),
        "projects.delete" => Some(with_workspace(state, req, projects_delete)),
        "projects.assignGuide" => Some(with_db(state, req, projects_assign_guide)),
        "projects.unassignGuide" => Some(with_db(state, req, projects_unassign_guide)),
        "projects.review" => Some(with_db(state, req, projects_review)),
        "projects.setStatus" => Some(with_db(state, req, projects_set_status)),
        "faculty.workload" => Some(with_db(state, req, faculty_workload)),
        _ => None,
    }
}
