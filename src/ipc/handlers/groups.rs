use crate::db;
use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::handlers::setup::SetupSection;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_required_text, group_member_ids, group_members_json,
    notify, require_session, row_exists, session_with_role, setting_i64, student_group,
    user_role, with_db, Caller, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{check_group_capacity, group_size_limit, Role, MAX_GROUP_SIZE};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

fn group_limit(conn: &Connection) -> Result<usize, HandlerErr> {
    let configured = setting_i64(
        conn,
        SetupSection::Allocation,
        "maxGroupSize",
        MAX_GROUP_SIZE as i64,
    )?;
    Ok(group_size_limit(configured))
}

fn group_exists(conn: &Connection, group_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM project_groups WHERE id = ?", group_id)
}

/// Leader of the group, or an admin.
fn require_group_manager(conn: &Connection, caller: &Caller, group_id: &str) -> Result<(), HandlerErr> {
    if !group_exists(conn, group_id)? {
        return Err(HandlerErr::not_found("group"));
    }
    if caller.is_admin() {
        return Ok(());
    }
    match student_group(conn, &caller.user_id)? {
        Some((g, true)) if g == group_id => Ok(()),
        _ => Err(HandlerErr::forbidden("only the group leader may do this")),
    }
}

/// Student account with no current group.
fn require_free_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    match user_role(conn, student_id)? {
        Some(Role::Student) => {}
        Some(_) => return Err(HandlerErr::bad_params("user is not a student")),
        None => return Err(HandlerErr::not_found("student")),
    }
    let active: i64 = conn
        .query_row("SELECT active FROM users WHERE id = ?", [student_id], |r| r.get(0))
        .map_err(db_err("db_query_failed"))?;
    if active == 0 {
        return Err(HandlerErr::conflict("student account is deactivated"));
    }
    if student_group(conn, student_id)?.is_some() {
        return Err(HandlerErr::conflict("student already belongs to a group"));
    }
    Ok(())
}

pub fn group_json(conn: &Connection, group_id: &str) -> Result<Value, HandlerErr> {
    let row: Option<(String, Option<String>, Option<String>, String)> = conn
        .query_row(
            "SELECT g.name, g.academic_year_id, ay.label, g.created_at
             FROM project_groups g
             LEFT JOIN academic_years ay ON ay.id = g.academic_year_id
             WHERE g.id = ?",
            [group_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((name, academic_year_id, academic_year_label, created_at)) = row else {
        return Err(HandlerErr::not_found("group"));
    };
    let members = group_members_json(conn, group_id)?;
    let leader_id = members
        .iter()
        .find(|m| m.get("isLeader").and_then(|v| v.as_bool()) == Some(true))
        .and_then(|m| m.get("id").cloned())
        .unwrap_or(Value::Null);
    let project = conn
        .query_row(
            "SELECT id, title, status FROM projects WHERE group_id = ?",
            [group_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "status": r.get::<_, String>(2)?,
                }))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({
        "id": group_id,
        "name": name,
        "academicYearId": academic_year_id,
        "academicYearLabel": academic_year_label,
        "createdAt": created_at,
        "leaderId": leader_id,
        "members": members,
        "capacity": group_limit(conn)?,
        "project": project,
    }))
}

fn groups_create(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Student])?;
    let name = get_required_text(&req.params, "name", 120)?;
    if student_group(conn, &caller.user_id)?.is_some() {
        return Err(HandlerErr::conflict("you already belong to a group"));
    }
    let academic_year_id: Option<String> = conn
        .query_row(
            "SELECT id FROM academic_years WHERE is_current = 1",
            [],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;

    let group_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO project_groups(id, name, academic_year_id, created_by, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&group_id, &name, &academic_year_id, &caller.user_id, db::now_ts()),
    )
    .map_err(db_table_err("db_insert_failed", "project_groups"))?;
    tx.execute(
        "UPDATE student_profiles SET group_id = ?, is_leader = 1 WHERE user_id = ?",
        (&group_id, &caller.user_id),
    )
    .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    tracing::info!(group_id = %group_id, leader = %caller.user_id, "group created");
    Ok(json!({ "group": group_json(conn, &group_id)? }))
}

fn groups_get(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let requested = get_optional_str(&req.params, "groupId")?;
    let group_id = match (caller.role, requested) {
        (Role::Student, requested) => {
            let own = student_group(conn, &caller.user_id)?.map(|(g, _)| g);
            match (own, requested) {
                (None, None) => return Ok(json!({ "group": null })),
                (Some(own), None) => own,
                (Some(own), Some(r)) if own == r => own,
                (_, Some(_)) => {
                    return Err(HandlerErr::forbidden("students may only view their own group"))
                }
            }
        }
        (_, Some(r)) => r,
        (_, None) => return Err(HandlerErr::bad_params("missing groupId")),
    };
    Ok(json!({ "group": group_json(conn, &group_id)? }))
}

fn groups_list(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin, Role::Faculty])?;
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.name, ay.label,
               (SELECT COUNT(*) FROM student_profiles sp WHERE sp.group_id = g.id),
               (SELECT u.name FROM student_profiles sp JOIN users u ON u.id = sp.user_id
                 WHERE sp.group_id = g.id AND sp.is_leader = 1),
               p.id, p.title, p.status
             FROM project_groups g
             LEFT JOIN academic_years ay ON ay.id = g.academic_year_id
             LEFT JOIN projects p ON p.group_id = g.id
             ORDER BY g.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let groups = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "academicYearLabel": r.get::<_, Option<String>>(2)?,
                "memberCount": r.get::<_, i64>(3)?,
                "leaderName": r.get::<_, Option<String>>(4)?,
                "projectId": r.get::<_, Option<String>>(5)?,
                "projectTitle": r.get::<_, Option<String>>(6)?,
                "projectStatus": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "groups": groups }))
}

fn groups_add_member(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Student, Role::Admin])?;
    let group_id = get_required_str(&req.params, "groupId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    require_group_manager(conn, &caller, &group_id)?;
    require_free_student(conn, &student_id)?;

    let current = group_member_ids(conn, &group_id)?.len();
    check_group_capacity(current, 1, group_limit(conn)?)?;

    conn.execute(
        "UPDATE student_profiles SET group_id = ?, is_leader = 0 WHERE user_id = ?",
        (&group_id, &student_id),
    )
    .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    notify(
        conn,
        &student_id,
        "group.added",
        &format!("{} added you to a project group", caller.name),
        None,
    )?;
    Ok(json!({ "group": group_json(conn, &group_id)? }))
}

fn groups_remove_member(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Student, Role::Admin])?;
    let group_id = get_required_str(&req.params, "groupId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    require_group_manager(conn, &caller, &group_id)?;

    match student_group(conn, &student_id)? {
        Some((g, is_leader)) if g == group_id => {
            if is_leader {
                return Err(HandlerErr::conflict(
                    "the leader cannot be removed; transfer leadership first",
                ));
            }
        }
        _ => return Err(HandlerErr::not_found("group member")),
    }
    conn.execute(
        "UPDATE student_profiles SET group_id = NULL, is_leader = 0 WHERE user_id = ?",
        [&student_id],
    )
    .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    notify(
        conn,
        &student_id,
        "group.removed",
        &format!("{} removed you from your project group", caller.name),
        None,
    )?;
    Ok(json!({ "group": group_json(conn, &group_id)? }))
}

fn groups_leave(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Student])?;
    let Some((group_id, is_leader)) = student_group(conn, &caller.user_id)? else {
        return Err(HandlerErr::conflict("you are not in a group"));
    };
    if is_leader {
        return Err(HandlerErr::conflict(
            "the leader cannot leave; transfer leadership first",
        ));
    }
    conn.execute(
        "UPDATE student_profiles SET group_id = NULL, is_leader = 0 WHERE user_id = ?",
        [&caller.user_id],
    )
    .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    let leader: Option<String> = conn
        .query_row(
            "SELECT user_id FROM student_profiles WHERE group_id = ? AND is_leader = 1",
            [&group_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(leader) = leader {
        notify(
            conn,
            &leader,
            "group.left",
            &format!("{} left your project group", caller.name),
            None,
        )?;
    }
    Ok(json!({ "ok": true }))
}

fn set_leader(conn: &Connection, group_id: &str, leader_id: &str) -> Result<(), HandlerErr> {
    // Clear first: the partial unique index allows one leader per group.
    conn.execute(
        "UPDATE student_profiles SET is_leader = 0 WHERE group_id = ?",
        [group_id],
    )
    .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    conn.execute(
        "UPDATE student_profiles SET is_leader = 1 WHERE group_id = ? AND user_id = ?",
        (group_id, leader_id),
    )
    .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    Ok(())
}

fn groups_transfer_leadership(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = session_with_role(conn, req, &[Role::Student, Role::Admin])?;
    let group_id = get_required_str(&req.params, "groupId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    require_group_manager(conn, &caller, &group_id)?;
    match student_group(conn, &student_id)? {
        Some((g, _)) if g == group_id => {}
        _ => return Err(HandlerErr::not_found("group member")),
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    set_leader(&tx, &group_id, &student_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    if student_id != caller.user_id {
        notify(
            conn,
            &student_id,
            "group.leader",
            "You are now the leader of your project group",
            None,
        )?;
    }
    Ok(json!({ "group": group_json(conn, &group_id)? }))
}

fn groups_set_members(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let group_id = get_required_str(&req.params, "groupId")?;
    let leader_id = get_required_str(&req.params, "leaderId")?;
    let Some(raw_ids) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("studentIds must be an array"));
    };
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group"));
    }
    let mut wanted: Vec<String> = Vec::new();
    for v in raw_ids {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params("studentIds must contain strings"));
        };
        if !wanted.iter().any(|w| w == s) {
            wanted.push(s.to_string());
        }
    }
    if wanted.is_empty() {
        return Err(HandlerErr::bad_params("a group needs at least one member"));
    }
    check_group_capacity(0, wanted.len(), group_limit(conn)?)?;
    if !wanted.contains(&leader_id) {
        return Err(HandlerErr::bad_params("leaderId must be one of studentIds"));
    }

    let current: HashSet<String> = group_member_ids(conn, &group_id)?.into_iter().collect();
    for sid in &wanted {
        if current.contains(sid) {
            continue;
        }
        require_free_student(conn, sid).map_err(|e| {
            let message = format!("{} ({})", e.message, sid);
            HandlerErr::new(e.code, message).with_details(json!({ "studentId": sid }))
        })?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    for sid in current.iter().filter(|s| !wanted.contains(s)) {
        tx.execute(
            "UPDATE student_profiles SET group_id = NULL, is_leader = 0 WHERE user_id = ?",
            [sid],
        )
        .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    }
    for sid in wanted.iter().filter(|s| !current.contains(*s)) {
        tx.execute(
            "UPDATE student_profiles SET group_id = ?, is_leader = 0 WHERE user_id = ?",
            (&group_id, sid),
        )
        .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    }
    set_leader(&tx, &group_id, &leader_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    for sid in wanted.iter().filter(|s| !current.contains(*s)) {
        notify(conn, sid, "group.added", "An admin added you to a project group", None)?;
    }
    for sid in current.iter().filter(|s| !wanted.contains(s)) {
        notify(conn, sid, "group.removed", "An admin removed you from your project group", None)?;
    }
    tracing::info!(group_id = %group_id, members = wanted.len(), "group members reassigned");
    Ok(json!({ "group": group_json(conn, &group_id)? }))
}

fn groups_delete(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let group_id = get_required_str(&req.params, "groupId")?;
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group"));
    }
    if row_exists(conn, "SELECT 1 FROM projects WHERE group_id = ?", &group_id)? {
        return Err(HandlerErr::conflict("group owns a project; delete the project first"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE student_profiles SET group_id = NULL, is_leader = 0 WHERE group_id = ?",
        [&group_id],
    )
    .map_err(db_table_err("db_update_failed", "student_profiles"))?;
    tx.execute("DELETE FROM project_groups WHERE id = ?", [&group_id])
        .map_err(db_table_err("db_delete_failed", "project_groups"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.create" => Some(with_db(state, req, groups_create)),
        "groups.get" => Some(with_db(state, req, groups_get)),
        "groups.list" => Some(with_db(state, req, groups_list)),
        "groups.addMember" => Some(with_db(state, req, groups_add_member)),
        "groups.removeMember" => Some(with_db(state, req, groups_remove_member)),
        "groups.leave" => Some(with_db(state, req, groups_leave)),
        "groups.transferLeadership" => Some(with_db(state, req, groups_transfer_leadership)),
        "groups.setMembers" => Some(with_db(state, req, groups_set_members)),
        "groups.delete" => Some(with_db(state, req, groups_delete)),
        _ => None,
    }
}
