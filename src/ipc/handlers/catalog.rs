//! Reference data: departments, academic years and project types.

use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::helpers::{
    get_optional_text, get_required_str, get_required_text, require_session, row_exists,
    session_with_role, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn departments_list(conn: &Connection, req: &Request) -> HandlerResult {
    require_session(conn, req)?;
    let mut stmt = conn
        .prepare(
            "SELECT d.id, d.code, d.name,
               (SELECT COUNT(*) FROM student_profiles sp WHERE sp.department_id = d.id) AS student_count,
               (SELECT COUNT(*) FROM faculty_profiles fp WHERE fp.department_id = d.id) AS faculty_count
             FROM departments d
             ORDER BY d.code",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "studentCount": r.get::<_, i64>(3)?,
                "facultyCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "departments": rows }))
}

fn departments_create(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let code = get_required_text(&req.params, "code", 16)?.to_ascii_uppercase();
    let name = get_required_text(&req.params, "name", 120)?;
    if row_exists(conn, "SELECT 1 FROM departments WHERE code = ?", &code)? {
        return Err(HandlerErr::conflict("department code already exists"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO departments(id, code, name) VALUES(?, ?, ?)",
        (&id, &code, &name),
    )
    .map_err(db_table_err("db_insert_failed", "departments"))?;
    Ok(json!({ "departmentId": id, "code": code, "name": name }))
}

fn departments_delete(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "departmentId")?;
    if !row_exists(conn, "SELECT 1 FROM departments WHERE id = ?", &id)? {
        return Err(HandlerErr::not_found("department"));
    }
    let in_use = row_exists(
        conn,
        "SELECT 1 FROM student_profiles WHERE department_id = ?1
         UNION ALL SELECT 1 FROM faculty_profiles WHERE department_id = ?1
         LIMIT 1",
        &id,
    )?;
    if in_use {
        return Err(HandlerErr::conflict("department is referenced by profiles"));
    }
    conn.execute("DELETE FROM departments WHERE id = ?", [&id])
        .map_err(db_table_err("db_delete_failed", "departments"))?;
    Ok(json!({ "ok": true }))
}

fn academic_years_list(conn: &Connection, req: &Request) -> HandlerResult {
    require_session(conn, req)?;
    let mut stmt = conn
        .prepare("SELECT id, label, is_current FROM academic_years ORDER BY label DESC")
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "label": r.get::<_, String>(1)?,
                "isCurrent": r.get::<_, i64>(2)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "academicYears": rows }))
}

fn academic_years_create(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let label = get_required_text(&req.params, "label", 32)?;
    if row_exists(conn, "SELECT 1 FROM academic_years WHERE label = ?", &label)? {
        return Err(HandlerErr::conflict("academic year already exists"));
    }
    let id = Uuid::new_v4().to_string();
    let has_current: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM academic_years WHERE is_current = 1)",
            [],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    // The first year created becomes current.
    conn.execute(
        "INSERT INTO academic_years(id, label, is_current) VALUES(?, ?, ?)",
        (&id, &label, (!has_current) as i64),
    )
    .map_err(db_table_err("db_insert_failed", "academic_years"))?;
    Ok(json!({ "academicYearId": id, "label": label, "isCurrent": !has_current }))
}

fn academic_years_set_current(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "academicYearId")?;
    if !row_exists(conn, "SELECT 1 FROM academic_years WHERE id = ?", &id)? {
        return Err(HandlerErr::not_found("academic year"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute("UPDATE academic_years SET is_current = 0", [])
        .map_err(db_table_err("db_update_failed", "academic_years"))?;
    tx.execute("UPDATE academic_years SET is_current = 1 WHERE id = ?", [&id])
        .map_err(db_table_err("db_update_failed", "academic_years"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true }))
}

fn project_types_list(conn: &Connection, req: &Request) -> HandlerResult {
    require_session(conn, req)?;
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.name, t.description,
               (SELECT COUNT(*) FROM projects p WHERE p.project_type_id = t.id)
             FROM project_types t
             ORDER BY t.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "projectCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "projectTypes": rows }))
}

fn project_types_create(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let name = get_required_text(&req.params, "name", 80)?;
    let description = get_optional_text(&req.params, "description", 1000)?;
    if row_exists(conn, "SELECT 1 FROM project_types WHERE name = ?", &name)? {
        return Err(HandlerErr::conflict("project type already exists"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO project_types(id, name, description) VALUES(?, ?, ?)",
        (&id, &name, &description),
    )
    .map_err(db_table_err("db_insert_failed", "project_types"))?;
    Ok(json!({ "projectTypeId": id, "name": name }))
}

fn project_types_delete(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "projectTypeId")?;
    if !row_exists(conn, "SELECT 1 FROM project_types WHERE id = ?", &id)? {
        return Err(HandlerErr::not_found("project type"));
    }
    if row_exists(
        conn,
        "SELECT 1 FROM projects WHERE project_type_id = ? LIMIT 1",
        &id,
    )? {
        return Err(HandlerErr::conflict("project type is used by projects"));
    }
    conn.execute("DELETE FROM project_types WHERE id = ?", [&id])
        .map_err(db_table_err("db_delete_failed", "project_types"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "departments.list" => Some(with_db(state, req, departments_list)),
        "departments.create" => Some(with_db(state, req, departments_create)),
        "departments.delete" => Some(with_db(state, req, departments_delete)),
        "academicYears.list" => Some(with_db(state, req, academic_years_list)),
        "academicYears.create" => Some(with_db(state, req, academic_years_create)),
        "academicYears.setCurrent" => Some(with_db(state, req, academic_years_set_current)),
        "projectTypes.list" => Some(with_db(state, req, project_types_list)),
        "projectTypes.create" => Some(with_db(state, req, project_types_create)),
        "projectTypes.delete" => Some(with_db(state, req, project_types_delete)),
        _ => None,
    }
}
