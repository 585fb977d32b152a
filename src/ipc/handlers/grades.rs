use crate::db;
use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::helpers::{
    get_optional_text, get_required_f64, get_required_str, get_required_text, group_member_ids,
    load_project, notify, require_guide_or_admin, require_participant, require_session, with_db,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{check_score, percent, round_1, ProjectStatus, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn grades_list(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;
    // Students only see their own rows.
    let only_student = (caller.role == Role::Student).then(|| caller.user_id.clone());

    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.student_id, s.name, g.faculty_id, f.name, g.criterion,
                    g.score, g.max_score, g.remarks, g.updated_at
             FROM grades g
             JOIN users s ON s.id = g.student_id
             LEFT JOIN users f ON f.id = g.faculty_id
             WHERE g.project_id = ?1
               AND (?2 IS NULL OR g.student_id = ?2)
             ORDER BY s.name, g.criterion",
        )
        .map_err(db_err("db_query_failed"))?;
    let grades = stmt
        .query_map((&project_id, &only_student), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "facultyId": r.get::<_, String>(3)?,
                "facultyName": r.get::<_, Option<String>>(4)?,
                "criterion": r.get::<_, String>(5)?,
                "score": r.get::<_, f64>(6)?,
                "maxScore": r.get::<_, f64>(7)?,
                "remarks": r.get::<_, Option<String>>(8)?,
                "updatedAt": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "grades": grades }))
}

fn grades_upsert(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_guide_or_admin(&caller, &project)?;
    if matches!(
        project.status,
        ProjectStatus::Proposed | ProjectStatus::Rejected
    ) {
        return Err(HandlerErr::invalid_state(format!(
            "cannot grade a {} project",
            project.status.as_str()
        )));
    }

    let student_id = get_required_str(&req.params, "studentId")?;
    if !group_member_ids(conn, &project.group_id)?.contains(&student_id) {
        return Err(HandlerErr::bad_params(
            "student is not a member of this project group",
        ));
    }
    let criterion = get_required_text(&req.params, "criterion", 80)?;
    let score = get_required_f64(&req.params, "score")?;
    let max_score = get_required_f64(&req.params, "maxScore")?;
    check_score(score, max_score)?;
    let remarks = get_optional_text(&req.params, "remarks", 2000)?;

    conn.execute(
        "INSERT INTO grades(id, project_id, student_id, faculty_id, criterion, score, max_score, remarks, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(project_id, student_id, criterion) DO UPDATE SET
           faculty_id = excluded.faculty_id,
           score = excluded.score,
           max_score = excluded.max_score,
           remarks = excluded.remarks,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &project_id,
            &student_id,
            &caller.user_id,
            &criterion,
            score,
            max_score,
            &remarks,
            db::now_ts(),
        ),
    )
    .map_err(db_table_err("db_insert_failed", "grades"))?;

    let grade_id: String = conn
        .query_row(
            "SELECT id FROM grades WHERE project_id = ? AND student_id = ? AND criterion = ?",
            (&project_id, &student_id, &criterion),
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    notify(
        conn,
        &student_id,
        "grade.updated",
        &format!("Grade recorded for {}: {}/{}", criterion, score, max_score),
        Some(project_id.as_str()),
    )?;
    Ok(json!({
        "gradeId": grade_id,
        "score": score,
        "maxScore": max_score,
    }))
}

fn grades_delete(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let grade_id = get_required_str(&req.params, "gradeId")?;
    let project_id: Option<String> = conn
        .query_row("SELECT project_id FROM grades WHERE id = ?", [&grade_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(project_id) = project_id else {
        return Err(HandlerErr::not_found("grade"));
    };
    let project = load_project(conn, &project_id)?;
    require_guide_or_admin(&caller, &project)?;
    conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(db_table_err("db_delete_failed", "grades"))?;
    Ok(json!({ "ok": true }))
}

fn grades_summary(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;

    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name,
                    COALESCE(SUM(g.score), 0.0), COALESCE(SUM(g.max_score), 0.0), COUNT(g.id)
             FROM student_profiles sp
             JOIN users u ON u.id = sp.user_id
             LEFT JOIN grades g ON g.student_id = u.id AND g.project_id = ?1
             WHERE sp.group_id = ?2
             GROUP BY u.id, u.name
             ORDER BY u.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((&project_id, &project.group_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let students: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(id, ..)| caller.role != Role::Student || *id == caller.user_id)
        .map(|(id, name, total, max, count)| {
            json!({
                "studentId": id,
                "name": name,
                "criteriaCount": count,
                "total": round_1(total),
                "max": round_1(max),
                "percent": percent(total, max),
            })
        })
        .collect();
    Ok(json!({ "projectId": project_id, "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(with_db(state, req, grades_list)),
        "grades.upsert" => Some(with_db(state, req, grades_upsert)),
        "grades.delete" => Some(with_db(state, req, grades_delete)),
        "grades.summary" => Some(with_db(state, req, grades_summary)),
        _ => None,
    }
}
