use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::handlers::setup::SetupSection;
use crate::ipc::helpers::{
    get_optional_bool, get_optional_i64, get_optional_str, get_optional_text, get_required_str,
    get_required_text, group_member_ids, load_project, now_minute, notify_all, parse_datetime,
    project_audience, require_guide_or_admin, require_participant, require_session, setting_i64,
    setting_value, student_group, with_db, Caller, HandlerResult, ProjectRef,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{percent, MeetingStatus, ProjectStatus, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

const MIN_DURATION: i64 = 5;
const MAX_DURATION: i64 = 480;

fn check_duration(minutes: i64) -> Result<i64, HandlerErr> {
    if !(MIN_DURATION..=MAX_DURATION).contains(&minutes) {
        return Err(HandlerErr::bad_params(format!(
            "durationMinutes must be between {} and {}",
            MIN_DURATION, MAX_DURATION
        )));
    }
    Ok(minutes)
}

fn load_meeting(conn: &Connection, meeting_id: &str) -> Result<(ProjectRef, MeetingStatus), HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT project_id, status FROM meetings WHERE id = ?",
            [meeting_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((project_id, status_raw)) = row else {
        return Err(HandlerErr::not_found("meeting"));
    };
    let status = MeetingStatus::parse(&status_raw).ok_or_else(|| {
        HandlerErr::new("db_query_failed", format!("unknown meeting status {}", status_raw))
    })?;
    Ok((load_project(conn, &project_id)?, status))
}

fn require_scheduled(status: MeetingStatus) -> Result<(), HandlerErr> {
    if status == MeetingStatus::Scheduled {
        Ok(())
    } else {
        Err(HandlerErr::invalid_state(format!(
            "meeting is {}",
            status.as_str()
        )))
    }
}

fn meeting_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "projectId": r.get::<_, String>(1)?,
        "projectTitle": r.get::<_, String>(2)?,
        "scheduledAt": r.get::<_, String>(3)?,
        "durationMinutes": r.get::<_, i64>(4)?,
        "agenda": r.get::<_, String>(5)?,
        "location": r.get::<_, Option<String>>(6)?,
        "notes": r.get::<_, Option<String>>(7)?,
        "status": r.get::<_, String>(8)?,
        "createdBy": r.get::<_, String>(9)?,
    }))
}

const MEETING_COLUMNS: &str = "m.id, m.project_id, p.title, m.scheduled_at, m.duration_minutes,
     m.agenda, m.location, m.notes, m.status, m.created_by";

fn meeting_json(conn: &Connection, meeting_id: &str) -> Result<Value, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM meetings m JOIN projects p ON p.id = m.project_id WHERE m.id = ?",
        MEETING_COLUMNS
    );
    conn.query_row(&sql, [meeting_id], meeting_from_row)
        .map_err(db_err("db_query_failed"))
}

fn meetings_list(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_optional_str(&req.params, "projectId")?;
    let upcoming_only = get_optional_bool(&req.params, "upcomingOnly")?.unwrap_or(false);
    if let Some(pid) = project_id.as_deref() {
        let project = load_project(conn, pid)?;
        require_participant(conn, &caller, &project)?;
    }
    let own_group = match caller.role {
        Role::Student => student_group(conn, &caller.user_id)?.map(|(g, _)| g),
        _ => None,
    };

    let sql = format!(
        "SELECT {}
         FROM meetings m
         JOIN projects p ON p.id = m.project_id
         WHERE (?1 IS NULL OR m.project_id = ?1)
           AND (?2 = 'admin'
                OR (?2 = 'faculty' AND p.guide_id = ?3)
                OR (?2 = 'student' AND p.group_id = ?4))
           AND (?5 = 0 OR (m.status = 'scheduled' AND m.scheduled_at >= ?6))
         ORDER BY m.scheduled_at",
        MEETING_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let meetings = stmt
        .query_map(
            (
                &project_id,
                caller.role.as_str(),
                &caller.user_id,
                &own_group,
                upcoming_only as i64,
                now_minute(),
            ),
            meeting_from_row,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "meetings": meetings }))
}

fn meetings_create(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_guide_or_admin(&caller, &project)?;
    if matches!(
        project.status,
        ProjectStatus::Rejected | ProjectStatus::Completed
    ) {
        return Err(HandlerErr::invalid_state(format!(
            "cannot schedule meetings for a {} project",
            project.status.as_str()
        )));
    }
    let scheduled_at = parse_datetime(&get_required_str(&req.params, "scheduledAt")?, "scheduledAt")?;
    let agenda = get_required_text(&req.params, "agenda", 2000)?;
    let duration = match get_optional_i64(&req.params, "durationMinutes")? {
        Some(d) => check_duration(d)?,
        None => setting_i64(conn, SetupSection::Meetings, "defaultDurationMinutes", 30)?,
    };
    let location = match get_optional_text(&req.params, "location", 200)? {
        Some(l) => Some(l),
        None => setting_value(conn, SetupSection::Meetings, "defaultLocation")?
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
    };

    let meeting_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO meetings(id, project_id, scheduled_at, duration_minutes, agenda, location, notes, status, created_by)
         VALUES(?, ?, ?, ?, ?, ?, NULL, ?, ?)",
        (
            &meeting_id,
            &project_id,
            &scheduled_at,
            duration,
            &agenda,
            &location,
            MeetingStatus::Scheduled.as_str(),
            &caller.user_id,
        ),
    )
    .map_err(db_table_err("db_insert_failed", "meetings"))?;

    let audience = project_audience(conn, &project, Some(caller.user_id.as_str()))?;
    notify_all(
        conn,
        &audience,
        "meeting.scheduled",
        &format!("Meeting scheduled for {}: {}", scheduled_at, agenda),
        Some(project_id.as_str()),
    )?;
    Ok(json!({ "meeting": meeting_json(conn, &meeting_id)? }))
}

fn meetings_update(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let meeting_id = get_required_str(&req.params, "meetingId")?;
    let (project, status) = load_meeting(conn, &meeting_id)?;
    require_guide_or_admin(&caller, &project)?;
    require_scheduled(status)?;

    let scheduled_at = match get_optional_str(&req.params, "scheduledAt")? {
        Some(s) => Some(parse_datetime(&s, "scheduledAt")?),
        None => None,
    };
    let duration = match get_optional_i64(&req.params, "durationMinutes")? {
        Some(d) => Some(check_duration(d)?),
        None => None,
    };
    let agenda = get_optional_text(&req.params, "agenda", 2000)?;
    if agenda.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("agenda must not be empty"));
    }
    let location = get_optional_text(&req.params, "location", 200)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    if let Some(s) = scheduled_at.as_ref() {
        tx.execute(
            "UPDATE meetings SET scheduled_at = ? WHERE id = ?",
            (s, &meeting_id),
        )
        .map_err(db_table_err("db_update_failed", "meetings"))?;
    }
    if let Some(d) = duration {
        tx.execute(
            "UPDATE meetings SET duration_minutes = ? WHERE id = ?",
            (d, &meeting_id),
        )
        .map_err(db_table_err("db_update_failed", "meetings"))?;
    }
    if let Some(a) = agenda.as_ref() {
        tx.execute("UPDATE meetings SET agenda = ? WHERE id = ?", (a, &meeting_id))
            .map_err(db_table_err("db_update_failed", "meetings"))?;
    }
    if req.params.get("location").is_some() {
        tx.execute(
            "UPDATE meetings SET location = ? WHERE id = ?",
            (&location, &meeting_id),
        )
        .map_err(db_table_err("db_update_failed", "meetings"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;

    if let Some(s) = scheduled_at.as_ref() {
        let audience = project_audience(conn, &project, Some(caller.user_id.as_str()))?;
        notify_all(
            conn,
            &audience,
            "meeting.rescheduled",
            &format!("Meeting moved to {}", s),
            Some(project.id.as_str()),
        )?;
    }
    Ok(json!({ "meeting": meeting_json(conn, &meeting_id)? }))
}

fn meetings_cancel(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let meeting_id = get_required_str(&req.params, "meetingId")?;
    let (project, status) = load_meeting(conn, &meeting_id)?;
    require_guide_or_admin(&caller, &project)?;
    require_scheduled(status)?;
    conn.execute(
        "UPDATE meetings SET status = ? WHERE id = ?",
        (MeetingStatus::Cancelled.as_str(), &meeting_id),
    )
    .map_err(db_table_err("db_update_failed", "meetings"))?;
    let meeting = meeting_json(conn, &meeting_id)?;
    let audience = project_audience(conn, &project, Some(caller.user_id.as_str()))?;
    notify_all(
        conn,
        &audience,
        "meeting.cancelled",
        &format!(
            "Meeting on {} was cancelled",
            meeting.get("scheduledAt").and_then(|v| v.as_str()).unwrap_or("")
        ),
        Some(project.id.as_str()),
    )?;
    Ok(json!({ "meeting": meeting }))
}

fn meetings_complete(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let meeting_id = get_required_str(&req.params, "meetingId")?;
    let (project, status) = load_meeting(conn, &meeting_id)?;
    require_guide_or_admin(&caller, &project)?;
    require_scheduled(status)?;
    let notes = get_optional_text(&req.params, "notes", 10_000)?;
    conn.execute(
        "UPDATE meetings SET status = ?, notes = COALESCE(?, notes) WHERE id = ?",
        (MeetingStatus::Completed.as_str(), &notes, &meeting_id),
    )
    .map_err(db_table_err("db_update_failed", "meetings"))?;
    Ok(json!({ "meeting": meeting_json(conn, &meeting_id)? }))
}

fn attendance_roster(conn: &Connection, caller: &Caller, meeting_id: &str, project: &ProjectRef) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name, sp.roll_no, a.present, a.remark
             FROM student_profiles sp
             JOIN users u ON u.id = sp.user_id
             LEFT JOIN meeting_attendance a ON a.student_id = u.id AND a.meeting_id = ?1
             WHERE sp.group_id = ?2
             ORDER BY u.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((meeting_id, &project.group_id), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "rollNo": r.get::<_, Option<String>>(2)?,
                "present": r.get::<_, Option<i64>>(3)?.map(|p| p != 0),
                "remark": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    // Students see only their own mark.
    if caller.role == Role::Student {
        return Ok(rows
            .into_iter()
            .filter(|row| row.get("studentId").and_then(|v| v.as_str()) == Some(caller.user_id.as_str()))
            .collect());
    }
    Ok(rows)
}

fn attendance_get(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let meeting_id = get_required_str(&req.params, "meetingId")?;
    let (project, status) = load_meeting(conn, &meeting_id)?;
    require_participant(conn, &caller, &project)?;
    let roster = attendance_roster(conn, &caller, &meeting_id, &project)?;
    Ok(json!({
        "meetingId": meeting_id,
        "status": status.as_str(),
        "entries": roster,
    }))
}

struct AttendanceEntry {
    student_id: String,
    present: bool,
    remark: Option<String>,
}

fn parse_entries(params: &Value) -> Result<Vec<AttendanceEntry>, HandlerErr> {
    let Some(items) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("entries[{}].studentId missing", i)))?;
        let present = item
            .get("present")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| HandlerErr::bad_params(format!("entries[{}].present must be boolean", i)))?;
        let remark = match item.get("remark") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.chars().count() <= 500 => Some(s.trim().to_string()),
            Some(_) => {
                return Err(HandlerErr::bad_params(format!(
                    "entries[{}].remark must be a string of at most 500 chars",
                    i
                )))
            }
        };
        out.push(AttendanceEntry {
            student_id: student_id.to_string(),
            present,
            remark,
        });
    }
    Ok(out)
}

fn attendance_set(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let meeting_id = get_required_str(&req.params, "meetingId")?;
    let (project, status) = load_meeting(conn, &meeting_id)?;
    require_guide_or_admin(&caller, &project)?;
    if status == MeetingStatus::Cancelled {
        return Err(HandlerErr::invalid_state(
            "attendance cannot be recorded for a cancelled meeting",
        ));
    }
    let entries = parse_entries(&req.params)?;
    let members: HashSet<String> = group_member_ids(conn, &project.group_id)?
        .into_iter()
        .collect();
    if let Some(stranger) = entries.iter().find(|e| !members.contains(&e.student_id)) {
        return Err(HandlerErr::bad_params("student is not a member of this project group")
            .with_details(json!({ "studentId": stranger.student_id })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    for e in &entries {
        tx.execute(
            "INSERT INTO meeting_attendance(meeting_id, student_id, present, remark)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(meeting_id, student_id) DO UPDATE SET
               present = excluded.present,
               remark = excluded.remark",
            (&meeting_id, &e.student_id, e.present as i64, &e.remark),
        )
        .map_err(db_table_err("db_insert_failed", "meeting_attendance"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    Ok(json!({ "ok": true, "updated": entries.len() }))
}

fn attendance_summary(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;

    let total: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM meetings WHERE project_id = ? AND status = 'completed'",
            [&project_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name,
               (SELECT COUNT(*)
                  FROM meeting_attendance a
                  JOIN meetings m ON m.id = a.meeting_id
                 WHERE a.student_id = u.id
                   AND a.present = 1
                   AND m.project_id = ?1
                   AND m.status = 'completed')
             FROM student_profiles sp
             JOIN users u ON u.id = sp.user_id
             WHERE sp.group_id = ?2
             ORDER BY u.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((&project_id, &project.group_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let students: Vec<Value> = rows
        .into_iter()
        .filter(|(id, _, _)| caller.role != Role::Student || *id == caller.user_id)
        .map(|(id, name, attended)| {
            json!({
                "studentId": id,
                "name": name,
                "attended": attended,
                "total": total,
                "percent": percent(attended as f64, total as f64),
            })
        })
        .collect();
    Ok(json!({ "projectId": project_id, "completedMeetings": total, "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "meetings.list" => Some(with_db(state, req, meetings_list)),
        "meetings.create" => Some(with_db(state, req, meetings_create)),
        "meetings.update" => Some(with_db(state, req, meetings_update)),
        "meetings.cancel" => Some(with_db(state, req, meetings_cancel)),
        "meetings.complete" => Some(with_db(state, req, meetings_complete)),
        "meetings.attendance.get" => Some(with_db(state, req, attendance_get)),
        "meetings.attendance.set" => Some(with_db(state, req, attendance_set)),
        "attendance.summary" => Some(with_db(state, req, attendance_summary)),
        _ => None,
    }
}
