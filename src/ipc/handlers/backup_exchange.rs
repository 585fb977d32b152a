use crate::backup;
use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{get_required_str, session_with_role, with_db, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use anyhow::Context;
use rusqlite::Connection;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(workspace_path)) = (state.db.as_ref(), state.workspace.clone()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = session_with_role(conn, req, &[Role::Admin]) {
        return e.response(&req.id);
    }
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };

    let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "documentCount": export.document_count
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Restoring over an open workspace needs an admin of that workspace.
    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = session_with_role(conn, req, &[Role::Admin]) {
            return e.response(&req.id);
        }
    }
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }
    if let Err(e) = std::fs::create_dir_all(&workspace_path) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": workspace_path.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;
    state.workspace = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
    };

    match open_workspace(state, &workspace_path) {
        Ok(()) => ok(
            &req.id,
            json!({
                "ok": true,
                "workspacePath": workspace_path.to_string_lossy(),
                "bundleFormatDetected": import.bundle_format_detected,
                "documentCount": import.document_count
            }),
        ),
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

struct ProjectCsvRow {
    title: String,
    status: String,
    group_name: String,
    members: String,
    leader: String,
    guide: String,
    project_type: String,
    milestones_done: i64,
    milestones_total: i64,
    updated_at: String,
}

fn write_projects_csv(rows: &[ProjectCsvRow], out_path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let mut f = std::fs::File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.to_string_lossy()))?;
    writeln!(
        f,
        "title,status,group,members,leader,guide,project_type,milestones_completed,milestones_total,updated_at"
    )?;
    for r in rows {
        writeln!(
            f,
            "{},{},{},{},{},{},{},{},{},{}",
            csv_quote(&r.title),
            csv_quote(&r.status),
            csv_quote(&r.group_name),
            csv_quote(&r.members),
            csv_quote(&r.leader),
            csv_quote(&r.guide),
            csv_quote(&r.project_type),
            r.milestones_done,
            r.milestones_total,
            csv_quote(&r.updated_at),
        )?;
    }
    f.flush()?;
    Ok(())
}

fn exports_projects_csv(conn: &Connection, req: &Request) -> HandlerResult {
    session_with_role(conn, req, &[Role::Admin])?;
    let out_path = PathBuf::from(get_required_str(&req.params, "outPath")?);

    let mut stmt = conn
        .prepare(
            "SELECT p.title, p.status, g.name,
               (SELECT GROUP_CONCAT(name, '; ') FROM (
                  SELECT u.name FROM student_profiles sp
                  JOIN users u ON u.id = sp.user_id
                  WHERE sp.group_id = g.id
                  ORDER BY u.name)),
               (SELECT u.name FROM student_profiles sp
                  JOIN users u ON u.id = sp.user_id
                  WHERE sp.group_id = g.id AND sp.is_leader = 1),
               gu.name, t.name,
               (SELECT COUNT(*) FROM milestones m WHERE m.project_id = p.id AND m.completed = 1),
               (SELECT COUNT(*) FROM milestones m WHERE m.project_id = p.id),
               p.updated_at
             FROM projects p
             JOIN project_groups g ON g.id = p.group_id
             LEFT JOIN users gu ON gu.id = p.guide_id
             LEFT JOIN project_types t ON t.id = p.project_type_id
             ORDER BY p.status, p.title",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(ProjectCsvRow {
                title: r.get(0)?,
                status: r.get(1)?,
                group_name: r.get(2)?,
                members: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                leader: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                guide: r.get::<_, Option<String>>(5)?.unwrap_or_default(),
                project_type: r.get::<_, Option<String>>(6)?.unwrap_or_default(),
                milestones_done: r.get(7)?,
                milestones_total: r.get(8)?,
                updated_at: r.get(9)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    write_projects_csv(&rows, &out_path).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string())
            .with_details(json!({ "path": out_path.to_string_lossy() }))
    })?;
    tracing::info!(out = %out_path.to_string_lossy(), rows = rows.len(), "projects csv exported");
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "rowsExported": rows.len()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        "exports.projectsCsv" => Some(with_db(state, req, exports_projects_csv)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::csv_quote;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
