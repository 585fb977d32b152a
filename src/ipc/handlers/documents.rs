use crate::db;
use crate::ipc::error::{db_err, db_table_err, HandlerErr};
use crate::ipc::handlers::setup::{SetupSection, DEFAULT_MAX_UPLOAD_BYTES};
use crate::ipc::helpers::{
    get_optional_text, get_required_str, load_project, notify_all, project_audience,
    require_participant, require_session, setting_i64, setting_value, with_db, with_workspace,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const DEFAULT_KIND: &str = "general";

fn io_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("io_failed", format!("{e:?}"))
}

/// Keeps only the final path component and replaces characters that are unsafe in file names.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("").trim();
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    Some(cleaned)
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn allowed_extensions(conn: &Connection) -> Result<Vec<String>, HandlerErr> {
    let v = setting_value(conn, SetupSection::Documents, "allowedExtensions")?;
    Ok(v.as_array()
        .map(|a| {
            a.iter()
                .filter_map(|x| x.as_str())
                .map(|s| s.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default())
}

/// Copies `src` to `dst`, returning (bytes, sha256 hex).
fn copy_with_digest(src: &Path, dst: &Path) -> anyhow::Result<(u64, String)> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let mut input = File::open(src)
        .with_context(|| format!("failed to open {}", src.to_string_lossy()))?;
    let mut output = File::create(dst)
        .with_context(|| format!("failed to create {}", dst.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = input
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", src.to_string_lossy()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output
            .write_all(&buf[..n])
            .with_context(|| format!("failed to write {}", dst.to_string_lossy()))?;
        total += n as u64;
    }
    output.flush()?;
    Ok((total, crate::auth::hex(&hasher.finalize())))
}

fn document_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "projectId": r.get::<_, String>(1)?,
        "uploadedBy": r.get::<_, String>(2)?,
        "uploaderName": r.get::<_, Option<String>>(3)?,
        "fileName": r.get::<_, String>(4)?,
        "kind": r.get::<_, String>(5)?,
        "sizeBytes": r.get::<_, i64>(6)?,
        "sha256": r.get::<_, String>(7)?,
        "createdAt": r.get::<_, String>(8)?,
    }))
}

const DOCUMENT_COLUMNS: &str = "d.id, d.project_id, d.uploaded_by, u.name, d.file_name, d.kind,
     d.size_bytes, d.sha256, d.created_at";

fn documents_list(conn: &Connection, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;
    let sql = format!(
        "SELECT {}
         FROM documents d
         LEFT JOIN users u ON u.id = d.uploaded_by
         WHERE d.project_id = ?
         ORDER BY d.created_at DESC, d.file_name",
        DOCUMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let documents = stmt
        .query_map([&project_id], document_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "documents": documents }))
}

fn documents_upload(conn: &Connection, workspace: &Path, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;

    let source = PathBuf::from(get_required_str(&req.params, "sourcePath")?);
    let meta = std::fs::metadata(&source).map_err(|e| {
        HandlerErr::bad_params(format!("sourcePath is not readable: {}", e))
    })?;
    if !meta.is_file() {
        return Err(HandlerErr::bad_params("sourcePath must be a file"));
    }

    let requested = match get_optional_text(&req.params, "fileName", 200)? {
        Some(n) => n,
        None => source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    let Some(file_name) = sanitize_file_name(&requested) else {
        return Err(HandlerErr::bad_params("fileName is not a valid file name"));
    };
    let kind = get_optional_text(&req.params, "kind", 40)?
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| DEFAULT_KIND.to_string());

    let allowed = allowed_extensions(conn)?;
    let ext = extension_of(&file_name).unwrap_or_default();
    if !allowed.iter().any(|a| *a == ext) {
        return Err(HandlerErr::bad_params(format!(
            "file type .{} is not allowed",
            ext
        ))
        .with_details(json!({ "allowedExtensions": allowed })));
    }
    let max_bytes = setting_i64(
        conn,
        SetupSection::Documents,
        "maxUploadBytes",
        DEFAULT_MAX_UPLOAD_BYTES,
    )?;
    if meta.len() > max_bytes as u64 {
        return Err(HandlerErr::bad_params("file exceeds the upload size limit")
            .with_details(json!({ "sizeBytes": meta.len(), "maxUploadBytes": max_bytes })));
    }

    let document_id = Uuid::new_v4().to_string();
    let stored_rel = format!(
        "{}/{}/{}-{}",
        db::DOCUMENTS_DIR,
        project_id,
        document_id,
        file_name
    );
    let target = workspace.join(&stored_rel);
    let (size, sha) = copy_with_digest(&source, &target).map_err(io_err)?;

    let inserted = conn.execute(
        "INSERT INTO documents(id, project_id, uploaded_by, file_name, kind, size_bytes, sha256, stored_path, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &document_id,
            &project_id,
            &caller.user_id,
            &file_name,
            &kind,
            size as i64,
            &sha,
            &stored_rel,
            db::now_ts(),
        ),
    );
    if let Err(e) = inserted {
        let _ = std::fs::remove_file(&target);
        return Err(db_table_err("db_insert_failed", "documents")(e));
    }

    let audience = project_audience(conn, &project, Some(caller.user_id.as_str()))?;
    notify_all(
        conn,
        &audience,
        "document.uploaded",
        &format!("{} uploaded {}", caller.name, file_name),
        Some(project_id.as_str()),
    )?;
    tracing::info!(project = %project_id, file = %file_name, bytes = size, "document stored");

    let sql = format!(
        "SELECT {} FROM documents d LEFT JOIN users u ON u.id = d.uploaded_by WHERE d.id = ?",
        DOCUMENT_COLUMNS
    );
    let document = conn
        .query_row(&sql, [&document_id], document_from_row)
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "document": document }))
}

fn documents_delete(conn: &Connection, workspace: &Path, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let document_id = get_required_str(&req.params, "documentId")?;
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT uploaded_by, stored_path FROM documents WHERE id = ?",
            [&document_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((uploaded_by, stored_path)) = row else {
        return Err(HandlerErr::not_found("document"));
    };
    if !caller.is_admin() && uploaded_by != caller.user_id {
        return Err(HandlerErr::forbidden(
            "only the uploader or an admin may delete a document",
        ));
    }
    // File first, so a failed removal leaves the row pointing at it.
    let path = workspace.join(&stored_path);
    if path.is_file() {
        std::fs::remove_file(&path).map_err(|e| {
            HandlerErr::new("io_failed", format!("failed to remove {}: {}", stored_path, e))
        })?;
    }
    conn.execute("DELETE FROM documents WHERE id = ?", [&document_id])
        .map_err(db_table_err("db_delete_failed", "documents"))?;
    Ok(json!({ "ok": true }))
}

struct StoredDocument {
    file_name: String,
    kind: String,
    size_bytes: i64,
    sha256: String,
    stored_path: String,
}

fn write_project_zip(
    workspace: &Path,
    project: &Value,
    docs: &[StoredDocument],
    out_path: &Path,
) -> anyhow::Result<usize> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out = File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = Vec::with_capacity(docs.len());
    let mut used = std::collections::HashSet::new();
    for d in docs {
        // Two uploads may share a file name; suffix later ones.
        let mut entry = format!("files/{}", d.file_name);
        let mut n = 1;
        while !used.insert(entry.clone()) {
            n += 1;
            entry = format!("files/{}-{}", n, d.file_name);
        }
        let src = workspace.join(&d.stored_path);
        zip.start_file(entry.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", entry))?;
        let mut f = File::open(&src)
            .with_context(|| format!("failed to open document {}", src.to_string_lossy()))?;
        std::io::copy(&mut f, &mut zip)
            .with_context(|| format!("failed to write entry {}", entry))?;
        entries.push(json!({
            "entry": entry,
            "fileName": d.file_name,
            "kind": d.kind,
            "sizeBytes": d.size_bytes,
            "sha256": d.sha256,
        }));
    }

    let manifest = json!({
        "project": project,
        "exportedAt": db::now_ts(),
        "documents": entries,
    });
    zip.start_file("manifest.json", opts)
        .context("failed to start manifest entry")?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
        .context("failed to write manifest entry")?;
    zip.finish().context("failed to finalize zip")?;
    Ok(docs.len())
}

fn documents_export_zip(conn: &Connection, workspace: &Path, req: &Request) -> HandlerResult {
    let caller = require_session(conn, req)?;
    let project_id = get_required_str(&req.params, "projectId")?;
    let out_path = PathBuf::from(get_required_str(&req.params, "outPath")?);
    let project = load_project(conn, &project_id)?;
    require_participant(conn, &caller, &project)?;

    let mut stmt = conn
        .prepare(
            "SELECT file_name, kind, size_bytes, sha256, stored_path
             FROM documents
             WHERE project_id = ?
             ORDER BY created_at, file_name",
        )
        .map_err(db_err("db_query_failed"))?;
    let docs = stmt
        .query_map([&project_id], |r| {
            Ok(StoredDocument {
                file_name: r.get(0)?,
                kind: r.get(1)?,
                size_bytes: r.get(2)?,
                sha256: r.get(3)?,
                stored_path: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let summary = json!({
        "id": project.id,
        "title": project.title,
        "status": project.status.as_str(),
    });
    let count = write_project_zip(workspace, &summary, &docs, &out_path).map_err(io_err)?;
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "documentCount": count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "documents.list" => Some(with_db(state, req, documents_list)),
        "documents.upload" => Some(with_workspace(state, req, documents_upload)),
        "documents.delete" => Some(with_workspace(state, req, documents_delete)),
        "documents.exportZip" => Some(with_workspace(state, req, documents_export_zip)),
        _ => None,
    }
}
