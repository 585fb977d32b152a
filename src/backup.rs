use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_FILE: &str = "spms.sqlite3";
const DB_ENTRY: &str = "db/spms.sqlite3";
const DOCUMENTS_DIR: &str = "documents";
const DOCUMENTS_PREFIX: &str = "documents/";
const STAGED_DOCUMENTS_DIR: &str = "documents.importing";
pub const BUNDLE_FORMAT_V1: &str = "spms-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub document_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub document_count: usize,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Files under `dir`, relative to `dir`, using `/` separators. Sorted for stable bundles.
fn collect_files(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(cur) = stack.pop() {
        for ent in std::fs::read_dir(&cur)
            .with_context(|| format!("failed to read directory {}", cur.to_string_lossy()))?
        {
            let p = ent?.path();
            if p.is_dir() {
                stack.push(p);
            } else if p.is_file() {
                let rel = p
                    .strip_prefix(dir)
                    .context("document path escaped documents directory")?;
                let parts: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                out.push(parts.join("/"));
            }
        }
    }
    out.sort();
    Ok(out)
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let documents_root = workspace_path.join(DOCUMENTS_DIR);
    let documents = collect_files(&documents_root)?;

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": unix_now(),
        "documentCount": documents.len(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    for rel in &documents {
        let entry = format!("{}{}", DOCUMENTS_PREFIX, rel);
        zip.start_file(entry.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", entry))?;
        let src = documents_root.join(rel);
        let mut f = File::open(&src)
            .with_context(|| format!("failed to open document {}", src.to_string_lossy()))?;
        std::io::copy(&mut f, &mut zip)
            .with_context(|| format!("failed to write entry {}", entry))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;

    tracing::info!(
        out = %out_path.to_string_lossy(),
        documents = documents.len(),
        "workspace bundle exported"
    );
    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 2 + documents.len(),
        document_count: documents.len(),
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(DB_FILE);

    if !is_zip_file(in_path)? {
        std::fs::copy(in_path, &dst).with_context(|| {
            format!(
                "failed to copy sqlite backup from {} to {}",
                in_path.to_string_lossy(),
                dst.to_string_lossy()
            )
        })?;
        // A bare database carries no documents; files of the replaced workspace go.
        let documents_root = workspace_path.join(DOCUMENTS_DIR);
        if documents_root.exists() {
            std::fs::remove_dir_all(&documents_root).with_context(|| {
                format!(
                    "failed to remove replaced documents {}",
                    documents_root.to_string_lossy()
                )
            })?;
        }
        return Ok(ImportSummary {
            bundle_format_detected: "plain-sqlite3".to_string(),
            document_count: 0,
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let tmp_dst = workspace_path.join("spms.sqlite3.importing");
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }

    let mut db_out = File::create(&tmp_dst).with_context(|| {
        format!(
            "failed to create temp database {}",
            tmp_dst.to_string_lossy()
        )
    })?;
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/spms.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
    }
    db_out
        .flush()
        .context("failed to flush extracted database")?;

    // Documents are staged beside the live tree and swapped in with the database.
    let staged_documents = workspace_path.join(STAGED_DOCUMENTS_DIR);
    if staged_documents.exists() {
        std::fs::remove_dir_all(&staged_documents).with_context(|| {
            format!(
                "failed to clear staging directory {}",
                staged_documents.to_string_lossy()
            )
        })?;
    }
    std::fs::create_dir_all(&staged_documents).with_context(|| {
        format!(
            "failed to create staging directory {}",
            staged_documents.to_string_lossy()
        )
    })?;
    let mut document_count = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("failed to read bundle entry")?;
        let name = entry.name().to_string();
        let Some(rel) = name.strip_prefix(DOCUMENTS_PREFIX) else {
            continue;
        };
        if rel.is_empty() || entry.is_dir() {
            continue;
        }
        // Reject traversal outside the documents directory.
        let Some(safe) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(anyhow!("unsafe entry path in bundle: {}", name));
        };
        let Ok(safe_rel) = safe.strip_prefix(DOCUMENTS_DIR) else {
            return Err(anyhow!("unsafe entry path in bundle: {}", name));
        };
        let target = staged_documents.join(safe_rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("failed to create {}", target.to_string_lossy()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract {}", name))?;
        document_count += 1;
    }

    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    let documents_root = workspace_path.join(DOCUMENTS_DIR);
    if documents_root.exists() {
        std::fs::remove_dir_all(&documents_root).with_context(|| {
            format!(
                "failed to remove replaced documents {}",
                documents_root.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&staged_documents, &documents_root).with_context(|| {
        format!(
            "failed to move restored documents to {}",
            documents_root.to_string_lossy()
        )
    })?;

    tracing::info!(
        workspace = %workspace_path.to_string_lossy(),
        documents = document_count,
        "workspace bundle imported"
    );
    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
        document_count,
    })
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}
