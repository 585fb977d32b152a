#[path = "../src/backup.rs"]
mod backup;

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

#[test]
fn bundle_carries_database_and_documents() {
    let workspace = temp_dir("spms-backup-src");
    let workspace2 = temp_dir("spms-backup-dst");
    let out_dir = temp_dir("spms-backup-out");

    let bytes = b"sqlite-test-payload";
    std::fs::write(workspace.join("spms.sqlite3"), bytes).expect("write source db");
    let doc_dir = workspace.join("documents").join("project-1");
    std::fs::create_dir_all(&doc_dir).expect("create documents dir");
    std::fs::write(doc_dir.join("a-report.pdf"), b"report").expect("write doc a");
    std::fs::write(doc_dir.join("b-slides.pptx"), b"slides").expect("write doc b");

    let bundle_path = out_dir.join("workspace.spmsbackup.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.document_count, 2);
    assert_eq!(export.entry_count, 4);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains(backup::BUNDLE_FORMAT_V1));
    archive
        .by_name("db/spms.sqlite3")
        .expect("database entry in bundle");
    archive
        .by_name("documents/project-1/a-report.pdf")
        .expect("document entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    assert_eq!(import.document_count, 2);

    let restored = std::fs::read(workspace2.join("spms.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);
    let restored_doc = std::fs::read(workspace2.join("documents/project-1/b-slides.pptx"))
        .expect("read restored document");
    assert_eq!(restored_doc, b"slides");
    assert!(!workspace2.join("spms.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn export_without_database_fails() {
    let workspace = temp_dir("spms-backup-empty");
    let out = workspace.join("out.zip");
    assert!(backup::export_workspace_bundle(&workspace, &out).is_err());
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn plain_sqlite_import_is_supported() {
    let out_dir = temp_dir("spms-backup-plain");
    let workspace = temp_dir("spms-backup-plain-dst");

    let plain_file = out_dir.join("copy.sqlite3");
    let bytes = b"plain-sqlite-copy";
    std::fs::write(&plain_file, bytes).expect("write sqlite file");

    let import = backup::import_workspace_bundle(&plain_file, &workspace).expect("import sqlite");
    assert_eq!(import.bundle_format_detected, "plain-sqlite3");
    assert_eq!(import.document_count, 0);

    let restored = std::fs::read(workspace.join("spms.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn foreign_bundle_format_is_rejected() {
    let out_dir = temp_dir("spms-backup-foreign");
    let workspace = temp_dir("spms-backup-foreign-dst");
    let bundle = out_dir.join("other.zip");
    {
        let f = File::create(&bundle).expect("create zip");
        let mut zip = zip::ZipWriter::new(f);
        zip.start_file("manifest.json", zip::write::FileOptions::default())
            .expect("start manifest");
        zip.write_all(br#"{"format":"something-else"}"#)
            .expect("write manifest");
        zip.finish().expect("finish zip");
    }
    let err = backup::import_workspace_bundle(&bundle, &workspace).expect_err("must reject");
    assert!(err.to_string().contains("unsupported bundle format"));
    assert!(!workspace.join("spms.sqlite3").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn restore_replaces_documents_of_the_previous_workspace() {
    let source = temp_dir("spms-backup-replace-src");
    let target = temp_dir("spms-backup-replace-dst");
    let out_dir = temp_dir("spms-backup-replace-out");

    std::fs::write(source.join("spms.sqlite3"), b"fresh-db").expect("write source db");
    let kept = source.join("documents").join("p-new");
    std::fs::create_dir_all(&kept).expect("create source documents");
    std::fs::write(kept.join("d-new.pdf"), b"new").expect("write source doc");

    std::fs::write(target.join("spms.sqlite3"), b"old-db").expect("write old db");
    let old_docs = target.join("documents").join("p-old");
    std::fs::create_dir_all(&old_docs).expect("create old documents");
    std::fs::write(old_docs.join("d-old.pdf"), b"old").expect("write old doc");

    let bundle = out_dir.join("bundle.zip");
    backup::export_workspace_bundle(&source, &bundle).expect("export bundle");
    let import = backup::import_workspace_bundle(&bundle, &target).expect("import bundle");
    assert_eq!(import.document_count, 1);
    assert!(!old_docs.join("d-old.pdf").exists());
    assert!(target.join("documents/p-new/d-new.pdf").is_file());
    assert!(!target.join("documents.importing").exists());

    // A re-export only carries what the restored workspace owns.
    let again = out_dir.join("again.zip");
    let export = backup::export_workspace_bundle(&target, &again).expect("re-export");
    assert_eq!(export.document_count, 1);

    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(target);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn restore_from_empty_bundle_leaves_no_documents() {
    let source = temp_dir("spms-backup-nodocs-src");
    let target = temp_dir("spms-backup-nodocs-dst");
    let out_dir = temp_dir("spms-backup-nodocs-out");
    std::fs::write(source.join("spms.sqlite3"), b"db").expect("write source db");
    let old_docs = target.join("documents").join("p-old");
    std::fs::create_dir_all(&old_docs).expect("create old documents");
    std::fs::write(old_docs.join("d-old.pdf"), b"old").expect("write old doc");

    let bundle = out_dir.join("bundle.zip");
    backup::export_workspace_bundle(&source, &bundle).expect("export bundle");
    let import = backup::import_workspace_bundle(&bundle, &target).expect("import bundle");
    assert_eq!(import.document_count, 0);
    assert!(!old_docs.exists());

    let plain = out_dir.join("plain.sqlite3");
    std::fs::write(&plain, b"plain").expect("write plain db");
    std::fs::create_dir_all(&old_docs).expect("recreate old documents");
    std::fs::write(old_docs.join("d-old.pdf"), b"old").expect("rewrite old doc");
    backup::import_workspace_bundle(&plain, &target).expect("import plain sqlite");
    assert!(!old_docs.exists());

    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(target);
    let _ = std::fs::remove_dir_all(out_dir);
}
