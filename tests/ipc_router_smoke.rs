mod test_support;

use serde_json::json;
use test_support::{call, spawn_sidecar, Harness};

const METHODS: &[&str] = &[
    "health",
    "workspace.select",
    "auth.me",
    "auth.changePassword",
    "users.list",
    "users.get",
    "users.create",
    "users.update",
    "users.delete",
    "departments.list",
    "departments.create",
    "departments.delete",
    "academicYears.list",
    "academicYears.create",
    "academicYears.setCurrent",
    "projectTypes.list",
    "projectTypes.create",
    "projectTypes.delete",
    "setup.get",
    "setup.update",
    "groups.create",
    "groups.get",
    "groups.list",
    "groups.addMember",
    "groups.removeMember",
    "groups.leave",
    "groups.transferLeadership",
    "groups.setMembers",
    "groups.delete",
    "projects.propose",
    "projects.list",
    "projects.get",
    "projects.update",
    "projects.delete",
    "projects.assignGuide",
    "projects.unassignGuide",
    "projects.review",
    "projects.setStatus",
    "faculty.workload",
    "milestones.list",
    "milestones.create",
    "milestones.update",
    "milestones.complete",
    "milestones.delete",
    "meetings.list",
    "meetings.create",
    "meetings.update",
    "meetings.cancel",
    "meetings.complete",
    "meetings.attendance.get",
    "meetings.attendance.set",
    "attendance.summary",
    "documents.list",
    "documents.upload",
    "documents.delete",
    "documents.exportZip",
    "grades.list",
    "grades.upsert",
    "grades.delete",
    "grades.summary",
    "chat.list",
    "chat.send",
    "notifications.list",
    "notifications.markRead",
    "notifications.markAllRead",
    "dashboard.summary",
    "backup.exportWorkspaceBundle",
    "backup.importWorkspaceBundle",
    "exports.projectsCsv",
    "auth.logout",
];

#[test]
fn every_method_is_routed() {
    let mut h = Harness::start("spms-router-smoke");
    let admin = h.admin.clone();
    for method in METHODS {
        let resp = h.raw(Some(&admin), method, json!({}));
        let code = resp
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        assert_ne!(code, "not_implemented", "{} is not routed", method);
    }
    let resp = h.raw(Some(&admin), "projects.frobnicate", json!({}));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );
}

#[test]
fn requests_before_workspace_select_fail_with_no_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let health = call(&mut stdin, &mut reader, "1", "health", None, json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert!(health.pointer("/result/workspacePath").unwrap().is_null());

    let listed = call(&mut stdin, &mut reader, "2", "projects.list", None, json!({}));
    assert_eq!(
        listed.pointer("/error/code").and_then(|v| v.as_str()),
        Some("no_workspace")
    );
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn bad_json_line_gets_an_error_reply_and_the_loop_continues() {
    use std::io::{BufRead, Write};
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("json reply");
    assert_eq!(v.pointer("/error/code").and_then(|v| v.as_str()), Some("bad_json"));

    let health = call(&mut stdin, &mut reader, "after", "health", None, json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));
    let _ = child.kill();
    let _ = child.wait();
}
