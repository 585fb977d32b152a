mod test_support;

use serde_json::json;
use test_support::{str_at, temp_dir, Harness};

#[test]
fn dashboards_reflect_each_role() {
    let mut h = Harness::start("spms-dashboard");
    let (_, leader) = h.student(1);
    let (_, loner) = h.student(2);
    let (faculty_id, faculty) = h.faculty(1, Some(3));
    let (_, project_id) = h.group_with_project(&leader, &[], "Weather Station");

    let admin = h.admin_ok("dashboard.summary", json!({}));
    assert_eq!(str_at(&admin, "/role"), "admin");
    assert_eq!(admin.pointer("/usersByRole/student").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(admin.pointer("/projectsByStatus/PROPOSED").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(admin.pointer("/projectsByStatus/COMPLETED").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(admin.get("unassignedProposals").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(admin.get("studentsWithoutGroup").and_then(|v| v.as_i64()), Some(1));

    let _ = h.admin_ok(
        "projects.assignGuide",
        json!({ "projectId": project_id, "facultyId": faculty_id }),
    );
    let _ = h.ok(&faculty, "projects.review", json!({ "projectId": project_id, "decision": "approve" }));
    let _ = h.ok(
        &faculty,
        "milestones.create",
        json!({ "projectId": project_id, "title": "Old", "dueDate": "2000-01-01" }),
    );
    let _ = h.ok(
        &faculty,
        "meetings.create",
        json!({ "projectId": project_id, "scheduledAt": "2999-01-01T09:00", "agenda": "Sync" }),
    );

    let fac = h.ok(&faculty, "dashboard.summary", json!({}));
    assert_eq!(fac.get("guidedProjects").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(fac.get("capacity").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(fac.get("available").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(fac.get("pendingReviews").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(fac.get("upcomingMeetings").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(fac.get("overdueMilestones").and_then(|v| v.as_i64()), Some(1));

    let stu = h.ok(&leader, "dashboard.summary", json!({}));
    assert_eq!(stu.get("isLeader").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(str_at(&stu, "/project/status"), "APPROVED");
    assert_eq!(str_at(&stu, "/project/guideName"), "Faculty 1");
    assert_eq!(str_at(&stu, "/nextMilestone/title"), "Old");
    assert_eq!(stu.pointer("/nextMilestone/overdue").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(stu.get("upcomingMeetings").and_then(|v| v.as_i64()), Some(1));

    let empty = h.ok(&loner, "dashboard.summary", json!({}));
    assert!(empty.get("group").map(|v| v.is_null()).unwrap_or(false));
    assert!(empty.get("project").map(|v| v.is_null()).unwrap_or(false));
}

#[test]
fn projects_csv_lists_every_project() {
    let mut h = Harness::start("spms-projects-csv");
    let (_, leader_a) = h.student(1);
    let (member_id, _) = h.student(2);
    let (_, leader_b) = h.student(3);
    let _ = h.group_with_project(&leader_a, &[member_id.as_str()], "Plain title");
    let _ = h.group_with_project(&leader_b, &[], "Title, with comma");

    let out_dir = temp_dir("spms-projects-csv-out");
    let out = out_dir.join("projects.csv");
    assert_eq!(
        h.err(&leader_a, "exports.projectsCsv", json!({ "outPath": out.to_string_lossy() })),
        "forbidden"
    );
    let res = h.admin_ok("exports.projectsCsv", json!({ "outPath": out.to_string_lossy() }));
    assert_eq!(res.get("rowsExported").and_then(|v| v.as_u64()), Some(2));

    let text = std::fs::read_to_string(&out).expect("read csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("title,status,group,members,leader,guide"));
    assert!(text.contains("\"Title, with comma\",PROPOSED"));
    assert!(text.contains("Student 1; Student 2"));
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn backup_bundle_restores_the_workspace() {
    let mut h = Harness::start("spms-backup-ipc");
    let (_, leader) = h.student(1);
    let (_, project_id) = h.group_with_project(&leader, &[], "Archive Me");
    let src_dir = temp_dir("spms-backup-ipc-src");
    let doc = src_dir.join("notes.txt");
    std::fs::write(&doc, b"meeting notes").expect("write doc");
    let _ = h.ok(
        &leader,
        "documents.upload",
        json!({ "projectId": project_id, "sourcePath": doc.to_string_lossy() }),
    );

    assert_eq!(
        h.err(&leader, "backup.exportWorkspaceBundle", json!({ "outPath": "x.zip" })),
        "forbidden"
    );
    let bundle = src_dir.join("workspace.zip");
    let exported = h.admin_ok(
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(str_at(&exported, "/bundleFormat"), "spms-workspace-v1");
    assert_eq!(exported.get("documentCount").and_then(|v| v.as_u64()), Some(1));

    // Changes made after the export disappear on restore.
    let _ = h.student(2);
    let imported = h.admin_ok(
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(str_at(&imported, "/bundleFormatDetected"), "spms-workspace-v1");
    assert_eq!(imported.get("documentCount").and_then(|v| v.as_u64()), Some(1));

    let students = h.admin_ok("users.list", json!({ "role": "student" }));
    assert_eq!(students.get("users").and_then(|v| v.as_array()).map(|a| a.len()), Some(1));
    let docs = h.ok(&leader, "documents.list", json!({ "projectId": project_id }));
    assert_eq!(docs.get("documents").and_then(|v| v.as_array()).map(|a| a.len()), Some(1));

    let _ = std::fs::remove_dir_all(src_dir);
}
