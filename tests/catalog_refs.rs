mod test_support;

use serde_json::{json, Value};
use test_support::{str_at, Harness};

fn rows<'a>(v: &'a Value, key: &str) -> &'a Vec<Value> {
    v.get(key).and_then(|x| x.as_array()).expect(key)
}

#[test]
fn referenced_department_cannot_be_deleted() {
    let mut h = Harness::start("spms-catalog-department");
    let dept = h.admin_ok("departments.create", json!({ "code": "cs", "name": "Computer Science" }));
    let dept_id = str_at(&dept, "/departmentId").to_string();
    assert_eq!(str_at(&dept, "/code"), "CS");
    let (student_id, _) = h.user(
        "dept.student@example.edu",
        "Dept Student",
        "student",
        json!({ "rollNo": "D001", "departmentId": dept_id }),
    );

    let admin = h.admin.clone();
    assert_eq!(
        h.err(&admin, "departments.delete", json!({ "departmentId": dept_id })),
        "conflict"
    );
    let listed = h.admin_ok("departments.list", json!({}));
    assert_eq!(rows(&listed, "departments")[0].get("studentCount").and_then(|v| v.as_i64()), Some(1));

    let _ = h.admin_ok(
        "users.update",
        json!({ "userId": student_id, "profile": { "departmentId": null } }),
    );
    let _ = h.admin_ok("departments.delete", json!({ "departmentId": dept_id }));
    assert_eq!(
        h.err(&admin, "departments.delete", json!({ "departmentId": dept_id })),
        "not_found"
    );
}

#[test]
fn used_project_type_cannot_be_deleted() {
    let mut h = Harness::start("spms-catalog-type");
    let kind = h.admin_ok("projectTypes.create", json!({ "name": "Research" }));
    let type_id = str_at(&kind, "/projectTypeId").to_string();
    let (_, leader) = h.student(1);
    let _ = h.ok(&leader, "groups.create", json!({ "name": "Typed team" }));
    let project = h.ok(
        &leader,
        "projects.propose",
        json!({ "title": "Typed", "description": "Typed description", "projectTypeId": type_id }),
    );
    let project_id = str_at(&project, "/project/id").to_string();
    assert_eq!(str_at(&project, "/project/projectTypeId"), type_id);

    let admin = h.admin.clone();
    assert_eq!(
        h.err(&admin, "projectTypes.delete", json!({ "projectTypeId": type_id })),
        "conflict"
    );
    let _ = h.admin_ok("projects.delete", json!({ "projectId": project_id }));
    let _ = h.admin_ok("projectTypes.delete", json!({ "projectTypeId": type_id }));
    let listed = h.admin_ok("projectTypes.list", json!({}));
    assert!(rows(&listed, "projectTypes").is_empty());
}

#[test]
fn exactly_one_academic_year_is_current() {
    let mut h = Harness::start("spms-catalog-years");
    let first = h.admin_ok("academicYears.create", json!({ "label": "2025-26" }));
    let second = h.admin_ok("academicYears.create", json!({ "label": "2026-27" }));
    assert_eq!(first.get("isCurrent").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(second.get("isCurrent").and_then(|v| v.as_bool()), Some(false));
    let second_id = str_at(&second, "/academicYearId").to_string();

    let _ = h.admin_ok("academicYears.setCurrent", json!({ "academicYearId": second_id }));
    let listed = h.admin_ok("academicYears.list", json!({}));
    let current: Vec<&str> = rows(&listed, "academicYears")
        .iter()
        .filter(|y| y.get("isCurrent").and_then(|v| v.as_bool()) == Some(true))
        .map(|y| str_at(y, "/label"))
        .collect();
    assert_eq!(current, vec!["2026-27"]);

    let admin = h.admin.clone();
    assert_eq!(
        h.err(&admin, "academicYears.setCurrent", json!({ "academicYearId": "missing" })),
        "not_found"
    );
    assert_eq!(
        h.err(&admin, "academicYears.create", json!({ "label": "2025-26" })),
        "conflict"
    );
}

#[test]
fn group_with_a_project_cannot_be_deleted() {
    let mut h = Harness::start("spms-catalog-group-delete");
    let (leader_id, leader) = h.student(1);
    let (member_id, member) = h.student(2);
    let (group_id, project_id) = h.group_with_project(&leader, &[member_id.as_str()], "Kept");

    let admin = h.admin.clone();
    assert_eq!(h.err(&leader, "groups.delete", json!({ "groupId": group_id })), "forbidden");
    assert_eq!(h.err(&admin, "groups.delete", json!({ "groupId": group_id })), "conflict");

    // Only the leader hands over leadership.
    assert_eq!(
        h.err(
            &member,
            "groups.transferLeadership",
            json!({ "groupId": group_id, "studentId": member_id })
        ),
        "forbidden"
    );
    let moved = h.ok(
        &leader,
        "groups.transferLeadership",
        json!({ "groupId": group_id, "studentId": member_id }),
    );
    assert_eq!(str_at(&moved, "/group/leaderId"), member_id);
    assert_eq!(
        h.err(
            &leader,
            "groups.transferLeadership",
            json!({ "groupId": group_id, "studentId": leader_id })
        ),
        "forbidden"
    );

    let _ = h.admin_ok("projects.delete", json!({ "projectId": project_id }));
    let _ = h.admin_ok("groups.delete", json!({ "groupId": group_id }));
    let me = h.ok(&member, "auth.me", json!({}));
    assert!(me.pointer("/user/profile/groupId").map(|v| v.is_null()).unwrap_or(true));
}
