mod test_support;

use serde_json::json;
use test_support::{str_at, Harness, ADMIN_PASSWORD, USER_PASSWORD};

#[test]
fn bootstrap_only_works_once() {
    let mut h = Harness::start("spms-auth-bootstrap");
    let resp = h.raw(
        None,
        "auth.bootstrap",
        json!({ "email": "other@example.edu", "name": "Other", "password": "another-pass" }),
    );
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("conflict")
    );

    let me = h.admin_ok("auth.me", json!({}));
    assert_eq!(str_at(&me, "/user/role"), "admin");
    assert_eq!(str_at(&me, "/user/email"), "admin@example.edu");
}

#[test]
fn login_rejects_bad_credentials_and_inactive_accounts() {
    let mut h = Harness::start("spms-auth-login");
    let (student_id, _) = h.student(1);

    let bad = h.raw(
        None,
        "auth.login",
        json!({ "email": "student1@example.edu", "password": "wrong-password" }),
    );
    assert_eq!(
        bad.pointer("/error/code").and_then(|v| v.as_str()),
        Some("unauthorized")
    );

    // Email matching is case-insensitive.
    let ok = h.raw(
        None,
        "auth.login",
        json!({ "email": "Student1@Example.edu", "password": USER_PASSWORD }),
    );
    assert_eq!(ok.get("ok").and_then(|v| v.as_bool()), Some(true));

    let _ = h.admin_ok(
        "users.update",
        json!({ "userId": student_id, "active": false }),
    );
    let inactive = h.raw(
        None,
        "auth.login",
        json!({ "email": "student1@example.edu", "password": USER_PASSWORD }),
    );
    assert_eq!(
        inactive.pointer("/error/code").and_then(|v| v.as_str()),
        Some("unauthorized")
    );
}

#[test]
fn missing_or_unknown_session_is_unauthorized() {
    let mut h = Harness::start("spms-auth-missing");
    let none = h.raw(None, "projects.list", json!({}));
    assert_eq!(
        none.pointer("/error/code").and_then(|v| v.as_str()),
        Some("unauthorized")
    );
    let code = h.err("not-a-real-token", "projects.list", json!({}));
    assert_eq!(code, "unauthorized");
}

#[test]
fn role_guards_return_forbidden() {
    let mut h = Harness::start("spms-auth-roles");
    let (_, student) = h.student(1);
    let (_, faculty) = h.faculty(1, None);

    let code = h.err(
        &student,
        "users.create",
        json!({ "email": "x@example.edu", "name": "X", "role": "student", "password": "whatever-1" }),
    );
    assert_eq!(code, "forbidden");
    assert_eq!(h.err(&faculty, "departments.create", json!({ "code": "CS", "name": "CS" })), "forbidden");
    assert_eq!(h.err(&student, "groups.list", json!({})), "forbidden");
    // The user directory is admin only.
    let (student_id, _) = h.student(2);
    assert_eq!(h.err(&faculty, "users.list", json!({})), "forbidden");
    assert_eq!(h.err(&faculty, "users.get", json!({ "userId": student_id })), "forbidden");
    assert_eq!(h.err(&student, "users.list", json!({ "role": "faculty" })), "forbidden");
    assert_eq!(
        h.err(&student, "setup.update", json!({ "section": "allocation", "patch": {} })),
        "forbidden"
    );

    // Reads are open to every role.
    let _ = h.ok(&student, "departments.list", json!({}));
    let _ = h.ok(&faculty, "setup.get", json!({}));
}

#[test]
fn change_password_revokes_other_sessions() {
    let mut h = Harness::start("spms-auth-password");
    let (_, first) = h.student(1);
    let second = str_at(
        &h.raw(
            None,
            "auth.login",
            json!({ "email": "student1@example.edu", "password": USER_PASSWORD }),
        ),
        "/result/session",
    )
    .to_string();

    let short = h.err(
        &first,
        "auth.changePassword",
        json!({ "currentPassword": USER_PASSWORD, "newPassword": "short" }),
    );
    assert_eq!(short, "bad_params");
    let wrong = h.err(
        &first,
        "auth.changePassword",
        json!({ "currentPassword": ADMIN_PASSWORD, "newPassword": "brand-new-pass" }),
    );
    assert_eq!(wrong, "unauthorized");

    let _ = h.ok(
        &first,
        "auth.changePassword",
        json!({ "currentPassword": USER_PASSWORD, "newPassword": "brand-new-pass" }),
    );
    let _ = h.ok(&first, "auth.me", json!({}));
    assert_eq!(h.err(&second, "auth.me", json!({})), "unauthorized");

    let _ = h.ok(&first, "auth.logout", json!({}));
    assert_eq!(h.err(&first, "auth.me", json!({})), "unauthorized");
}

#[test]
fn deleting_a_group_leader_is_refused() {
    let mut h = Harness::start("spms-auth-delete");
    let (leader_id, leader) = h.student(1);
    let (plain_id, _) = h.student(2);
    let _ = h.ok(&leader, "groups.create", json!({ "name": "Team" }));

    let admin = h.admin.clone();
    assert_eq!(
        h.err(&admin, "users.delete", json!({ "userId": leader_id })),
        "conflict"
    );
    let _ = h.admin_ok("users.delete", json!({ "userId": plain_id }));
    let listed = h.admin_ok("users.list", json!({ "role": "student" }));
    let users = listed.get("users").and_then(|v| v.as_array()).expect("users");
    assert_eq!(users.len(), 1);
}
