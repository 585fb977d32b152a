mod test_support;

use serde_json::json;
use test_support::{str_at, Harness};

fn member_ids(group: &serde_json::Value) -> Vec<String> {
    group
        .pointer("/group/members")
        .and_then(|v| v.as_array())
        .expect("members")
        .iter()
        .filter_map(|m| m.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()))
        .collect()
}

fn leader_count(group: &serde_json::Value) -> usize {
    group
        .pointer("/group/members")
        .and_then(|v| v.as_array())
        .expect("members")
        .iter()
        .filter(|m| m.get("isLeader").and_then(|v| v.as_bool()) == Some(true))
        .count()
}

#[test]
fn fifth_member_is_rejected_with_capacity_exceeded() {
    let mut h = Harness::start("spms-groups-cap");
    let (leader_id, leader) = h.student(1);
    let others: Vec<String> = (2..=5).map(|n| h.student(n).0).collect();

    let created = h.ok(&leader, "groups.create", json!({ "name": "Full house" }));
    let group_id = str_at(&created, "/group/id").to_string();
    assert_eq!(str_at(&created, "/group/leaderId"), leader_id);

    for sid in &others[..3] {
        let _ = h.ok(
            &leader,
            "groups.addMember",
            json!({ "groupId": group_id, "studentId": sid }),
        );
    }
    let code = h.err(
        &leader,
        "groups.addMember",
        json!({ "groupId": group_id, "studentId": others[3] }),
    );
    assert_eq!(code, "capacity_exceeded");

    let group = h.ok(&leader, "groups.get", json!({}));
    assert_eq!(member_ids(&group).len(), 4);
    assert_eq!(leader_count(&group), 1);
}

#[test]
fn configured_group_size_cannot_exceed_hard_cap() {
    let mut h = Harness::start("spms-groups-config");
    let admin = h.admin.clone();
    let code = h.err(
        &admin,
        "setup.update",
        json!({ "section": "allocation", "patch": { "maxGroupSize": 5 } }),
    );
    assert_eq!(code, "bad_params");

    let _ = h.admin_ok(
        "setup.update",
        json!({ "section": "allocation", "patch": { "maxGroupSize": 2 } }),
    );
    let (_, leader) = h.student(1);
    let s2 = h.student(2).0;
    let s3 = h.student(3).0;
    let created = h.ok(&leader, "groups.create", json!({ "name": "Pair" }));
    let group_id = str_at(&created, "/group/id").to_string();
    let _ = h.ok(&leader, "groups.addMember", json!({ "groupId": group_id, "studentId": s2 }));
    assert_eq!(
        h.err(&leader, "groups.addMember", json!({ "groupId": group_id, "studentId": s3 })),
        "capacity_exceeded"
    );
}

#[test]
fn student_in_a_group_cannot_join_or_create_another() {
    let mut h = Harness::start("spms-groups-single");
    let (_, a) = h.student(1);
    let (b_id, b) = h.student(2);
    let g1 = h.ok(&a, "groups.create", json!({ "name": "A" }));
    let g1_id = str_at(&g1, "/group/id").to_string();
    let _ = h.ok(&a, "groups.addMember", json!({ "groupId": g1_id, "studentId": b_id }));

    assert_eq!(h.err(&b, "groups.create", json!({ "name": "B" })), "conflict");

    let (_, c) = h.student(3);
    let g2 = h.ok(&c, "groups.create", json!({ "name": "C" }));
    let g2_id = str_at(&g2, "/group/id").to_string();
    assert_eq!(
        h.err(&c, "groups.addMember", json!({ "groupId": g2_id, "studentId": b_id })),
        "conflict"
    );
}

#[test]
fn only_the_leader_manages_members_and_the_leader_cannot_leave() {
    let mut h = Harness::start("spms-groups-leader");
    let (leader_id, leader) = h.student(1);
    let (member_id, member) = h.student(2);
    let outsider = h.student(3).0;
    let created = h.ok(&leader, "groups.create", json!({ "name": "Team" }));
    let group_id = str_at(&created, "/group/id").to_string();
    let _ = h.ok(&leader, "groups.addMember", json!({ "groupId": group_id, "studentId": member_id }));

    assert_eq!(
        h.err(&member, "groups.addMember", json!({ "groupId": group_id, "studentId": outsider })),
        "forbidden"
    );
    assert_eq!(
        h.err(&leader, "groups.removeMember", json!({ "groupId": group_id, "studentId": leader_id })),
        "conflict"
    );
    assert_eq!(h.err(&leader, "groups.leave", json!({})), "conflict");

    let moved = h.ok(
        &leader,
        "groups.transferLeadership",
        json!({ "groupId": group_id, "studentId": member_id }),
    );
    assert_eq!(str_at(&moved, "/group/leaderId"), member_id);
    assert_eq!(leader_count(&moved), 1);

    // The former leader is now an ordinary member and may leave.
    let _ = h.ok(&leader, "groups.leave", json!({}));
    let group = h.ok(&member, "groups.get", json!({}));
    assert_eq!(member_ids(&group), vec![member_id]);
}

#[test]
fn admin_set_members_is_all_or_nothing() {
    let mut h = Harness::start("spms-groups-setmembers");
    let (a_id, a) = h.student(1);
    let (b_id, _) = h.student(2);
    let (c_id, c) = h.student(3);
    let d_id = h.student(4).0;
    let g = h.ok(&a, "groups.create", json!({ "name": "Main" }));
    let group_id = str_at(&g, "/group/id").to_string();
    let _ = h.ok(&c, "groups.create", json!({ "name": "Other" }));

    // c belongs to another group: nothing changes.
    let admin = h.admin.clone();
    let code = h.err(
        &admin,
        "groups.setMembers",
        json!({ "groupId": group_id, "studentIds": [a_id, b_id, c_id], "leaderId": b_id }),
    );
    assert_eq!(code, "conflict");
    let unchanged = h.admin_ok("groups.get", json!({ "groupId": group_id }));
    assert_eq!(member_ids(&unchanged), vec![a_id.clone()]);

    let updated = h.admin_ok(
        "groups.setMembers",
        json!({ "groupId": group_id, "studentIds": [b_id, d_id], "leaderId": d_id }),
    );
    let mut ids = member_ids(&updated);
    ids.sort();
    let mut expected = vec![b_id.clone(), d_id.clone()];
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(str_at(&updated, "/group/leaderId"), d_id);
    assert_eq!(leader_count(&updated), 1);

    // a was detached and is free again.
    let a_group = h.ok(&a, "groups.get", json!({}));
    assert!(a_group.get("group").map(|v| v.is_null()).unwrap_or(false));
}
