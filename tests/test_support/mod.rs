#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ADMIN_PASSWORD: &str = "admin-pass-1";
pub const USER_PASSWORD: &str = "user-pass-1";

pub fn temp_dir(prefix: &str) -> PathBuf {
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

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_spmsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn spmsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

/// Sends one request and returns the full response envelope.
pub fn call(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    session: Option<&str>,
    params: Value,
) -> Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(s) = session {
        payload["session"] = json!(s);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    authed_ok(stdin, reader, None, id, method, params)
}

pub fn authed_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    session: Option<&str>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = call(stdin, reader, id, method, session, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

/// Expects a failure and returns its error code.
pub fn authed_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    session: Option<&str>,
    id: &str,
    method: &str,
    params: Value,
) -> String {
    let value = call(stdin, reader, id, method, session, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

pub fn str_at<'a>(v: &'a Value, pointer: &str) -> &'a str {
    v.pointer(pointer)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string at {} in {}", pointer, v))
}

/// A running sidecar on a fresh workspace with a bootstrapped admin.
pub struct Harness {
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    pub workspace: PathBuf,
    pub admin: String,
    next_id: u64,
}

impl Harness {
    pub fn start(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "ws",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        let boot = request_ok(
            &mut stdin,
            &mut reader,
            "boot",
            "auth.bootstrap",
            json!({ "email": "admin@example.edu", "name": "Admin", "password": ADMIN_PASSWORD }),
        );
        let admin = str_at(&boot, "/session").to_string();
        Harness {
            child,
            stdin,
            reader,
            workspace,
            admin,
            next_id: 0,
        }
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("r{}", self.next_id)
    }

    pub fn ok(&mut self, session: &str, method: &str, params: Value) -> Value {
        let id = self.id();
        authed_ok(
            &mut self.stdin,
            &mut self.reader,
            Some(session),
            &id,
            method,
            params,
        )
    }

    pub fn err(&mut self, session: &str, method: &str, params: Value) -> String {
        let id = self.id();
        authed_err(
            &mut self.stdin,
            &mut self.reader,
            Some(session),
            &id,
            method,
            params,
        )
    }

    pub fn raw(&mut self, session: Option<&str>, method: &str, params: Value) -> Value {
        let id = self.id();
        call(&mut self.stdin, &mut self.reader, &id, method, session, params)
    }

    pub fn admin_ok(&mut self, method: &str, params: Value) -> Value {
        let admin = self.admin.clone();
        self.ok(&admin, method, params)
    }

    /// Creates a user as admin and logs them in. Returns (user id, session).
    pub fn user(&mut self, email: &str, name: &str, role: &str, profile: Value) -> (String, String) {
        let created = self.admin_ok(
            "users.create",
            json!({
                "email": email,
                "name": name,
                "role": role,
                "password": USER_PASSWORD,
                "profile": profile,
            }),
        );
        let user_id = str_at(&created, "/user/id").to_string();
        let id = self.id();
        let login = request_ok(
            &mut self.stdin,
            &mut self.reader,
            &id,
            "auth.login",
            json!({ "email": email, "password": USER_PASSWORD }),
        );
        (user_id, str_at(&login, "/session").to_string())
    }

    pub fn student(&mut self, n: u32) -> (String, String) {
        self.user(
            &format!("student{}@example.edu", n),
            &format!("Student {}", n),
            "student",
            json!({ "rollNo": format!("R{:03}", n) }),
        )
    }

    pub fn faculty(&mut self, n: u32, max_load: Option<i64>) -> (String, String) {
        self.user(
            &format!("faculty{}@example.edu", n),
            &format!("Faculty {}", n),
            "faculty",
            json!({ "employeeNo": format!("E{:03}", n), "maxLoad": max_load }),
        )
    }

    /// Leader creates a group, adds `others`, proposes a project. Returns (group id, project id).
    pub fn group_with_project(
        &mut self,
        leader_session: &str,
        others: &[&str],
        title: &str,
    ) -> (String, String) {
        let group = self.ok(leader_session, "groups.create", json!({ "name": format!("{} team", title) }));
        let group_id = str_at(&group, "/group/id").to_string();
        for student_id in others {
            let _ = self.ok(
                leader_session,
                "groups.addMember",
                json!({ "groupId": group_id, "studentId": student_id }),
            );
        }
        let project = self.ok(
            leader_session,
            "projects.propose",
            json!({ "title": title, "description": format!("{} description", title) }),
        );
        (group_id, str_at(&project, "/project/id").to_string())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.workspace);
    }
}
