use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_session, session_with_role};
use crate::ipc::types::{AppState, Request};
use crate::model::{Role, MAX_GROUP_SIZE};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
pub enum SetupSection {
    Allocation,
    Meetings,
    Documents,
    Security,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "allocation" => Some(Self::Allocation),
            "meetings" => Some(Self::Meetings),
            "documents" => Some(Self::Documents),
            "security" => Some(Self::Security),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Allocation => "setup.allocation",
            Self::Meetings => "setup.meetings",
            Self::Documents => "setup.documents",
            Self::Security => "setup.security",
        }
    }
}

pub const DEFAULT_MAX_FACULTY_LOAD: i64 = 4;
pub const DEFAULT_MAX_UPLOAD_BYTES: i64 = 20 * 1024 * 1024;

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Allocation => json!({
            "maxFacultyLoad": DEFAULT_MAX_FACULTY_LOAD,
            "maxGroupSize": MAX_GROUP_SIZE,
            "requireGuideBeforeApproval": false
        }),
        SetupSection::Meetings => json!({
            "defaultDurationMinutes": 30,
            "defaultLocation": ""
        }),
        SetupSection::Documents => json!({
            "maxUploadBytes": DEFAULT_MAX_UPLOAD_BYTES,
            "allowedExtensions": ["pdf", "doc", "docx", "ppt", "pptx", "zip", "txt", "md"]
        }),
        SetupSection::Security => json!({
            "sessionTtlHours": 24,
            "minPasswordLength": 8
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_extensions(v: &Value, key: &str) -> Result<Vec<Value>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings", key))?;
    if arr.is_empty() || arr.len() > 32 {
        return Err(format!("{} must list 1..=32 extensions", key));
    }
    let mut out: Vec<Value> = Vec::new();
    for item in arr {
        let s = parse_string_max(item, key, 10)?
            .trim_start_matches('.')
            .to_ascii_lowercase();
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("{} entries must be alphanumeric", key));
        }
        let v = Value::String(s);
        if !out.contains(&v) {
            out.push(v);
        }
    }
    Ok(out)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Allocation => match k.as_str() {
                "maxFacultyLoad" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 50)?));
                }
                "maxGroupSize" => {
                    obj.insert(
                        k.clone(),
                        Value::from(parse_i64_range(v, k, 1, MAX_GROUP_SIZE as i64)?),
                    );
                }
                "requireGuideBeforeApproval" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown allocation field: {}", k)),
            },
            SetupSection::Meetings => match k.as_str() {
                "defaultDurationMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 5, 480)?));
                }
                "defaultLocation" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                _ => return Err(format!("unknown meetings field: {}", k)),
            },
            SetupSection::Documents => match k.as_str() {
                "maxUploadBytes" => {
                    obj.insert(
                        k.clone(),
                        Value::from(parse_i64_range(v, k, 1024, 512 * 1024 * 1024)?),
                    );
                }
                "allowedExtensions" => {
                    obj.insert(k.clone(), Value::Array(parse_extensions(v, k)?));
                }
                _ => return Err(format!("unknown documents field: {}", k)),
            },
            SetupSection::Security => match k.as_str() {
                "sessionTtlHours" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 720)?));
                }
                "minPasswordLength" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 4, 128)?));
                }
                _ => return Err(format!("unknown security field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults as a whole.
            let mut merged = current.clone();
            match merge_section_patch(section, &mut merged, saved_obj) {
                Ok(()) => current = merged,
                Err(e) => tracing::warn!(
                    section = section.key(),
                    error = %e,
                    "ignoring invalid saved setup section"
                ),
            }
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = require_session(conn, req) {
        return e.response(&req.id);
    }
    let mut out = Map::new();
    for (name, section) in [
        ("allocation", SetupSection::Allocation),
        ("meetings", SetupSection::Meetings),
        ("documents", SetupSection::Documents),
        ("security", SetupSection::Security),
    ] {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(name.to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = session_with_role(conn, req, &[Role::Admin]) {
        return e.response(&req.id);
    }
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "section": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
