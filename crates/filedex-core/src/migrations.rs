//! Document schema migrations.
//!
//! Migrations run on the raw JSON object before it is deserialized into a
//! [`Document`](crate::models::Document), so older shapes that no longer fit
//! the struct can still be read. Each step upgrades exactly one version and
//! is a no-op on documents that are already past it.
//!
//! | From | To | Change |
//! |------|----|--------|
//! | 0 | 1 | `paths` list → `{path: mtime}` map |
//! | 1 | 2 | add `paths_list` and `copies` |
//! | 2 | 3 | `next_module` → `next`, add archive flags and `modules_done` |

use serde_json::{Map, Value};

use crate::models::CURRENT_VERSION;

type Migration = fn(&mut Map<String, Value>);

/// Ordered migrations; entry `i` upgrades version `i` to `i + 1`.
const MIGRATIONS: [Migration; CURRENT_VERSION as usize] =
    [paths_list_to_map, add_paths_list, rename_next_and_flags];

/// Keys that belong to the document itself rather than a module namespace.
pub const RESERVED_KEYS: &[&str] = &[
    "id",
    "paths",
    "paths_list",
    "mtime",
    "size",
    "type",
    "copies",
    "next",
    "has_archive_paths",
    "offline",
    "version",
    "modules_done",
];

fn version_of(doc: &Map<String, Value>) -> u32 {
    doc.get("version")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(0)
}

/// Apply pending migrations in order. Returns whether anything changed.
pub fn migrate(doc: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    loop {
        let version = version_of(doc);
        if version >= CURRENT_VERSION {
            break;
        }
        MIGRATIONS[version as usize](doc);
        doc.insert("version".to_string(), Value::from(version + 1));
        changed = true;
    }
    changed
}

fn paths_list_to_map(doc: &mut Map<String, Value>) {
    let mtime = doc.get("mtime").and_then(Value::as_f64).unwrap_or(0.0);
    if let Some(Value::Array(list)) = doc.get("paths") {
        let map: Map<String, Value> = list
            .iter()
            .filter_map(Value::as_str)
            .map(|p| (p.to_string(), Value::from(mtime)))
            .collect();
        doc.insert("paths".to_string(), Value::Object(map));
    }
}

fn add_paths_list(doc: &mut Map<String, Value>) {
    let mut keys: Vec<String> = doc
        .get("paths")
        .and_then(Value::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    doc.insert("copies".to_string(), Value::from(keys.len()));
    doc.insert(
        "paths_list".to_string(),
        Value::Array(keys.into_iter().map(Value::from).collect()),
    );
}

fn rename_next_and_flags(doc: &mut Map<String, Value>) {
    if let Some(next) = doc.remove("next_module") {
        doc.entry("next").or_insert(next);
    }
    doc.entry("has_archive_paths").or_insert(Value::Bool(false));
    doc.entry("offline").or_insert(Value::Bool(false));
    if !doc.contains_key("modules_done") {
        // Older documents only carry namespaces for modules that already ran.
        let mut done: Vec<String> = doc
            .iter()
            .filter(|(k, v)| !RESERVED_KEYS.contains(&k.as_str()) && v.is_object())
            .map(|(k, _)| k.clone())
            .collect();
        done.sort();
        doc.insert(
            "modules_done".to_string(),
            Value::Array(done.into_iter().map(Value::from).collect()),
        );
    }
}
