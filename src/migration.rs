//! Migration engine.
//!
//! Detects the on-disk schema version of a project and brings it up to
//! current: DETECT, then plan, then apply each version-to-version step,
//! then verify the result. Upgraded output always goes to a new location;
//! the source project is never mutated, so a failed migration loses
//! nothing.

use crate::error::{Result, StoreError};
use crate::schema::{upgrade_steps, RawRecord};
use crate::storage::{load_document, read_version, write_document_atomic, DATA_DIR_NAME, INDEX_FILE_NAME};
use crate::types::{ItemId, SCHEMA_VERSION};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The ordered plan for one migration run.
#[derive(Clone, Debug)]
pub struct MigrationPlan {
    pub from: u32,
    pub to: u32,
    /// Step names, in application order.
    pub steps: Vec<String>,
}

/// Outcome of a successful migration.
#[derive(Clone, Debug)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    pub steps: Vec<String>,
    /// Items carried over from the source.
    pub items_migrated: usize,
    /// Items created by structural transforms.
    pub items_created: usize,
}

/// Read the schema version of a project on disk.
pub fn detect(project_path: &Path) -> Result<u32> {
    read_version(&project_path.join(INDEX_FILE_NAME))
}

/// Build the upgrade plan from an on-disk version.
pub fn plan(from: u32) -> Result<MigrationPlan> {
    if from > SCHEMA_VERSION {
        return Err(StoreError::VersionTooNew {
            found: from,
            supported: SCHEMA_VERSION,
        });
    }

    let mut steps = Vec::new();
    let mut version = from;
    while version < SCHEMA_VERSION {
        for step in upgrade_steps() {
            if step.from == version {
                steps.push(step.name.to_string());
            }
        }
        if let Some(structural) = structural_step_name(version) {
            steps.push(structural.to_string());
        }
        let next = upgrade_steps()
            .iter()
            .find(|s| s.from == version)
            .map(|s| s.to)
            .ok_or(StoreError::NoUpgradePath {
                from,
                to: SCHEMA_VERSION,
            })?;
        version = next;
    }

    Ok(MigrationPlan {
        from,
        to: SCHEMA_VERSION,
        steps,
    })
}

/// Migrate a project to a new location.
///
/// No-op when the source is already current (the destination is not
/// created). On failure the partial destination is removed and the source
/// is left untouched; the error names the failing step and, when known, the
/// failing item.
pub fn migrate(source: &Path, dest: &Path) -> Result<MigrationReport> {
    // DETECT
    let from = detect(source)?;
    if from == SCHEMA_VERSION {
        return Ok(MigrationReport {
            from,
            to: SCHEMA_VERSION,
            steps: Vec::new(),
            items_migrated: 0,
            items_created: 0,
        });
    }

    // UPGRADE_PLAN
    let plan = plan(from)?;
    info!(from, to = plan.to, steps = plan.steps.len(), "migrating project");

    let outcome = apply_and_verify(source, dest, &plan);
    if outcome.is_err() && dest.exists() {
        // Discard the partial destination; the source is still intact.
        let _ = fs::remove_dir_all(dest);
    }
    outcome
}

fn apply_and_verify(source: &Path, dest: &Path, plan: &MigrationPlan) -> Result<MigrationReport> {
    let (_, entries) = load_document(&source.join(INDEX_FILE_NAME))?;
    let source_count = entries.len();

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::Object(map) => records.push(RawRecord::new(map)),
            other => {
                return Err(StoreError::Migration {
                    step: "load".into(),
                    item: None,
                    reason: format!("index entry is not an object: {}", other),
                })
            }
        }
    }

    // APPLY_STEPS: schema transforms per record, then the structural
    // transform for that version boundary, one version at a time.
    let mut version = plan.from;
    while version < SCHEMA_VERSION {
        for step in upgrade_steps() {
            if step.from != version {
                continue;
            }
            for record in &mut records {
                (step.apply)(record).map_err(|e| StoreError::Migration {
                    step: step.name.to_string(),
                    item: record_id(record),
                    reason: e.to_string(),
                })?;
            }
        }

        if let Some(name) = structural_step_name(version) {
            apply_structural(version, &mut records).map_err(|e| match e {
                already @ StoreError::Migration { .. } => already,
                other => StoreError::Migration {
                    step: name.to_string(),
                    item: None,
                    reason: other.to_string(),
                },
            })?;
        }

        version = upgrade_steps()
            .iter()
            .find(|s| s.from == version)
            .map(|s| s.to)
            .expect("plan() validated the chain");
    }

    let items_created = records.len() - source_count;

    // Write the destination: data directory first, payloads copied over,
    // index document last.
    fs::create_dir_all(dest.join(DATA_DIR_NAME))?;
    copy_payloads(source, dest, &records)?;

    records.sort_by(|a, b| id_string(a).cmp(&id_string(b)));
    let dest_entries: Vec<Value> = records
        .iter()
        .map(|r| Value::Object(r.entry.clone()))
        .collect();

    write_document_atomic(&dest.join(INDEX_FILE_NAME), SCHEMA_VERSION, dest_entries)?;

    // VERIFY: re-read the destination and compare identities against the
    // transformed set before declaring success.
    let (dest_version, dest_entries) = load_document(&dest.join(INDEX_FILE_NAME))?;
    if dest_version != SCHEMA_VERSION {
        return Err(StoreError::Migration {
            step: "verify".into(),
            item: None,
            reason: format!("destination version is {}", dest_version),
        });
    }
    if dest_entries.len() != records.len() {
        return Err(StoreError::Migration {
            step: "verify".into(),
            item: None,
            reason: format!(
                "destination has {} items, expected {}",
                dest_entries.len(),
                records.len()
            ),
        });
    }

    let expected: HashSet<ItemId> = records.iter().filter_map(record_id).collect();
    let mut found = HashSet::with_capacity(dest_entries.len());
    for entry in &dest_entries {
        let id = entry
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| ItemId::parse(s).ok())
            .ok_or_else(|| StoreError::Migration {
                step: "verify".into(),
                item: None,
                reason: "destination entry without an id".into(),
            })?;
        found.insert(id);
    }
    if expected != found {
        return Err(StoreError::Migration {
            step: "verify".into(),
            item: None,
            reason: "destination item identities do not match the upgraded set".into(),
        });
    }

    debug!(items = records.len(), "migration verified");

    Ok(MigrationReport {
        from: plan.from,
        to: plan.to,
        steps: plan.steps.clone(),
        items_migrated: source_count,
        items_created,
    })
}

/// Upgrade a project in place when its on-disk version is old.
///
/// The upgraded project is built at a scratch location, the original is
/// moved aside to a versioned backup, and the upgraded tree takes its
/// place. Returns whether a migration ran.
pub fn migrate_if_needed(project_path: &Path) -> Result<bool> {
    let from = detect(project_path)?;
    if from == SCHEMA_VERSION {
        return Ok(false);
    }

    let scratch = sibling(project_path, ".upgrade");
    if scratch.exists() {
        fs::remove_dir_all(&scratch)?;
    }

    migrate(project_path, &scratch)?;

    let backup = sibling(project_path, &format!(".v{}", from));
    if backup.exists() {
        fs::remove_dir_all(&backup)?;
    }
    fs::rename(project_path, &backup)?;
    if let Err(e) = fs::rename(&scratch, project_path) {
        // Put the original back rather than leave no project at the path.
        let _ = fs::rename(&backup, project_path);
        return Err(e.into());
    }

    info!(path = %project_path.display(), backup = %backup.display(), "project upgraded");
    Ok(true)
}

// --- Structural transforms ---

fn structural_step_name(from: u32) -> Option<&'static str> {
    match from {
        2 => Some("split_combined_items"),
        _ => None,
    }
}

fn apply_structural(from: u32, records: &mut Vec<RawRecord>) -> Result<()> {
    match from {
        2 => split_combined_items(records),
        _ => Ok(()),
    }
}

/// v2 -> v3 structural transform.
///
/// Version 2 embedded display properties inside each data item under a
/// `display` record property. Version 3 stores displays as separate items
/// referencing their data item. The new display item's identity is derived
/// deterministically from the data item's, so repeated migrations agree.
fn split_combined_items(records: &mut Vec<RawRecord>) -> Result<()> {
    let mut created = Vec::new();

    for record in records.iter_mut() {
        let is_data_item = record
            .entry
            .get("item_type")
            .and_then(|v| v.as_str())
            .map(|t| t == "data_item")
            .unwrap_or(false);
        if !is_data_item {
            continue;
        }

        let properties = match record.entry.get_mut("properties").and_then(|p| p.as_object_mut()) {
            Some(properties) => properties,
            None => continue,
        };

        let display = match properties.remove("display") {
            Some(display) => display,
            None => continue,
        };

        let id = record_id(record).ok_or_else(|| StoreError::Migration {
            step: "split_combined_items".into(),
            item: None,
            reason: "data item with embedded display has no id".into(),
        })?;

        let display_properties = match display {
            Value::Object(mut tagged) => match tagged.remove("Record") {
                Some(Value::Object(inner)) => inner,
                _ => Map::new(),
            },
            _ => Map::new(),
        };

        let display_id = id.derived("display");

        let mut entry = Map::new();
        entry.insert("id".into(), Value::String(display_id.to_string()));
        entry.insert("item_type".into(), Value::String("display_item".into()));
        entry.insert(
            "created".into(),
            record.entry.get("created").cloned().unwrap_or(Value::from(0)),
        );
        entry.insert(
            "modified".into(),
            record.entry.get("modified").cloned().unwrap_or(Value::from(0)),
        );
        entry.insert("modification_count".into(), Value::from(0u64));
        entry.insert("is_live".into(), Value::Bool(false));
        entry.insert("properties".into(), Value::Object(display_properties));
        entry.insert(
            "source_uuids".into(),
            Value::Array(vec![Value::String(id.to_string())]),
        );
        entry.insert("handler_ref".into(), Value::Null);

        created.push(RawRecord::new(entry));
    }

    records.extend(created);
    Ok(())
}

// --- Helpers ---

fn record_id(record: &RawRecord) -> Option<ItemId> {
    record
        .entry
        .get("id")
        .or_else(|| record.entry.get("uuid"))
        .and_then(|v| v.as_str())
        .and_then(|s| ItemId::parse(s).ok())
}

fn id_string(record: &RawRecord) -> String {
    record
        .entry
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Copy payload files referenced by the upgraded records into the
/// destination data directory.
fn copy_payloads(source: &Path, dest: &Path, records: &[RawRecord]) -> Result<()> {
    for record in records {
        let locator = record
            .entry
            .get("handler_ref")
            .and_then(|v| v.as_object())
            .and_then(|r| r.get("locator"))
            .and_then(|v| v.as_str());

        let locator = match locator {
            Some(locator) => locator,
            None => continue,
        };

        let from = source.join(DATA_DIR_NAME).join(locator);
        let to = dest.join(DATA_DIR_NAME).join(locator);
        fs::copy(&from, &to).map_err(|e| StoreError::Migration {
            step: "copy_payloads".into(),
            item: record_id(record),
            reason: format!("{}: {}", locator, e),
        })?;
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".into());
    name.push_str(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    /// Build a version-2 project on disk with one combined data item and
    /// one connection.
    fn write_v2_project(path: &Path) -> ItemId {
        let data_id = ItemId::new();
        let connection_id = ItemId::new();

        let data_item = json!({
            "id": data_id.to_string(),
            "item_type": "data_item",
            "created": 1000,
            "modified": 2000,
            "modification_count": 4,
            "is_live": false,
            "properties": {
                "title": {"String": "combined"},
                "spatial_calibrations": {"List": []},
                "display": {"Record": {
                    "display_type": {"String": "line_plot"}
                }}
            },
            "source_uuids": [],
            "handler_ref": null
        });
        let connection = json!({
            "id": connection_id.to_string(),
            "item_type": "connection",
            "created": 1000,
            "modified": 1000,
            "modification_count": 0,
            "is_live": false,
            "properties": {},
            "source_uuids": [],
            "handler_ref": null
        });

        fs::create_dir_all(path.join(DATA_DIR_NAME)).unwrap();
        write_document_atomic(
            &path.join(INDEX_FILE_NAME),
            2,
            vec![data_item, connection],
        )
        .unwrap();

        data_id
    }

    #[test]
    fn test_plan_from_v1() {
        let plan = plan(1).unwrap();
        assert_eq!(plan.from, 1);
        assert_eq!(plan.to, SCHEMA_VERSION);
        assert_eq!(
            plan.steps,
            vec!["hoist_bookkeeping", "rename_calibrations", "split_combined_items"]
        );
    }

    #[test]
    fn test_plan_unknown_version_fails() {
        assert!(matches!(plan(0), Err(StoreError::NoUpgradePath { .. })));
        assert!(matches!(
            plan(SCHEMA_VERSION + 1),
            Err(StoreError::VersionTooNew { .. })
        ));
    }

    #[test]
    fn test_migrate_v2_splits_display() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("old");
        let dest = dir.path().join("new");
        let data_id = write_v2_project(&source);

        let report = migrate(&source, &dest).unwrap();
        assert_eq!(report.from, 2);
        assert_eq!(report.items_migrated, 2);
        assert_eq!(report.items_created, 1);

        let (version, entries) = load_document(&dest.join(INDEX_FILE_NAME)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert_eq!(entries.len(), 3);

        let display = entries
            .iter()
            .find(|e| e.get("item_type").and_then(|v| v.as_str()) == Some("display_item"))
            .unwrap();
        assert_eq!(
            display.get("id").and_then(|v| v.as_str()),
            Some(data_id.derived("display").to_string().as_str())
        );
        assert_eq!(
            display.get("source_uuids").unwrap(),
            &json!([data_id.to_string()])
        );

        // The data item no longer embeds the display.
        let data_item = entries
            .iter()
            .find(|e| e.get("id").and_then(|v| v.as_str()) == Some(&data_id.to_string()))
            .unwrap();
        let props = data_item.get("properties").unwrap().as_object().unwrap();
        assert!(!props.contains_key("display"));
        assert!(props.contains_key("dimensional_calibrations"));

        // Source untouched.
        let (source_version, source_entries) =
            load_document(&source.join(INDEX_FILE_NAME)).unwrap();
        assert_eq!(source_version, 2);
        assert_eq!(source_entries.len(), 2);
    }

    #[test]
    fn test_migrate_deterministic() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("old");
        write_v2_project(&source);

        let dest_a = dir.path().join("a");
        let dest_b = dir.path().join("b");
        migrate(&source, &dest_a).unwrap();
        migrate(&source, &dest_b).unwrap();

        let bytes_a = fs::read(dest_a.join(INDEX_FILE_NAME)).unwrap();
        let bytes_b = fs::read(dest_b.join(INDEX_FILE_NAME)).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_migrate_current_is_noop() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("current");
        fs::create_dir_all(&source).unwrap();
        write_document_atomic(&source.join(INDEX_FILE_NAME), SCHEMA_VERSION, Vec::new())
            .unwrap();

        let dest = dir.path().join("dest");
        let report = migrate(&source, &dest).unwrap();
        assert!(report.steps.is_empty());
        assert!(!dest.exists());
    }

    #[test]
    fn test_failed_migration_discards_destination() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("old");
        let data_id = write_v2_project(&source);

        // Reference a payload file that does not exist.
        let (version, mut entries) = load_document(&source.join(INDEX_FILE_NAME)).unwrap();
        entries[0].as_object_mut().unwrap().insert(
            "handler_ref".into(),
            json!({"kind": "archive", "locator": format!("{}.arc", data_id)}),
        );
        write_document_atomic(&source.join(INDEX_FILE_NAME), version, entries).unwrap();

        let dest = dir.path().join("new");
        let err = migrate(&source, &dest).unwrap_err();
        match err {
            StoreError::Migration { step, item, .. } => {
                assert_eq!(step, "copy_payloads");
                assert_eq!(item, Some(data_id));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dest.exists());
        assert!(source.join(INDEX_FILE_NAME).exists());
    }

    #[test]
    fn test_migrate_if_needed_swaps_in_place() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        write_v2_project(&project);

        assert!(migrate_if_needed(&project).unwrap());
        assert_eq!(detect(&project).unwrap(), SCHEMA_VERSION);

        // The original is preserved as a versioned backup.
        let backup = dir.path().join("project.v2");
        assert_eq!(detect(&backup).unwrap(), 2);

        // Second call is a no-op.
        assert!(!migrate_if_needed(&project).unwrap());
    }
}
