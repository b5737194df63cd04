//! End-to-end migration tests against on-disk projects written by older
//! builds.

use proj_store::{
    migrate, ArchiveHandler, ArrayData, DType, ItemId, ItemType, Project, ProjectConfig,
    PropertyValue, StorageHandler, StoreError,
};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Lay down a version-1 project: identity under a `uuid` key, timestamps
/// inside the properties map, pre-rename calibration keys, an embedded
/// display, and one archive payload.
fn write_v1_project(path: &Path) -> (ItemId, ItemId) {
    let data_id = ItemId::new();
    let group_id = ItemId::new();

    fs::create_dir_all(path.join("data")).unwrap();

    // Payload file for the data item.
    let archive = ArchiveHandler::new(path.join("data"), 4).unwrap();
    let payload = ArrayData::new(
        DType::F64,
        vec![4],
        (0..4u64).flat_map(|i| (i as f64).to_le_bytes()).collect(),
    )
    .unwrap();
    let handler_ref = archive.write(data_id, &payload).unwrap();

    let data_item = json!({
        "uuid": data_id.to_string(),
        "item_type": "data_item",
        "properties": {
            "created": {"Timestamp": 11_000},
            "modified": {"Timestamp": 22_000},
            "title": {"String": "legacy scan"},
            "spatial_calibrations": {"List": []},
            "display": {"Record": {
                "display_type": {"String": "image"}
            }}
        },
        "handler_ref": {"kind": handler_ref.kind, "locator": handler_ref.locator}
    });
    let group = json!({
        "uuid": group_id.to_string(),
        "item_type": "data_group",
        "properties": {
            "created": {"Timestamp": 11_000},
            "modified": {"Timestamp": 11_000},
            "title": {"String": "session"}
        }
    });

    let document = json!({
        "version": 1,
        "items": [data_item, group]
    });
    fs::write(
        path.join("project.pstore"),
        serde_json::to_vec_pretty(&document).unwrap(),
    )
    .unwrap();

    (data_id, group_id)
}

#[test]
fn test_v1_project_migrates_and_opens() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("old");
    let dest = dir.path().join("new");
    let (data_id, group_id) = write_v1_project(&source);

    let report = migrate(&source, &dest).unwrap();
    assert_eq!(report.from, 1);
    assert_eq!(report.items_migrated, 2);
    assert_eq!(report.items_created, 1);
    assert_eq!(
        report.steps,
        vec![
            "hoist_bookkeeping",
            "rename_calibrations",
            "split_combined_items"
        ]
    );

    let project = Project::open(ProjectConfig {
        path: dest,
        create_if_missing: false,
        ..Default::default()
    })
    .unwrap();
    assert!(project.load_errors().is_empty());
    assert_eq!(project.items().len(), 3);

    // Bookkeeping hoisted out of the properties map.
    let data_item = project.read_item(data_id).unwrap();
    assert_eq!(data_item.created.0, 11_000);
    assert_eq!(data_item.modified.0, 22_000);
    assert_eq!(data_item.modification_count, 0);
    assert!(!data_item.properties.contains_key("display"));
    assert!(data_item.properties.contains_key("dimensional_calibrations"));

    // The split display item references its data item deterministically.
    let display = project.read_item(data_id.derived("display")).unwrap();
    assert_eq!(display.item_type, ItemType::DisplayItem);
    assert_eq!(display.source_uuids, vec![data_id]);
    assert_eq!(
        display.properties.get("display_type"),
        Some(&PropertyValue::String("image".into()))
    );

    // Payload carried over intact.
    let array = project.read_array(data_id).unwrap().unwrap();
    assert_eq!(array.shape, vec![4]);

    let group = project.read_item(group_id).unwrap();
    assert_eq!(group.item_type, ItemType::DataGroup);
}

#[test]
fn test_migration_deterministic_across_destinations() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("old");
    write_v1_project(&source);

    let dest_a = dir.path().join("a");
    let dest_b = dir.path().join("b");
    migrate(&source, &dest_a).unwrap();
    migrate(&source, &dest_b).unwrap();

    assert_eq!(
        fs::read(dest_a.join("project.pstore")).unwrap(),
        fs::read(dest_b.join("project.pstore")).unwrap()
    );
}

#[test]
fn test_failed_migration_leaves_source_usable_for_retry() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("old");
    let (data_id, _) = write_v1_project(&source);

    // Break the payload reference so the copy step fails.
    let payload = source.join("data").join(format!("{}.arc", data_id));
    fs::remove_file(&payload).unwrap();

    let dest = dir.path().join("new");
    let err = migrate(&source, &dest).unwrap_err();
    assert!(matches!(err, StoreError::Migration { .. }));
    assert!(!dest.exists());

    // Fix the condition and retry the same migration.
    let archive = ArchiveHandler::new(source.join("data"), 4).unwrap();
    archive
        .write(data_id, &ArrayData::zeros(DType::F64, vec![4]))
        .unwrap();

    migrate(&source, &dest).unwrap();
    assert!(dest.join("project.pstore").exists());
}

#[test]
fn test_migrate_if_needed_end_to_end() {
    let dir = TempDir::new().unwrap();
    let project_path = dir.path().join("project");
    let (data_id, _) = write_v1_project(&project_path);

    assert!(matches!(
        Project::open_path(&project_path),
        Err(StoreError::MigrationRequired { found: 1, .. })
    ));

    assert!(Project::migrate_if_needed(&project_path).unwrap());

    let project = Project::open_path(&project_path).unwrap();
    assert_eq!(project.items().len(), 3);
    assert!(project.read_item(data_id).is_ok());

    // The original survives as a backup.
    assert!(dir.path().join("project.v1").join("project.pstore").exists());

    // Already current: no-op.
    drop(project);
    assert!(!Project::migrate_if_needed(&project_path).unwrap());
}
