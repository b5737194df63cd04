//! Error handling and crash-resilience tests.

use proj_store::{
    ArrayData, DType, ItemId, ItemRecord, ItemType, Project, ProjectConfig, Region, StoreError,
};
use std::fs;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> ProjectConfig {
    ProjectConfig {
        path: dir.path().join("project"),
        ..Default::default()
    }
}

fn small_array() -> ArrayData {
    let bytes = (0..100).flat_map(|i| (i as f64).to_le_bytes()).collect();
    ArrayData::new(DType::F64, vec![10, 10], bytes).unwrap()
}

// --- Index Atomicity ---

#[test]
fn test_orphaned_temp_file_leaves_previous_index_intact() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let id = {
        let project = Project::open(config.clone()).unwrap();
        let mut item = ItemRecord::new(ItemType::DataItem).with_property("title", "kept");
        project.write_item(&mut item, Some(&small_array())).unwrap();
        item.id
    };

    // Simulate a crash mid-index-write: a truncated temp file exists but the
    // rename never happened.
    fs::write(
        config.path.join(".tmp-partial-index"),
        b"{\"version\": 3, \"items\": [",
    )
    .unwrap();

    let project = Project::open(config).unwrap();
    assert!(project.load_errors().is_empty());
    assert_eq!(project.read_array(id).unwrap().unwrap(), small_array());
}

// --- Partial Project Load ---

#[test]
fn test_one_missing_payload_does_not_abort_load() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let (damaged, healthy, locator) = {
        let project = Project::open(config.clone()).unwrap();

        let mut ids = Vec::new();
        let mut locator = String::new();
        for i in 0..5 {
            let mut item = ItemRecord::new(ItemType::DataItem)
                .with_property("title", format!("item {}", i));
            project.write_item(&mut item, Some(&small_array())).unwrap();
            if i == 2 {
                locator = item.handler_ref.clone().unwrap().locator;
            }
            ids.push(item.id);
        }
        (ids[2], ids[0], locator)
    };

    // Delete one payload file out-of-band.
    fs::remove_file(config.path.join("data").join(&locator)).unwrap();

    let project = Project::open(config).unwrap();

    // All five index entries load; exactly one read error is surfaced.
    assert_eq!(project.items().len(), 5);
    assert_eq!(project.load_errors().len(), 1);
    assert_eq!(project.load_errors()[0].item, Some(damaged));
    assert!(matches!(
        project.load_errors()[0].error,
        StoreError::PayloadMissing(_)
    ));

    // The healthy items still read; the damaged one fails on array access.
    assert!(project.read_array(healthy).unwrap().is_some());
    assert!(matches!(
        project.read_array(damaged).unwrap_err(),
        StoreError::PayloadMissing(_)
    ));
}

#[test]
fn test_garbled_index_entry_is_collected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let project = Project::open(config.clone()).unwrap();
        let mut item = ItemRecord::new(ItemType::DataItem);
        project.write_item(&mut item, None).unwrap();
    }

    // Corrupt one entry in place: unknown item type tag.
    let index_path = config.path.join("project.pstore");
    let mut document: serde_json::Value =
        serde_json::from_slice(&fs::read(&index_path).unwrap()).unwrap();
    let items = document["items"].as_array_mut().unwrap();
    let mut broken = items[0].clone();
    broken["id"] = serde_json::Value::String(ItemId::new().to_string());
    broken["item_type"] = serde_json::Value::String("Hologram".into());
    items.push(broken);
    fs::write(&index_path, serde_json::to_vec_pretty(&document).unwrap()).unwrap();

    let project = Project::open(config).unwrap();
    assert_eq!(project.items().len(), 1);
    assert_eq!(project.load_errors().len(), 1);
    assert!(matches!(
        project.load_errors()[0].error,
        StoreError::Deserialization(_)
    ));
}

// --- Deletes ---

#[test]
fn test_delete_twice_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let project = Project::open(test_config(&dir)).unwrap();

    let mut item = ItemRecord::new(ItemType::DataItem);
    project.write_item(&mut item, Some(&small_array())).unwrap();
    let locator = item.handler_ref.clone().unwrap().locator;

    project.delete_item(item.id).unwrap();
    project.delete_item(item.id).unwrap();

    assert!(matches!(
        project.read_item(item.id).unwrap_err(),
        StoreError::ItemNotFound(_)
    ));
    assert!(!project.path().join("data").join(locator).exists());

    // Deleting an id that never existed is fine too.
    project.delete_item(ItemId::new()).unwrap();
}

// --- Capability Errors ---

#[test]
fn test_partial_write_on_archive_backed_item() {
    let dir = TempDir::new().unwrap();
    let project = Project::open(test_config(&dir)).unwrap();

    let mut item = ItemRecord::new(ItemType::DataItem);
    project.write_item(&mut item, Some(&small_array())).unwrap();

    let region = Region::new(vec![0, 0], vec![1, 1]);
    let err = project
        .write_partial(item.id, &region, &0f64.to_le_bytes())
        .unwrap_err();
    assert!(matches!(err, StoreError::UnsupportedOperation(_)));
}

#[test]
fn test_partial_write_without_payload() {
    let dir = TempDir::new().unwrap();
    let project = Project::open(test_config(&dir)).unwrap();

    let mut item = ItemRecord::new(ItemType::DataItem);
    project.write_item(&mut item, None).unwrap();

    let err = project
        .write_partial(item.id, &Region::new(vec![0], vec![1]), &[0u8; 8])
        .unwrap_err();
    assert!(matches!(err, StoreError::PayloadMissing(_)));
}

// --- Locking ---

#[test]
fn test_second_writer_sees_lock_conflict() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let _first = Project::open(config.clone()).unwrap();

    match Project::open(config.clone()) {
        Err(StoreError::Locked) => {}
        other => panic!("expected lock conflict, got {:?}", other.map(|_| ())),
    }

    // The conflicted caller may proceed read-only.
    let read_only = Project::open(ProjectConfig {
        read_only: true,
        ..config
    })
    .unwrap();
    assert!(read_only.is_read_only());

    let mut item = ItemRecord::new(ItemType::DataItem);
    assert!(matches!(
        read_only.write_item(&mut item, None).unwrap_err(),
        StoreError::ReadOnly
    ));
}

#[test]
fn test_lock_released_on_close() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let _project = Project::open(config.clone()).unwrap();
    }

    // Lock released with the handle; a new writer can open.
    let _project = Project::open(config).unwrap();
}

// --- Version Gating ---

#[test]
fn test_newer_project_refused() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let _project = Project::open(config.clone()).unwrap();
    }

    let index_path = config.path.join("project.pstore");
    let mut document: serde_json::Value =
        serde_json::from_slice(&fs::read(&index_path).unwrap()).unwrap();
    document["version"] = serde_json::Value::from(99u32);
    fs::write(&index_path, serde_json::to_vec_pretty(&document).unwrap()).unwrap();

    assert!(matches!(
        Project::open(config),
        Err(StoreError::VersionTooNew { found: 99, .. })
    ));
}

#[test]
fn test_older_project_requires_migration() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let _project = Project::open(config.clone()).unwrap();
    }

    let index_path = config.path.join("project.pstore");
    let mut document: serde_json::Value =
        serde_json::from_slice(&fs::read(&index_path).unwrap()).unwrap();
    document["version"] = serde_json::Value::from(2u32);
    document["items"] = serde_json::Value::Array(Vec::new());
    fs::write(&index_path, serde_json::to_vec_pretty(&document).unwrap()).unwrap();

    // The old layout is never written silently.
    assert!(matches!(
        Project::open(config.clone()),
        Err(StoreError::MigrationRequired { found: 2, .. })
    ));

    // Migration unblocks the open.
    assert!(Project::migrate_if_needed(&config.path).unwrap());
    let project = Project::open(config).unwrap();
    assert!(project.load_errors().is_empty());
}
