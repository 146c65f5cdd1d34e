#![forbid(unsafe_code)]

use ecutune_kernel_contracts::calibration::{CalibrationMap, MapCategory, MapId, Profile, ProfileId};
use ecutune_kernel_contracts::changeset::{ChangesetId, MapChange};
use ecutune_kernel_contracts::MonotonicTimeNs;
use ecutune_storage::ecu_store::{EcuStore, StorageError};
use ecutune_storage::repo::{ChangesetRepo, ProfileRepo};

fn map_id(v: &str) -> MapId {
    MapId::new(v).unwrap()
}

fn seeded() -> EcuStore {
    let ign = CalibrationMap::linear(map_id("ign"), "Ignition", MapCategory::Ignition, vec![14.0, 16.0])
        .unwrap();
    let mut s = EcuStore::new_in_memory();
    s.insert_profile_row(Profile::v1(ProfileId::new("stock").unwrap(), "Stock", "", vec![ign]).unwrap())
        .unwrap();
    s
}

fn change(map: &str) -> MapChange {
    MapChange::v1(map_id(map), None, Some(0), 14.0, 15.0, "advance").unwrap()
}

#[test]
fn at_changesets_db_01_foreign_keys_enforced() {
    let mut s = seeded();
    assert!(matches!(
        s.insert_changeset_row(
            Some(ProfileId::new("missing").unwrap()),
            vec![change("ign")],
            "tech".to_string(),
            String::new(),
            MonotonicTimeNs(1),
        ),
        Err(StorageError::ForeignKeyViolation {
            table: "changesets.profile_id",
            ..
        })
    ));
    assert!(matches!(
        s.insert_changeset_row(
            Some(ProfileId::new("stock").unwrap()),
            vec![change("ghost")],
            "tech".to_string(),
            String::new(),
            MonotonicTimeNs(1),
        ),
        Err(StorageError::ForeignKeyViolation {
            table: "changesets.changes.map_id",
            ..
        })
    ));
    assert!(s.changeset_rows().is_empty());
}

#[test]
fn at_changesets_db_02_rows_are_shared_and_filterable() {
    let mut s = seeded();
    let stock = ProfileId::new("stock").unwrap();
    let cs = s
        .insert_changeset_row(
            Some(stock.clone()),
            vec![change("ign")],
            "tech".to_string(),
            "first pass".to_string(),
            MonotonicTimeNs(10),
        )
        .unwrap();
    s.insert_changeset_row(None, vec![], "tech".to_string(), String::new(), MonotonicTimeNs(11))
        .unwrap();

    let fetched = s.changeset_row(ChangesetId(1)).unwrap();
    assert!(std::sync::Arc::ptr_eq(&cs, &fetched));
    assert_eq!(s.changeset_rows_for_profile(&stock).len(), 1);
    assert_eq!(s.changeset_rows().len(), 2);
}

#[test]
fn at_changesets_db_03_invalid_author_rejected_without_consuming_id() {
    let mut s = seeded();
    assert!(matches!(
        s.insert_changeset_row(None, vec![], " ".to_string(), String::new(), MonotonicTimeNs(1)),
        Err(StorageError::ContractViolation(_))
    ));
    let cs = s
        .insert_changeset_row(None, vec![], "tech".to_string(), String::new(), MonotonicTimeNs(1))
        .unwrap();
    assert_eq!(cs.id, ChangesetId(1));
}
