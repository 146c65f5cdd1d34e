#![forbid(unsafe_code)]

use ecutune_kernel_contracts::calibration::{CalibrationMap, MapCategory, MapId, Profile, ProfileId};
use ecutune_storage::ecu_store::{EcuStore, StorageError};
use ecutune_storage::repo::{ChangesetRepo, ProfileRepo};
use ecutune_kernel_contracts::MonotonicTimeNs;

fn map_id(v: &str) -> MapId {
    MapId::new(v).unwrap()
}

fn profile_id(v: &str) -> ProfileId {
    ProfileId::new(v).unwrap()
}

fn stock() -> Profile {
    let boost = CalibrationMap::table(
        map_id("boost_tgt"),
        "Boost Target",
        MapCategory::Boost,
        2,
        2,
        vec![12.0, 14.0, 16.0, 18.0],
    )
    .unwrap()
    .with_bounds(Some(0.0), Some(22.0))
    .unwrap();
    Profile::v1(profile_id("stock"), "Stock", "demo hatch", vec![boost]).unwrap()
}

#[test]
fn at_profiles_db_01_duplicate_profile_rejected() {
    let mut s = EcuStore::new_in_memory();
    s.insert_profile_row(stock()).unwrap();
    assert!(matches!(
        s.insert_profile_row(stock()),
        Err(StorageError::DuplicateKey { table: "profiles", .. })
    ));
    assert_eq!(s.profile_rows().len(), 1);
}

#[test]
fn at_profiles_db_02_map_update_is_bounds_checked() {
    let mut s = EcuStore::new_in_memory();
    s.insert_profile_row(stock()).unwrap();

    let err = s
        .update_map_cell_row(&profile_id("stock"), &map_id("boost_tgt"), Some(1), Some(1), 24.0)
        .unwrap_err();
    assert_eq!(
        err,
        StorageError::OutOfBounds {
            value: 24.0,
            min: 0.0,
            max: 22.0
        }
    );

    let updated = s
        .update_map_cell_row(&profile_id("stock"), &map_id("boost_tgt"), Some(1), Some(1), 20.0)
        .unwrap();
    assert_eq!(updated.grid.get(Some(1), Some(1)), Some(20.0));
    assert_eq!(
        s.map_row(&profile_id("stock"), &map_id("boost_tgt"))
            .and_then(|m| m.grid.get(Some(1), Some(1))),
        Some(20.0)
    );
}

#[test]
fn at_profiles_db_03_unknown_map_and_cell_are_not_written() {
    let mut s = EcuStore::new_in_memory();
    s.insert_profile_row(stock()).unwrap();
    assert!(matches!(
        s.update_map_cell_row(&profile_id("stock"), &map_id("ghost"), None, None, 1.0),
        Err(StorageError::NotFound { table: "profiles.maps", .. })
    ));
    assert!(matches!(
        s.update_map_cell_row(&profile_id("stock"), &map_id("boost_tgt"), Some(5), Some(0), 1.0),
        Err(StorageError::ContractViolation(_))
    ));
}

#[test]
fn at_profiles_db_04_delete_blocked_while_changesets_reference_profile() {
    let mut s = EcuStore::new_in_memory();
    s.insert_profile_row(stock()).unwrap();
    s.insert_changeset_row(
        Some(profile_id("stock")),
        vec![],
        "tech".to_string(),
        String::new(),
        MonotonicTimeNs(5),
    )
    .unwrap();
    assert!(matches!(
        s.delete_profile_row(&profile_id("stock")),
        Err(StorageError::ForeignKeyViolation { .. })
    ));

    let mut empty = EcuStore::new_in_memory();
    empty.insert_profile_row(stock()).unwrap();
    let removed = empty.delete_profile_row(&profile_id("stock")).unwrap();
    assert_eq!(removed.name, "Stock");
    assert!(empty.profile_row(&profile_id("stock")).is_none());
}
