use std::path::{Path, PathBuf};

use estate_core::{EntityKind, SnapshotDetail};
use estate_erp::{fetch_buildings, fetch_snapshot, StaticSource};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/erp")
}

#[tokio::test]
async fn fixture_buildings_decode() {
    let source = StaticSource::from_fixture_dir(fixture_dir()).expect("fixtures load");
    let buildings = fetch_buildings(&source).await.expect("buildings decode");

    assert_eq!(buildings.len(), 3);
    let mill = &buildings[1];
    assert_eq!(mill.external_id, "BLD-0002");
    assert_eq!(mill.name, "Old Mill Lofts");
    assert_eq!(mill.floors, Some(6));
    assert_eq!(mill.latitude, Some(38.4622));
    assert_eq!(mill.total_area, None);
    assert_eq!(buildings[2].address, None);
}

#[tokio::test]
async fn fixture_sales_documents_decode() {
    let source = StaticSource::from_fixture_dir(fixture_dir()).expect("fixtures load");

    let acquisitions = fetch_snapshot(&source, EntityKind::Acquisitions)
        .await
        .expect("acquisitions decode");
    assert_eq!(acquisitions.len(), 2);
    assert_eq!(
        acquisitions[1].detail,
        SnapshotDetail::Acquisition {
            seller_name: Some("Depot Holdings".into()),
            acquisition_type: Some("Lease".into()),
            asking_price: Some(3_200_000.0),
        }
    );

    for kind in [EntityKind::Proposals, EntityKind::LettersOfIntent] {
        let rows = fetch_snapshot(&source, kind).await.expect("snapshot decode");
        assert_eq!(rows.len(), 1, "{kind}");
        assert!(rows.iter().all(|r| r.kind() == kind));
        assert_eq!(rows[0].building_ref.as_deref(), Some("BLD-0001"));
    }
}

#[tokio::test]
async fn fixture_dir_without_a_kind_leaves_it_unconfigured() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("proposals.json"),
        r#"{"data": [{"name": "PRP-1", "building": "B1", "proposed_price": "12.5"}]}"#,
    )
    .expect("write fixture");

    let source = StaticSource::from_fixture_dir(dir.path()).expect("fixtures load");
    let rows = fetch_snapshot(&source, EntityKind::Proposals)
        .await
        .expect("proposals decode");
    assert_eq!(rows[0].external_id, "PRP-1");
    assert!(fetch_buildings(&source).await.is_err());
}

#[test]
fn malformed_fixture_is_reported_with_its_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("buildings.json"), "{\"rows\": []}").expect("write fixture");

    let err = StaticSource::from_fixture_dir(dir.path()).unwrap_err();
    assert!(format!("{err:#}").contains("buildings.json"));
}
