//! Snapshot create, list, restore and delete on both storage backends

mod common;

use common::Harness;
use sds_controller::common::ErrorKind;
use sds_controller::controller::agent_client::ZfsKind;
use sds_controller::controller::records::{PoolType, SnapshotBackend};
use sds_controller::controller::snapshot::SnapshotRequest;

fn snap(node: &str, name: &str) -> SnapshotRequest {
    SnapshotRequest {
        resource: "r0".into(),
        node: node.into(),
        volume: 0,
        name: name.into(),
        size_gib: None,
    }
}

#[tokio::test]
async fn test_volume_group_snapshot_lifecycle() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let snaps = &h.services.snapshots;

    let record = snaps.create(snap("n1", "before-upgrade")).await.unwrap();
    assert_eq!(record.backend, SnapshotBackend::Lvm);
    assert_eq!(record.object, "vg0/r0_vol0_before-upgrade");
    // thick snapshots default to the volume size
    assert_eq!(record.size_gib, Some(10));
    assert!(h.sim.has_lv("n1", "vg0", "r0_vol0_before-upgrade"));
    assert!(!h.sim.has_lv("n2", "vg0", "r0_vol0_before-upgrade"));
    assert_eq!(h.free_gib("n1"), 80);
    assert_eq!(h.free_gib("n2"), 90);

    let err = snaps.create(snap("n1", "before-upgrade")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let on_node = snaps.list_on_node("r0", "n1", 0).await.unwrap();
    assert_eq!(on_node.len(), 1);
    assert_eq!(on_node[0].name, "before-upgrade");
    assert_eq!(snaps.list(Some("r0")).unwrap().len(), 1);
    assert!(snaps.list(Some("other")).unwrap().is_empty());

    // snapshots pin the resource
    let err = h.services.orchestrator.delete_resource("r0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    // merging consumes the snapshot
    snaps.restore("r0", "n1", 0, "before-upgrade").await.unwrap();
    assert!(!h.sim.has_lv("n1", "vg0", "r0_vol0_before-upgrade"));
    assert!(snaps.get("r0", "n1", 0, "before-upgrade").is_err());
    assert_eq!(h.free_gib("n1"), 90);

    h.services.orchestrator.delete_resource("r0").await.unwrap();
}

#[tokio::test]
async fn test_snapshot_input_checks() {
    let h = Harness::new(&["n1", "n2", "n3"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let snaps = &h.services.snapshots;

    let mut sized = snap("n1", "s0");
    sized.size_gib = Some(0);
    let err = snaps.create(sized).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut sized = snap("n1", "s1");
    sized.size_gib = Some(2);
    assert_eq!(snaps.create(sized).await.unwrap().size_gib, Some(2));

    let err = snaps.create(snap("n3", "s2")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let mut other = snap("n1", "s3");
    other.volume = 4;
    let err = snaps.create(other).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = snaps.create(snap("n1", "bad name")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = snaps.delete("r0", "n1", 0, "missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // a snapshot removed behind our back still deletes cleanly
    h.sim.fail("n1", "lv_snapshot_remove", "logical volume vg0/r0_vol0_s1 not found");
    snaps.delete("r0", "n1", 0, "s1").await.unwrap();
    assert!(snaps.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_thick_snapshots_hold_pool_capacity() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let snaps = &h.services.snapshots;

    let mut oversized = snap("n1", "big");
    oversized.size_gib = Some(95);
    let err = snaps.create(oversized).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    assert!(!h.sim.has_lv("n1", "vg0", "r0_vol0_big"));
    assert_eq!(h.free_gib("n1"), 90);

    snaps.create(snap("n1", "s1")).await.unwrap();
    assert_eq!(h.free_gib("n1"), 80);

    // placement sees the snapshot's area as taken
    let err = h.create("r1", &["n1", "n2"], 90).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    assert_eq!(h.sim.calls("n1", "lv_create"), 1);
    h.create("r1", &["n1", "n2"], 80).await.unwrap();
    assert_eq!(h.free_gib("n1"), 0);
    assert_eq!(h.free_gib("n2"), 10);

    snaps.delete("r0", "n1", 0, "s1").await.unwrap();
    assert_eq!(h.free_gib("n1"), 10);
}

#[tokio::test]
async fn test_restore_refused_while_mounted() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let orch = &h.services.orchestrator;
    h.services.snapshots.create(snap("n1", "s1")).await.unwrap();

    orch.set_primary("r0", "n1", false).await.unwrap();
    orch.create_filesystem("r0", "n1", 0, "ext4").await.unwrap();
    orch.mount("r0", "n1", 0, "/srv/r0", None).await.unwrap();

    let err = h.services.snapshots.restore("r0", "n1", 0, "s1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert!(h.sim.has_lv("n1", "vg0", "r0_vol0_s1"));
}

#[tokio::test]
async fn test_thin_pool_snapshot_has_no_size() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.add_pool(&["n1", "n2"], "thin0", PoolType::ThinPool).await;
    h.create_in("r0", &["n1", "n2"], "thin0", 20).await.unwrap();

    let record = h.services.snapshots.create(snap("n2", "s1")).await.unwrap();
    assert_eq!(record.size_gib, None);
    assert_eq!(record.object, "vg0/r0_vol0_s1");
    assert!(h.sim.has_lv("n2", "vg0", "r0_vol0_s1"));
}

#[tokio::test]
async fn test_copy_on_write_snapshot_lifecycle() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.add_pool(&["n1", "n2"], "tank", PoolType::CopyOnWritePool).await;
    h.create_in("r0", &["n1", "n2"], "tank", 10).await.unwrap();
    assert!(h.sim.has_dataset("n1", "tank/r0_vol0"));
    let snaps = &h.services.snapshots;

    let record = snaps.create(snap("n2", "nightly")).await.unwrap();
    assert_eq!(record.backend, SnapshotBackend::Zfs);
    assert_eq!(record.object, "tank/r0_vol0@nightly");
    assert!(h.sim.has_dataset("n2", "tank/r0_vol0@nightly"));

    let on_node = snaps.list_on_node("r0", "n2", 0).await.unwrap();
    assert_eq!(on_node.len(), 1);
    assert_eq!(on_node[0].object, "tank/r0_vol0@nightly");

    // rollback keeps the snapshot
    snaps.restore("r0", "n2", 0, "nightly").await.unwrap();
    assert_eq!(h.sim.calls("n2", "zfs_rollback"), 1);
    assert!(snaps.get("r0", "n2", 0, "nightly").is_ok());

    snaps.delete("r0", "n2", 0, "nightly").await.unwrap();
    assert!(!h.sim.has_dataset("n2", "tank/r0_vol0@nightly"));

    let listed = h
        .services
        .zfs
        .list("n2", ZfsKind::Snapshot, Some("tank"))
        .await
        .unwrap();
    assert!(listed.is_empty());
}
