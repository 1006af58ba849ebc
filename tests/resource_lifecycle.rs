//! Resource workflows against a simulated cluster

mod common;

use common::Harness;
use sds_controller::common::{ErrorKind, RollbackStatus};
use sds_controller::controller::records::{IntentState, ResourceState, Role, WorkflowKind};

#[tokio::test]
async fn test_create_brings_every_node_up() {
    let h = Harness::new(&["n1", "n2", "n3"]).await;

    let record = h.create("r0", &["n1", "n2", "n3"], 10).await.unwrap();
    assert_eq!(record.state, ResourceState::Ready);
    assert_eq!(record.volumes.len(), 1);
    assert_eq!(record.next_volume_id, 1);

    for node in ["n1", "n2", "n3"] {
        assert!(h.sim.has_lv(node, "vg0", "r0_vol0"));
        assert!(h.sim.replica_up(node, "r0"));
        assert_eq!(h.sim.role(node, "r0"), Role::Secondary);
        assert_eq!(record.role(node), Role::Secondary);
        assert_eq!(h.free_gib(node), 90);

        let config = h.sim.replication_config(node, "r0").unwrap();
        assert!(config.contains("resource r0"));
        assert!(config.contains("10.0.0.1"));
        assert!(config.contains("10.0.0.3"));
    }

    let intents = h.ctx.intents.list().unwrap();
    assert!(intents
        .iter()
        .any(|i| i.kind == WorkflowKind::CreateResource && i.state == IntentState::Completed));
}

#[tokio::test]
async fn test_create_rejects_duplicates_and_bad_input() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 5).await.unwrap();

    let err = h.create("r0", &["n1", "n2"], 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = h.create("r1", &["n1", "n2"], 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = h.create("r1", &[], 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = h.create("r1", &["n1", "n9"], 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h.create("r1", &["n1", "n2"], 500).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
}

#[tokio::test]
async fn test_create_refuses_unreachable_node() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.sim.set_down("n2", true);
    h.ctx.registry.probe_node("n2").await.unwrap();

    let err = h.create("r0", &["n1", "n2"], 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert_eq!(h.sim.calls("n1", "lv_create"), 0);
    assert!(h.services.orchestrator.get("r0").is_err());
}

#[tokio::test]
async fn test_failed_bring_up_rolls_back_everything() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.sim.fail("n2", "replication_up", "kernel refused to attach device");

    let err = h.create("r0", &["n1", "n2"], 10).await.unwrap_err();
    assert_eq!(err.rollback_status(), Some(RollbackStatus::Complete));
    assert_eq!(err.kind(), ErrorKind::Internal);

    assert!(h.services.orchestrator.get("r0").is_err());
    for node in ["n1", "n2"] {
        assert!(!h.sim.has_lv(node, "vg0", "r0_vol0"));
        assert!(h.sim.replication_config(node, "r0").is_none());
        assert!(!h.sim.replica_up(node, "r0"));
        assert_eq!(h.free_gib(node), 100);
    }

    let intents = h.ctx.intents.list().unwrap();
    assert!(intents.iter().all(|i| i.state != IntentState::Running));
}

#[tokio::test]
async fn test_failed_undo_keeps_provisioning_record() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.sim.fail("n2", "replication_create_md", "device busy");
    h.sim.fail("n1", "lv_remove", "device busy");

    let err = h.create("r0", &["n1", "n2"], 10).await.unwrap_err();
    assert_eq!(err.rollback_status(), Some(RollbackStatus::Partial));

    let record = h.services.orchestrator.get("r0").unwrap();
    assert_eq!(record.state, ResourceState::Provisioning);
    assert!(h.sim.has_lv("n1", "vg0", "r0_vol0"));
    assert!(!h.sim.has_lv("n2", "vg0", "r0_vol0"));

    // a later delete finishes the cleanup
    h.sim.heal("n1", "lv_remove");
    h.services.orchestrator.delete_resource("r0").await.unwrap();
    assert!(!h.sim.has_lv("n1", "vg0", "r0_vol0"));
    assert!(h.services.orchestrator.get("r0").is_err());
}

#[tokio::test]
async fn test_delete_returns_capacity() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 20).await.unwrap();
    assert_eq!(h.free_gib("n1"), 80);

    h.services.orchestrator.delete_resource("r0").await.unwrap();
    for node in ["n1", "n2"] {
        assert_eq!(h.free_gib(node), 100);
        assert!(!h.sim.has_lv(node, "vg0", "r0_vol0"));
        assert!(h.sim.replication_config(node, "r0").is_none());
    }
    let err = h.services.orchestrator.delete_resource("r0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_delete_refuses_primary_or_mounted() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 5).await.unwrap();
    let orch = &h.services.orchestrator;

    orch.set_primary("r0", "n1", false).await.unwrap();
    let err = orch.delete_resource("r0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    orch.create_filesystem("r0", "n1", 0, "ext4").await.unwrap();
    orch.mount("r0", "n1", 0, "/srv/r0", None).await.unwrap();
    let err = orch.delete_resource("r0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    orch.unmount("r0", "n1", "/srv/r0").await.unwrap();
    orch.set_secondary("r0", "n1").await.unwrap();
    orch.delete_resource("r0").await.unwrap();
}

#[tokio::test]
async fn test_volume_add_remove_resize() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let orch = &h.services.orchestrator;

    let added = orch.add_volume("r0", 5).await.unwrap();
    assert_eq!(added.id, 1);
    assert!(h.sim.has_lv("n2", "vg0", "r0_vol1"));
    assert_eq!(h.free_gib("n1"), 85);

    let first = orch.get("r0").unwrap().volume(0).unwrap().minor;
    assert_ne!(first, added.minor);

    orch.remove_volume("r0", 1).await.unwrap();
    assert!(!h.sim.has_lv("n1", "vg0", "r0_vol1"));
    assert_eq!(h.free_gib("n1"), 90);

    // ids are never reused
    let again = orch.add_volume("r0", 5).await.unwrap();
    assert_eq!(again.id, 2);

    let err = orch.remove_volume("r0", 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let grown = orch.resize_volume("r0", 0, 30).await.unwrap();
    assert_eq!(grown.size_gib, 30);
    assert_eq!(h.free_gib("n2"), 65);

    let err = orch.resize_volume("r0", 0, 20).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    orch.remove_volume("r0", 2).await.unwrap();
    let err = orch.remove_volume("r0", 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn test_roles_and_status() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 5).await.unwrap();
    let orch = &h.services.orchestrator;

    let record = orch.set_primary("r0", "n2", false).await.unwrap();
    assert_eq!(record.role("n2"), Role::Primary);
    assert_eq!(h.sim.role("n2", "r0"), Role::Primary);

    // a second primary needs the first demoted
    let err = orch.set_primary("r0", "n1", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    // forcing is refused while the peer answers
    let err = orch.set_primary("r0", "n1", true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let status = orch.status("r0").await.unwrap();
    let n2 = status.nodes.iter().find(|n| n.node == "n2").unwrap();
    assert_eq!(n2.role, Role::Primary);
    assert_eq!(n2.disk_state.as_deref(), Some("UpToDate"));

    let err = orch.mount("r0", "n2", 0, "/srv/r0", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let err = orch.create_filesystem("r0", "n1", 0, "xfs").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    orch.create_filesystem("r0", "n2", 0, "xfs").await.unwrap();
    let err = orch.create_filesystem("r0", "n2", 0, "xfs").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    orch.set_secondary("r0", "n2").await.unwrap();
    assert_eq!(h.sim.role("n2", "r0"), Role::Secondary);
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ports() {
    let h = Harness::new(&["n1", "n2"]).await;
    let (a, b) = tokio::join!(h.create("ra", &["n1", "n2"], 5), h.create("rb", &["n1", "n2"], 5));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.port, b.port);
    assert_ne!(a.volumes[0].minor, b.volumes[0].minor);
    assert_eq!(h.free_gib("n1"), 90);
}

#[tokio::test]
async fn test_silent_primary_blocks_plain_promotion() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 5).await.unwrap();
    let orch = &h.services.orchestrator;
    orch.set_primary("r0", "n1", false).await.unwrap();

    h.sim.set_down("n1", true);
    h.ctx.registry.probe_node("n1").await.unwrap();

    // a status refresh during the outage keeps the last known role
    orch.status("r0").await.unwrap();
    assert_eq!(orch.get("r0").unwrap().role("n1"), Role::Primary);

    let err = orch.set_primary("r0", "n2", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(h.sim.role("n2", "r0"), Role::Secondary);

    let record = orch.set_primary("r0", "n2", true).await.unwrap();
    assert_eq!(record.role("n2"), Role::Primary);
    assert_eq!(record.role("n1"), Role::Unknown);
    assert_eq!(h.sim.role("n2", "r0"), Role::Primary);
}

#[tokio::test]
async fn test_volume_changes_on_one_resource_serialize() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let orch = &h.services.orchestrator;

    let (added, grown) = tokio::join!(orch.add_volume("r0", 5), orch.resize_volume("r0", 0, 20));
    let (added, grown) = (added.unwrap(), grown.unwrap());
    assert_eq!(added.id, 1);
    assert_eq!(grown.size_gib, 20);

    // neither commit overwrote the other
    let record = orch.get("r0").unwrap();
    assert_eq!(record.volumes.len(), 2);
    assert_eq!(record.volume(0).unwrap().size_gib, 20);
    assert_eq!(record.volume(1).unwrap().size_gib, 5);
    assert_eq!(record.next_volume_id, 2);
    for node in ["n1", "n2"] {
        assert_eq!(h.free_gib(node), 75);
        assert!(h.sim.replication_config(node, "r0").unwrap().contains("volume 1 {"));
    }
}

#[tokio::test]
async fn test_add_then_remove_restores_pool_capacity() {
    let h = Harness::new(&["n1", "n2", "n3"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let orch = &h.services.orchestrator;
    let before: Vec<u64> = ["n1", "n2", "n3"].iter().map(|n| h.free_gib(n)).collect();

    for size in [1, 7, 30] {
        let volume = orch.add_volume("r0", size).await.unwrap();
        orch.remove_volume("r0", volume.id).await.unwrap();
        let after: Vec<u64> = ["n1", "n2", "n3"].iter().map(|n| h.free_gib(n)).collect();
        assert_eq!(after, before);
    }
    let record = orch.get("r0").unwrap();
    assert_eq!(record.volumes.len(), 1);
    assert_eq!(record.next_volume_id, 4);
}

#[tokio::test]
async fn test_failed_volume_removal_restores_config() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let orch = &h.services.orchestrator;
    orch.add_volume("r0", 5).await.unwrap();

    // n1 took the shrunk config before n2 refused it
    h.sim.fail("n2", "replication_write_config", "read-only file system");
    let err = orch.remove_volume("r0", 1).await.unwrap_err();
    assert_eq!(err.rollback_status(), Some(RollbackStatus::Complete));
    assert_eq!(orch.get("r0").unwrap().volumes.len(), 2);
    assert!(h.sim.replication_config("n1", "r0").unwrap().contains("volume 1 {"));
    assert!(h.sim.has_lv("n1", "vg0", "r0_vol1"));
    assert_eq!(h.free_gib("n1"), 85);
    h.sim.heal("n2", "replication_write_config");

    // n2 keeps refusing to reattach, so the undo is partial
    h.sim.fail("n2", "replication_adjust", "device busy");
    let err = orch.remove_volume("r0", 1).await.unwrap_err();
    assert_eq!(err.rollback_status(), Some(RollbackStatus::Partial));
    let record = orch.get("r0").unwrap();
    assert_eq!(record.state, ResourceState::Ready);
    assert_eq!(record.volumes.len(), 2);
    assert!(h.sim.replication_config("n1", "r0").unwrap().contains("volume 1 {"));

    let intents = h.ctx.intents.list().unwrap();
    assert!(intents
        .iter()
        .filter(|i| i.kind == WorkflowKind::RemoveVolume)
        .all(|i| i.state == IntentState::RolledBack));

    h.sim.heal("n2", "replication_adjust");
    orch.remove_volume("r0", 1).await.unwrap();
    assert_eq!(h.free_gib("n2"), 90);
}

#[tokio::test]
async fn test_volume_removal_failing_on_backing_keeps_leftover_charged() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let orch = &h.services.orchestrator;
    orch.add_volume("r0", 5).await.unwrap();

    h.sim.fail("n2", "lv_remove", "device busy");
    let err = orch.remove_volume("r0", 1).await.unwrap_err();
    assert_eq!(err.rollback_status(), Some(RollbackStatus::Partial));

    // replication no longer knows the volume, so neither does the record
    let record = orch.get("r0").unwrap();
    assert!(record.volume(1).is_none());
    assert!(!h.sim.replication_config("n2", "r0").unwrap().contains("volume 1 {"));
    assert!(!h.sim.has_lv("n1", "vg0", "r0_vol1"));
    assert!(h.sim.has_lv("n2", "vg0", "r0_vol1"));
    assert_eq!(h.free_gib("n1"), 90);
    assert_eq!(h.free_gib("n2"), 85);
}

#[tokio::test]
async fn test_failed_resize_reports_rollback() {
    let h = Harness::new(&["n1", "n2"]).await;
    h.create("r0", &["n1", "n2"], 10).await.unwrap();
    let orch = &h.services.orchestrator;

    h.sim.fail("n2", "lv_extend", "insufficient free extents");
    let err = orch.resize_volume("r0", 0, 20).await.unwrap_err();
    // n1 grew and cannot shrink back
    assert_eq!(err.rollback_status(), Some(RollbackStatus::Partial));
    let record = orch.get("r0").unwrap();
    assert_eq!(record.state, ResourceState::Ready);
    assert_eq!(record.volume(0).unwrap().size_gib, 10);
    assert_eq!(h.free_gib("n1"), 90);

    // a retry picks up from the grown backing volume
    h.sim.heal("n2", "lv_extend");
    let grown = orch.resize_volume("r0", 0, 20).await.unwrap();
    assert_eq!(grown.size_gib, 20);
    assert_eq!(h.free_gib("n1"), 80);
    assert_eq!(h.free_gib("n2"), 80);
}
