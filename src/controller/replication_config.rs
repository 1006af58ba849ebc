//! Replication driver resource file rendering

use super::records::{NodeRecord, ResourceRecord};
use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Render the resource file every peer of `resource` receives.
///
/// Node ids follow the order of the resource's node list, which never changes
/// after creation, so re-rendering is stable.
pub fn render(resource: &ResourceRecord, nodes: &BTreeMap<String, NodeRecord>) -> Result<String> {
    let mut out = String::new();
    out.push_str("# managed by sds-controller, do not edit\n");
    out.push_str(&format!("resource {} {{\n", resource.name));

    out.push_str("    net {\n");
    out.push_str(&format!("        protocol {:?};\n", resource.protocol));
    for (key, value) in &resource.options {
        out.push_str(&format!("        {} {};\n", key, value));
    }
    out.push_str("    }\n");

    for volume in &resource.volumes {
        out.push_str(&format!("    volume {} {{\n", volume.id));
        out.push_str(&format!("        device minor {};\n", volume.minor));
        out.push_str(&format!("        disk {};\n", volume.backing_device));
        out.push_str("        meta-disk internal;\n");
        out.push_str("    }\n");
    }

    for (node_id, name) in resource.nodes.iter().enumerate() {
        let node = nodes
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("node {}", name)))?;
        out.push_str(&format!("    on {} {{\n", name));
        out.push_str(&format!("        node-id {};\n", node_id));
        out.push_str(&format!("        address {};\n", address(&node.address, resource.port)));
        out.push_str("    }\n");
    }

    if resource.nodes.len() > 1 {
        out.push_str("    connection-mesh {\n");
        out.push_str(&format!("        hosts {};\n", resource.nodes.join(" ")));
        out.push_str("    }\n");
    }

    out.push_str("}\n");
    Ok(out)
}

fn address(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("ipv6 [{}]:{}", v6, port),
        _ => format!("{}:{}", host, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::records::{
        Protocol, ResourceState, StorageKind, VolumeRecord, SCHEMA_VERSION,
    };
    use serde_json::Map;

    fn resource() -> ResourceRecord {
        ResourceRecord {
            schema_version: SCHEMA_VERSION,
            name: "r0".into(),
            port: 7000,
            protocol: Protocol::C,
            storage: StorageKind::VolumeManager,
            pool: "p1".into(),
            nodes: vec!["A".into(), "B".into()],
            options: BTreeMap::from([("max-buffers".to_string(), "8000".to_string())]),
            volumes: vec![VolumeRecord {
                id: 0,
                size_gib: 10,
                minor: 1000,
                backing_device: "/dev/p1/r0_vol0".into(),
                filesystem: None,
                extra: Map::new(),
            }],
            next_volume_id: 1,
            peers: BTreeMap::new(),
            mounts: vec![],
            state: ResourceState::Provisioning,
            created_at: 0,
            extra: Map::new(),
        }
    }

    fn nodes() -> BTreeMap<String, NodeRecord> {
        BTreeMap::from([
            ("A".to_string(), NodeRecord::new("A", "10.0.0.1", 3375)),
            ("B".to_string(), NodeRecord::new("B", "fd00::2", 3375)),
        ])
    }

    #[test]
    fn test_render_contains_peers_and_volumes() {
        let text = render(&resource(), &nodes()).unwrap();
        assert!(text.contains("resource r0 {"));
        assert!(text.contains("protocol C;"));
        assert!(text.contains("max-buffers 8000;"));
        assert!(text.contains("device minor 1000;"));
        assert!(text.contains("disk /dev/p1/r0_vol0;"));
        assert!(text.contains("node-id 0;"));
        assert!(text.contains("address 10.0.0.1:7000;"));
        assert!(text.contains("address ipv6 [fd00::2]:7000;"));
        assert!(text.contains("hosts A B;"));
    }

    #[test]
    fn test_unknown_node_is_error() {
        let mut res = resource();
        res.nodes.push("C".into());
        assert!(render(&res, &nodes()).unwrap_err().is_not_found());
    }
}
