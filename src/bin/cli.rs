//! CLI for cluster operations

use clap::{Args, Parser, Subcommand};
use sds_controller::client::{ClientError, ControllerClient, DEFAULT_URL};
use serde_json::{json, Map, Value};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sds")]
#[command(about = "sds cluster CLI")]
#[command(version)]
struct Cli {
    /// Controller URL
    #[arg(long, env = "SDS_CONTROLLER", default_value = DEFAULT_URL)]
    controller: String,

    /// Seconds to wait for a reply
    #[arg(long, default_value = "600")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Storage pools
    #[command(subcommand)]
    Pool(PoolCmd),
    /// Node registration and health
    #[command(subcommand)]
    Node(NodeCmd),
    /// Replicated resources
    #[command(subcommand)]
    Resource(ResourceCmd),
    /// High availability
    #[command(subcommand)]
    Ha(HaCmd),
    /// Volume snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCmd),
    /// NFS / iSCSI / NVMe-oF gateways
    #[command(subcommand)]
    Gateway(GatewayCmd),
    /// Direct ZFS administration on one node
    #[command(subcommand)]
    Zfs(ZfsCmd),
    /// Controller health
    Health,
}

#[derive(Subcommand)]
enum PoolCmd {
    Create {
        node: String,
        name: String,
        /// volume-group, thin-pool or copy-on-write-pool
        #[arg(long = "type", default_value = "volume-group")]
        pool_type: String,
        #[arg(long = "device")]
        devices: Vec<String>,
        /// Volume group of a thin pool
        #[arg(long)]
        volume_group: Option<String>,
        /// Thin pool size in GiB
        #[arg(long)]
        size: Option<u64>,
    },
    Get {
        node: String,
        name: String,
    },
    List {
        #[arg(long)]
        node: Option<String>,
    },
    Delete {
        node: String,
        name: String,
    },
    AddDisk {
        node: String,
        name: String,
        #[arg(long = "device", required = true)]
        devices: Vec<String>,
    },
}

#[derive(Subcommand)]
enum NodeCmd {
    Register {
        name: String,
        address: String,
        #[arg(long)]
        agent_port: Option<u16>,
    },
    Unregister {
        name: String,
    },
    Get {
        name: String,
    },
    List,
    /// Probe every node now
    HealthCheck,
}

#[derive(Args)]
struct Target {
    resource: String,
    node: String,
}

#[derive(Subcommand)]
enum ResourceCmd {
    Create {
        name: String,
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
        #[arg(long)]
        pool: String,
        /// First volume size in GiB
        #[arg(long)]
        size: u64,
        /// Replication port (auto-assigned when omitted)
        #[arg(long)]
        port: Option<u32>,
        /// A, B or C
        #[arg(long, default_value = "C")]
        protocol: String,
        /// key=value replication option
        #[arg(long = "option", value_parser = parse_key_value)]
        options: Vec<(String, String)>,
    },
    Delete {
        name: String,
    },
    Get {
        name: String,
    },
    List,
    /// Live replication state of every node
    Status {
        name: String,
    },
    AddVolume {
        resource: String,
        #[arg(long)]
        size: u64,
    },
    RemoveVolume {
        resource: String,
        volume: u32,
    },
    ResizeVolume {
        resource: String,
        volume: u32,
        #[arg(long)]
        size: u64,
    },
    SetPrimary {
        #[command(flatten)]
        target: Target,
        /// Promote even though peers are not up to date
        #[arg(long)]
        force: bool,
    },
    SetSecondary {
        #[command(flatten)]
        target: Target,
    },
    Mkfs {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "0")]
        volume: u32,
        #[arg(long, default_value = "ext4")]
        fstype: String,
    },
    Mount {
        #[command(flatten)]
        target: Target,
        path: String,
        #[arg(long, default_value = "0")]
        volume: u32,
        #[arg(long)]
        fstype: Option<String>,
    },
    Unmount {
        #[command(flatten)]
        target: Target,
        path: String,
    },
    /// Workflow intents and their state
    Intents,
}

#[derive(Subcommand)]
enum HaCmd {
    Make {
        resource: String,
        /// path:fstype
        #[arg(long)]
        mount: Option<String>,
        #[arg(long = "service")]
        services: Vec<String>,
        /// address/prefix
        #[arg(long)]
        vip: Option<String>,
    },
    Delete {
        resource: String,
    },
    Get {
        resource: String,
    },
    List,
    /// Move the resource off its active node
    Evict {
        resource: String,
    },
}

#[derive(Args)]
struct SnapshotTarget {
    node: String,
    /// Resource name, or a backing volume path such as vg0/r0_vol0
    volume: String,
    #[arg(long = "vol", default_value = "0")]
    volume_id: u32,
}

impl SnapshotTarget {
    fn into_body(self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("node".into(), json!(self.node));
        if self.volume.contains('/') {
            body.insert("volume_path".into(), json!(self.volume));
        } else {
            body.insert("resource".into(), json!(self.volume));
            body.insert("volume".into(), json!(self.volume_id));
        }
        body
    }
}

#[derive(Subcommand)]
enum SnapshotCmd {
    Create {
        #[command(flatten)]
        target: SnapshotTarget,
        name: String,
        /// Copy-on-write area in GiB (thick volume groups)
        #[arg(long)]
        size: Option<u64>,
    },
    Delete {
        #[command(flatten)]
        target: SnapshotTarget,
        name: String,
    },
    Restore {
        #[command(flatten)]
        target: SnapshotTarget,
        name: String,
    },
    List {
        #[arg(long)]
        resource: Option<String>,
    },
    /// What the node's backend holds for a volume
    ListNode {
        #[command(flatten)]
        target: SnapshotTarget,
    },
}

#[derive(Subcommand)]
enum GatewayCmd {
    Create {
        name: String,
        /// nfs, iscsi or nvmeof
        #[arg(long)]
        kind: String,
        #[arg(long)]
        resource: String,
        #[arg(long, default_value = "0")]
        volume: u32,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        service_ip: Option<String>,
    },
    Get {
        name: String,
    },
    List {
        #[arg(long)]
        resource: Option<String>,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Delete {
        name: String,
    },
}

#[derive(Subcommand)]
enum ZfsCmd {
    PoolCreate {
        node: String,
        name: String,
        #[arg(long = "device", required = true)]
        devices: Vec<String>,
    },
    PoolDestroy {
        node: String,
        name: String,
    },
    DatasetCreate {
        node: String,
        name: String,
        /// key=value property
        #[arg(long = "property", value_parser = parse_key_value)]
        properties: Vec<(String, String)>,
    },
    DatasetDestroy {
        node: String,
        name: String,
        #[arg(long)]
        recursive: bool,
    },
    VolumeCreate {
        node: String,
        name: String,
        #[arg(long)]
        size: u64,
    },
    VolumeDestroy {
        node: String,
        name: String,
    },
    List {
        node: String,
        /// pool, filesystem, volume or snapshot
        #[arg(long, default_value = "filesystem")]
        kind: String,
        #[arg(long)]
        root: Option<String>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn pairs(items: Vec<(String, String)>) -> Value {
    Value::Object(items.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
}

type Call = (&'static str, &'static str, Value);

/// (group, method, body) for a command; `None` for the plain health check
fn request(command: Commands) -> Result<Option<Call>, String> {
    let call = match command {
        Commands::Health => return Ok(None),

        Commands::Pool(cmd) => match cmd {
            PoolCmd::Create {
                node,
                name,
                pool_type,
                devices,
                volume_group,
                size,
            } => (
                "pool",
                "create",
                json!({"node": node, "name": name, "pool_type": pool_type, "devices": devices,
                       "volume_group": volume_group, "size_gib": size}),
            ),
            PoolCmd::Get { node, name } => ("pool", "get", json!({"node": node, "name": name})),
            PoolCmd::List { node } => ("pool", "list", json!({"node": node})),
            PoolCmd::Delete { node, name } => ("pool", "delete", json!({"node": node, "name": name})),
            PoolCmd::AddDisk { node, name, devices } => (
                "pool",
                "add_disk",
                json!({"node": node, "name": name, "devices": devices}),
            ),
        },

        Commands::Node(cmd) => match cmd {
            NodeCmd::Register {
                name,
                address,
                agent_port,
            } => (
                "node",
                "register",
                json!({"name": name, "address": address, "agent_port": agent_port}),
            ),
            NodeCmd::Unregister { name } => ("node", "unregister", json!({"name": name})),
            NodeCmd::Get { name } => ("node", "get", json!({"name": name})),
            NodeCmd::List => ("node", "list", json!({})),
            NodeCmd::HealthCheck => ("node", "health_check", json!({})),
        },

        Commands::Resource(cmd) => match cmd {
            ResourceCmd::Create {
                name,
                nodes,
                pool,
                size,
                port,
                protocol,
                options,
            } => (
                "resource",
                "create",
                json!({"name": name, "nodes": nodes, "pool": pool, "size_gib": size, "port": port,
                       "protocol": protocol.to_uppercase(), "options": pairs(options)}),
            ),
            ResourceCmd::Delete { name } => ("resource", "delete", json!({"name": name})),
            ResourceCmd::Get { name } => ("resource", "get", json!({"name": name})),
            ResourceCmd::List => ("resource", "list", json!({})),
            ResourceCmd::Status { name } => ("resource", "status", json!({"name": name})),
            ResourceCmd::AddVolume { resource, size } => (
                "resource",
                "add_volume",
                json!({"resource": resource, "size_gib": size}),
            ),
            ResourceCmd::RemoveVolume { resource, volume } => (
                "resource",
                "remove_volume",
                json!({"resource": resource, "volume": volume}),
            ),
            ResourceCmd::ResizeVolume {
                resource,
                volume,
                size,
            } => (
                "resource",
                "resize_volume",
                json!({"resource": resource, "volume": volume, "size_gib": size}),
            ),
            ResourceCmd::SetPrimary { target, force } => (
                "resource",
                "set_primary",
                json!({"resource": target.resource, "node": target.node, "force": force}),
            ),
            ResourceCmd::SetSecondary { target } => (
                "resource",
                "set_secondary",
                json!({"resource": target.resource, "node": target.node}),
            ),
            ResourceCmd::Mkfs {
                target,
                volume,
                fstype,
            } => (
                "resource",
                "create_filesystem",
                json!({"resource": target.resource, "node": target.node, "volume": volume, "fstype": fstype}),
            ),
            ResourceCmd::Mount {
                target,
                path,
                volume,
                fstype,
            } => (
                "resource",
                "mount",
                json!({"resource": target.resource, "node": target.node, "volume": volume,
                       "path": path, "fstype": fstype}),
            ),
            ResourceCmd::Unmount { target, path } => (
                "resource",
                "unmount",
                json!({"resource": target.resource, "node": target.node, "path": path}),
            ),
            ResourceCmd::Intents => ("resource", "intents", json!({})),
        },

        Commands::Ha(cmd) => match cmd {
            HaCmd::Make {
                resource,
                mount,
                services,
                vip,
            } => {
                let mount = match mount {
                    Some(spec) => {
                        let (path, fstype) = spec
                            .rsplit_once(':')
                            .ok_or_else(|| format!("expected path:fstype, got '{}'", spec))?;
                        json!({"path": path, "fstype": fstype})
                    }
                    None => Value::Null,
                };
                (
                    "ha",
                    "make",
                    json!({"resource": resource, "mount": mount, "services": services, "vip": vip}),
                )
            }
            HaCmd::Delete { resource } => ("ha", "delete", json!({"resource": resource})),
            HaCmd::Get { resource } => ("ha", "get", json!({"resource": resource})),
            HaCmd::List => ("ha", "list", json!({})),
            HaCmd::Evict { resource } => ("ha", "evict", json!({"resource": resource})),
        },

        Commands::Snapshot(cmd) => match cmd {
            SnapshotCmd::Create { target, name, size } => {
                let mut body = target.into_body();
                body.insert("name".into(), json!(name));
                body.insert("size_gib".into(), json!(size));
                ("snapshot", "create", Value::Object(body))
            }
            SnapshotCmd::Delete { target, name } => {
                let mut body = target.into_body();
                body.insert("name".into(), json!(name));
                ("snapshot", "delete", Value::Object(body))
            }
            SnapshotCmd::Restore { target, name } => {
                let mut body = target.into_body();
                body.insert("name".into(), json!(name));
                ("snapshot", "restore", Value::Object(body))
            }
            SnapshotCmd::List { resource } => ("snapshot", "list", json!({"resource": resource})),
            SnapshotCmd::ListNode { target } => ("snapshot", "list_node", Value::Object(target.into_body())),
        },

        Commands::Gateway(cmd) => match cmd {
            GatewayCmd::Create {
                name,
                kind,
                resource,
                volume,
                target,
                service_ip,
            } => (
                "gateway",
                "create",
                json!({"name": name, "kind": kind, "resource": resource, "volume": volume,
                       "target": target, "service_ip": service_ip}),
            ),
            GatewayCmd::Get { name } => ("gateway", "get", json!({"name": name})),
            GatewayCmd::List { resource } => ("gateway", "list", json!({"resource": resource})),
            GatewayCmd::Start { name } => ("gateway", "start", json!({"name": name})),
            GatewayCmd::Stop { name } => ("gateway", "stop", json!({"name": name})),
            GatewayCmd::Delete { name } => ("gateway", "delete", json!({"name": name})),
        },

        Commands::Zfs(cmd) => match cmd {
            ZfsCmd::PoolCreate { node, name, devices } => (
                "zfs",
                "pool_create",
                json!({"node": node, "name": name, "devices": devices}),
            ),
            ZfsCmd::PoolDestroy { node, name } => ("zfs", "pool_destroy", json!({"node": node, "name": name})),
            ZfsCmd::DatasetCreate {
                node,
                name,
                properties,
            } => (
                "zfs",
                "dataset_create",
                json!({"node": node, "name": name, "properties": pairs(properties)}),
            ),
            ZfsCmd::DatasetDestroy {
                node,
                name,
                recursive,
            } => (
                "zfs",
                "dataset_destroy",
                json!({"node": node, "name": name, "recursive": recursive}),
            ),
            ZfsCmd::VolumeCreate { node, name, size } => (
                "zfs",
                "volume_create",
                json!({"node": node, "name": name, "size_gib": size}),
            ),
            ZfsCmd::VolumeDestroy { node, name } => {
                ("zfs", "volume_destroy", json!({"node": node, "name": name}))
            }
            ZfsCmd::List { node, kind, root } => (
                "zfs",
                "list",
                json!({"node": node, "kind": kind, "root": root}),
            ),
        },
    };
    Ok(Some(call))
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn fail(error: ClientError) -> ExitCode {
    match &error {
        ClientError::Remote(envelope) => {
            eprintln!("error: {}", envelope.message);
            for failure in &envelope.failures {
                eprintln!("  {}: {} ({})", failure.node, failure.message, failure.kind);
            }
        }
        other => eprintln!("error: {}", other),
    }
    ExitCode::from(error.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    let client = match ControllerClient::new(&cli.controller, Duration::from_secs(cli.timeout)) {
        Ok(client) => client,
        Err(e) => return fail(e),
    };

    let (group, method, body) = match request(cli.command) {
        Ok(Some(call)) => call,
        Ok(None) => {
            return match client.health().await {
                Ok(health) => {
                    print_json(&health);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(e),
            };
        }
        Err(message) => {
            eprintln!("error: {}", message);
            return ExitCode::from(1);
        }
    };

    match client.call(group, method, &body).await {
        Ok(Some(payload)) => {
            print_json(&payload);
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => fail(e),
    }
}
