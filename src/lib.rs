//! # sds-controller
//!
//! Control plane for a replicated block-storage cluster:
//! - Node registry with periodic health probing of the node agents
//! - Resource orchestration (create, delete, add/remove/resize volume) with
//!   per-step checkpoints and rollback
//! - HA promoter configuration and controlled failover
//! - LVM and ZFS snapshots, gateways and direct ZFS administration
//! - Durable state in an append-only log with compacted snapshots
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   POST /v1/<group>/<method>   ┌─────────────────────────────┐
//! │ sds CLI  │ ────────────────────────────► │       sds-controller        │
//! └──────────┘                               │  placement ─► orchestrator  │
//!                                            │  HA builder   failover      │
//!                                            │  state store (log + snap)   │
//!                                            └──────────────┬──────────────┘
//!                                                           │ POST /v1/call
//!                               ┌───────────────────────────┼──────────────┐
//!                               │                           │              │
//!                         ┌─────▼──────┐             ┌──────▼─────┐  ┌─────▼──────┐
//!                         │ node agent │             │ node agent │  │ node agent │
//!                         │ LVM / ZFS  │             │ LVM / ZFS  │  │ LVM / ZFS  │
//!                         │ replication│             │ replication│  │ replication│
//!                         │ promoter   │             │ promoter   │  │ promoter   │
//!                         └────────────┘             └────────────┘  └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the controller
//! ```bash
//! sds-controller serve --config /etc/sds/controller.toml
//! ```
//!
//! ### Use the CLI
//! ```bash
//! sds node register n1 10.0.0.1
//! sds pool create n1 vg0 --type volume-group --device /dev/sdb
//! sds resource create r0 --nodes n1,n2 --pool vg0 --size 10
//! sds ha make r0 --mount /srv/data:ext4 --vip 10.0.0.50/24
//! sds ha evict r0
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod common;
pub mod controller;

// Re-export commonly used types
pub use client::ControllerClient;
pub use common::{ControllerConfig, Error, ErrorKind, Result};
pub use controller::{Controller, Orchestrator, StateStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
