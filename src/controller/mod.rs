//! Cluster controller: state, node agents and the workflows that drive them

pub mod agent_client;
pub mod backing;
pub mod context;
pub mod failover;
pub mod fanout;
pub mod gateway;
pub mod ha;
pub mod http;
pub mod intent;
pub mod locks;
pub mod orchestrator;
pub mod placement;
pub mod pools;
pub mod records;
pub mod registry;
pub mod replication_config;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod wal;
pub mod zfs;

pub use agent_client::{AgentConnector, AgentReply, AgentRequest, AgentTransport, NodeAgentClient};
pub use context::ClusterContext;
pub use orchestrator::{Orchestrator, RecoveryReport};
pub use server::{Controller, Services};
pub use store::StateStore;
