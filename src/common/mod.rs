//! Common utilities and types shared across sds-controller

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use config::{ControllerConfig, HealthConfig, LogConfig, LogFormat, TimeoutConfig, WorkflowConfig};
pub use error::{Error, ErrorKind, NodeFailure, Result, RollbackStatus};
pub use utils::{
    generate_workflow_id, mount_unit_name, parse_cidr, timestamp_now, timestamp_now_millis,
    validate_mount_path, validate_object_name,
};
