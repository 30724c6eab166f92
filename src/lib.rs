//! toolgate: MCP gateway aggregation layer.
//!
//! Merges the tool catalogs of stdio, HTTP, WebSocket, and in-process sources
//! into one namespace served over a single JSON-RPC endpoint. Sources are
//! probed in the background; unreachable ones drop out of `tools/list` and
//! come back when they recover.

pub mod config;
pub mod error;
pub mod gateway;
pub mod jsonrpc;
pub mod namespace;
pub mod registry;
pub mod router;
pub mod source;
pub mod standalone;
pub mod tool;

pub use config::{CollisionPolicy, GatewayConfig, SourceConfig, TransportKind};
pub use error::{GatewayError, Result};
pub use gateway::{GatewayInstance, HealthReport, OverallStatus};
pub use registry::{SourceDescriptor, SourceRegistry};
pub use router::AggregatingRouter;
pub use source::bridge::{BridgeCatalog, InternalBridge};
pub use source::health::HealthState;
pub use standalone::front_door::app;
pub use standalone::stdio_bridge::StdioBridge;
pub use standalone::supervisor::{Supervisor, shutdown_signal};
pub use tool::ToolDescriptor;
