//! cad-mcp-bridge library
//!
//! Bridges an MCP client to a long-running, single-threaded CAD host:
//! - Command and response envelopes with correlation ids
//! - File-pair and HTTP channels between the gateway and the host process
//! - A request gateway that serializes callers onto the single channel slot
//! - A host executor loop and a Rhai sandbox bound to explicit host state
//! - A data-driven catalog of convenience operations
//! - MCP server implementation using rmcp

pub mod catalog;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod host;
pub mod mcp;
pub mod sandbox;
pub mod transport;

pub use error::{BridgeError, ErrorKind};
