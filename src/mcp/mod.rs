//! Model Context Protocol (MCP) server handling and JSON-RPC implementations
//!
//! Provides protocol-level specifics surrounding JSON-RPC validation, dispatch,
//! formatting, and the MCP method set layered on top.

pub mod audit;
pub mod processor;
pub mod rpc;
pub mod server;

pub use processor::{HandlerError, HandlerResult, JsonRpcProcessor, MethodHandler};
