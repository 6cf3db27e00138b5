//! MCP gateway that fans tool calls out to a fleet of remote hosts over
//! persistent SSH connections.
//!
//! A client (typically an LLM orchestration layer) connects once over MCP
//! and then issues many short, unordered commands against one or more
//! remote machines, each identified by a human-readable alias. The gateway
//! mediates authentication, connection reuse, jump-host tunnelling,
//! command execution and file transfer.

pub mod mcp;
