//! perlcode-sandbox library
//!
//! Runs untrusted Perl snippets inside short-lived, locked-down containers:
//! - Configuration from environment variables
//! - A subprocess runner with hard timeouts and out-of-band kills
//! - The sandbox executor (image provisioning, isolation profile, version probe)
//! - A fair concurrency gate and the rate-limited execute handler
//! - MCP server implementation using rmcp

pub mod config;
pub mod gate;
pub mod mcp;
pub mod process;
pub mod sandbox;
pub mod service;
