//! Ephemeral container sandboxes for running untrusted agent commands.
//!
//! The crate is layered bottom-up:
//!
//! - [`runtime`]: the [`RuntimeAdapter`] seam over a container runtime, with
//!   a Docker implementation and an in-memory fake
//! - [`sandbox`]: one container plus a persistent interactive terminal
//! - [`manager`]: a bounded pool of sandboxes keyed by session id, with idle
//!   eviction
//! - [`client`]: the façade a tool layer calls
//!
//! ```no_run
//! use std::sync::Arc;
//! use agentbox::{DockerRuntime, PoolConfig, SandboxClient, SandboxConfig, SandboxManager};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(DockerRuntime::connect()?);
//! let manager = SandboxManager::start(runtime, PoolConfig::default())?;
//! let client = SandboxClient::new(manager, SandboxConfig::default())?;
//!
//! let result = client.run("session-1", "echo hello", None).await?;
//! assert_eq!(result.stdout, "hello\n");
//! client.end_session("session-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod manager;
pub mod runtime;
pub mod sandbox;

pub use client::SandboxClient;
pub use error::SandboxError;
pub use manager::{PoolConfig, PoolStats, SandboxManager, SessionInfo};
pub use runtime::{DockerRuntime, MemoryRuntime, RuntimeAdapter, RuntimeError};
pub use sandbox::{CommandResult, Sandbox, SandboxConfig, SandboxLease, SandboxState};
