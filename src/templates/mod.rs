//! Embedded templates for agentbox files.

/// Default `agentbox.toml` configuration.
pub(crate) const AGENTBOX_TOML: &str = include_str!("agentbox.toml");
