//! `agentbox clean`: remove managed containers left behind by earlier runs.

use anyhow::Result;
use colored::Colorize;

use agentbox::{PoolConfig, SandboxManager};

use super::open_runtime;
use crate::config::Backend;

pub(crate) async fn run(backend: Backend, dry_run: bool) -> Result<()> {
    let runtime = open_runtime(backend)?;

    if dry_run {
        let containers = runtime.list_containers().await?;
        if containers.is_empty() {
            println!("\n{} No managed containers found.", "ℹ".blue());
        } else {
            println!("\n{} Would remove:", "ℹ".blue());
            for container in containers {
                println!("  {} {}", container.name.cyan(), container.state.dimmed());
            }
        }
        return Ok(());
    }

    // A fresh pool owns nothing, so every managed container counts as orphaned.
    let manager = SandboxManager::new(runtime, PoolConfig::default())?;
    let removed = manager.cleanup_orphaned().await?;
    println!("\n{}", format_removed(removed));
    Ok(())
}

fn format_removed(removed: usize) -> String {
    match removed {
        0 => format!("{} No managed containers found.", "ℹ".blue()),
        1 => format!("{} Removed 1 container.", "✓".green()),
        n => format!("{} Removed {n} containers.", "✓".green()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_removed() {
        assert!(format_removed(0).contains("No managed"));
        assert!(format_removed(1).contains("1 container."));
        assert!(format_removed(3).contains("3 containers"));
    }

    #[tokio::test]
    async fn test_clean_memory_backend_is_noop() {
        run(Backend::Memory, false).await.unwrap();
        run(Backend::Memory, true).await.unwrap();
    }
}
