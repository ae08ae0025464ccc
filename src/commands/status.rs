//! `agentbox status`: runtime health and the managed containers it holds.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use agentbox::runtime::ContainerSummary;

use super::open_runtime;
use crate::config::Backend;

pub(crate) async fn run(backend: Backend, json: bool) -> Result<()> {
    let runtime = open_runtime(backend)?;
    let reachable = runtime.ping().await;
    let containers = match &reachable {
        Ok(()) => runtime.list_containers().await?,
        Err(_) => Vec::new(),
    };

    if json {
        let report = serde_json::json!({
            "runtime": runtime.name(),
            "reachable": reachable.is_ok(),
            "error": reachable.as_ref().err().map(ToString::to_string),
            "containers": containers,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let error = reachable.as_ref().err().map(ToString::to_string);
        print!("{}", format_status(runtime.name(), error, &containers));
    }
    Ok(())
}

fn format_status(runtime: &str, error: Option<String>, containers: &[ContainerSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(out, "{}", "   agentbox status".yellow().bold());
    let _ = writeln!(out, "{}", "━".repeat(50).dimmed());
    let _ = writeln!(out, "  Runtime:    {}", runtime.cyan());
    match error {
        None => {
            let _ = writeln!(out, "  Reachable:  {}", "yes".green().bold());
        }
        Some(error) => {
            let _ = writeln!(out, "  Reachable:  {} ({})", "no".red().bold(), error);
        }
    }
    let _ = writeln!(out, "  Sandboxes:  {}", containers.len().to_string().cyan());
    for container in containers {
        let _ = writeln!(
            out,
            "    {} {} {} {}",
            short_id(&container.id).dimmed(),
            container.name.cyan(),
            container.state,
            container
                .session
                .as_deref()
                .map(|s| format!("session={s}"))
                .unwrap_or_default()
                .dimmed()
        );
    }
    let _ = writeln!(out, "{}", "━".repeat(50).dimmed());
    out
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_status_lists_containers() {
        let containers = vec![ContainerSummary {
            id: "0123456789abcdef".to_string(),
            name: "agentbox-1".to_string(),
            state: "running".to_string(),
            session: Some("s1".to_string()),
        }];
        let out = format_status("docker", None, &containers);
        assert!(out.contains("0123456789ab"));
        assert!(!out.contains("0123456789abc"));
        assert!(out.contains("agentbox-1"));
        assert!(out.contains("session=s1"));
        assert!(out.contains("yes"));
    }

    #[test]
    fn test_format_status_unreachable() {
        let out = format_status("docker", Some("socket missing".to_string()), &[]);
        assert!(out.contains("socket missing"));
    }
}
