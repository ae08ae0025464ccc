//! Write a default `agentbox.toml` into the current directory.
//!
//! Filesystem access is passed in as closures so the core logic can be
//! tested without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

/// Runs the init command.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!("Initializing agentbox in {}", cwd.display());

    let files = init_files();
    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results));
    Ok(())
}

/// File written during init.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    Skipped,
}

fn init_files() -> Vec<InitFile> {
    vec![InitFile {
        path: PathBuf::from(CONFIG_FILE),
        content: templates::AGENTBOX_TOML,
    }]
}

fn init_project<E, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let mut results = Vec::new();
    for file in files {
        let existed = exists(&file.path);
        let result = match (existed, force) {
            (true, false) => WriteResult::Skipped,
            (true, true) => {
                write_file(&file.path, file.content)?;
                WriteResult::Overwritten
            }
            (false, _) => {
                write_file(&file.path, file.content)?;
                WriteResult::Created
            }
        };
        results.push((file.path.clone(), result));
    }
    Ok(results)
}

fn format_results(results: &[(PathBuf, WriteResult)]) -> String {
    let mut out = String::new();
    for (path, result) in results {
        let line = match result {
            WriteResult::Created => format!(
                "{} Created {}\n",
                "✓".green().bold(),
                path.display().to_string().cyan()
            ),
            WriteResult::Overwritten => {
                format!("{} {} (overwritten)\n", "↻".blue(), path.display())
            }
            WriteResult::Skipped => format!(
                "{} {} (already exists, use --force to overwrite)\n",
                "⊘".yellow(),
                path.display()
            ),
        };
        out.push_str(&line);
    }
    out.push_str(&format!(
        "\nNext: edit {} and try {}\n",
        CONFIG_FILE.cyan(),
        "agentbox run -- 'echo hello'".green()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[test]
    fn test_init_files_include_config() {
        let files = init_files();
        assert!(files.iter().any(|f| f.path == Path::new(CONFIG_FILE)));
    }

    #[test]
    fn test_creates_missing_files() {
        let written = RefCell::new(HashMap::new());
        let results = init_project(
            &init_files(),
            false,
            |_| false,
            |path, content| {
                written
                    .borrow_mut()
                    .insert(path.to_path_buf(), content.to_string());
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(results[0].1, WriteResult::Created);
        assert!(written.borrow()[Path::new(CONFIG_FILE)].contains("[sandbox]"));
    }

    #[test]
    fn test_skips_existing_without_force() {
        let written = RefCell::new(0);
        let results = init_project(&init_files(), false, |_| true, |_, _| {
            *written.borrow_mut() += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(results[0].1, WriteResult::Skipped);
        assert_eq!(*written.borrow(), 0);
    }

    #[test]
    fn test_overwrites_with_force() {
        let results = init_project(&init_files(), true, |_| true, |_, _| Ok(())).unwrap();
        assert_eq!(results[0].1, WriteResult::Overwritten);
    }

    #[test]
    fn test_format_results() {
        let created = format_results(&[(PathBuf::from(CONFIG_FILE), WriteResult::Created)]);
        assert!(created.contains(CONFIG_FILE));
        let skipped = format_results(&[(PathBuf::from(CONFIG_FILE), WriteResult::Skipped)]);
        assert!(skipped.contains("--force"));
    }
}
