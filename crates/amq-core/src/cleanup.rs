//! Stale temp-file cleanup
//!
//! A writer that crashes between creating its temp file and renaming it
//! leaves the temp file behind. Nothing reads those files, so they are safe
//! to delete once they are older than any write still in flight.

use crate::io::layout::Layout;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Temp files under `root` last modified before `cutoff`.
///
/// Covers every file in each agent's `inbox/tmp` and `dlq/tmp`, plus
/// `.name.tmp-*` files left by atomic writes anywhere in the agent's tree.
/// The result is sorted and free of duplicates.
pub fn find_stale_tmp_files(root: &Path, cutoff: DateTime<Utc>) -> Result<Vec<PathBuf>> {
    let layout = Layout::new(root);
    let agents = layout
        .list_agents()
        .with_context(|| format!("Failed to list agents under {}", root.display()))?;

    let mut matches = BTreeSet::new();
    for agent in &agents {
        for dir in [layout.inbox_tmp(agent), layout.dlq_tmp(agent)] {
            collect_older(&dir, cutoff, &mut matches, &|_| true)?;
        }
        walk_agent_tree(&layout.agent_base(agent), cutoff, &mut matches)?;
    }
    Ok(matches.into_iter().collect())
}

/// Delete the files found by [`find_stale_tmp_files`]; returns how many
/// were removed.
pub fn remove_stale_tmp_files(root: &Path, cutoff: DateTime<Utc>) -> Result<usize> {
    let mut removed = 0;
    for path in find_stale_tmp_files(root, cutoff)? {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed stale temp file: {}", path.display());
                removed += 1;
            }
            // Renamed into place or removed by someone else
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
            }
        }
    }
    Ok(removed)
}

/// Parse an age like `"36h"`, `"7d"`, `"90m"` or `"30s"`.
pub fn parse_age(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    let (num_part, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => anyhow::bail!("Duration must have a unit (s, m, h or d): {s}"),
    };
    let num: i64 = num_part
        .parse()
        .with_context(|| format!("Invalid number in duration: {s}"))?;

    let age = match unit {
        "s" => Duration::try_seconds(num),
        "m" => Duration::try_minutes(num),
        "h" => Duration::try_hours(num),
        "d" => Duration::try_days(num),
        _ => anyhow::bail!("Unknown duration unit '{unit}'. Use s, m, h or d"),
    };
    age.with_context(|| format!("Duration out of range: {s}"))
}

fn is_atomic_temp(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp-")
}

fn walk_agent_tree(dir: &Path, cutoff: DateTime<Utc>, matches: &mut BTreeSet<PathBuf>) -> Result<()> {
    collect_older(dir, cutoff, matches, &is_atomic_temp)?;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            walk_agent_tree(&entry.path(), cutoff, matches)?;
        }
    }
    Ok(())
}

fn collect_older(
    dir: &Path,
    cutoff: DateTime<Utc>,
    matches: &mut BTreeSet<PathBuf>,
    keep: &dyn Fn(&str) -> bool,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.context("Failed to read directory entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !keep(&name) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!("Failed to get metadata for {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if DateTime::<Utc>::from(modified) < cutoff {
            matches.insert(entry.path());
        }
    }
    Ok(())
}
