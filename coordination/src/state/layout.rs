//! Numbered run directories under a shared root (`arenas/0001`, `arenas/0002`, ...).

use std::path::{Path, PathBuf};

use crate::error::ArenaResult;

pub const DEFAULT_RUNS_ROOT: &str = "arenas";

/// Make sure `root` exists and is ignored by git.
fn ensure_gitignore(root: &Path) -> ArenaResult<()> {
    std::fs::create_dir_all(root)?;
    let gitignore = root.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(gitignore, "*\n")?;
    }
    Ok(())
}

fn numbered_dirs(root: &Path) -> ArenaResult<Vec<(u32, PathBuf)>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(n) = name.parse::<u32>() {
            dirs.push((n, entry.path()));
        }
    }
    dirs.sort_by_key(|(n, _)| *n);
    Ok(dirs)
}

/// Path for the next run directory (not created).
pub fn next_run_dir(root: &Path) -> ArenaResult<PathBuf> {
    ensure_gitignore(root)?;
    let next = numbered_dirs(root)?.last().map(|(n, _)| n + 1).unwrap_or(1);
    Ok(root.join(format!("{next:04}")))
}

/// Most recent run directory, if any.
pub fn latest_run_dir(root: &Path) -> ArenaResult<Option<PathBuf>> {
    Ok(numbered_dirs(root)?.pop().map(|(_, p)| p))
}

/// The NNNN of a run directory; 1 when the name is not a number.
pub fn run_number_from_dir(dir: &Path) -> u32 {
    dir.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse().ok())
        .unwrap_or(1)
}
