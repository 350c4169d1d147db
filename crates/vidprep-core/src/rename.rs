//! Media file renaming: scan a directory, normalize filenames in place.
//!
//! Each directory is handled in two phases. Phase 1 sorts the entries and
//! plans every rename, claiming target names so two sources mapping to the
//! same target are caught up front; the second claimant is skipped with a
//! warning instead of racing the first. Phase 2 executes the plan
//! sequentially. Recursion passes the subdirectory's full path.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::filename;
use crate::ProgressCallback;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameOptions {
    /// Directory to scan.
    pub root: PathBuf,
    /// Descend into subdirectories.
    #[serde(default)]
    pub recursive: bool,
    /// Plan and report renames without touching the filesystem.
    #[serde(default)]
    pub dry_run: bool,
}

impl RenameOptions {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            recursive: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenameResult {
    /// Files renamed (or planned, in dry-run mode).
    pub renamed: u64,
    /// Entries skipped: wrong extension, unparseable, or already normalized.
    pub skipped: u64,
    /// Collisions and other non-fatal oddities.
    pub warnings: Vec<String>,
}

/// Scan the root directory and rename media files to their normalized form.
///
/// Every rename is reported through the callback as `old -> new`. A failed
/// rename aborts the scan.
pub fn rename_media(
    options: &RenameOptions,
    progress: &ProgressCallback,
) -> anyhow::Result<RenameResult> {
    let mut result = RenameResult::default();
    scan_dir(&options.root, options, progress, &mut result)?;
    Ok(result)
}

fn scan_dir(
    dir: &Path,
    options: &RenameOptions,
    progress: &ProgressCallback,
    result: &mut RenameResult,
) -> anyhow::Result<()> {
    let mut files: Vec<(PathBuf, String)> = Vec::new();
    let mut subdirs: Vec<PathBuf> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            subdirs.push(entry.path());
        } else if file_type.is_file() {
            match entry.file_name().into_string() {
                Ok(name) => files.push((entry.path(), name)),
                Err(name) => {
                    result.skipped += 1;
                    result
                        .warnings
                        .push(format!("skipping non-UTF-8 name {:?} in {}", name, dir.display()));
                }
            }
        }
    }

    // Deterministic order so the collision policy is reproducible.
    files.sort_by(|a, b| a.1.cmp(&b.1));
    subdirs.sort();

    // Phase 1: plan targets, claiming each so collisions surface here.
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    let mut plan: Vec<(PathBuf, PathBuf)> = Vec::new();
    for (path, name) in &files {
        let Some(parsed) = filename::parse(name) else {
            result.skipped += 1;
            continue;
        };
        let target = dir.join(parsed.normalized());
        if target == *path {
            result.skipped += 1;
            continue;
        }
        if claimed.contains(&target) || target.exists() {
            result.warnings.push(format!(
                "collision: {} -> {} (target already taken, skipped)",
                path.display(),
                target.display()
            ));
            continue;
        }
        claimed.insert(target.clone());
        plan.push((path.clone(), target));
    }

    // Phase 2: execute sequentially.
    let total = plan.len() as u64;
    for (i, (source, target)) in plan.iter().enumerate() {
        progress(
            "rename",
            i as u64,
            total,
            &format!("{} -> {}", source.display(), target.display()),
        );
        if !options.dry_run {
            fs::rename(source, target)?;
        }
        result.renamed += 1;
    }

    if options.recursive {
        for subdir in subdirs {
            scan_dir(&subdir, options, progress, result)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    fn noop(_: &str, _: u64, _: u64, _: &str) {}

    fn run(options: &RenameOptions) -> RenameResult {
        rename_media(options, &noop).unwrap()
    }

    #[test]
    fn test_renames_and_skips() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("the.show.name.S01E02.1080p.mkv"));
        touch(&dir.path().join("movie.title.720P.mp4"));
        touch(&dir.path().join("show.mkv"));
        touch(&dir.path().join("random-video-file.avi"));

        let result = run(&RenameOptions::new(dir.path().to_path_buf()));

        assert_eq!(result.renamed, 3);
        assert_eq!(result.skipped, 1);
        assert!(result.warnings.is_empty());
        assert_eq!(
            names_in(dir.path()),
            vec![
                "Movie Title-SXXEXX-720p.mp4",
                "Show-SXXEXX-UNKNOWNp.mkv",
                "The Show Name-S01E02-1080p.mkv",
                "random-video-file.avi",
            ]
        );
    }

    #[test]
    fn test_already_normalized_is_skipped() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("Show-S01E02-1080p.mkv"));

        let result = run(&RenameOptions::new(dir.path().to_path_buf()));

        assert_eq!(result.renamed, 0);
        assert_eq!(result.skipped, 1);
        assert_eq!(names_in(dir.path()), vec!["Show-S01E02-1080p.mkv"]);
    }

    #[test]
    fn test_collision_detected_not_silent() {
        let dir = tempdir().unwrap();
        // Both normalize to "The Show-S01E02-1080p.mkv".
        touch(&dir.path().join("The Show-S01E02-1080P.mkv"));
        touch(&dir.path().join("the.show.S01E02.1080p.mkv"));

        let result = run(&RenameOptions::new(dir.path().to_path_buf()));

        // First claimant (in name order) wins; the second is skipped loudly.
        assert_eq!(result.renamed, 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("collision"));
        assert_eq!(
            names_in(dir.path()),
            vec!["The Show-S01E02-1080p.mkv", "the.show.S01E02.1080p.mkv"]
        );
    }

    #[test]
    fn test_existing_target_on_disk_is_a_collision() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("Show-S01E02-1080p.mkv"));
        touch(&dir.path().join("show.s01e02.1080p.mkv"));

        let result = run(&RenameOptions::new(dir.path().to_path_buf()));

        assert_eq!(result.renamed, 0);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(
            names_in(dir.path()),
            vec!["Show-S01E02-1080p.mkv", "show.s01e02.1080p.mkv"]
        );
    }

    #[test]
    fn test_recursive_reaches_nested_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("season one").join("disk two");
        fs::create_dir_all(&nested).unwrap();
        touch(&nested.join("deep.show.S05E09.480p.mkv"));

        let mut options = RenameOptions::new(dir.path().to_path_buf());
        options.recursive = true;
        let result = run(&options);

        assert_eq!(result.renamed, 1);
        assert_eq!(names_in(&nested), vec!["Deep Show-S05E09-480p.mkv"]);
    }

    #[test]
    fn test_non_recursive_ignores_subdirectories() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        touch(&sub.join("inner.show.S01E01.720p.mkv"));

        let result = run(&RenameOptions::new(dir.path().to_path_buf()));

        assert_eq!(result.renamed, 0);
        assert_eq!(names_in(&sub), vec!["inner.show.S01E01.720p.mkv"]);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("the.show.S01E02.1080p.mkv"));

        let mut options = RenameOptions::new(dir.path().to_path_buf());
        options.dry_run = true;
        let result = run(&options);

        assert_eq!(result.renamed, 1);
        assert_eq!(names_in(dir.path()), vec!["the.show.S01E02.1080p.mkv"]);
    }
}
