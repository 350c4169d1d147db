pub mod cancel;
pub mod datasets;
pub mod decompress;
pub mod fetch;
pub mod filename;
pub mod normalize;
pub mod rename;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub use cancel::{CancellationToken, CancelledError};
pub use decompress::{DecompressOptions, DecompressResult};
pub use fetch::{FetchOptions, FetchResult};
pub use normalize::{NormalizeOptions, NormalizeResult};
pub use rename::{RenameOptions, RenameResult};

/// Type alias for progress callback: (stage, current, total, message).
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

/// Throttled progress reporter — emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        Self {
            inner,
            last_emit: Mutex::new(Instant::now() - std::time::Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap();
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// `path` with `suffix` appended to its file name
/// (`title.basics.tsv` + `.tmp` -> `title.basics.tsv.tmp`).
pub(crate) fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Options for the full dataset pipeline: fetch, decompress, sort-normalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareOptions {
    /// Directory the datasets land in.
    pub dest: PathBuf,
    /// Mirror base URL.
    pub base_url: String,
    /// Archive names to process.
    pub files: Vec<String>,
    /// Maximum concurrent range-request segments per file.
    pub connections: usize,
    /// Memory budget per sort chunk.
    pub chunk_bytes: usize,
    /// Record per-file failures and continue instead of aborting.
    #[serde(default)]
    pub keep_going: bool,
}

impl PrepareOptions {
    pub fn new(dest: PathBuf) -> Self {
        Self {
            dest,
            base_url: datasets::DEFAULT_BASE_URL.to_string(),
            files: datasets::default_files(),
            connections: 16,
            chunk_bytes: normalize::DEFAULT_CHUNK_BYTES,
            keep_going: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResult {
    pub fetch: FetchResult,
    pub decompress: DecompressResult,
    pub normalize: NormalizeResult,
}

impl PrepareResult {
    /// All per-file failures across the three stages.
    pub fn failures(&self) -> Vec<String> {
        let mut failures = self.fetch.failed.clone();
        failures.extend(self.decompress.failed.iter().cloned());
        failures.extend(self.normalize.failed.iter().cloned());
        failures
    }
}

/// Run the full dataset pipeline with progress reporting.
///
/// Later stages only see the files that survived earlier ones, so with
/// `keep_going` a failed download is reported once rather than cascading.
pub fn prepare(
    options: &PrepareOptions,
    token: Option<&CancellationToken>,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<PrepareResult> {
    let tp = ThrottledProgress::new(progress_callback);

    let fetch_options = FetchOptions {
        dest: options.dest.clone(),
        base_url: options.base_url.clone(),
        files: options.files.clone(),
        connections: options.connections,
        keep_going: options.keep_going,
    };
    let fetched = fetch::fetch_datasets(&fetch_options, token, &tp)?;

    let decompress_options = DecompressOptions {
        dir: options.dest.clone(),
        files: fetched.fetched.clone(),
        keep_going: options.keep_going,
    };
    let decompressed = decompress::decompress_datasets(&decompress_options, &tp)?;

    let normalize_options = NormalizeOptions {
        dir: options.dest.clone(),
        files: decompressed.decompressed.clone(),
        chunk_bytes: options.chunk_bytes,
        keep_going: options.keep_going,
    };
    let normalized = normalize::normalize_datasets(&normalize_options, &tp)?;

    Ok(PrepareResult {
        fetch: fetched,
        decompress: decompressed,
        normalize: normalized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_with_suffix() {
        assert_eq!(
            path_with_suffix(Path::new("/data/title.basics.tsv"), ".tmp"),
            PathBuf::from("/data/title.basics.tsv.tmp")
        );
        assert_eq!(
            path_with_suffix(Path::new("title.akas.tsv.gz"), ".part"),
            PathBuf::from("title.akas.tsv.gz.part")
        );
    }

    #[test]
    fn test_throttled_progress_emits_final_update() {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let callback = {
            let count = count.clone();
            move |_: &str, _: u64, _: u64, _: &str| {
                count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        };
        let tp = ThrottledProgress::new(&callback);

        // Rapid intermediate updates are dropped, the final one always lands.
        tp.report("stage", 0, 100, "start");
        tp.report("stage", 1, 100, "middle");
        tp.report("stage", 99, 100, "done");
        let emitted = count.load(std::sync::atomic::Ordering::Relaxed);
        assert!(emitted >= 2, "expected first and final emissions, got {emitted}");
    }
}
