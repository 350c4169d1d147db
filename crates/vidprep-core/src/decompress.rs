//! In-place gzip inflation of the fetched dataset archives.
//!
//! Each archive is inflated to a sibling temp file, renamed onto the
//! decompressed name, and the `.gz` is removed. Files are processed in
//! parallel.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::bail;
use flate2::read::GzDecoder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::datasets;
use crate::path_with_suffix;
use crate::ThrottledProgress;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompressOptions {
    /// Directory holding the fetched archives.
    pub dir: PathBuf,
    /// Archive names to inflate, relative to `dir`.
    pub files: Vec<String>,
    /// Record per-file failures and continue instead of aborting.
    #[serde(default)]
    pub keep_going: bool,
}

impl DecompressOptions {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            files: datasets::default_files(),
            keep_going: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecompressResult {
    /// Decompressed file names (the `.tsv` names, not the archives).
    pub decompressed: Vec<String>,
    /// Per-file failures ("name: error"), only populated with keep_going.
    pub failed: Vec<String>,
}

/// Inflate each configured archive in place.
pub fn decompress_datasets(
    options: &DecompressOptions,
    progress: &ThrottledProgress,
) -> anyhow::Result<DecompressResult> {
    let total = options.files.len() as u64;
    let counter = AtomicU64::new(0);

    let outcomes: Vec<(String, anyhow::Result<()>)> = options
        .files
        .par_iter()
        .map(|name| {
            let outcome = decompress_one(&options.dir, name);
            let current = counter.fetch_add(1, Ordering::Relaxed);
            progress.report("decompress", current, total, name);
            (name.clone(), outcome)
        })
        .collect();

    let mut result = DecompressResult::default();
    for (name, outcome) in outcomes {
        match outcome {
            Ok(()) => result
                .decompressed
                .push(datasets::decompressed_name(&name).to_string()),
            Err(e) if options.keep_going => result.failed.push(format!("{name}: {e:#}")),
            Err(e) => return Err(e),
        }
    }

    Ok(result)
}

fn decompress_one(dir: &Path, name: &str) -> anyhow::Result<()> {
    let out_name = datasets::decompressed_name(name);
    if out_name == name {
        bail!("not a .gz archive: {name}");
    }

    let src = dir.join(name);
    let out_path = dir.join(out_name);
    let tmp_path = path_with_suffix(&out_path, ".tmp");

    let mut decoder = GzDecoder::new(BufReader::new(File::open(&src)?));
    let mut writer = BufWriter::new(File::create(&tmp_path)?);
    io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    drop(writer);

    fs::rename(&tmp_path, &out_path)?;
    fs::remove_file(&src)?;

    Ok(())
}
