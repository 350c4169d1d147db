//! Segmented, resumable downloader for the dataset archives.
//!
//! Each file is probed with a HEAD request; when the server reports a length
//! and accepts byte ranges, the body is split into up to `connections`
//! segments downloaded by scoped threads, each writing at its own offset of a
//! preallocated `<name>.part` file. Per-segment progress is persisted to a
//! `<name>.fetch.json` sidecar so an interrupted download resumes where it
//! stopped. On completion the sidecar is removed and the part file is renamed
//! onto the final name.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::bail;
use reqwest::blocking::Client;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};

use crate::cancel::{CancellationToken, CancelledError};
use crate::datasets;
use crate::path_with_suffix;
use crate::ThrottledProgress;

const CHECKPOINT_VERSION: u32 = 1;

/// Segments smaller than this are not worth a connection.
const MIN_SEGMENT_SIZE: u64 = 1024 * 1024;

const COPY_BUF_SIZE: usize = 64 * 1024;

const SAVE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Destination directory for the archives.
    pub dest: PathBuf,
    /// Mirror base URL.
    pub base_url: String,
    /// Archive names to fetch, relative to `base_url` and `dest`.
    pub files: Vec<String>,
    /// Maximum concurrent range-request segments per file.
    pub connections: usize,
    /// Record per-file failures and continue instead of aborting.
    #[serde(default)]
    pub keep_going: bool,
}

impl FetchOptions {
    pub fn new(dest: PathBuf) -> Self {
        Self {
            dest,
            base_url: datasets::DEFAULT_BASE_URL.to_string(),
            files: datasets::default_files(),
            connections: 16,
            keep_going: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResult {
    /// Archive names downloaded to completion.
    pub fetched: Vec<String>,
    /// Bytes on disk across completed archives.
    pub bytes: u64,
    /// Per-file failures ("name: error"), only populated with keep_going.
    pub failed: Vec<String>,
}

/// One byte range of the download, `[start, end)`, with `done` bytes written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SegmentState {
    start: u64,
    end: u64,
    done: u64,
}

impl SegmentState {
    fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Sidecar persisted next to the part file while a download is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FetchCheckpoint {
    version: u32,
    url: String,
    total_size: u64,
    segments: Vec<SegmentState>,
}

impl FetchCheckpoint {
    fn new(url: &str, total_size: u64, connections: usize) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            url: url.to_string(),
            total_size,
            segments: plan_segments(total_size, connections),
        }
    }

    fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint = serde_json::from_reader(File::open(path)?)?;
        Ok(Some(checkpoint))
    }

    /// Write to a sibling temp file, then rename for atomicity.
    fn save(&self, path: &Path) -> anyhow::Result<()> {
        let tmp_path = path_with_suffix(path, ".tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// A checkpoint resumes only a download of the same URL and size.
    fn is_compatible(&self, url: &str, total_size: u64) -> bool {
        self.version == CHECKPOINT_VERSION
            && self.url == url
            && self.total_size == total_size
            && self.segments.last().map(|s| s.end) == Some(total_size)
            && self.segments.iter().all(|s| s.start <= s.end && s.done <= s.len())
    }
}

/// Split `[0, total_size)` into up to `connections` segments of at least
/// `MIN_SEGMENT_SIZE` bytes each.
fn plan_segments(total_size: u64, connections: usize) -> Vec<SegmentState> {
    if total_size == 0 {
        return Vec::new();
    }
    let max_segments = (total_size / MIN_SEGMENT_SIZE).max(1);
    let count = (connections.max(1) as u64).min(max_segments);
    let base = total_size / count;
    let remainder = total_size % count;

    let mut segments = Vec::with_capacity(count as usize);
    let mut start = 0;
    for i in 0..count {
        let len = base + u64::from(i < remainder);
        segments.push(SegmentState {
            start,
            end: start + len,
            done: 0,
        });
        start += len;
    }
    segments
}

/// Throttled writer for the checkpoint sidecar, shared by segment threads.
struct SidecarSaver {
    checkpoint: FetchCheckpoint,
    path: PathBuf,
    last_save: Instant,
}

impl SidecarSaver {
    fn new(checkpoint: FetchCheckpoint, path: PathBuf) -> Self {
        Self {
            checkpoint,
            path,
            last_save: Instant::now(),
        }
    }

    fn record(&mut self, segment: usize, done: u64) {
        self.checkpoint.segments[segment].done = done;
        if self.last_save.elapsed() >= SAVE_INTERVAL {
            self.force_save();
        }
    }

    fn force_save(&mut self) {
        let _ = self.checkpoint.save(&self.path);
        self.last_save = Instant::now();
    }
}

/// Download each configured archive into the destination directory.
pub fn fetch_datasets(
    options: &FetchOptions,
    token: Option<&CancellationToken>,
    progress: &ThrottledProgress,
) -> anyhow::Result<FetchResult> {
    fs::create_dir_all(&options.dest)?;

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    let mut result = FetchResult::default();
    for name in &options.files {
        let url = datasets::dataset_url(&options.base_url, name);
        let dest = options.dest.join(name);
        match fetch_one(&client, &url, &dest, options.connections, token, progress) {
            Ok(bytes) => {
                result.bytes += bytes;
                result.fetched.push(name.clone());
            }
            Err(e) if e.downcast_ref::<CancelledError>().is_some() => return Err(e),
            Err(e) if options.keep_going => result.failed.push(format!("{name}: {e:#}")),
            Err(e) => return Err(e),
        }
    }

    Ok(result)
}

fn fetch_one(
    client: &Client,
    url: &str,
    dest: &Path,
    connections: usize,
    token: Option<&CancellationToken>,
    progress: &ThrottledProgress,
) -> anyhow::Result<u64> {
    let part_path = path_with_suffix(dest, ".part");
    let checkpoint_path = path_with_suffix(dest, ".fetch.json");

    let Some(total_size) = probe(client, url) else {
        // No usable range support: plain streaming download, not resumable.
        return fetch_single(client, url, dest, &part_path, token, progress);
    };

    let checkpoint = match FetchCheckpoint::load(&checkpoint_path).unwrap_or(None) {
        Some(cp) if cp.is_compatible(url, total_size) && part_path.exists() => cp,
        _ => FetchCheckpoint::new(url, total_size, connections),
    };

    // Preallocate so each segment can write at its own offset.
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(&part_path)?
        .set_len(total_size)?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let segments = checkpoint.segments.clone();
    let done_total = AtomicU64::new(segments.iter().map(|s| s.done).sum());
    progress.report("fetch", done_total.load(Ordering::Relaxed), total_size, &file_name);

    let saver = Mutex::new(SidecarSaver::new(checkpoint, checkpoint_path.clone()));
    let cancelled = AtomicBool::new(false);

    std::thread::scope(|s| -> anyhow::Result<()> {
        let handles: Vec<_> = segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.done < segment.len())
            .map(|(i, segment)| {
                let part_path = &part_path;
                let file_name = &file_name;
                let saver = &saver;
                let cancelled = &cancelled;
                let done_total = &done_total;
                s.spawn(move || -> anyhow::Result<()> {
                    let mut file = OpenOptions::new().write(true).open(part_path)?;
                    let mut done = segment.done;
                    file.seek(SeekFrom::Start(segment.start + done))?;

                    let range = format!("bytes={}-{}", segment.start + done, segment.end - 1);
                    let mut response = client
                        .get(url)
                        .header(header::RANGE, range)
                        .send()?
                        .error_for_status()?;
                    if response.status() != StatusCode::PARTIAL_CONTENT {
                        bail!("server ignored range request for {url}");
                    }

                    let mut buf = [0u8; COPY_BUF_SIZE];
                    loop {
                        if let Some(token) = token {
                            if token.check().is_err() {
                                cancelled.store(true, Ordering::SeqCst);
                                return Ok(());
                            }
                        }
                        let n = response.read(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        file.write_all(&buf[..n])?;
                        done += n as u64;
                        let current = done_total.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
                        saver.lock().unwrap().record(i, done);
                        progress.report("fetch", current, total_size, file_name);
                    }

                    if done < segment.len() {
                        bail!(
                            "connection closed early at byte {} of {} for {url}",
                            segment.start + done,
                            segment.end
                        );
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap()?;
        }
        Ok(())
    })?;

    if cancelled.load(Ordering::SeqCst) {
        saver.lock().unwrap().force_save();
        return Err(CancelledError.into());
    }

    fs::rename(&part_path, dest)?;
    let _ = fs::remove_file(&checkpoint_path);

    Ok(total_size)
}

/// HEAD the URL; Some(length) when byte ranges are usable.
fn probe(client: &Client, url: &str) -> Option<u64> {
    let response = client.head(url).send().ok()?.error_for_status().ok()?;
    let ranges = response
        .headers()
        .get(header::ACCEPT_RANGES)
        .map(|v| v.as_bytes() == b"bytes")
        .unwrap_or(false);
    if !ranges {
        return None;
    }
    response
        .headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Fallback single-stream download for servers without range support.
fn fetch_single(
    client: &Client,
    url: &str,
    dest: &Path,
    part_path: &Path,
    token: Option<&CancellationToken>,
    progress: &ThrottledProgress,
) -> anyhow::Result<u64> {
    let mut response = client.get(url).send()?.error_for_status()?;
    let total = response.content_length().unwrap_or(0);
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut writer = BufWriter::new(File::create(part_path)?);
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut bytes = 0u64;
    loop {
        if let Some(token) = token {
            token.check()?;
        }
        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        bytes += n as u64;
        progress.report("fetch", bytes, total, &file_name);
    }
    writer.flush()?;
    drop(writer);

    fs::rename(part_path, dest)?;
    Ok(bytes)
}
