//! Header-preserving sort pass over the dataset files.
//!
//! Line 1 is copied verbatim; lines 2..N are rewritten in ascending byte
//! order. Data lines are collected in bounded-memory chunks, full chunks are
//! sorted and spilled to sibling temp files, and spills are k-way merged on
//! write-out, so files larger than memory work. The output is written to a
//! sibling temp file and renamed over the original, so a concurrent reader
//! never sees a partial write.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::datasets;
use crate::path_with_suffix;
use crate::ThrottledProgress;

/// Default in-memory budget for one sort chunk.
pub const DEFAULT_CHUNK_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeOptions {
    /// Directory holding the decompressed dataset files.
    pub dir: PathBuf,
    /// Files to normalize, relative to `dir`.
    pub files: Vec<String>,
    /// Memory budget per sort chunk.
    pub chunk_bytes: usize,
    /// Record per-file failures and continue instead of aborting.
    #[serde(default)]
    pub keep_going: bool,
}

impl NormalizeOptions {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            files: datasets::default_decompressed_files(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            keep_going: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizeResult {
    /// Files rewritten.
    pub normalized: Vec<String>,
    /// Data lines sorted across all files.
    pub lines: u64,
    /// Per-file failures ("name: error"), only populated with keep_going.
    pub failed: Vec<String>,
}

/// Sort-normalize each configured dataset file in place.
pub fn normalize_datasets(
    options: &NormalizeOptions,
    progress: &ThrottledProgress,
) -> anyhow::Result<NormalizeResult> {
    let total = options.files.len() as u64;
    let mut result = NormalizeResult::default();

    for (i, name) in options.files.iter().enumerate() {
        progress.report("normalize", i as u64, total, name);
        match normalize_file(&options.dir.join(name), options.chunk_bytes) {
            Ok(lines) => {
                result.lines += lines;
                result.normalized.push(name.clone());
            }
            Err(e) if options.keep_going => result.failed.push(format!("{name}: {e:#}")),
            Err(e) => return Err(e),
        }
    }
    progress.report("normalize", total, total, "datasets normalized");

    Ok(result)
}

/// Rewrite one file: header verbatim, data lines in ascending byte order.
///
/// Returns the number of data lines. An empty file is left untouched.
pub fn normalize_file(path: &Path, chunk_bytes: usize) -> anyhow::Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut header = Vec::new();
    if reader.read_until(b'\n', &mut header)? == 0 {
        return Ok(0);
    }

    let mut chunk: Vec<Vec<u8>> = Vec::new();
    let mut chunk_size = 0usize;
    let mut spills: Vec<PathBuf> = Vec::new();
    let mut lines = 0u64;

    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        chunk_size += line.len() + std::mem::size_of::<Vec<u8>>();
        chunk.push(line);
        lines += 1;

        if chunk_size >= chunk_bytes {
            spills.push(spill_chunk(path, spills.len(), &mut chunk)?);
            chunk_size = 0;
        }
    }
    drop(reader);

    let tmp_path = path_with_suffix(path, ".tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&header)?;

        if spills.is_empty() {
            chunk.sort_unstable();
            for line in &chunk {
                writer.write_all(line)?;
                writer.write_all(b"\n")?;
            }
        } else {
            if !chunk.is_empty() {
                spills.push(spill_chunk(path, spills.len(), &mut chunk)?);
            }
            merge_spills(&spills, &mut writer)?;
        }
        writer.flush()?;
    }

    for spill in &spills {
        let _ = fs::remove_file(spill);
    }
    fs::rename(&tmp_path, path)?;

    Ok(lines)
}

/// Sort the chunk and write it to a sibling spill file, one line per `\n`.
fn spill_chunk(path: &Path, index: usize, chunk: &mut Vec<Vec<u8>>) -> anyhow::Result<PathBuf> {
    chunk.sort_unstable();

    let spill_path = path_with_suffix(path, &format!(".spill-{index}"));
    let mut writer = BufWriter::new(File::create(&spill_path)?);
    for line in chunk.iter() {
        writer.write_all(line)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    chunk.clear();

    Ok(spill_path)
}

/// K-way merge of sorted spill files into the writer.
fn merge_spills(spills: &[PathBuf], writer: &mut impl Write) -> anyhow::Result<()> {
    let mut readers = Vec::with_capacity(spills.len());
    for spill in spills {
        readers.push(BufReader::new(File::open(spill)?));
    }

    // Min-heap keyed on (line, reader); ties drain the lower reader first,
    // which is invisible for whole-line keys but keeps the order total.
    let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::new();
    for (i, reader) in readers.iter_mut().enumerate() {
        if let Some(line) = read_line(reader)? {
            heap.push(Reverse((line, i)));
        }
    }

    while let Some(Reverse((line, i))) = heap.pop() {
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        if let Some(next) = read_line(&mut readers[i])? {
            heap.push(Reverse((next, i)));
        }
    }

    Ok(())
}

fn read_line(reader: &mut impl BufRead) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(path: &Path, contents: &[u8]) {
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_header_preserved_and_lines_sorted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("title.ratings.tsv");
        write_file(&path, b"tconst\taverageRating\nt3\t5.0\nt1\t7.1\nt2\t6.4\n");

        let lines = normalize_file(&path, DEFAULT_CHUNK_BYTES).unwrap();
        assert_eq!(lines, 3);
        assert_eq!(
            fs::read(&path).unwrap(),
            b"tconst\taverageRating\nt1\t7.1\nt2\t6.4\nt3\t5.0\n"
        );
    }

    #[test]
    fn test_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.tsv");
        write_file(&path, b"header\nzz\naa\nmm\naa\n");

        normalize_file(&path, DEFAULT_CHUNK_BYTES).unwrap();
        let once = fs::read(&path).unwrap();
        // Duplicates survive the sort; the data lines are a permutation.
        assert_eq!(once, b"header\naa\naa\nmm\nzz\n");
        normalize_file(&path, DEFAULT_CHUNK_BYTES).unwrap();
        assert_eq!(fs::read(&path).unwrap(), once);
    }

    #[test]
    fn test_multi_chunk_spill_and_merge() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.tsv");

        let mut contents = b"header\n".to_vec();
        let mut expected: Vec<String> = Vec::new();
        for i in (0..200).rev() {
            contents.extend_from_slice(format!("row{i:04}\tx\n").as_bytes());
            expected.push(format!("row{:04}\tx", 199 - i));
        }
        write_file(&path, &contents);

        // Tiny budget forces several spill files through the merge path.
        let lines = normalize_file(&path, 64).unwrap();
        assert_eq!(lines, 200);

        let output = fs::read_to_string(&path).unwrap();
        let mut output_lines = output.lines();
        assert_eq!(output_lines.next(), Some("header"));
        let data: Vec<&str> = output_lines.collect();
        assert_eq!(data, expected);

        // Spill files are cleaned up.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.contains(".spill-"))
            .collect();
        assert!(leftovers.is_empty(), "spills left behind: {leftovers:?}");
    }

    #[test]
    fn test_empty_and_header_only_files() {
        let dir = tempdir().unwrap();

        let empty = dir.path().join("empty.tsv");
        write_file(&empty, b"");
        assert_eq!(normalize_file(&empty, DEFAULT_CHUNK_BYTES).unwrap(), 0);
        assert_eq!(fs::read(&empty).unwrap(), b"");

        let header_only = dir.path().join("header.tsv");
        write_file(&header_only, b"tconst\ttitleType\n");
        assert_eq!(normalize_file(&header_only, DEFAULT_CHUNK_BYTES).unwrap(), 0);
        assert_eq!(fs::read(&header_only).unwrap(), b"tconst\ttitleType\n");
    }

    #[test]
    fn test_final_line_without_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.tsv");
        write_file(&path, b"header\nbb\naa");

        normalize_file(&path, DEFAULT_CHUNK_BYTES).unwrap();
        let once = fs::read(&path).unwrap();
        assert_eq!(once, b"header\naa\nbb\n");

        normalize_file(&path, DEFAULT_CHUNK_BYTES).unwrap();
        assert_eq!(fs::read(&path).unwrap(), once);
    }

    #[test]
    fn test_keep_going_records_missing_file() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("title.ratings.tsv");
        write_file(&present, b"header\nb\na\n");

        let options = NormalizeOptions {
            dir: dir.path().to_path_buf(),
            files: vec!["missing.tsv".to_string(), "title.ratings.tsv".to_string()],
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            keep_going: true,
        };
        let noop = |_: &str, _: u64, _: u64, _: &str| {};
        let progress = ThrottledProgress::new(&noop);
        let result = normalize_datasets(&options, &progress).unwrap();

        assert_eq!(result.normalized, vec!["title.ratings.tsv"]);
        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].starts_with("missing.tsv:"));
        assert_eq!(fs::read(&present).unwrap(), b"header\na\nb\n");
    }
}
