use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use vidprep_core::{
    datasets, decompress, fetch, normalize, rename, CancellationToken, CancelledError,
    DecompressOptions, FetchOptions, NormalizeOptions, PrepareOptions, RenameOptions,
    ThrottledProgress,
};

#[derive(Parser)]
#[command(
    name = "vidprep",
    version,
    about = "Prepare the IMDb datasets and normalize media filenames"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the IMDb dataset archives and decompress them
    Fetch {
        /// Destination directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Concurrent range-request segments per file
        #[arg(long, default_value_t = 16)]
        connections: usize,

        /// Dataset mirror base URL
        #[arg(long, default_value = datasets::DEFAULT_BASE_URL)]
        base_url: String,

        /// Continue past per-file failures instead of aborting
        #[arg(long)]
        keep_going: bool,

        /// Leave the downloaded archives compressed
        #[arg(long)]
        no_decompress: bool,
    },

    /// Sort the decompressed dataset files in place, keeping the header first
    Normalize {
        /// Directory holding the dataset files
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Continue past per-file failures instead of aborting
        #[arg(long)]
        keep_going: bool,
    },

    /// Fetch, decompress and sort-normalize in one run
    Prepare {
        /// Destination directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Concurrent range-request segments per file
        #[arg(long, default_value_t = 16)]
        connections: usize,

        /// Dataset mirror base URL
        #[arg(long, default_value = datasets::DEFAULT_BASE_URL)]
        base_url: String,

        /// Continue past per-file failures instead of aborting
        #[arg(long)]
        keep_going: bool,
    },

    /// Rename media files to {Title}-{SxxExx}-{quality}.{ext}
    Rename {
        /// Directory to scan
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        /// Report renames without touching the filesystem
        #[arg(long)]
        dry_run: bool,
    },
}

/// Renders core progress callbacks: one indicatif bar per stage, rename
/// lines straight to stderr.
#[derive(Default)]
struct ProgressRender {
    bar: Mutex<Option<(String, ProgressBar)>>,
}

impl ProgressRender {
    fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        if stage == "rename" {
            eprintln!("{message}");
            return;
        }

        let mut guard = self.bar.lock().unwrap();
        let bar = match guard.as_ref() {
            Some((active, bar)) if active == stage => bar.clone(),
            _ => {
                if let Some((_, old)) = guard.take() {
                    old.finish_and_clear();
                }
                let bar = ProgressBar::new(total.max(1));
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("[{bar:40}] {pos}/{len} {msg}")
                        .unwrap(),
                );
                *guard = Some((stage.to_string(), bar.clone()));
                bar
            }
        };
        bar.set_length(total.max(1));
        bar.set_position(current);
        bar.set_message(message.to_string());

        if current >= total {
            guard.take();
            bar.finish_and_clear();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let t_total = std::time::Instant::now();

    let token = CancellationToken::new();
    {
        let token = token.clone();
        ctrlc::set_handler(move || token.cancel())?;
    }

    let render = ProgressRender::default();
    let progress = move |stage: &str, current: u64, total: u64, message: &str| {
        render.report(stage, current, total, message)
    };

    let outcome = run(cli.command, &token, &progress);

    let failures = match outcome {
        Ok(failures) => failures,
        Err(e) if e.downcast_ref::<CancelledError>().is_some() => {
            eprintln!("Interrupted; fetch progress saved, rerun to resume.");
            std::process::exit(130);
        }
        Err(e) => return Err(e),
    };

    if !failures.is_empty() {
        for failure in &failures {
            eprintln!("failed: {failure}");
        }
        std::process::exit(1);
    }

    eprintln!("Done in {:.2}s", t_total.elapsed().as_secs_f64());
    Ok(())
}

/// Run one subcommand; returns the per-file failures recorded by keep-going.
fn run(
    command: Command,
    token: &CancellationToken,
    progress: &vidprep_core::ProgressCallback,
) -> anyhow::Result<Vec<String>> {
    match command {
        Command::Fetch {
            dir,
            connections,
            base_url,
            keep_going,
            no_decompress,
        } => {
            let tp = ThrottledProgress::new(progress);
            let options = FetchOptions {
                dest: dir.clone(),
                base_url,
                files: datasets::default_files(),
                connections,
                keep_going,
            };
            let fetched = fetch::fetch_datasets(&options, Some(token), &tp)?;
            eprintln!(
                "Fetched {} archives ({} bytes)",
                fetched.fetched.len(),
                fetched.bytes
            );
            let mut failures = fetched.failed.clone();

            if !no_decompress {
                let options = DecompressOptions {
                    dir,
                    files: fetched.fetched,
                    keep_going,
                };
                let decompressed = decompress::decompress_datasets(&options, &tp)?;
                eprintln!("Decompressed {} archives", decompressed.decompressed.len());
                failures.extend(decompressed.failed);
            }
            Ok(failures)
        }

        Command::Normalize { dir, keep_going } => {
            let tp = ThrottledProgress::new(progress);
            let mut options = NormalizeOptions::new(dir);
            options.keep_going = keep_going;
            let result = normalize::normalize_datasets(&options, &tp)?;
            eprintln!(
                "Normalized {} files ({} data lines)",
                result.normalized.len(),
                result.lines
            );
            Ok(result.failed)
        }

        Command::Prepare {
            dir,
            connections,
            base_url,
            keep_going,
        } => {
            let mut options = PrepareOptions::new(dir);
            options.base_url = base_url;
            options.connections = connections;
            options.keep_going = keep_going;
            let result = vidprep_core::prepare(&options, Some(token), progress)?;
            eprintln!(
                "Prepared {} datasets ({} data lines sorted)",
                result.normalize.normalized.len(),
                result.normalize.lines
            );
            Ok(result.failures())
        }

        Command::Rename {
            root,
            recursive,
            dry_run,
        } => {
            let options = RenameOptions {
                root,
                recursive,
                dry_run,
            };
            let result = rename::rename_media(&options, progress)?;
            for warning in &result.warnings {
                eprintln!("warning: {warning}");
            }
            eprintln!(
                "{} {} files, {} skipped",
                if dry_run { "Would rename" } else { "Renamed" },
                result.renamed,
                result.skipped
            );
            Ok(Vec::new())
        }
    }
}
