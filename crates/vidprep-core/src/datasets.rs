//! The fixed set of IMDb dataset exports this tool prepares.

/// Default mirror serving the IMDb TSV exports.
pub const DEFAULT_BASE_URL: &str = "https://datasets.imdbws.com";

/// The four dataset archives consumed downstream.
pub const DATASET_FILES: &[&str] = &[
    "title.akas.tsv.gz",
    "title.basics.tsv.gz",
    "title.episode.tsv.gz",
    "title.ratings.tsv.gz",
];

pub fn default_files() -> Vec<String> {
    DATASET_FILES.iter().map(|s| s.to_string()).collect()
}

/// Full URL for one dataset archive.
pub fn dataset_url(base_url: &str, file: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), file)
}

/// Name of the file once inflated ("title.basics.tsv.gz" -> "title.basics.tsv").
pub fn decompressed_name(file: &str) -> &str {
    file.strip_suffix(".gz").unwrap_or(file)
}

pub fn default_decompressed_files() -> Vec<String> {
    DATASET_FILES
        .iter()
        .map(|f| decompressed_name(f).to_string())
        .collect()
}
