//! Tokenizer and classifier for media filenames.
//!
//! Splits a name like `the.show.name.S01E02.1080p.mkv` into tokens, picks out
//! the quality and season/episode markers, and rebuilds the normalized
//! `{Title}-{EPISODE}-{quality}.{ext}` form.

use std::sync::LazyLock;

use regex::Regex;

/// Extensions the renamer will touch, lowercase.
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "mkv"];

/// Placeholder when no quality token was found.
pub const UNKNOWN_QUALITY: &str = "UNKNOWNp";

/// Placeholder when no season/episode token was found.
pub const UNKNOWN_EPISODE: &str = "SXXEXX";

static QUALITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\d{3,}p").unwrap());
static EPISODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)s\d+e\d+").unwrap());

/// Structured form of a media filename.
///
/// `title` holds the already-capitalized tokens preceding the cut point, the
/// lowest token index at which either marker matched. The first match wins
/// for each marker's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub title: Vec<String>,
    pub quality: Option<String>,
    pub episode: Option<String>,
    pub extension: String,
}

impl ParsedName {
    /// The normalized filename: `{Title}-{EPISODE}-{quality}.{ext}`.
    ///
    /// The extension keeps its original casing; missing markers become the
    /// `SXXEXX` / `UNKNOWNp` placeholders.
    pub fn normalized(&self) -> String {
        format!(
            "{}-{}-{}.{}",
            self.title.join(" "),
            self.episode.as_deref().unwrap_or(UNKNOWN_EPISODE),
            self.quality.as_deref().unwrap_or(UNKNOWN_QUALITY),
            self.extension
        )
    }
}

/// Parse a filename into its structured form.
///
/// Returns None when the extension is not an allowed media extension, or when
/// the name has nothing besides the extension token.
pub fn parse(file_name: &str) -> Option<ParsedName> {
    let tokens: Vec<&str> = file_name
        .split(['.', '-', ' '])
        .filter(|t| !t.is_empty())
        .collect();

    let (&extension, rest) = tokens.split_last()?;
    if !ALLOWED_EXTENSIONS.contains(&extension.to_lowercase().as_str()) {
        return None;
    }
    if rest.is_empty() {
        return None;
    }

    let mut quality = None;
    let mut episode = None;
    let mut cut = rest.len();
    for (i, token) in rest.iter().enumerate() {
        if quality.is_none() {
            if let Some(m) = QUALITY_RE.find(token) {
                quality = Some(m.as_str().to_lowercase());
                cut = cut.min(i);
            }
        }
        if episode.is_none() {
            if let Some(m) = EPISODE_RE.find(token) {
                episode = Some(m.as_str().to_uppercase());
                cut = cut.min(i);
            }
        }
    }

    let title = rest[..cut].iter().map(|t| capitalize(t)).collect();

    Some(ParsedName {
        title,
        quality,
        episode,
        extension: extension.to_string(),
    })
}

/// Uppercase the first character of a token, leaving the rest as-is.
fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
