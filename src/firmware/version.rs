use std::borrow::Cow;

use log::trace;
use once_cell::sync::Lazy;
use once_cell::unsync::OnceCell;
use regex::Regex;

/// The version reported when no version string could be found.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Number of leading bytes searched for a `V`-prefixed version.
const PREFIXED_SCAN_LIMIT: usize = 100_000;

/// Number of bytes, including the `V`, decoded at each candidate position.
const PREFIXED_WINDOW: usize = 10;

/// Bytes kept clear at the end of the buffer when choosing candidate positions.
const PREFIXED_LOOKAHEAD: usize = 8;

static PREFIXED_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"V[0-9]+\.[0-9]+\.[0-9]+").expect("valid regex"));
static BARE_VERSION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+$").expect("valid regex"));
static LABELED_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Version[:\s]*([0-9]+\.[0-9]+\.[0-9]+)").expect("valid regex")
});

/// The buffer being searched, with its lossy text decoding computed at most once.
struct VersionScan<'a> {
    data: &'a [u8],
    text: OnceCell<Cow<'a, str>>,
}

impl<'a> VersionScan<'a> {
    fn new(data: &'a [u8]) -> Self {
        VersionScan {
            data,
            text: OnceCell::new(),
        }
    }

    /// The whole buffer decoded as UTF-8, with invalid sequences replaced.
    fn text(&self) -> &str {
        self.text.get_or_init(|| String::from_utf8_lossy(self.data))
    }
}

type Extractor = fn(&VersionScan<'_>) -> Option<String>;

/// Extraction strategies, most specific first.
const EXTRACTORS: &[(&str, Extractor)] = &[
    ("prefixed", prefixed_version),
    ("bare line", bare_version_line),
    ("labeled", labeled_version),
];

/// Official firmware embeds its version as `V<major>.<minor>.<patch>` near the start of the image.
fn prefixed_version(scan: &VersionScan<'_>) -> Option<String> {
    let data = scan.data;
    let end = data
        .len()
        .saturating_sub(PREFIXED_LOOKAHEAD)
        .min(PREFIXED_SCAN_LIMIT);

    for (offset, _) in data[..end].iter().enumerate().filter(|&(_, &b)| b == b'V') {
        let window = &data[offset..(offset + PREFIXED_WINDOW).min(data.len())];
        let chunk = String::from_utf8_lossy(window);

        if let Some(found) = PREFIXED_VERSION.find(&chunk) {
            return Some(found.as_str().to_string());
        }
    }

    None
}

/// Community firmware stores the version as a bare dotted triple on its own line.
fn bare_version_line(scan: &VersionScan<'_>) -> Option<String> {
    scan.text()
        .split(|c: char| c == '\0' || c == '\n')
        .find(|line| BARE_VERSION_LINE.is_match(line))
        .map(str::to_string)
}

/// A `Version` label followed by the dotted triple, in any letter case.
fn labeled_version(scan: &VersionScan<'_>) -> Option<String> {
    LABELED_VERSION
        .captures(scan.text())
        .and_then(|captures| captures.get(1))
        .map(|version| version.as_str().to_string())
}

/// Extracts the embedded version string of a firmware binary.
///
/// Returns [`UNKNOWN_VERSION`] when no strategy finds a version.
pub fn extract_version(data: &[u8]) -> String {
    let scan = VersionScan::new(data);

    EXTRACTORS
        .iter()
        .find_map(|(name, extractor)| {
            let version = extractor(&scan)?;
            trace!("Found version {} with the {} strategy", version, name);

            Some(version)
        })
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}
