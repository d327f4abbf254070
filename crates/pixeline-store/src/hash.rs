//! Content-addressed filenames for downloaded images

use url::Url;

/// Extension used when the URL path has no usable one
pub const DEFAULT_EXTENSION: &str = ".jpg";

/// Longest extension kept from a URL path (without the dot)
const MAX_EXTENSION_LEN: usize = 5;

/// Hash the raw URL string with blake3.
pub fn url_hash(url: &str) -> blake3::Hash {
    blake3::hash(url.as_bytes())
}

/// Extension of the last path segment, lowercased and dot-prefixed.
///
/// Query and fragment never contribute. Anything that is not 1-5 ASCII
/// alphanumerics falls back to [`DEFAULT_EXTENSION`].
pub fn extension_of(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segs| segs.next_back())
        .unwrap_or("");
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=MAX_EXTENSION_LEN).contains(&ext.len())
                && ext.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

/// Deterministic local filename: `{blake3(url) hex}{extension}`.
///
/// The same URL always maps to the same file, so a retried write lands on
/// the same path.
pub fn image_filename(raw: &str, parsed: &Url) -> String {
    format!("{}{}", url_hash(raw).to_hex(), extension_of(parsed))
}
