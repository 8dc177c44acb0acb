//! Thumbnail key naming and the self-trigger guard.
//!
//! Writing a thumbnail fires the same finalize notification as any other
//! upload. The suffix check in [`should_process`] is the only thing that stops
//! the trigger from thumbnailing its own output, so both functions here must
//! agree on [`THUMBNAIL_SUFFIX`].

/// Marker segment inserted before the image extension.
pub const THUMBNAIL_MARKER: &str = "thumbnail";

/// Extension of the encoded thumbnail (JPEG).
pub const THUMBNAIL_EXTENSION: &str = "jpg";

/// `.{THUMBNAIL_MARKER}.{THUMBNAIL_EXTENSION}`
pub const THUMBNAIL_SUFFIX: &str = ".thumbnail.jpg";

/// False for absent or empty keys and for keys that already name a thumbnail.
pub fn should_process(key: Option<&str>) -> bool {
    match key {
        Some(key) => !key.is_empty() && !key.ends_with(THUMBNAIL_SUFFIX),
        None => false,
    }
}

/// Thumbnail key for `key`: the extension of the last path segment is
/// replaced by [`THUMBNAIL_SUFFIX`], or the suffix is appended when there is
/// none.
///
/// Directory segments are left alone, and a leading dot (`.profile`) does not
/// count as an extension.
pub fn derive_key(key: &str) -> String {
    let name_start = key.rfind('/').map_or(0, |slash| slash + 1);
    let stem_end = match key[name_start..].rfind('.') {
        Some(0) | None => key.len(),
        Some(dot) => name_start + dot,
    };
    format!("{}{}", &key[..stem_end], THUMBNAIL_SUFFIX)
}
