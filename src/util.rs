//! Miscellaneous helpers for naming downloaded files.

use url::Url;

/// Last path segment of a camera file URL or storage path.
///
/// Handles full URLs (query and fragment dropped) as well as plain paths with
/// either separator.  Returns `None` when there is no usable name.
pub fn file_name_from_url(remote: &str) -> Option<String> {
    let path = match Url::parse(remote) {
        Ok(url) if url.has_host() => url.path().to_string(),
        _ => remote.to_string(),
    };
    let name = path.rsplit(['/', '\\']).next().unwrap_or("");
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// `<prefix>_<YYYYmmdd_HHMMSS>.<ext>` in local time.
pub fn timestamped_name(prefix: &str, ext: &str) -> String {
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("{prefix}_{ts}.{ext}")
}

/// File name to save `remote` under, falling back to a timestamped name.
pub fn local_file_name(remote: &str, prefix: &str, ext: &str) -> String {
    file_name_from_url(remote).unwrap_or_else(|| timestamped_name(prefix, ext))
}

/// `name` with `_<n>` inserted before the extension; `n == 0` returns `name`.
pub fn numbered_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{n}.{ext}"),
        _ => format!("{name}_{n}"),
    }
}
