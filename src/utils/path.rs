//! Path utility functions
//!
//! Directory lookup and path-component helpers shared by the cache and CLI.

use std::path::PathBuf;

/// Per-user cache directory for the application (`~/.cache/<app>` on Linux)
pub fn get_cache_dir(app_name: &str) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(app_name)
}

/// Per-user config directory for the application (`~/.config/<app>` on Linux)
pub fn get_config_dir(app_name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(app_name)
}

/// Extract the file name from a download URL, ignoring any query string
pub fn extract_filename(url: &str) -> Result<&str, String> {
    let url_path = url.split(['?', '#']).next().unwrap_or(url);
    url_path
        .split('/')
        .next_back()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Invalid URL: no filename in {}", url))
}

/// Make a value safe to use as a single path component
///
/// Keeps alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
/// `.` and `..` are rejected by mapping them to `_`.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
