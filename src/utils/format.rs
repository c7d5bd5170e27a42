//! Formatting utilities for human-readable output

/// Bytes per megabyte constant
pub const MB: u64 = 1024 * 1024;
/// Bytes per gigabyte constant
pub const GB: u64 = 1024 * 1024 * 1024;

/// Convert bytes to megabytes as f64 (for calculations and logging)
#[inline]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / MB as f64
}

/// Convert bytes to gigabytes as f64 (for calculations and logging)
#[inline]
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GB as f64
}

/// Format bytes into human-readable size string (e.g., "1.5 GB", "256 MB")
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes_to_gb(bytes))
    } else if bytes >= MB {
        format!("{:.0} MB", bytes_to_mb(bytes))
    } else if bytes >= KB {
        format!("{:.0} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a duration in seconds as "1h 02m 03s" / "2m 03s" / "3s"
pub fn format_elapsed(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
