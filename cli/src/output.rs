//! Summary lines printed after a command finishes.

use std::path::Path;

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

/// Archive size in binary units, one decimal above a KiB.
fn archive_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

/// One-line summary of a finished export.
pub fn export_summary(output: &Path, charts: usize, images: usize, size: u64, downloaded: u64) -> String {
    format!(
        "Exported {} and {} to {} ({}, {} downloaded)",
        plural(charts, "chart"),
        plural(images, "image"),
        output.display(),
        archive_size(size),
        plural(downloaded as usize, "object"),
    )
}

/// One-line summary of a finished import.
pub fn import_summary(registry: &str, charts: usize, images: usize) -> String {
    format!(
        "Imported {} and {} into {}",
        plural(charts, "chart"),
        plural(images, "image"),
        registry
    )
}
