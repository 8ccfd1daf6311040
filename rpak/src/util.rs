//! Small path/time helpers shared across the builder.

use std::time::{SystemTime, UNIX_EPOCH};

/// Rounds `value` up to a multiple of `align`. `align` must be a power of two.
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Replaces backslashes with forward slashes.
pub fn fix_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Replaces the extension of the final path segment with `ext` (which must
/// include its leading dot), appending it if the segment has none.
pub fn change_extension(path: &str, ext: &str) -> String {
    let stem_end = match path.rfind('.') {
        // A dot before the last separator belongs to a directory name.
        Some(dot) if !path[dot..].contains(['/', '\\']) => dot,
        _ => path.len(),
    };
    let mut out = String::with_capacity(stem_end + ext.len());
    out.push_str(&path[..stem_end]);
    out.push_str(ext);
    out
}

/// Seconds between the Windows FILETIME epoch (1601-01-01) and the Unix epoch.
const FILETIME_UNIX_EPOCH_DELTA_SECS: u64 = 11_644_473_600;

/// The current time as a Windows FILETIME (100 ns ticks since 1601-01-01).
pub fn filetime_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() + FILETIME_UNIX_EPOCH_DELTA_SECS) * 10_000_000 + now.subsec_nanos() as u64 / 100
}
