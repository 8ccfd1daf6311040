//! The build map document: the JSON control file that decides what gets
//! packed.

use anyhow::Context;
use serde_derive::Deserialize;
use std::path::Path;

/// Top-level schema of a build map file.
///
/// Per-asset entries stay as raw JSON values; their interpretation belongs to
/// the asset adders.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapFile {
    /// Name of the produced pak, without extension.
    pub name: Option<String>,
    /// Pak file version; 7 or 8.
    pub version: u16,
    /// Directory holding the source assets. Relative paths resolve against
    /// the map file's directory.
    pub assets_dir: Option<String>,
    /// Directory the pak and stream files are written to.
    pub output_dir: String,
    /// Legacy name for the mandatory stream file; `streamFileMandatory`
    /// wins when both are present.
    pub starpak_path: Option<String>,
    /// Path of the mandatory stream file, as the pak should reference it.
    pub stream_file_mandatory: Option<String>,
    /// Path of the optional stream file (version 8 only).
    pub stream_file_optional: Option<String>,
    /// Path of a `.starmap` cache from a previous run to deduplicate
    /// against.
    pub stream_cache: Option<String>,
    /// Keep dev-only data (asset names and similar debugging info).
    #[serde(default)]
    pub keep_dev_only: bool,
    /// Keep server-only data.
    #[serde(default)]
    pub keep_server_only: bool,
    /// Keep client-only data.
    #[serde(default)]
    pub keep_client_only: bool,
    /// Log per-asset details while building.
    #[serde(default)]
    pub show_debug_info: bool,
    /// The assets to pack, in pak order.
    pub files: Vec<serde_json::Value>,
}

/// Reads and parses a map file.
pub fn parse_map_file(path: &Path) -> anyhow::Result<MapFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open map file \"{}\"", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse map file \"{}\"", path.display()))
}
