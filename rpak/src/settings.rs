//! Resolved build configuration for one pak build.

use crate::format::PakVersion;
use crate::map::MapFile;
use bitflags::bitflags;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Pak name used when the map file does not provide one.
pub const DEFAULT_PAK_NAME: &str = "new";

bitflags! {
    /// Build behavior toggles from the map file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BuildFlags: u32 {
        /// Keep debugging information such as asset names.
        const KEEP_DEV = 1 << 0;
        /// Keep server-only data.
        const KEEP_SERVER = 1 << 1;
        /// Keep client-only data.
        const KEEP_CLIENT = 1 << 2;
    }
}

/// The settings a build runs under, with all paths resolved.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    version: PakVersion,
    pak_name: String,
    map_dir: PathBuf,
    asset_dir: PathBuf,
    output_dir: PathBuf,
    flags: BuildFlags,
    show_debug_info: bool,
}

impl BuildSettings {
    /// Creates settings from already-resolved values.
    pub fn new(
        version: PakVersion,
        pak_name: String,
        map_dir: PathBuf,
        asset_dir: PathBuf,
        output_dir: PathBuf,
        flags: BuildFlags,
        show_debug_info: bool,
    ) -> Self {
        Self {
            version,
            pak_name,
            map_dir,
            asset_dir,
            output_dir,
            flags,
            show_debug_info,
        }
    }

    /// Derives settings from a parsed map document. Relative directories
    /// resolve against the map file's own directory.
    pub fn from_map(map: &MapFile, map_path: &Path) -> anyhow::Result<Self> {
        let version = PakVersion::from_u16(map.version)?;

        let map_dir = map_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let pak_name = match &map.name {
            Some(name) => name.clone(),
            None => {
                warn!(
                    "Map file has no 'name' field; using '{DEFAULT_PAK_NAME}{}'.",
                    crate::format::PAK_EXTENSION
                );
                DEFAULT_PAK_NAME.to_owned()
            }
        };

        let asset_dir = match &map.assets_dir {
            Some(dir) => resolve(&map_dir, dir),
            None => {
                warn!(
                    "No assetsDir field provided. Assuming that everything is \
                     relative to the map file's directory."
                );
                map_dir.clone()
            }
        };

        let output_dir = resolve(&map_dir, &map.output_dir);

        let mut flags = BuildFlags::empty();
        flags.set(BuildFlags::KEEP_DEV, map.keep_dev_only);
        flags.set(BuildFlags::KEEP_SERVER, map.keep_server_only);
        flags.set(BuildFlags::KEEP_CLIENT, map.keep_client_only);

        Ok(Self::new(
            version,
            pak_name,
            map_dir,
            asset_dir,
            output_dir,
            flags,
            map.show_debug_info,
        ))
    }

    /// The pak version being built.
    pub fn version(&self) -> PakVersion {
        self.version
    }

    /// The pak name, without extension.
    pub fn pak_name(&self) -> &str {
        &self.pak_name
    }

    /// Directory of the map file; relative map paths resolve against it.
    pub fn map_dir(&self) -> &Path {
        &self.map_dir
    }

    /// Directory holding the source assets.
    pub fn asset_dir(&self) -> &Path {
        &self.asset_dir
    }

    /// Directory the pak and its companion files are written to.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// The build flags.
    pub fn flags(&self) -> BuildFlags {
        self.flags
    }

    /// Whether the given flags are all set.
    pub fn is_flag_set(&self, flags: BuildFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Whether per-asset details should be logged.
    pub fn show_debug_info(&self) -> bool {
        self.show_debug_info
    }

    /// Resolves a map-relative path.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        resolve(&self.map_dir, path)
    }

    /// The full path of a source asset file.
    pub fn asset_path(&self, asset: &str) -> PathBuf {
        self.asset_dir.join(asset)
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_relative() {
        base.join(path)
    } else {
        path
    }
}
