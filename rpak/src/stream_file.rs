//! Writes the mandatory and optional stream files that accompany a pak.
//!
//! Each stream file starts with a 4096-byte header block (magic, version,
//! `0xCB` fill) and holds payloads padded to 4096-byte boundaries, followed by
//! a sort table of `{offset, size}` records and a `u64` entry count. Payload
//! writes deduplicate against the [`StreamCache`] first, so a payload already
//! present in a previously built stream file maps to that file instead of
//! being written again.

use crate::format::{
    PakStreamSet, StreamEntryDesc, StreamFileHdr, STARPAK_BLOCK_ALIGNMENT, STARPAK_MAGIC,
    STARPAK_PAD_BYTE, STARPAK_VERSION,
};
use crate::map::MapFile;
use crate::settings::BuildSettings;
use crate::stream_cache::StreamCache;
use crate::util::{align_up, change_extension, fix_slashes};
use anyhow::{bail, Context};
use binio::BinaryIo;
use std::mem::size_of;
use std::path::Path;
use tracing::{info, warn};
use zerocopy::byteorder::{U32, U64};

/// The outcome of [`StreamFileBuilder::add_entry`].
#[derive(Clone, Debug)]
pub struct StreamAddResult {
    /// Path of the stream file holding the payload, as the pak should
    /// reference it.
    pub stream_file: String,
    /// Offset of the payload within that file.
    pub data_offset: u64,
    /// The stream file's index within the cache.
    pub path_index: u32,
    /// Whether the payload was written by this call, or mapped to existing
    /// stream data.
    pub newly_written: bool,
}

struct OpenStream {
    /// The path recorded in the pak and the cache (forward slashes).
    path: String,
    io: BinaryIo,
    /// `(offset, padded size)` of every payload written, for the sort table.
    blocks: Vec<(u64, u64)>,
}

/// Builds the stream files for one pak build.
#[derive(Default)]
pub struct StreamFileBuilder {
    cache: StreamCache,
    mandatory: Option<OpenStream>,
    optional: Option<OpenStream>,
}

impl StreamFileBuilder {
    /// Creates a builder with no open streams and an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the streams named by the map document and loads the prior
    /// stream cache if one is configured. The optional stream is only opened
    /// when `use_optional` is set (pak version 8).
    pub fn init(
        &mut self,
        map: &MapFile,
        settings: &BuildSettings,
        use_optional: bool,
    ) -> anyhow::Result<()> {
        // The legacy `starpakPath` field names the mandatory stream file when
        // the newer field is absent.
        let mandatory_path = map
            .stream_file_mandatory
            .as_deref()
            .or(map.starpak_path.as_deref());

        if let Some(path) = mandatory_path {
            self.create_stream(&fix_slashes(path), PakStreamSet::Mandatory, settings)?;
        }

        if use_optional {
            if let Some(path) = &map.stream_file_optional {
                self.create_stream(&fix_slashes(path), PakStreamSet::Optional, settings)?;
            }
        } else if map.stream_file_optional.is_some() {
            warn!("streamFileOptional is ignored on pak version 7");
        }

        if let Some(cache_path) = &map.stream_cache {
            let resolved = settings.resolve_path(cache_path);
            info!(map = %resolved.display(), "loading cache from streaming map file");
            self.cache = StreamCache::parse_map(&resolved)?;
        }

        Ok(())
    }

    /// Number of payloads written to the mandatory stream file.
    pub fn mandatory_streaming_asset_count(&self) -> usize {
        self.mandatory.as_ref().map_or(0, |s| s.blocks.len())
    }

    /// Number of payloads written to the optional stream file.
    pub fn optional_streaming_asset_count(&self) -> usize {
        self.optional.as_ref().map_or(0, |s| s.blocks.len())
    }

    fn stream_slot(&mut self, set: PakStreamSet) -> &mut Option<OpenStream> {
        match set {
            PakStreamSet::Mandatory => &mut self.mandatory,
            PakStreamSet::Optional => &mut self.optional,
        }
    }

    /// Opens a stream file in the output directory and writes its header
    /// block.
    fn create_stream(
        &mut self,
        path: &str,
        set: PakStreamSet,
        settings: &BuildSettings,
    ) -> anyhow::Result<()> {
        if self.stream_slot(set).is_some() {
            return Ok(());
        }

        let file_name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);
        let full_path = settings.output_dir().join(file_name);

        std::fs::create_dir_all(settings.output_dir())?;
        let mut io = BinaryIo::create(&full_path).with_context(|| {
            format!(
                "Failed to open {} streaming file \"{}\"",
                set.name(),
                full_path.display()
            )
        })?;

        info!(set = set.name(), path = %full_path.display(), "opened streaming file stream");

        io.write(&StreamFileHdr {
            magic: U32::new(STARPAK_MAGIC),
            version: U32::new(STARPAK_VERSION),
        })?;
        let fill = [STARPAK_PAD_BYTE; STARPAK_BLOCK_ALIGNMENT as usize - size_of::<StreamFileHdr>()];
        io.write_bytes(&fill)?;

        *self.stream_slot(set) = Some(OpenStream {
            path: path.to_owned(),
            io,
            blocks: Vec::new(),
        });
        Ok(())
    }

    /// Adds one payload to the given stream set, deduplicating against the
    /// cache first.
    pub fn add_entry(&mut self, data: &[u8], set: PakStreamSet) -> anyhow::Result<StreamAddResult> {
        let is_optional = set == PakStreamSet::Optional;

        let current_path = match set {
            PakStreamSet::Mandatory => &self.mandatory,
            PakStreamSet::Optional => &self.optional,
        }
        .as_ref()
        .map(|s| s.path.clone())
        .unwrap_or_default();

        let query = self.cache.create_query(data, &current_path);

        if let Some(hit) = self.cache.find(&query, is_optional) {
            return Ok(StreamAddResult {
                stream_file: hit.file.path.clone(),
                data_offset: hit.data_offset,
                path_index: hit.path_index,
                newly_written: false,
            });
        }

        let Some(stream) = self.stream_slot(set).as_mut() else {
            bail!(
                "Attempted to write a {} streaming asset without a stream file handle. \
                 Add '{}' to the map file.",
                set.name(),
                match set {
                    PakStreamSet::Mandatory => "streamFileMandatory",
                    PakStreamSet::Optional => "streamFileOptional",
                }
            );
        };

        let data_offset = stream.io.size();
        debug_assert!(data_offset >= STARPAK_BLOCK_ALIGNMENT);

        stream.io.write_bytes(data)?;
        let padded_size = align_up(data.len() as u64, STARPAK_BLOCK_ALIGNMENT);
        if padded_size > data.len() as u64 {
            stream.io.pad(padded_size - data.len() as u64)?;
        }

        stream.blocks.push((data_offset, padded_size));

        let path_index = self.cache.add(&query, data_offset, is_optional)?;
        Ok(StreamAddResult {
            stream_file: current_path,
            data_offset,
            path_index,
            newly_written: true,
        })
    }

    /// Finishes both stream files (sort table plus entry-count footer) and,
    /// when any stream file was in use, saves a fresh `.starmap` next to the
    /// pak.
    pub fn shutdown(&mut self, output_dir: &Path) -> anyhow::Result<()> {
        Self::finish_stream(&mut self.mandatory, PakStreamSet::Mandatory)?;
        Self::finish_stream(&mut self.optional, PakStreamSet::Optional)?;

        let cache_stem = self
            .mandatory
            .as_ref()
            .or(self.optional.as_ref())
            .map(|s| s.path.clone());

        if let Some(stem) = cache_stem {
            let file_name = Path::new(&stem)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&stem);
            let map_path = output_dir.join(change_extension(
                file_name,
                crate::format::STREAM_CACHE_EXTENSION,
            ));

            match BinaryIo::create(&map_path) {
                Ok(mut io) => {
                    self.cache.save(&mut io)?;
                    info!(map = %map_path.display(), "saved cache to streaming map file");
                }
                Err(err) => {
                    warn!(
                        map = %map_path.display(),
                        error = %err,
                        "failed to save cache to streaming map file"
                    );
                }
            }
        }

        Ok(())
    }

    fn finish_stream(slot: &mut Option<OpenStream>, set: PakStreamSet) -> anyhow::Result<()> {
        let Some(stream) = slot.as_mut() else {
            return Ok(());
        };

        for &(offset, size) in &stream.blocks {
            stream.io.write(&StreamEntryDesc {
                offset: U64::new(offset),
                size: U64::new(size),
            })?;
        }
        stream.io.write(&(stream.blocks.len() as u64))?;

        info!(
            set = set.name(),
            path = %stream.path,
            assets = stream.blocks.len(),
            bytes = stream.io.size(),
            "built streaming file"
        );
        Ok(())
    }
}
