//! The top-level pak builder.
//!
//! Owns the asset list, the descriptor tables, the page builder, and the
//! stream-file builder, and drives the asset adders over the map document.
//! Asset output order matches the order of entries in the map file;
//! descriptor tables are written sorted by pointer value regardless of
//! registration order, which is what the loading runtime expects.

use crate::assets::{builtin_handlers, default_asset_guid, AdderSlot, AssetTypeHandler};
use crate::format::{
    PagePtr, PagePtrDesc, PakHdr, PakStreamSet, PakStreamSetEntry, PakVersion,
    PAK_EXTENSION, PAK_MAX_STREAM_FILES_PER_SET,
};
use crate::guid::Guid;
use crate::map::{parse_map_file, MapFile};
use crate::pages::{PageBuilder, PageLump};
use crate::settings::BuildSettings;
use crate::stream_file::StreamFileBuilder;
use crate::util::filetime_now;
use anyhow::{bail, Context};
use binio::BinaryIo;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use sync_file::WriteAt;
use tracing::{debug, info};
use zerocopy::IntoBytes;

/// A guid reference: the location of a guid inside page data that the runtime
/// must resolve to an asset pointer.
#[derive(Copy, Clone, Debug)]
pub struct PakGuidRef {
    /// Where the guid bytes live.
    pub ptr: PagePtr,
    /// The referenced asset's guid. Build-time only; the on-disk table
    /// records just the location.
    pub guid: Guid,
}

/// One asset record under construction.
#[derive(Debug)]
pub struct PakAsset {
    /// Hashed asset path, unique across the pak.
    pub guid: Guid,
    /// Source path, kept for diagnostics.
    pub name: String,
    /// Pointer to the asset's header lump.
    pub head_ptr: PagePtr,
    /// Size of the asset header in bytes.
    pub head_size: u32,
    /// Pointer to the asset's bulk CPU data, or null.
    pub cpu_ptr: PagePtr,
    /// Mandatory stream-data reference.
    pub starpak: PakStreamSetEntry,
    /// Optional stream-data reference (version 8 only).
    pub opt_starpak: PakStreamSetEntry,
    /// Highest page index referenced by this asset, plus one.
    pub page_end: u16,
    /// 1 plus the number of local assets that use this one. The runtime
    /// decrements this while resolving dependencies; the asset activates
    /// when it reaches 1.
    pub internal_dep_count: u16,
    /// Start of this asset's slice of the global dependents table.
    pub dependents_start: u32,
    /// Length of that slice.
    pub dependents_count: u32,
    /// Start of this asset's slice of the global guid-reference table.
    pub uses_start: u32,
    /// Length of that slice.
    pub uses_count: u32,
    /// Asset format version.
    pub version: u32,
    /// Asset type FourCC.
    pub asset_type: u32,

    uses: Vec<PakGuidRef>,
    dependents: Vec<u32>,
}

impl PakAsset {
    fn new(guid: Guid, name: &str) -> Self {
        Self {
            guid,
            name: name.to_owned(),
            head_ptr: PagePtr::NULL,
            head_size: 0,
            cpu_ptr: PagePtr::NULL,
            starpak: PakStreamSetEntry::UNASSIGNED,
            opt_starpak: PakStreamSetEntry::UNASSIGNED,
            page_end: 0,
            // The asset always depends on itself.
            internal_dep_count: 1,
            dependents_start: 0,
            dependents_count: 0,
            uses_start: 0,
            uses_count: 0,
            version: 0,
            asset_type: 0,
            uses: Vec::new(),
            dependents: Vec::new(),
        }
    }

    /// The guid references registered by this asset so far.
    pub fn uses(&self) -> &[PakGuidRef] {
        &self.uses
    }
}

/// Builds one pak file from a map document.
pub struct PakBuilder {
    settings: BuildSettings,
    stream: StreamFileBuilder,
    header: PakHdr,
    pages: PageBuilder,
    assets: Vec<PakAsset>,
    page_ptrs: Vec<PagePtr>,
    guid_refs: Vec<PakGuidRef>,
    dependents: Vec<u32>,
    mandatory_stream_paths: Vec<String>,
    optional_stream_paths: Vec<String>,
    handlers: Vec<AssetTypeHandler>,
    processing_asset: bool,
}

impl PakBuilder {
    /// Creates a builder for the given settings, taking ownership of the
    /// stream-file builder.
    pub fn new(settings: BuildSettings, stream: StreamFileBuilder) -> Self {
        let header = PakHdr::new(settings.version());
        Self {
            settings,
            stream,
            header,
            pages: PageBuilder::new(),
            assets: Vec::new(),
            page_ptrs: Vec::new(),
            guid_refs: Vec::new(),
            dependents: Vec::new(),
            mandatory_stream_paths: Vec::new(),
            optional_stream_paths: Vec::new(),
            handlers: builtin_handlers(),
            processing_asset: false,
        }
    }

    /// The build settings.
    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Number of assets added so far.
    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    /// Number of pages created so far.
    pub fn page_count(&self) -> u16 {
        self.pages.page_count()
    }

    /// Replaces the handler for an asset type, letting an external parser
    /// hook its adders in.
    pub fn register_asset_handler(&mut self, handler: AssetTypeHandler) {
        match self
            .handlers
            .iter_mut()
            .find(|h| h.four_cc == handler.four_cc)
        {
            Some(slot) => *slot = handler,
            None => self.handlers.push(handler),
        }
    }

    /// Finds an asset by guid.
    pub fn get_asset_by_guid(&self, guid: Guid) -> Option<&PakAsset> {
        self.assets.iter().find(|asset| asset.guid == guid)
    }

    /// Starts a new asset record. Only one asset may be in flight at a time;
    /// a duplicate guid is a fatal build error.
    pub fn begin_asset(&mut self, guid: Guid, name: &str) -> anyhow::Result<()> {
        // Only one asset can be processed at a time. This fires when an
        // adder begins a nested asset, or forgot to call finish_asset.
        assert!(
            !self.processing_asset,
            "begin_asset called while another asset is being processed"
        );

        if let Some(existing) = self.assets.iter().position(|a| a.guid == guid) {
            bail!(
                "Attempted to create asset with a non-unique GUID.\n\
                 Assets at index {existing} (\"{}\") and {} (\"{name}\") share GUID {guid:#018x}.",
                self.assets[existing].name,
                self.assets.len(),
            );
        }

        self.processing_asset = true;
        self.assets.push(PakAsset::new(guid, name));
        Ok(())
    }

    fn current_asset_mut(&mut self) -> &mut PakAsset {
        assert!(
            self.processing_asset,
            "no asset is being processed; call begin_asset first"
        );
        self.assets.last_mut().unwrap()
    }

    /// Fills in the in-flight asset's core record fields from its header
    /// lump.
    pub fn init_asset(&mut self, head: &PageLump, cpu_ptr: PagePtr, version: u32, asset_type: u32) {
        let head_ptr = head.ptr();
        let head_size = head.size();
        let asset = self.current_asset_mut();
        asset.head_ptr = head_ptr;
        asset.head_size = head_size;
        asset.cpu_ptr = cpu_ptr;
        asset.version = version;
        asset.asset_type = asset_type;
    }

    /// Assigns a stream-data reference on the in-flight asset.
    pub fn set_asset_stream_entry(&mut self, set: PakStreamSet, entry: PakStreamSetEntry) {
        let asset = self.current_asset_mut();
        match set {
            PakStreamSet::Mandatory => asset.starpak = entry,
            PakStreamSet::Optional => asset.opt_starpak = entry,
        }
    }

    /// Completes the in-flight asset, recording the page high-water mark.
    pub fn finish_asset(&mut self) {
        let page_end = self.pages.page_count();
        let asset = self.current_asset_mut();
        asset.page_end = page_end;
        self.processing_asset = false;
    }

    /// Allocates a lump in the paged region. See
    /// [`PageBuilder::create_page_lump`].
    pub fn create_page_lump(
        &mut self,
        size: usize,
        flags: u32,
        alignment: u32,
        data: Option<Box<[u8]>>,
    ) -> anyhow::Result<PageLump> {
        self.pages.create_page_lump(size, flags, alignment, data)
    }

    /// Gets mutable access to a lump's bytes.
    pub fn lump_data_mut(&mut self, lump: &PageLump) -> &mut [u8] {
        self.pages.lump_data_mut(lump)
    }

    /// Writes a pointer to `to_offset` within `to` into the bytes of `from`
    /// at `from_offset`, and records the location in the page-pointer table
    /// so the runtime relocates it.
    pub fn add_pointer(
        &mut self,
        from: &PageLump,
        from_offset: usize,
        to: &PageLump,
        to_offset: usize,
    ) {
        let value = PagePtrDesc::from(to.ptr_at(to_offset));
        let bytes = self.pages.lump_data_mut(from);
        bytes[from_offset..from_offset + 8].copy_from_slice(value.as_bytes());
        self.page_ptrs.push(from.ptr_at(from_offset));
    }

    /// Records a pointer location whose value the caller has already written
    /// into the lump bytes.
    pub fn add_pointer_at(&mut self, from: &PageLump, from_offset: usize) {
        self.page_ptrs.push(from.ptr_at(from_offset));
    }

    /// Registers that the bytes at `offset` within `lump` hold `guid`, which
    /// the runtime must resolve to an asset pointer. A zero guid is a no-op,
    /// so call sites do not need their own null checks. Returns whether the
    /// reference was recorded.
    pub fn register_guid_ref_at_offset(
        &mut self,
        guid: Guid,
        offset: usize,
        lump: &PageLump,
    ) -> bool {
        if guid == 0 {
            return false;
        }

        let ptr = lump.ptr_at(offset);
        self.current_asset_mut().uses.push(PakGuidRef { ptr, guid });
        true
    }

    /// Interns a stream-file path in the mandatory or optional list and
    /// returns its index.
    pub fn add_streaming_file_reference(
        &mut self,
        path: &str,
        mandatory: bool,
    ) -> anyhow::Result<u32> {
        if !mandatory && self.settings.version() == PakVersion::V7 {
            bail!("Optional streaming data is not supported on pak version 7.");
        }

        let paths = if mandatory {
            &mut self.mandatory_stream_paths
        } else {
            &mut self.optional_stream_paths
        };

        if let Some(index) = paths.iter().position(|p| p == path) {
            return Ok(index as u32);
        }

        if paths.len() >= PAK_MAX_STREAM_FILES_PER_SET {
            bail!(
                "Pak cannot reference more than {PAK_MAX_STREAM_FILES_PER_SET} \
                 {} stream files.",
                if mandatory { "mandatory" } else { "optional" }
            );
        }

        paths.push(path.to_owned());
        Ok(paths.len() as u32 - 1)
    }

    /// Adds a streaming payload, deduplicating through the stream cache, and
    /// returns the packed reference for the asset record.
    pub fn add_streaming_data_entry(
        &mut self,
        data: &[u8],
        set: PakStreamSet,
    ) -> anyhow::Result<PakStreamSetEntry> {
        let result = self.stream.add_entry(data, set)?;
        let index =
            self.add_streaming_file_reference(&result.stream_file, set == PakStreamSet::Mandatory)?;
        Ok(PakStreamSetEntry::new(
            result.data_offset as i64,
            i64::from(index),
        ))
    }

    /// Dispatches one map-file entry to its asset adder.
    fn add_asset(&mut self, file: &Value) -> anyhow::Result<()> {
        let Some(type_str) = file.get("$type").and_then(Value::as_str) else {
            bail!("Every file entry requires a '$type' string field.");
        };
        let Some(path) = file.get("path").and_then(Value::as_str) else {
            bail!("File entry of type '{type_str}' requires a 'path' string field.");
        };

        let Some(handler) = self.handlers.iter().find(|h| h.four_cc == type_str) else {
            bail!("Invalid asset type '{type_str}' provided for asset '{path}'.");
        };

        let slot = match self.settings.version() {
            PakVersion::V7 => handler.v7,
            PakVersion::V8 => handler.v8,
        };

        match slot {
            AdderSlot::Unsupported => {
                tracing::warn!(
                    "Asset type '{type_str}' is not supported on pak version {}.",
                    self.settings.version().as_u16()
                );
                Ok(())
            }
            AdderSlot::External(parser) => bail!(
                "Asset type '{type_str}' requires the {parser} parser, which is not \
                 registered in this build."
            ),
            AdderSlot::Builtin(adder) => {
                let guid = default_asset_guid(type_str, file, path);
                if self.settings.show_debug_info() {
                    info!(asset = path, ty = type_str, guid, "adding asset");
                } else {
                    debug!(asset = path, ty = type_str, "adding asset");
                }
                adder(self, guid, path, file)
                    .with_context(|| format!("Failed to add {type_str} asset '{path}'"))
            }
        }
    }

    /// Computes every asset's internal dependency count and the inverse
    /// dependents lists. An asset's count is 1 (itself) plus the number of
    /// distinct local assets that use its guid.
    pub fn generate_internal_dependencies(&mut self) {
        let mut links: Vec<(usize, u32)> = Vec::new();

        for (dependent, asset) in self.assets.iter().enumerate() {
            let targets: BTreeSet<Guid> = asset.uses.iter().map(|r| r.guid).collect();
            for guid in targets {
                if let Some(target) = self.assets.iter().position(|a| a.guid == guid) {
                    links.push((target, dependent as u32));
                }
            }
        }

        for (target, dependent) in links {
            self.assets[target].internal_dep_count += 1;
            self.assets[target].dependents.push(dependent);
        }
    }

    /// Assigns every asset's slice of the global dependents table and builds
    /// the table.
    pub fn generate_asset_dependents(&mut self) {
        for index in 0..self.assets.len() {
            let start = self.dependents.len() as u32;
            let asset = &mut self.assets[index];
            asset.dependents_start = start;
            asset.dependents_count = asset.dependents.len() as u32;
            let slice = asset.dependents.clone();
            self.dependents.extend_from_slice(&slice);
        }
    }

    /// Sorts every asset's uses by pointer, assigns its slice of the global
    /// guid-reference table, and builds the table.
    pub fn generate_asset_uses(&mut self) {
        for index in 0..self.assets.len() {
            let start = self.guid_refs.len() as u32;
            let asset = &mut self.assets[index];
            asset.uses.sort_by_key(|r| r.ptr);
            asset.uses_start = start;
            asset.uses_count = asset.uses.len() as u32;
            let slice = asset.uses.clone();
            self.guid_refs.extend_from_slice(&slice);
        }
    }

    fn write_header<F: WriteAt>(&mut self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        self.header.slab_count = self.pages.slab_count();
        self.header.page_count = self.pages.page_count();
        self.header.pointer_count = self.page_ptrs.len() as u32;
        self.header.asset_count = self.assets.len() as u32;
        self.header.guid_ref_count = self.guid_refs.len() as u32;
        self.header.dependents_count = self.dependents.len() as u32;
        self.header.write(io)
    }

    fn write_path_list<F: WriteAt>(
        io: &mut BinaryIo<F>,
        paths: &[String],
    ) -> std::io::Result<u64> {
        let start = io.tell_put();
        for path in paths {
            io.write_cstr(path)?;
        }
        Ok(io.tell_put() - start)
    }

    /// Writes the stream-file path blocks and records their sizes in the
    /// header. The combined block is padded to 8 bytes; the padding attaches
    /// to the optional block when one exists, else to the mandatory block.
    fn write_stream_paths<F: WriteAt>(&mut self, io: &mut BinaryIo<F>) -> anyhow::Result<()> {
        let mut mandatory_len = Self::write_path_list(io, &self.mandatory_stream_paths)?;
        let mut optional_len = Self::write_path_list(io, &self.optional_stream_paths)?;

        let combined = mandatory_len + optional_len;
        let pad = crate::util::align_up(combined, 8) - combined;
        if pad > 0 {
            io.pad(pad)?;
            if optional_len != 0 {
                optional_len += pad;
            } else {
                mandatory_len += pad;
            }
        }

        if mandatory_len > u64::from(u16::MAX) || optional_len > u64::from(u16::MAX) {
            bail!("Stream-file path block exceeds the 64 KiB header field.");
        }

        self.header.starpak_paths_size = mandatory_len as u16;
        self.header.opt_starpak_paths_size = optional_len as u16;
        Ok(())
    }

    /// Writes the page-pointer descriptor table, sorted ascending.
    fn write_page_pointers<F: WriteAt>(&mut self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        // Pointers must be written in sorted order, otherwise the runtime
        // faults while resolving them.
        self.page_ptrs.sort();
        for ptr in &self.page_ptrs {
            io.write(&PagePtrDesc::from(*ptr))?;
        }
        Ok(())
    }

    /// Writes the asset records in map order.
    fn write_asset_records<F: WriteAt>(&self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        let v8 = self.settings.version() == PakVersion::V8;
        for asset in &self.assets {
            io.write(&asset.guid)?;
            io.write(&[0u8; 8])?;
            io.write(&asset.head_ptr.index)?;
            io.write(&asset.head_ptr.offset)?;
            io.write(&asset.cpu_ptr.index)?;
            io.write(&asset.cpu_ptr.offset)?;
            io.write(&asset.starpak.packed())?;
            if v8 {
                io.write(&asset.opt_starpak.packed())?;
            }
            io.write(&asset.page_end)?;
            io.write(&asset.internal_dep_count)?;
            io.write(&asset.dependents_start)?;
            io.write(&asset.uses_start)?;
            io.write(&asset.dependents_count)?;
            io.write(&asset.uses_count)?;
            io.write(&asset.head_size)?;
            io.write(&asset.version)?;
            io.write(&asset.asset_type)?;
        }
        Ok(())
    }

    /// Writes the guid-reference table. The per-asset slices were sorted by
    /// [`PakBuilder::generate_asset_uses`].
    fn write_guid_refs<F: WriteAt>(&self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        for guid_ref in &self.guid_refs {
            io.write(&PagePtrDesc::from(guid_ref.ptr))?;
        }
        Ok(())
    }

    fn write_dependents<F: WriteAt>(&self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        for &dependent in &self.dependents {
            io.write(&dependent)?;
        }
        Ok(())
    }

    /// Runs the full build: dispatches every map entry, derives the
    /// dependency tables, and writes the pak and its companion files.
    /// Returns the path of the written pak.
    pub fn build_from_map(mut self, map: &MapFile) -> anyhow::Result<PathBuf> {
        info!("build settings:");
        info!("version: {}", self.settings.version().as_u16());
        info!("fileName: {}{PAK_EXTENSION}", self.settings.pak_name());
        info!("assetsDir: {}", self.settings.asset_dir().display());
        info!("outputDir: {}", self.settings.output_dir().display());

        for file in &map.files {
            self.add_asset(file)?;
        }
        assert!(
            !self.processing_asset,
            "an adder returned without calling finish_asset"
        );

        self.generate_internal_dependencies();
        self.generate_asset_dependents();
        self.generate_asset_uses();

        std::fs::create_dir_all(self.settings.output_dir()).with_context(|| {
            format!(
                "Failed to create output directory \"{}\"",
                self.settings.output_dir().display()
            )
        })?;

        let pak_path = self
            .settings
            .output_dir()
            .join(format!("{}{PAK_EXTENSION}", self.settings.pak_name()));
        let mut io = BinaryIo::create(&pak_path)
            .with_context(|| format!("Failed to create pak file \"{}\"", pak_path.display()))?;

        // Placeholder header; rewritten once all sizes and counts are known.
        self.write_header(&mut io)?;

        self.write_stream_paths(&mut io)?;

        self.pages.pad_slabs_and_pages();

        self.pages.write_slab_headers(&mut io)?;
        self.pages.write_page_headers(&mut io)?;
        self.write_page_pointers(&mut io)?;
        self.write_asset_records(&mut io)?;
        self.write_guid_refs(&mut io)?;
        self.write_dependents(&mut io)?;

        self.pages.write_page_data(&mut io)?;

        let total_size = io.tell_put();
        self.header.compressed_size = total_size;
        self.header.decompressed_size = total_size;
        self.header.file_time = filetime_now();

        io.seek_put(SeekFrom::Start(0))?;
        self.write_header(&mut io)?;

        info!(size = total_size, path = %pak_path.display(), "written pak file");

        self.stream.shutdown(self.settings.output_dir())?;

        Ok(pak_path)
    }
}

/// Parses a map file and builds the pak it describes. Returns the path of
/// the written pak.
pub fn build_from_map_file(map_path: &Path) -> anyhow::Result<PathBuf> {
    let map = parse_map_file(map_path)?;
    let settings = BuildSettings::from_map(&map, map_path)?;

    let mut stream = StreamFileBuilder::new();
    stream.init(&map, &settings, settings.version() == PakVersion::V8)?;

    PakBuilder::new(settings, stream).build_from_map(&map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{SF_CPU, SF_HEAD};
    use crate::settings::BuildFlags;
    use crate::tests::MemFile;

    fn test_builder() -> PakBuilder {
        let settings = BuildSettings::new(
            PakVersion::V8,
            "test".to_owned(),
            PathBuf::from("."),
            PathBuf::from("."),
            PathBuf::from("./out"),
            BuildFlags::empty(),
            false,
        );
        PakBuilder::new(settings, StreamFileBuilder::new())
    }

    #[test]
    fn page_pointer_table_is_written_sorted() {
        let mut builder = test_builder();
        for (page, offset) in [(3, 0), (1, 8), (2, 4), (1, 0)] {
            builder.page_ptrs.push(PagePtr::new(page, offset));
        }

        let mut io = BinaryIo::with_file(MemFile::default(), 0);
        builder.write_page_pointers(&mut io).unwrap();

        let size = io.size();
        let mut io = BinaryIo::with_file(io.into_inner(), size);
        let mut written = Vec::new();
        for _ in 0..4 {
            let desc: PagePtrDesc = io.read().unwrap();
            written.push((desc.index.get(), desc.offset.get()));
        }
        assert_eq!(written, vec![(1, 0), (1, 8), (2, 4), (3, 0)]);
    }

    #[test]
    fn duplicate_guid_is_fatal() {
        let mut builder = test_builder();
        builder.begin_asset(0x1234, "assets/a").unwrap();
        builder.finish_asset();

        let err = builder.begin_asset(0x1234, "assets/b").unwrap_err();
        assert!(err.to_string().contains("non-unique GUID"));
    }

    #[test]
    fn internal_dependency_counts_follow_uses() {
        let mut builder = test_builder();

        // Asset 0: a plain target.
        builder.begin_asset(0xaaaa, "target").unwrap();
        builder.finish_asset();

        // Asset 1 uses asset 0 twice; distinct assets count once.
        builder.begin_asset(0xbbbb, "user_one").unwrap();
        let lump = builder.create_page_lump(32, SF_HEAD, 8, None).unwrap();
        assert!(builder.register_guid_ref_at_offset(0xaaaa, 0, &lump));
        assert!(builder.register_guid_ref_at_offset(0xaaaa, 8, &lump));
        // A guid that is not in this pak contributes nothing.
        assert!(builder.register_guid_ref_at_offset(0xcccc, 16, &lump));
        // A zero guid is ignored outright.
        assert!(!builder.register_guid_ref_at_offset(0, 24, &lump));
        builder.finish_asset();

        // Asset 2 also uses asset 0.
        builder.begin_asset(0xdddd, "user_two").unwrap();
        let lump = builder.create_page_lump(16, SF_HEAD, 8, None).unwrap();
        builder.register_guid_ref_at_offset(0xaaaa, 0, &lump);
        builder.finish_asset();

        builder.generate_internal_dependencies();
        builder.generate_asset_dependents();
        builder.generate_asset_uses();

        let target = &builder.assets[0];
        assert_eq!(target.internal_dep_count, 3, "itself plus two distinct users");
        assert_eq!(target.dependents_count, 2);
        let deps = &builder.dependents
            [target.dependents_start as usize..(target.dependents_start + 2) as usize];
        assert_eq!(deps, &[1, 2]);

        let user_one = &builder.assets[1];
        assert_eq!(user_one.internal_dep_count, 1);
        assert_eq!(user_one.uses_count, 3);
        assert_eq!(user_one.uses_start, 0);

        let user_two = &builder.assets[2];
        assert_eq!(user_two.uses_start, 3);
        assert_eq!(user_two.uses_count, 1);

        assert_eq!(builder.guid_refs.len(), 4);
    }

    #[test]
    fn asset_uses_are_sorted_by_pointer() {
        let mut builder = test_builder();

        builder.begin_asset(0x1, "asset").unwrap();
        let a = builder.create_page_lump(64, SF_HEAD, 8, None).unwrap();
        let b = builder.create_page_lump(64, SF_CPU, 8, None).unwrap();
        // Register out of order, across two pages.
        builder.register_guid_ref_at_offset(0x2, 8, &b);
        builder.register_guid_ref_at_offset(0x3, 16, &a);
        builder.register_guid_ref_at_offset(0x4, 0, &a);
        builder.finish_asset();

        builder.generate_internal_dependencies();
        builder.generate_asset_dependents();
        builder.generate_asset_uses();

        let ptrs: Vec<(i32, i32)> = builder
            .guid_refs
            .iter()
            .map(|r| (r.ptr.index, r.ptr.offset))
            .collect();
        assert_eq!(ptrs, vec![(0, 0), (0, 16), (1, 8)]);
    }

    #[test]
    fn add_pointer_writes_target_value_into_lump() {
        let mut builder = test_builder();
        builder.begin_asset(0x77, "asset").unwrap();
        let from = builder.create_page_lump(24, SF_HEAD, 8, None).unwrap();
        let to = builder.create_page_lump(40, SF_CPU, 8, None).unwrap();

        builder.add_pointer(&from, 8, &to, 4);

        let bytes = builder.lump_data_mut(&from);
        let index = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let offset = i32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(index, to.ptr().index);
        assert_eq!(offset, to.ptr().offset + 4);

        assert_eq!(builder.page_ptrs.len(), 1);
        assert_eq!(builder.page_ptrs[0], from.ptr_at(8));
        builder.finish_asset();
    }

    #[test]
    fn optional_streaming_rejected_on_v7() {
        let settings = BuildSettings::new(
            PakVersion::V7,
            "test".to_owned(),
            PathBuf::from("."),
            PathBuf::from("."),
            PathBuf::from("./out"),
            BuildFlags::empty(),
            false,
        );
        let mut builder = PakBuilder::new(settings, StreamFileBuilder::new());
        assert!(builder
            .add_streaming_file_reference("paks/a.starpak", true)
            .is_ok());
        assert!(builder
            .add_streaming_file_reference("paks/a.opt.starpak", false)
            .is_err());
    }

    #[test]
    fn stream_file_references_are_interned() {
        let mut builder = test_builder();
        let a = builder.add_streaming_file_reference("paks/a.starpak", true).unwrap();
        let b = builder.add_streaming_file_reference("paks/b.starpak", true).unwrap();
        let a2 = builder.add_streaming_file_reference("paks/a.starpak", true).unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);

        let opt = builder.add_streaming_file_reference("paks/a.starpak", false).unwrap();
        assert_eq!(opt, 0, "optional list is independent of the mandatory list");
    }
}
