//! On-disk structures and constants of the pak container format and its
//! companion files.
//!
//! The pak header and asset records exist in two revisions, 7 and 8. They are
//! written field-by-field, gated on [`PakVersion`], because the two layouts
//! interleave their differences; the fixed-size tables (slab headers, page
//! headers, descriptors) are plain structs.

use anyhow::bail;
use binio::BinaryIo;
use static_assertions::const_assert_eq;
use std::mem::size_of;
use sync_file::WriteAt;
use zerocopy::byteorder::{I32, LE, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Identifies a pak file. Reads as `RPak` in a hex dump.
pub const PAK_MAGIC: u32 = u32::from_le_bytes(*b"RPak");

/// File extension of the produced pak.
pub const PAK_EXTENSION: &str = ".rpak";

/// Identifies a stream file. Reads as `SRPk` in a hex dump.
pub const STARPAK_MAGIC: u32 = u32::from_le_bytes(*b"SRPk");

/// Stream file format version.
pub const STARPAK_VERSION: u32 = 1;

/// Every stream-file payload (and the stream-file header itself) is padded to
/// this boundary.
pub const STARPAK_BLOCK_ALIGNMENT: u64 = 4096;

/// Filler byte for the stream-file header padding.
pub const STARPAK_PAD_BYTE: u8 = 0xCB;

/// Identifies a stream-cache file. Reads as `STCM` in a hex dump.
pub const STREAM_CACHE_MAGIC: u32 = u32::from_le_bytes(*b"STCM");

/// Stream-cache format version, rejected on any mismatch.
pub const STREAM_CACHE_MAJOR_VERSION: u16 = 1;
/// See [`STREAM_CACHE_MAJOR_VERSION`].
pub const STREAM_CACHE_MINOR_VERSION: u16 = 0;

/// File extension of the persistent stream cache.
pub const STREAM_CACHE_EXTENSION: &str = ".starmap";

/// Hard cap on the number of slabs in one pak.
pub const PAK_MAX_SLAB_COUNT: usize = 20;

/// A lump may only be merged into an existing page when the page's padded
/// size stays at or below this many bytes.
pub const PAK_MAX_PAGE_MERGE_SIZE: u32 = 0xffff;

/// Stream-file indices are packed into 12 bits, both in asset records and in
/// the stream cache.
pub const PAK_MAX_STREAM_FILES_PER_SET: usize = 4096;

/// Lump flag: asset header data.
pub const SF_HEAD: u32 = 0;
/// Lump flag: bulk CPU data.
pub const SF_CPU: u32 = 1 << 0;
/// Lump flag: temporary data, discarded after load.
pub const SF_TEMP: u32 = 1 << 1;
/// Lump flag: server-only data.
pub const SF_SERVER: u32 = 1 << 5;
/// Lump flag: client-only data.
pub const SF_CLIENT: u32 = 1 << 6;
/// Lump flag: dev-only data.
pub const SF_DEV: u32 = 1 << 7;

/// Builds the FourCC for an asset type tag as it appears on disk.
pub const fn fourcc(tag: [u8; 4]) -> u32 {
    u32::from_le_bytes(tag)
}

/// Texture asset.
pub const TYPE_TXTR: u32 = fourcc(*b"txtr");
/// Texture animation asset.
pub const TYPE_TXAN: u32 = fourcc(*b"txan");
/// Model asset.
pub const TYPE_RMDL: u32 = fourcc(*b"mdl_");
/// UI image atlas asset.
pub const TYPE_UIMG: u32 = fourcc(*b"uimg");
/// Patch asset.
pub const TYPE_PTCH: u32 = fourcc(*b"Ptch");
/// Data table asset.
pub const TYPE_DTBL: u32 = fourcc(*b"dtbl");
/// Material asset.
pub const TYPE_MATL: u32 = fourcc(*b"matl");
/// Animation sequence asset.
pub const TYPE_ASEQ: u32 = fourcc(*b"aseq");
/// Animation rig asset.
pub const TYPE_ARIG: u32 = fourcc(*b"arig");
/// Shader set asset.
pub const TYPE_SHDS: u32 = fourcc(*b"shds");
/// Shader asset.
pub const TYPE_SHDR: u32 = fourcc(*b"shdr");

/// Renders a FourCC as printable text for diagnostics, e.g. `txtr`.
pub fn fourcc_to_string(value: u32) -> String {
    value
        .to_le_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

/// The pak file revisions this builder can produce.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PakVersion {
    /// Revision 7 (Titanfall 2).
    V7,
    /// Revision 8 (Apex).
    V8,
}

impl PakVersion {
    /// Maps the map-file `version` field to a [`PakVersion`].
    pub fn from_u16(value: u16) -> anyhow::Result<Self> {
        match value {
            7 => Ok(Self::V7),
            8 => Ok(Self::V8),
            other => bail!("Unsupported pak file version {other}. Valid versions are 7 and 8."),
        }
    }

    /// The numeric value written into the header.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::V7 => 7,
            Self::V8 => 8,
        }
    }

    /// The size of this revision's header, in bytes.
    pub fn header_size(self) -> u64 {
        match self {
            Self::V7 => 0x58,
            Self::V8 => 0x80,
        }
    }
}

/// A relocatable reference into the pak's paged region: a page index plus a
/// byte offset within that page. The loading runtime rewrites these to real
/// addresses.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PagePtr {
    /// Page index, `-1` for the null pointer.
    pub index: i32,
    /// Byte offset within the page.
    pub offset: i32,
}

impl PagePtr {
    /// The null page pointer.
    pub const NULL: PagePtr = PagePtr {
        index: -1,
        offset: 0,
    };

    /// Creates a pointer to `offset` within page `index`.
    pub fn new(index: i32, offset: i32) -> Self {
        Self { index, offset }
    }

    /// Whether this is the null pointer.
    pub fn is_null(&self) -> bool {
        self.index < 0
    }

    /// Returns this pointer advanced by `delta` bytes within the same page.
    pub fn shifted(&self, delta: u32) -> Self {
        Self {
            index: self.index,
            offset: self.offset + delta as i32,
        }
    }

    /// The packed `(index, offset)` value that defines descriptor ordering.
    fn packed(&self) -> u64 {
        ((self.index as u32 as u64) << 32) | self.offset as u32 as u64
    }
}

impl Ord for PagePtr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.packed().cmp(&other.packed())
    }
}

impl PartialOrd for PagePtr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// On-disk form of a [`PagePtr`], as stored both inside page data and in the
/// descriptor tables.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct PagePtrDesc {
    /// Page index.
    pub index: I32<LE>,
    /// Byte offset within the page.
    pub offset: I32<LE>,
}
const_assert_eq!(size_of::<PagePtrDesc>(), 8);

impl From<PagePtr> for PagePtrDesc {
    fn from(ptr: PagePtr) -> Self {
        Self {
            index: I32::new(ptr.index),
            offset: I32::new(ptr.offset),
        }
    }
}

/// On-disk slab header.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct PakSlabHdr {
    /// Lump flags shared by every page in the slab.
    pub flags: U32<LE>,
    /// The highest alignment of any page in the slab.
    pub alignment: U32<LE>,
    /// Total padded size of the slab's pages.
    pub data_size: U64<LE>,
}
const_assert_eq!(size_of::<PakSlabHdr>(), 16);

/// On-disk page header.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct PakPageHdr {
    /// Index of the slab this page belongs to.
    pub slab_index: U32<LE>,
    /// The highest alignment of any lump in the page.
    pub alignment: U32<LE>,
    /// Padded size of the page's data.
    pub data_size: U32<LE>,
}
const_assert_eq!(size_of::<PakPageHdr>(), 12);

/// Header at the start of every stream file.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct StreamFileHdr {
    /// [`STARPAK_MAGIC`].
    pub magic: U32<LE>,
    /// [`STARPAK_VERSION`].
    pub version: U32<LE>,
}
const_assert_eq!(size_of::<StreamFileHdr>(), 8);

/// One record of the sort table at the end of a stream file.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone, Debug)]
#[repr(C)]
pub struct StreamEntryDesc {
    /// File offset of the payload.
    pub offset: U64<LE>,
    /// Padded size of the payload.
    pub size: U64<LE>,
}
const_assert_eq!(size_of::<StreamEntryDesc>(), 16);

/// Header of a stream-cache (`.starmap`) file.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct StreamCacheHdr {
    /// [`STREAM_CACHE_MAGIC`].
    pub magic: U32<LE>,
    /// [`STREAM_CACHE_MAJOR_VERSION`].
    pub major: U16<LE>,
    /// [`STREAM_CACHE_MINOR_VERSION`].
    pub minor: U16<LE>,
    /// Number of stream-file records following the header.
    pub num_stream_files: U32<LE>,
    /// Number of data entries.
    pub num_entries: U32<LE>,
    /// File offset of the data entries, 16-byte aligned.
    pub entries_offset: U32<LE>,
    /// Reserved.
    pub reserved: [u8; 12],
}
const_assert_eq!(size_of::<StreamCacheHdr>(), 32);

/// One data entry of a stream-cache file.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct StreamCacheEntryDesc {
    /// MurmurHash3-x64-128 of the payload, little-endian.
    pub hash: [u8; 16],
    /// Payload offset within its stream file.
    pub data_offset: U64<LE>,
    /// Payload size in bytes.
    pub data_size: U64<LE>,
    /// Index into the cache's stream-file records.
    pub path_index: U32<LE>,
}
const_assert_eq!(size_of::<StreamCacheEntryDesc>(), 36);

/// Which stream file a payload belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PakStreamSet {
    /// The mandatory stream file; always loaded with the pak.
    Mandatory,
    /// The optional stream file; loaded on demand (texture quality, etc.).
    Optional,
}

impl PakStreamSet {
    /// The set's name for log and error text.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mandatory => "mandatory",
            Self::Optional => "optional",
        }
    }
}

/// A packed stream-data reference as stored in an asset record: the payload
/// offset (always 4096-aligned, so its low 12 bits are free) with the
/// stream-file index packed into those low 12 bits. `-1` means unassigned.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PakStreamSetEntry(i64);

impl PakStreamSetEntry {
    /// No stream data assigned.
    pub const UNASSIGNED: Self = Self(-1);

    /// Packs an offset and a stream-file index.
    pub fn new(offset: i64, file_index: i64) -> Self {
        Self((offset & !0xfff) | (file_index & 0xfff))
    }

    /// The raw packed value written to disk.
    pub fn packed(self) -> i64 {
        self.0
    }

    /// The payload offset.
    pub fn offset(self) -> i64 {
        self.0 & !0xfff
    }

    /// The stream-file index.
    pub fn file_index(self) -> i64 {
        self.0 & 0xfff
    }
}

impl Default for PakStreamSetEntry {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

/// The pak file header, in memory. Holds the superset of both revisions'
/// fields; [`PakHdr::write`] emits the layout matching [`PakHdr::version`].
#[derive(Debug)]
pub struct PakHdr {
    /// Which revision to write.
    pub version: PakVersion,
    /// Header flags. The compression bits stay clear; this builder does not
    /// compress.
    pub flags: u16,
    /// Windows FILETIME of the build.
    pub file_time: u64,
    /// Size of the pak on disk.
    pub compressed_size: u64,
    /// Size of the pak after decompression. Equal to `compressed_size` here.
    pub decompressed_size: u64,
    /// Byte length of the mandatory stream-file path block.
    pub starpak_paths_size: u16,
    /// Byte length of the optional stream-file path block (revision 8 only).
    pub opt_starpak_paths_size: u16,
    /// Number of slab headers.
    pub slab_count: u16,
    /// Number of page headers.
    pub page_count: u16,
    /// Reserved, written as zero.
    pub patch_index: u16,
    /// Number of page-pointer descriptors.
    pub pointer_count: u32,
    /// Number of asset records.
    pub asset_count: u32,
    /// Number of guid-reference descriptors.
    pub guid_ref_count: u32,
    /// Number of entries in the dependents table.
    pub dependents_count: u32,
}

impl PakHdr {
    /// Creates a zeroed header for the given revision.
    pub fn new(version: PakVersion) -> Self {
        Self {
            version,
            flags: 0,
            file_time: 0,
            compressed_size: 0,
            decompressed_size: 0,
            starpak_paths_size: 0,
            opt_starpak_paths_size: 0,
            slab_count: 0,
            page_count: 0,
            patch_index: 0,
            pointer_count: 0,
            asset_count: 0,
            guid_ref_count: 0,
            dependents_count: 0,
        }
    }

    /// Writes the header at the current put position. The byte count written
    /// is exactly [`PakVersion::header_size`], so a placeholder write followed
    /// by a final write over it produces identical layout.
    pub fn write<F: WriteAt>(&self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        let v8 = self.version == PakVersion::V8;

        io.write(&PAK_MAGIC)?;
        io.write(&self.version.as_u16())?;
        io.write(&self.flags)?;
        io.write(&self.file_time)?;
        io.write(&[0u8; 8])?;
        io.write(&self.compressed_size)?;

        if v8 {
            // Embedded starpak offset; reserved, never produced by this tool.
            io.write(&0u64)?;
        }

        io.write(&[0u8; 8])?;
        io.write(&self.decompressed_size)?;

        if v8 {
            // Embedded starpak size; reserved.
            io.write(&0u64)?;
        }

        io.write(&[0u8; 8])?;
        io.write(&self.starpak_paths_size)?;

        if v8 {
            io.write(&self.opt_starpak_paths_size)?;
        }

        io.write(&self.slab_count)?;
        io.write(&self.page_count)?;
        io.write(&self.patch_index)?;

        if v8 {
            // Header alignment field; observed as zero in every known pak.
            io.write(&0u16)?;
        }

        io.write(&self.pointer_count)?;
        io.write(&self.asset_count)?;
        io.write(&self.guid_ref_count)?;
        io.write(&self.dependents_count)?;

        if v8 {
            io.write(&[0u8; 0x1c])?;
        } else {
            // Legacy external-assets counters; meaning undocumented, always
            // written as zero.
            io.write(&0u32)?;
            io.write(&0u32)?;
        }

        Ok(())
    }
}
