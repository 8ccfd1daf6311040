//! Persistent content-addressed index of stream-file payloads.
//!
//! The cache maps a MurmurHash3-x64-128 content key to the stream file,
//! offset, and size where that payload was previously written, letting
//! repeated payloads across build runs resolve to existing stream data
//! instead of being written again. It round-trips through a `.starmap` file
//! between runs, and can also be rebuilt by scanning a directory of existing
//! stream files.
//!
//! Entries in the mandatory space never deduplicate against entries in the
//! optional space, and vice versa.

use crate::format::{
    StreamCacheEntryDesc, StreamCacheHdr, StreamEntryDesc, StreamFileHdr,
    PAK_MAX_STREAM_FILES_PER_SET, STARPAK_BLOCK_ALIGNMENT, STARPAK_MAGIC, STREAM_CACHE_MAGIC,
    STREAM_CACHE_MAJOR_VERSION, STREAM_CACHE_MINOR_VERSION,
};
use crate::murmur::murmur3_x64_128;
use crate::util::{align_up, fix_slashes};
use anyhow::{bail, Context};
use binio::BinaryIo;
use std::mem::size_of;
use std::path::Path;
use sync_file::{ReadAt, WriteAt};
use tracing::{info, warn};
use zerocopy::byteorder::{U16, U32, U64};

/// Seed of the payload content hash.
pub const STREAM_HASH_SEED: u32 = 0x165D_CA75;

/// Stream-file paths recorded by the cache builder are relative to the game
/// root.
const GAME_STREAM_FILE_DIR: &str = "paks/Win64/";

/// One stream file known to the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCacheFileEntry {
    /// Whether the file holds optional-space payloads.
    pub is_optional: bool,
    /// Path of the stream file, with forward slashes.
    pub path: String,
}

/// One payload known to the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCacheEntry {
    /// Content hash of the payload.
    pub hash: u128,
    /// Offset of the payload within its stream file.
    pub data_offset: u64,
    /// Size of the payload in bytes.
    pub data_size: u64,
    /// Index into the cache's stream-file list.
    pub path_index: u32,
}

/// A prepared lookup key: the content hash plus the stream file a miss would
/// be written to.
pub struct StreamQuery {
    hash: u128,
    size: u64,
    stream_file: String,
}

/// A successful cache lookup.
pub struct StreamCacheHit<'a> {
    /// The stream file already holding the payload.
    pub file: &'a StreamCacheFileEntry,
    /// The payload's offset within that file.
    pub data_offset: u64,
    /// The cache index of that file.
    pub path_index: u32,
}

/// The content-addressed payload index.
#[derive(Default)]
pub struct StreamCache {
    files: Vec<StreamCacheFileEntry>,
    entries: Vec<StreamCacheEntry>,
}

impl StreamCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payload entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of stream files known to the cache.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Hashes a payload into a lookup key. `stream_file` names the file a
    /// cache miss would be written to; [`StreamCache::add`] interns it.
    pub fn create_query(&self, data: &[u8], stream_file: &str) -> StreamQuery {
        StreamQuery {
            hash: murmur3_x64_128(data, STREAM_HASH_SEED),
            size: data.len() as u64,
            stream_file: stream_file.to_owned(),
        }
    }

    /// Looks a payload up in the given dedup space. The scan compares sizes
    /// and spaces first and only then the 128-bit hashes.
    pub fn find(&self, query: &StreamQuery, is_optional: bool) -> Option<StreamCacheHit<'_>> {
        for entry in &self.entries {
            if entry.data_size != query.size {
                continue;
            }

            let file = &self.files[entry.path_index as usize];
            if file.is_optional != is_optional {
                continue;
            }

            if entry.hash != query.hash {
                continue;
            }

            return Some(StreamCacheHit {
                file,
                data_offset: entry.data_offset,
                path_index: entry.path_index,
            });
        }

        None
    }

    /// Records a payload written at `offset` into the query's stream file,
    /// interning the file path if it is new. Returns the file's cache index.
    pub fn add(
        &mut self,
        query: &StreamQuery,
        offset: u64,
        is_optional: bool,
    ) -> anyhow::Result<u32> {
        let path_index = match self
            .files
            .iter()
            .position(|file| file.path == query.stream_file)
        {
            Some(existing) => existing as u32,
            None => self.intern_stream_file(&query.stream_file, is_optional)?,
        };

        self.entries.push(StreamCacheEntry {
            hash: query.hash,
            data_offset: offset,
            data_size: query.size,
            path_index,
        });
        Ok(path_index)
    }

    /// Appends a stream-file record. The index is stored in 12 bits, so the
    /// cache cannot reference more than 4096 files.
    fn intern_stream_file(&mut self, path: &str, is_optional: bool) -> anyhow::Result<u32> {
        if self.files.len() >= PAK_MAX_STREAM_FILES_PER_SET {
            bail!(
                "Stream cache cannot reference more than {PAK_MAX_STREAM_FILES_PER_SET} \
                 stream files."
            );
        }

        self.files.push(StreamCacheFileEntry {
            is_optional,
            path: path.to_owned(),
        });
        Ok(self.files.len() as u32 - 1)
    }

    /// Loads a cache from a `.starmap` file.
    pub fn parse_map(path: &Path) -> anyhow::Result<Self> {
        let mut io = BinaryIo::open(path)
            .with_context(|| format!("Failed to open streaming map file \"{}\"", path.display()))?;
        Self::parse_from(&mut io)
            .with_context(|| format!("Streaming map file \"{}\" is invalid", path.display()))
    }

    /// Loads a cache from an already-open stream.
    pub fn parse_from<F: ReadAt>(io: &mut BinaryIo<F>) -> anyhow::Result<Self> {
        let file_size = io.size();
        if file_size < size_of::<StreamCacheHdr>() as u64 {
            bail!(
                "file appears truncated ({file_size} < {} header bytes)",
                size_of::<StreamCacheHdr>()
            );
        }

        let header: StreamCacheHdr = io.read()?;

        if header.magic.get() != STREAM_CACHE_MAGIC {
            bail!(
                "bad magic (expected {STREAM_CACHE_MAGIC:#x}, got {:#x})",
                header.magic.get()
            );
        }

        if header.major.get() != STREAM_CACHE_MAJOR_VERSION
            || header.minor.get() != STREAM_CACHE_MINOR_VERSION
        {
            bail!(
                "unsupported version (expected {STREAM_CACHE_MAJOR_VERSION}.\
                 {STREAM_CACHE_MINOR_VERSION}, got {}.{})",
                header.major.get(),
                header.minor.get()
            );
        }

        let num_entries = header.num_entries.get() as u64;
        let entries_offset = u64::from(header.entries_offset.get());
        let entries_size = num_entries * size_of::<StreamCacheEntryDesc>() as u64;
        if entries_offset + entries_size > file_size {
            bail!(
                "data entry block is out of bounds \
                 (offset {entries_offset} + size {entries_size} > file size {file_size})"
            );
        }

        let mut files = Vec::with_capacity(header.num_stream_files.get() as usize);
        for _ in 0..header.num_stream_files.get() {
            let is_optional: u8 = io.read()?;
            let path = io.read_cstr()?;
            files.push(StreamCacheFileEntry {
                is_optional: is_optional != 0,
                path,
            });
        }

        io.seek_get(std::io::SeekFrom::Start(entries_offset))?;
        let mut entries = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            let desc: StreamCacheEntryDesc = io.read()?;
            let entry = StreamCacheEntry {
                hash: u128::from_le_bytes(desc.hash),
                data_offset: desc.data_offset.get(),
                data_size: desc.data_size.get(),
                path_index: desc.path_index.get(),
            };
            if entry.path_index as usize >= files.len() {
                bail!(
                    "data entry references stream file {} but only {} are recorded",
                    entry.path_index,
                    files.len()
                );
            }
            entries.push(entry);
        }

        Ok(Self { files, entries })
    }

    /// Serializes the cache.
    pub fn save<F: WriteAt>(&self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        let paths_size: u64 = self
            .files
            .iter()
            .map(|file| file.path.len() as u64 + 2) // optional flag + terminator
            .sum();
        let entries_offset = align_up(size_of::<StreamCacheHdr>() as u64 + paths_size, 16);

        io.write(&StreamCacheHdr {
            magic: U32::new(STREAM_CACHE_MAGIC),
            major: U16::new(STREAM_CACHE_MAJOR_VERSION),
            minor: U16::new(STREAM_CACHE_MINOR_VERSION),
            num_stream_files: U32::new(self.files.len() as u32),
            num_entries: U32::new(self.entries.len() as u32),
            entries_offset: U32::new(entries_offset as u32),
            reserved: [0; 12],
        })?;

        for file in &self.files {
            io.write(&(file.is_optional as u8))?;
            io.write_cstr(&file.path)?;
        }

        let pad = entries_offset - io.tell_put();
        if pad > 0 {
            io.pad(pad)?;
        }

        for entry in &self.entries {
            io.write(&StreamCacheEntryDesc {
                hash: entry.hash.to_le_bytes(),
                data_offset: U64::new(entry.data_offset),
                data_size: U64::new(entry.data_size),
                path_index: U32::new(entry.path_index),
            })?;
        }

        Ok(())
    }

    /// Builds a cache by scanning `dir` for `.starpak` / `.opt.starpak`
    /// files, hashing every payload they contain, and writing the result to
    /// `output_path`.
    pub fn build_from_game_paks(dir: &Path, output_path: &Path) -> anyhow::Result<Self> {
        // Open the output first so a bad path fails before the scan runs.
        let mut out = BinaryIo::create(output_path).with_context(|| {
            format!(
                "Failed to create streaming map file \"{}\"",
                output_path.display()
            )
        })?;

        let mut stream_files: Vec<(bool, std::path::PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to scan directory \"{}\"", dir.display()))?
        {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".opt.starpak") {
                stream_files.push((true, path));
            } else if name.ends_with(".starpak") {
                stream_files.push((false, path));
            }
        }
        // Directory iteration order is platform-dependent; a stable order
        // keeps rebuilt caches comparable.
        stream_files.sort();

        info!(
            count = stream_files.len(),
            dir = %dir.display(),
            "found streaming files to cache"
        );

        let mut cache = Self::new();

        for (is_optional, path) in &stream_files {
            cache.scan_stream_file(path, *is_optional)?;
        }

        cache.save(&mut out)?;
        info!(
            entries = cache.entries.len(),
            map = %output_path.display(),
            "saved streaming map file"
        );
        Ok(cache)
    }

    /// Hashes every payload of one stream file into the cache.
    fn scan_stream_file(&mut self, path: &Path, is_optional: bool) -> anyhow::Result<()> {
        let mut io = BinaryIo::open(path).with_context(|| {
            format!("Failed to open streaming file \"{}\" for reading", path.display())
        })?;

        let header: StreamFileHdr = io.read()?;
        if header.magic.get() != STARPAK_MAGIC {
            bail!(
                "Streaming file \"{}\" has an invalid file magic; expected {STARPAK_MAGIC:#x}, \
                 got {:#x}.",
                path.display(),
                header.magic.get()
            );
        }

        let file_size = io.size();
        io.seek_get(std::io::SeekFrom::End(-8))?;
        let entry_count: u64 = io.read()?;

        let Some(table_size) = entry_count.checked_mul(size_of::<StreamEntryDesc>() as u64) else {
            bail!(
                "Streaming file \"{}\" reports an impossible entry count ({entry_count}).",
                path.display()
            );
        };
        if 8 + table_size + STARPAK_BLOCK_ALIGNMENT > file_size {
            bail!(
                "Streaming file \"{}\" is too small for its own sort table; it appears corrupt.",
                path.display()
            );
        }

        io.seek_get(std::io::SeekFrom::End(-(8 + table_size as i64)))?;
        let mut descs = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            descs.push(io.read::<StreamEntryDesc>()?);
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let relative_path = fix_slashes(&format!("{GAME_STREAM_FILE_DIR}{file_name}"));
        let path_index = self.intern_stream_file(&relative_path, is_optional)?;

        for (index, desc) in descs.iter().enumerate() {
            let size = desc.size.get();
            let offset = desc.offset.get();

            if size == 0 {
                bail!(
                    "Stream entry #{index} has a size of 0; streaming file appears corrupt."
                );
            }
            if offset < STARPAK_BLOCK_ALIGNMENT {
                bail!(
                    "Stream entry #{index} has an offset lower than {STARPAK_BLOCK_ALIGNMENT}; \
                     streaming file appears corrupt."
                );
            }
            if size > i32::MAX as u64 {
                warn!(index, size, "skipping oversized stream entry");
                continue;
            }

            let mut payload = vec![0u8; size as usize];
            io.seek_get(std::io::SeekFrom::Start(offset))?;
            io.read_into(&mut payload)?;

            self.entries.push(StreamCacheEntry {
                hash: murmur3_x64_128(&payload, STREAM_HASH_SEED),
                data_offset: offset,
                data_size: size,
                path_index,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MemFile;

    fn sample_cache() -> StreamCache {
        let mut cache = StreamCache::new();
        let q1 = cache.create_query(b"first payload", "paks/Win64/a.starpak");
        cache.add(&q1, 4096, false).unwrap();
        let q2 = cache.create_query(b"second payload", "paks/Win64/a.starpak");
        cache.add(&q2, 8192, false).unwrap();
        let q3 = cache.create_query(b"optional payload", "paks/Win64/a.opt.starpak");
        cache.add(&q3, 4096, true).unwrap();
        cache
    }

    #[test]
    fn find_hits_matching_space_only() {
        let cache = sample_cache();

        let q = cache.create_query(b"first payload", "whatever.starpak");
        let hit = cache.find(&q, false).expect("mandatory entry should hit");
        assert_eq!(hit.data_offset, 4096);
        assert_eq!(hit.file.path, "paks/Win64/a.starpak");

        assert!(
            cache.find(&q, true).is_none(),
            "mandatory data must not dedup into the optional space"
        );

        let q = cache.create_query(b"optional payload", "whatever.starpak");
        assert!(cache.find(&q, false).is_none());
        assert!(cache.find(&q, true).is_some());
    }

    #[test]
    fn same_size_different_content_misses() {
        let cache = sample_cache();
        let q = cache.create_query(b"FIRST PAYLOAD", "x.starpak");
        assert!(cache.find(&q, false).is_none());
    }

    #[test]
    fn add_reuses_existing_file_entry() {
        let mut cache = sample_cache();
        assert_eq!(cache.file_count(), 2);

        let q = cache.create_query(b"third payload", "paks/Win64/a.starpak");
        cache.add(&q, 12288, false).unwrap();
        assert_eq!(cache.file_count(), 2, "existing path must be reused");

        let q = cache.create_query(b"fourth payload", "paks/Win64/b.starpak");
        cache.add(&q, 4096, false).unwrap();
        assert_eq!(cache.file_count(), 3);
    }

    #[test]
    fn save_and_parse_round_trip() {
        let cache = sample_cache();

        let mut io = BinaryIo::with_file(MemFile::default(), 0);
        cache.save(&mut io).unwrap();

        let size = io.size();
        let mut io = BinaryIo::with_file(io.into_inner(), size);
        let reloaded = StreamCache::parse_from(&mut io).unwrap();

        assert_eq!(reloaded.files, cache.files);
        assert_eq!(reloaded.entries, cache.entries);
    }

    #[test]
    fn entries_offset_is_16_byte_aligned() {
        let cache = sample_cache();
        let mut io = BinaryIo::with_file(MemFile::default(), 0);
        cache.save(&mut io).unwrap();

        let size = io.size();
        let mut io = BinaryIo::with_file(io.into_inner(), size);
        let header: StreamCacheHdr = io.read().unwrap();
        assert_eq!(header.entries_offset.get() % 16, 0);
        assert_eq!(header.num_stream_files.get(), 2);
        assert_eq!(header.num_entries.get(), 3);
    }

    #[test]
    fn parse_rejects_bad_magic_and_version() {
        let cache = sample_cache();
        let mut io = BinaryIo::with_file(MemFile::default(), 0);
        cache.save(&mut io).unwrap();

        // Corrupt the magic.
        io.seek_put(std::io::SeekFrom::Start(0)).unwrap();
        io.write(&0xdead_beefu32).unwrap();
        let size = io.size();
        let mut io = BinaryIo::with_file(io.into_inner(), size);
        assert!(StreamCache::parse_from(&mut io).is_err());

        // Fresh copy with a bumped major version.
        let mut io = BinaryIo::with_file(MemFile::default(), 0);
        cache.save(&mut io).unwrap();
        io.seek_put(std::io::SeekFrom::Start(4)).unwrap();
        io.write(&99u16).unwrap();
        let size = io.size();
        let mut io = BinaryIo::with_file(io.into_inner(), size);
        assert!(StreamCache::parse_from(&mut io).is_err());
    }

    #[test]
    fn parse_rejects_truncated_entry_block() {
        let cache = sample_cache();
        let mut io = BinaryIo::with_file(MemFile::default(), 0);
        cache.save(&mut io).unwrap();

        // Claim one more entry than the file holds.
        io.seek_put(std::io::SeekFrom::Start(12)).unwrap();
        io.write(&(cache.entry_count() as u32 + 1)).unwrap();
        let size = io.size();
        let mut io = BinaryIo::with_file(io.into_inner(), size);
        assert!(StreamCache::parse_from(&mut io).is_err());
    }
}
