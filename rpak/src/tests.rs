//! Crate-level tests: end-to-end builds over real files plus the shared
//! in-memory test file.

use crate::builder::build_from_map_file;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use sync_file::{ReadAt, WriteAt};

/// An in-memory positional file for byte-exact write tests.
#[derive(Default)]
pub(crate) struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl ReadAt for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let lock = self.data.lock().unwrap();
        lock.as_slice().read_at(buf, offset)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let lock = self.data.lock().unwrap();
        lock.as_slice().read_exact_at(buf, offset)
    }
}

impl WriteAt for MemFile {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut lock = self.data.lock().unwrap();
        let vec: &mut Vec<u8> = &mut lock;
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > vec.len() {
            vec.resize(end, 0);
        }
        vec[offset..end].copy_from_slice(buf);
        Ok(())
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn write_map(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn empty_pak_v8() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(
        dir.path(),
        "empty.json",
        r#"{ "name": "empty", "version": 8, "outputDir": "./", "files": [] }"#,
    );

    let pak_path = build_from_map_file(&map).unwrap();
    let bytes = std::fs::read(&pak_path).unwrap();

    assert_eq!(bytes.len(), 0x80, "an empty v8 pak is exactly its header");
    assert_eq!(&bytes[0..4], b"RPak");
    assert_eq!(read_u16(&bytes, 4), 8, "file_version");
    assert_eq!(read_u16(&bytes, 6), 0, "flags");
    assert_ne!(read_u64(&bytes, 8), 0, "file_time must be stamped");
    assert_eq!(read_u64(&bytes, 24), 0x80, "compressed_size");
    assert_eq!(read_u64(&bytes, 48), 0x80, "decompressed_size");
    assert_eq!(read_u16(&bytes, 72), 0, "starpak_paths_size");
    assert_eq!(read_u16(&bytes, 74), 0, "opt_starpak_paths_size");
    assert_eq!(read_u16(&bytes, 76), 0, "slab_count");
    assert_eq!(read_u16(&bytes, 78), 0, "page_count");
    assert_eq!(read_u32(&bytes, 84), 0, "pointer_count");
    assert_eq!(read_u32(&bytes, 88), 0, "asset_count");
    assert_eq!(read_u32(&bytes, 92), 0, "guid_ref_count");
    assert_eq!(read_u32(&bytes, 96), 0, "dependents_count");
    assert!(bytes[100..128].iter().all(|&b| b == 0), "reserved tail");
}

#[test]
fn empty_pak_v7() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(
        dir.path(),
        "empty.json",
        r#"{ "name": "legacy", "version": 7, "outputDir": "./", "files": [] }"#,
    );

    let pak_path = build_from_map_file(&map).unwrap();
    let bytes = std::fs::read(&pak_path).unwrap();

    assert_eq!(bytes.len(), 0x58, "an empty v7 pak is exactly its header");
    assert_eq!(&bytes[0..4], b"RPak");
    assert_eq!(read_u16(&bytes, 4), 7);
    assert_eq!(read_u64(&bytes, 24), 0x58, "compressed_size");
    assert_eq!(read_u64(&bytes, 40), 0x58, "decompressed_size");
    assert_eq!(read_u16(&bytes, 56), 0, "starpak_paths_size");
    assert_eq!(read_u16(&bytes, 58), 0, "slab_count");
    assert_eq!(read_u16(&bytes, 60), 0, "page_count");
    assert_eq!(read_u32(&bytes, 64), 0, "pointer_count");
    assert_eq!(read_u32(&bytes, 68), 0, "asset_count");
    assert_eq!(read_u64(&bytes, 80), 0, "legacy external-assets counters");
}

#[test]
fn single_patch_asset_pak() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(
        dir.path(),
        "patch.json",
        r#"{
            "name": "patch",
            "version": 8,
            "outputDir": "./",
            "files": [
                {
                    "$type": "Ptch",
                    "path": "patch_master",
                    "entries": [ { "name": "foo.rpak", "version": 1 } ]
                }
            ]
        }"#,
    );

    let pak_path = build_from_map_file(&map).unwrap();
    let bytes = std::fs::read(&pak_path).unwrap();

    let slab_count = read_u16(&bytes, 76) as usize;
    let page_count = read_u16(&bytes, 78) as usize;
    let pointer_count = read_u32(&bytes, 84) as usize;
    let asset_count = read_u32(&bytes, 88) as usize;

    assert_eq!(asset_count, 1);
    assert!(page_count >= 2, "header and data lumps live on separate pages");
    assert_eq!(slab_count, 2);
    assert_eq!(
        pointer_count, 2,
        "the patch header registers its two pointers"
    );
    assert_eq!(read_u32(&bytes, 92), 0, "no guid references");
    assert_eq!(read_u32(&bytes, 96), 0, "no dependents");

    // Header 128, two slab headers, two page headers, two pointers, one
    // asset record, then the 24-byte header page and the 24-byte (padded)
    // data page. The data page's trailing padding is seeked over rather
    // than written, so the file on disk may end before compressed_size.
    assert_eq!(read_u64(&bytes, 24), 328, "compressed_size");
    assert_eq!(read_u64(&bytes, 48), 328, "decompressed_size");

    // Walk to the asset records: header, path blocks (empty), slab headers,
    // page headers, page-pointer table.
    let assets_offset = 0x80 + slab_count * 16 + page_count * 12 + pointer_count * 8;

    assert_eq!(read_u64(&bytes, assets_offset), 0x6fc6_fa5a_d8f8_bc9c, "guid");
    assert_eq!(read_u32(&bytes, assets_offset + 16), 0, "head page");
    assert_eq!(read_u32(&bytes, assets_offset + 20), 0, "head offset");
    assert_eq!(
        read_u32(&bytes, assets_offset + 24),
        u32::MAX,
        "null cpu pointer"
    );
    assert_eq!(read_u64(&bytes, assets_offset + 32), u64::MAX, "no starpak");
    assert_eq!(read_u64(&bytes, assets_offset + 40), u64::MAX, "no opt starpak");
    assert_eq!(read_u16(&bytes, assets_offset + 48) as usize, page_count, "page_end");
    assert_eq!(read_u16(&bytes, assets_offset + 50), 1, "internal_dep_count");
    assert_eq!(read_u32(&bytes, assets_offset + 68), 24, "head size");
    assert_eq!(read_u32(&bytes, assets_offset + 72), 1, "patch version");
    assert_eq!(&bytes[assets_offset + 76..assets_offset + 80], b"Ptch");

    // The paged data follows the (empty) guid-reference and dependents
    // tables. Page 0 is the header lump.
    let page_data_offset = assets_offset + asset_count * 80;
    assert_eq!(read_u32(&bytes, page_data_offset), 0xff, "patch header marker");
    assert_eq!(read_u32(&bytes, page_data_offset + 4), 1, "patched pak count");

    // pPakNames points at page 1, offset 0.
    assert_eq!(read_u32(&bytes, page_data_offset + 8), 1);
    assert_eq!(read_u32(&bytes, page_data_offset + 12), 0);
    // pPakPatchNums points at page 1, just past the one name pointer.
    assert_eq!(read_u32(&bytes, page_data_offset + 16), 1);
    assert_eq!(read_u32(&bytes, page_data_offset + 20), 8);

    // Page 1: name pointer, patch number, then the name string.
    let head_page_size = 24;
    let data_page = page_data_offset + head_page_size;
    assert_eq!(read_u32(&bytes, data_page), 1, "name pointer page");
    assert_eq!(read_u32(&bytes, data_page + 4), 9, "name pointer offset");
    assert_eq!(bytes[data_page + 8], 1, "patch number");
    assert_eq!(&bytes[data_page + 9..data_page + 18], b"foo.rpak\0");

    // No stream file was configured, so no starmap is saved.
    assert!(!dir.path().join("patch.starmap").exists());
}

#[test]
fn unknown_asset_type_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(
        dir.path(),
        "bad.json",
        r#"{ "name": "bad", "version": 8, "outputDir": "./",
             "files": [ { "$type": "wxyz", "path": "thing" } ] }"#,
    );

    let err = build_from_map_file(&map).unwrap_err();
    assert!(err.to_string().contains("Invalid asset type"));
}

#[test]
fn external_parser_types_fail_without_registration() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(
        dir.path(),
        "tex.json",
        r#"{ "name": "tex", "version": 8, "outputDir": "./",
             "files": [ { "$type": "txtr", "path": "texture/grid" } ] }"#,
    );

    let err = build_from_map_file(&map).unwrap_err();
    assert!(err.to_string().contains("texture parser"));
}

#[test]
fn version_gated_types_are_skipped_on_v7() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(
        dir.path(),
        "mdl.json",
        r#"{ "name": "mdl", "version": 7, "outputDir": "./",
             "files": [ { "$type": "rmdl", "path": "models/thing.rmdl" } ] }"#,
    );

    // Skipped with a warning, not an error; the pak builds empty.
    let pak_path = build_from_map_file(&map).unwrap();
    let bytes = std::fs::read(&pak_path).unwrap();
    assert_eq!(read_u32(&bytes, 68), 0, "asset_count");
}

#[test]
fn unsupported_map_version_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(
        dir.path(),
        "v9.json",
        r#"{ "name": "x", "version": 9, "outputDir": "./", "files": [] }"#,
    );
    assert!(build_from_map_file(&map).is_err());
}

#[test]
fn missing_map_file_is_fatal() {
    assert!(build_from_map_file(Path::new("/nonexistent/map.json")).is_err());
}

#[test]
fn opened_stream_files_are_finalized() {
    let dir = tempfile::tempdir().unwrap();
    let map = write_map(
        dir.path(),
        "stream.json",
        r#"{
            "name": "streamed",
            "version": 8,
            "outputDir": "./",
            "streamFileMandatory": "paks/streamed.starpak",
            "files": [
                {
                    "$type": "Ptch",
                    "path": "patch_master",
                    "entries": [ { "name": "a.rpak", "version": 2 } ]
                }
            ]
        }"#,
    );

    let pak_path = build_from_map_file(&map).unwrap();
    let bytes = std::fs::read(&pak_path).unwrap();

    // The patch adder streams nothing, so no stream path is referenced by
    // the pak even though the stream file was opened.
    assert_eq!(read_u16(&bytes, 72), 0);

    // The opened stream file exists with a valid header block, and the
    // cache was saved next to the pak because a stream file was in use.
    let starpak = std::fs::read(dir.path().join("streamed.starpak")).unwrap();
    assert_eq!(&starpak[0..4], b"SRPk");
    assert_eq!(starpak.len() as u64, 4096 + 8, "header block plus empty footer");
    assert!(dir.path().join("streamed.starmap").exists());
}

#[test]
fn build_cache_from_written_stream_files() {
    use crate::format::PakStreamSet;
    use crate::settings::{BuildFlags, BuildSettings};
    use crate::stream_cache::StreamCache;
    use crate::stream_file::StreamFileBuilder;

    let dir = tempfile::tempdir().unwrap();
    let settings = BuildSettings::new(
        crate::format::PakVersion::V8,
        "t".to_owned(),
        dir.path().to_path_buf(),
        dir.path().to_path_buf(),
        dir.path().to_path_buf(),
        BuildFlags::empty(),
        false,
    );

    let map: crate::map::MapFile = serde_json::from_str(
        r#"{ "version": 8, "outputDir": "./",
             "streamFileMandatory": "scan_me.starpak", "files": [] }"#,
    )
    .unwrap();

    let payload_a = vec![0x41u8; 5000];
    let payload_b = vec![0x42u8; 100];

    let mut builder = StreamFileBuilder::new();
    builder.init(&map, &settings, true).unwrap();
    builder.add_entry(&payload_a, PakStreamSet::Mandatory).unwrap();
    builder.add_entry(&payload_b, PakStreamSet::Mandatory).unwrap();
    builder.shutdown(dir.path()).unwrap();

    let cache_path = dir.path().join("rebuilt.starmap");
    let cache = StreamCache::build_from_game_paks(dir.path(), &cache_path).unwrap();

    assert_eq!(cache.file_count(), 1);
    assert_eq!(cache.entry_count(), 2);

    // The scanner indexes whole padded blocks (that is all the sort table
    // records), so lookups of the raw payloads miss while the padded blocks
    // hit at the recorded offsets.
    let query = cache.create_query(&payload_a, "unused.starpak");
    assert!(cache.find(&query, false).is_none());

    let mut padded_a = payload_a.clone();
    padded_a.resize(8192, 0);
    let query = cache.create_query(&padded_a, "unused.starpak");
    let hit = cache.find(&query, false).expect("padded block A should be indexed");
    assert_eq!(hit.data_offset, 4096);
    assert_eq!(hit.file.path, "paks/Win64/scan_me.starpak");

    let mut padded_b = payload_b.clone();
    padded_b.resize(4096, 0);
    let query = cache.create_query(&padded_b, "unused.starpak");
    let hit = cache.find(&query, false).expect("padded block B should be indexed");
    assert_eq!(hit.data_offset, 4096 + 8192);
}
