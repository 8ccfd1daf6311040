//! The patch (`Ptch`) asset: a list of pak files and the highest patch
//! number the runtime should load for each.
//!
//! The asset is described entirely by the map document, so the adder needs no
//! external parser. The header holds two relocated pointers into the data
//! lump: one to an array of name pointers, one to the parallel array of patch
//! numbers; the name strings follow both arrays.

use crate::builder::PakBuilder;
use crate::format::{PagePtr, PagePtrDesc, SF_CPU, SF_HEAD, TYPE_PTCH};
use crate::guid::Guid;
use anyhow::bail;
use serde_json::Value;
use zerocopy::IntoBytes;

/// The well-known guid of the patch master asset. There is only ever one
/// patch asset, and the runtime looks it up by this value.
pub const PATCH_ASSET_GUID: Guid = 0x6fc6_fa5a_d8f8_bc9c;

/// Format version of the patch asset header.
pub const PATCH_VERSION: u32 = 1;

/// unknown(4) + count(4) + two page pointers(8 each).
const PATCH_HEADER_SIZE: usize = 24;
const HDR_PAK_NAMES_OFFSET: usize = 8;
const HDR_PAK_PATCH_NUMS_OFFSET: usize = 16;

struct PatchEntry {
    pak_file_name: String,
    highest_patch_num: u8,
    name_offset: u32,
}

/// Adds a patch asset from its map entry.
pub(crate) fn add_patch_asset(
    pak: &mut PakBuilder,
    guid: Guid,
    asset_path: &str,
    map_entry: &Value,
) -> anyhow::Result<()> {
    let Some(entry_array) = map_entry.get("entries").and_then(Value::as_array) else {
        bail!("Patch asset '{asset_path}' requires an 'entries' array.");
    };

    let mut entries: Vec<PatchEntry> = Vec::with_capacity(entry_array.len());
    let mut names_size: u32 = 0;

    for (index, entry) in entry_array.iter().enumerate() {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            bail!("Patch entry #{index} requires a 'name' string.");
        };
        let Some(version) = entry.get("version").and_then(Value::as_u64) else {
            bail!("Patch entry #{index} requires a 'version' number.");
        };
        if version > u64::from(u8::MAX) {
            bail!("Patch entry #{index} has version {version}, which exceeds {}.", u8::MAX);
        }

        entries.push(PatchEntry {
            pak_file_name: name.to_owned(),
            highest_patch_num: version as u8,
            name_offset: names_size,
        });
        names_size += name.len() as u32 + 1;
    }

    let count = entries.len() as u32;

    pak.begin_asset(guid, asset_path)?;

    let hdr = pak.create_page_lump(PATCH_HEADER_SIZE, SF_HEAD, 8, None)?;
    {
        let bytes = pak.lump_data_mut(&hdr);
        bytes[0..4].copy_from_slice(&0xffu32.to_le_bytes());
        bytes[4..8].copy_from_slice(&count.to_le_bytes());
    }

    // Data lump layout: name pointer array, patch number array, name strings.
    let nums_offset = std::mem::size_of::<PagePtrDesc>() * count as usize;
    let names_base = nums_offset + count as usize;
    let data_size = names_base + names_size as usize;
    let data = pak.create_page_lump(data_size, SF_CPU, 8, None)?;

    pak.add_pointer(&hdr, HDR_PAK_NAMES_OFFSET, &data, 0);
    pak.add_pointer(&hdr, HDR_PAK_PATCH_NUMS_OFFSET, &data, nums_offset);

    for (index, entry) in entries.iter().enumerate() {
        let name_offset = names_base + entry.name_offset as usize;
        let name_ptr = PagePtrDesc::from(data.ptr_at(name_offset));

        let bytes = pak.lump_data_mut(&data);
        bytes[8 * index..8 * index + 8].copy_from_slice(name_ptr.as_bytes());
        bytes[nums_offset + index] = entry.highest_patch_num;
        bytes[name_offset..name_offset + entry.pak_file_name.len()]
            .copy_from_slice(entry.pak_file_name.as_bytes());
    }

    pak.init_asset(&hdr, PagePtr::NULL, PATCH_VERSION, TYPE_PTCH);
    pak.finish_asset();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PakVersion;
    use crate::settings::{BuildFlags, BuildSettings};
    use crate::stream_file::StreamFileBuilder;
    use std::path::PathBuf;

    fn patch_entry_json(entries: &str) -> Value {
        serde_json::from_str(&format!(
            r#"{{ "$type": "Ptch", "path": "patch_master", "entries": {entries} }}"#
        ))
        .unwrap()
    }

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
    fn single_entry_patch_layout() {
        let mut pak = test_builder();
        let entry = patch_entry_json(r#"[ { "name": "foo.rpak", "version": 1 } ]"#);
        add_patch_asset(&mut pak, PATCH_ASSET_GUID, "patch_master", &entry).unwrap();

        assert_eq!(pak.asset_count(), 1);
        // Header lump and data lump carry different flags, so at least two
        // pages exist.
        assert!(pak.page_count() >= 2);

        let asset = pak.get_asset_by_guid(PATCH_ASSET_GUID).unwrap();
        assert_eq!(asset.asset_type, TYPE_PTCH);
        assert_eq!(asset.version, PATCH_VERSION);
        assert_eq!(asset.head_size, 24);
        assert!(asset.cpu_ptr.is_null());
        assert_eq!(asset.page_end, pak.page_count());
    }

    #[test]
    fn entries_are_required() {
        let mut pak = test_builder();
        let entry: Value =
            serde_json::from_str(r#"{ "$type": "Ptch", "path": "patch_master" }"#).unwrap();
        assert!(add_patch_asset(&mut pak, PATCH_ASSET_GUID, "patch_master", &entry).is_err());
    }

    #[test]
    fn oversized_patch_number_is_rejected() {
        let mut pak = test_builder();
        let entry = patch_entry_json(r#"[ { "name": "foo.rpak", "version": 300 } ]"#);
        assert!(add_patch_asset(&mut pak, PATCH_ASSET_GUID, "patch_master", &entry).is_err());
    }
}
