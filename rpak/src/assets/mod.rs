//! The asset-adder contract and dispatch table.
//!
//! An adder translates one map-file entry into pak content through the
//! [`PakBuilder`](crate::builder::PakBuilder) host API. Every adder must:
//! register each pointer inside the asset header via `add_pointer`, register
//! each cross-asset guid via `register_guid_ref_at_offset`, route streaming
//! payloads through `add_streaming_data_entry`, pair `begin_asset` with
//! `finish_asset`, and request the alignment its structures need from
//! `create_page_lump`.
//!
//! The per-format parsers (DDS textures, CSV tables, models, shader
//! bytecode…) live outside this crate and hook in through
//! [`PakBuilder::register_asset_handler`](crate::builder::PakBuilder::register_asset_handler).
//! The patch asset is entirely described by the map document, so its adder is
//! built in.

pub mod patch;

use crate::builder::PakBuilder;
use crate::guid::{guid_from_string, guid_from_string_forced, string_to_guid, Guid};
use serde_json::Value;

/// An asset adder: `(builder, asset guid, asset path, map entry)`.
pub type AssetAdderFn = fn(&mut PakBuilder, Guid, &str, &Value) -> anyhow::Result<()>;

/// How an asset type is handled on one pak version.
#[derive(Copy, Clone)]
pub enum AdderSlot {
    /// Handled by an adder in this crate.
    Builtin(AssetAdderFn),
    /// Needs the named external parser; building this type without one
    /// registered is a fatal error.
    External(&'static str),
    /// The pak version cannot hold this asset type; the entry is skipped
    /// with a warning.
    Unsupported,
}

/// Dispatch entry for one asset type.
#[derive(Copy, Clone)]
pub struct AssetTypeHandler {
    /// The `$type` tag in the map file.
    pub four_cc: &'static str,
    /// Adder used for pak version 7.
    pub v7: AdderSlot,
    /// Adder used for pak version 8.
    pub v8: AdderSlot,
}

/// The default dispatch table.
pub fn builtin_handlers() -> Vec<AssetTypeHandler> {
    use AdderSlot::{Builtin, External, Unsupported};

    vec![
        AssetTypeHandler {
            four_cc: "txtr",
            v7: External("texture"),
            v8: External("texture"),
        },
        AssetTypeHandler {
            four_cc: "uimg",
            v7: External("ui image atlas"),
            v8: External("ui image atlas"),
        },
        AssetTypeHandler {
            four_cc: "Ptch",
            v7: Builtin(patch::add_patch_asset),
            v8: Builtin(patch::add_patch_asset),
        },
        AssetTypeHandler {
            four_cc: "dtbl",
            v7: External("data table"),
            v8: External("data table"),
        },
        AssetTypeHandler {
            four_cc: "matl",
            v7: External("material"),
            v8: External("material"),
        },
        AssetTypeHandler {
            four_cc: "rmdl",
            v7: Unsupported,
            v8: External("model"),
        },
        AssetTypeHandler {
            four_cc: "aseq",
            v7: External("animation sequence"),
            v8: External("animation sequence"),
        },
        AssetTypeHandler {
            four_cc: "arig",
            v7: Unsupported,
            v8: External("animation rig"),
        },
        AssetTypeHandler {
            four_cc: "shds",
            v7: External("shader set"),
            v8: External("shader set"),
        },
        AssetTypeHandler {
            four_cc: "shdr",
            v7: External("shader"),
            v8: External("shader"),
        },
    ]
}

/// Resolves an entry's asset guid: an explicit `guid` field wins, otherwise
/// the guid derives from the asset path. Types whose runtime names always
/// carry the `.rpak` extension hash with it forced on.
pub fn default_asset_guid(four_cc: &str, entry: &Value, path: &str) -> Guid {
    if let Some(explicit) = entry.get("guid").and_then(Value::as_str) {
        return guid_from_string(explicit);
    }

    match four_cc {
        "Ptch" => patch::PATCH_ASSET_GUID,
        "rmdl" | "aseq" | "arig" => guid_from_string_forced(path),
        _ => string_to_guid(path),
    }
}
