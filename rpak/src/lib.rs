//! Builds pak asset container files.
//!
//! A pak packs a set of game assets into a small number of aligned memory
//! regions ("pages", grouped under "slabs") so the loading runtime can map
//! the file and relocate it in place. Every cross-reference inside the paged
//! data is recorded in a descriptor table; bulk payloads go to companion
//! stream files, deduplicated across builds through a persistent
//! content-addressed cache.
//!
//! The map document (a JSON control file) lists the assets to pack; see
//! [`builder::build_from_map_file`] for the top-level entry point. Per-format
//! asset parsers are external: they drive the [`builder::PakBuilder`] host
//! API and register through the [`assets`] dispatch table. The patch asset
//! adder is built in.

#![forbid(unused_must_use)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::collapsible_if)]

pub mod assets;
pub mod builder;
pub mod format;
pub mod guid;
pub mod map;
pub mod murmur;
pub mod pages;
pub mod settings;
pub mod stream_cache;
pub mod stream_file;
pub mod symbols;
pub mod util;

#[cfg(test)]
mod tests;

pub use binio::BinaryIo;
pub use builder::{build_from_map_file, PakBuilder};
pub use format::{PagePtr, PakStreamSet, PakVersion};
pub use guid::{string_to_guid, string_to_uimg_hash, Guid};
