//! Torrent metainfo parsing and validation.
//!
//! A [`Metainfo`] is the parsed, validated form of a `.torrent` file:
//! the info dictionary (single-file or multi-file), per-piece SHA-1
//! hashes, and tracker tiers.

mod error;
mod info_hash;
mod torrent;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use torrent::{FileSpec, Info, Metainfo};
