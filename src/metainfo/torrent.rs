use std::path::PathBuf;

use sha1::{Digest, Sha1};

use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};

/// A parsed torrent file.
///
/// # Examples
///
/// ```no_run
/// use torpak::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let data = std::fs::read("example.torrent")?;
/// let metainfo = Metainfo::from_bytes(&data)?;
/// println!("{}: {} bytes", metainfo.info.name, metainfo.info.total_len);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The info dictionary: content layout and piece hashes.
    pub info: Info,
    /// SHA-1 of the bencoded info dictionary; the swarm identifier.
    pub info_hash: InfoHash,
    /// Primary tracker URL.
    pub announce: String,
    /// Tiered tracker list; may be empty.
    pub announce_list: Vec<Vec<String>>,
    /// Unix timestamp when the torrent was created.
    pub creation_date: Option<i64>,
    pub created_by: Option<String>,
    pub comment: Option<String>,
    pub encoding: Option<String>,
}

/// The info dictionary: what the content looks like on disk.
#[derive(Debug, Clone)]
pub struct Info {
    /// Name of the file (single-file) or root directory (multi-file).
    pub name: String,
    /// Bytes per piece; the last piece may be shorter.
    pub piece_length: u64,
    /// SHA-1 hash per piece.
    pub pieces: Vec<[u8; 20]>,
    /// Files in declared order, with running offsets.
    pub files: Vec<FileSpec>,
    /// Total content size in bytes.
    pub total_len: u64,
    /// True for multi-file torrents (`files` key present).
    pub multi_file: bool,
}

/// One file within a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Path relative to the destination (includes the root dir for
    /// multi-file torrents).
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset within the logical content stream.
    pub offset: u64,
}

impl Metainfo {
    /// Parses and validates a torrent file from raw bytes.
    ///
    /// # Errors
    ///
    /// Fails on malformed bencode, missing required fields, an info dict
    /// carrying both or neither of `length`/`files`, a `pieces` string
    /// that is not a multiple of 20 bytes, or a declared content size
    /// the piece hashes cannot cover.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        if root.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("root"));
        }

        let info_value = root
            .get(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_hash = hash_info(info_value)?;
        let info = parse_info(info_value)?;

        let announce = root
            .get(b"announce")
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingField("announce"))?
            .to_string();

        let announce_list = root
            .get(b"announce-list")
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect::<Vec<_>>()
                        })
                    })
                    .filter(|tier: &Vec<String>| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let creation_date = root.get(b"creation date").and_then(|v| v.as_integer());
        let created_by = string_field(&root, b"created by");
        let comment = string_field(&root, b"comment");
        let encoding = string_field(&root, b"encoding");

        Ok(Self {
            info,
            info_hash,
            announce,
            announce_list,
            creation_date,
            created_by,
            comment,
            encoding,
        })
    }

    /// Tracker tiers in announce order.
    ///
    /// Falls back to a single tier holding `announce` when no
    /// `announce-list` was declared.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if self.announce_list.is_empty() {
            vec![vec![self.announce.clone()]]
        } else {
            self.announce_list.clone()
        }
    }
}

impl Info {
    /// Number of pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Actual length of the given piece; the final piece absorbs the
    /// remainder.
    pub fn piece_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_len - start)
    }

    /// Absolute byte offset of the given piece in the content stream.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length
    }
}

fn string_field(root: &Value, key: &[u8]) -> Option<String> {
    root.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn hash_info(info_value: &Value) -> Result<InfoHash, MetainfoError> {
    let raw = encode(info_value)?;
    let mut hasher = Sha1::new();
    hasher.update(&raw);
    let digest: [u8; 20] = hasher.finalize().into();
    Ok(InfoHash::new(digest))
}

fn parse_info(value: &Value) -> Result<Info, MetainfoError> {
    let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

    let name = dict
        .get(b"name".as_slice())
        .and_then(|v| v.as_str())
        .ok_or(MetainfoError::MissingField("name"))?
        .to_string();

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(|v| v.as_integer())
        .filter(|&n| n > 0)
        .ok_or(MetainfoError::MissingField("piece length"))? as u64;

    let pieces_bytes = dict
        .get(b"pieces".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or(MetainfoError::MissingField("pieces"))?;

    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    let pieces: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut arr = [0u8; 20];
            arr.copy_from_slice(chunk);
            arr
        })
        .collect();

    // An optional "sha1" key appears in some torrents; it is neither
    // validated nor preserved.
    let length = dict.get(b"length".as_slice());
    let files_list = dict.get(b"files".as_slice());

    let (files, total_len, multi_file) = match (length, files_list) {
        (Some(_), Some(_)) => return Err(MetainfoError::AmbiguousFileMode),
        (Some(length), None) => {
            let length = length
                .as_integer()
                .filter(|&n| n >= 0)
                .ok_or(MetainfoError::InvalidField("length"))? as u64;
            let file = FileSpec {
                path: PathBuf::from(&name),
                length,
                offset: 0,
            };
            (vec![file], length, false)
        }
        (None, Some(files_value)) => {
            let list = files_value
                .as_list()
                .ok_or(MetainfoError::InvalidField("files"))?;
            let mut files = Vec::with_capacity(list.len());
            let mut offset = 0u64;

            for entry in list {
                let length = entry
                    .get(b"length")
                    .and_then(|v| v.as_integer())
                    .filter(|&n| n >= 0)
                    .ok_or(MetainfoError::MissingField("file length"))?
                    as u64;

                let path_parts = entry
                    .get(b"path")
                    .and_then(|v| v.as_list())
                    .ok_or(MetainfoError::MissingField("file path"))?;

                let path: PathBuf = std::iter::once(name.clone())
                    .chain(
                        path_parts
                            .iter()
                            .filter_map(|p| p.as_str().map(String::from)),
                    )
                    .collect();

                files.push(FileSpec {
                    path,
                    length,
                    offset,
                });
                offset += length;
            }

            (files, offset, true)
        }
        (None, None) => return Err(MetainfoError::MissingField("length or files")),
    };

    let covered = pieces.len() as u64 * piece_length;
    if total_len > covered {
        return Err(MetainfoError::PieceCoverage {
            total: total_len,
            covered,
        });
    }

    Ok(Info {
        name,
        piece_length,
        pieces,
        files,
        total_len,
        multi_file,
    })
}
