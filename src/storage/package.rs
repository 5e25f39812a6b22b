use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

use super::error::StorageError;
use super::piece::Piece;
use crate::coverage::{Covering, Range};
use crate::metainfo::Info;

/// One file backing part of the package's byte stream.
pub struct PackageFile {
    pub path: PathBuf,
    /// Declared length from the metainfo.
    pub length: u64,
    /// Start offset within the logical stream.
    pub offset: u64,
    handle: TokioMutex<File>,
}

/// The ordered file vector a package's byte stream maps onto.
///
/// Reads and writes that span file boundaries are split by offset
/// arithmetic and walk the files in declared order. Each handle is
/// serialized by its own lock across seek+IO.
pub struct FileTable {
    files: Vec<PackageFile>,
}

impl FileTable {
    pub fn files(&self) -> &[PackageFile] {
        &self.files
    }

    /// Writes `data` at the given absolute stream offset.
    pub async fn write_at(&self, abs: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut abs = abs;
        let mut rest = data;
        for file in &self.files {
            if rest.is_empty() {
                break;
            }
            let file_end = file.offset + file.length;
            if abs >= file_end {
                continue;
            }
            let within = abs - file.offset;
            let n = ((file.length - within) as usize).min(rest.len());
            {
                let mut handle = file.handle.lock().await;
                handle.seek(SeekFrom::Start(within)).await?;
                handle.write_all(&rest[..n]).await?;
            }
            rest = &rest[n..];
            abs += n as u64;
        }
        Ok(())
    }

    /// Fills `buf` from the given absolute stream offset.
    pub async fn read_at(&self, abs: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut abs = abs;
        let mut filled = 0usize;
        for file in &self.files {
            if filled == buf.len() {
                break;
            }
            let file_end = file.offset + file.length;
            if abs >= file_end {
                continue;
            }
            let within = abs - file.offset;
            let n = ((file.length - within) as usize).min(buf.len() - filled);
            {
                let mut handle = file.handle.lock().await;
                handle.seek(SeekFrom::Start(within)).await?;
                handle.read_exact(&mut buf[filled..filled + n]).await?;
            }
            filled += n;
            abs += n as u64;
        }
        Ok(())
    }

    /// Flushes every handle and reopens it read-only.
    async fn reopen_read_only(&self) -> Result<(), StorageError> {
        for file in &self.files {
            let mut handle = file.handle.lock().await;
            handle.sync_data().await?;
            *handle = File::open(&file.path).await?;
        }
        Ok(())
    }
}

/// One torrent's on-disk state: the piece vector over a file set.
///
/// Binding a [`Metainfo`](crate::metainfo::Metainfo)'s info dictionary to
/// a destination path opens or creates each file; pieces fully covered by
/// pre-existing file bytes are assumed valid unless that optimism is
/// disabled.
pub struct Package {
    name: String,
    total_len: u64,
    piece_length: u64,
    files: Arc<FileTable>,
    pieces: Vec<Piece>,
    read_only: AtomicBool,
}

impl Package {
    /// Binds `info` to a destination: a file path for single-file
    /// torrents, a parent directory for multi-file torrents (the root
    /// directory named by the torrent is created inside it on demand).
    pub async fn bind(info: &Info, dest: &Path, assume_valid: bool) -> Result<Self, StorageError> {
        let mut files = Vec::with_capacity(info.files.len());
        // Coverage of the stream by bytes already present on disk.
        let mut present = Covering::new(Range::new(0, info.total_len));

        for spec in &info.files {
            let path = if info.multi_file {
                validate_relative(&spec.path)?;
                dest.join(&spec.path)
            } else {
                dest.to_path_buf()
            };

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let existing_len = match tokio::fs::metadata(&path).await {
                Ok(meta) => Some(meta.len()),
                Err(_) => None,
            };

            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;

            if let Some(disk_len) = existing_len {
                let covered = disk_len.min(spec.length);
                if covered > 0 {
                    present = present.fill(Range::with_len(spec.offset, covered))?;
                }
            }

            files.push(PackageFile {
                path,
                length: spec.length,
                offset: spec.offset,
                handle: TokioMutex::new(handle),
            });
        }

        let files = Arc::new(FileTable { files });

        let pieces: Vec<Piece> = info
            .pieces
            .iter()
            .enumerate()
            .map(|(i, &sha1)| {
                Piece::new(
                    i as u32,
                    sha1,
                    info.piece_offset(i),
                    info.piece_len(i),
                    files.clone(),
                )
            })
            .collect();

        if assume_valid {
            for piece in &pieces {
                let span = Range::with_len(piece.offset(), piece.length());
                if !span.is_empty() && present.covers(&span) {
                    piece.assume_complete();
                }
            }
        }

        Ok(Self {
            name: info.name.clone(),
            total_len: info.total_len,
            piece_length: info.piece_length,
            files,
            pieces,
            read_only: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Number of pieces whose bytes are fully on disk.
    pub fn completed_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_complete()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.is_complete())
    }

    /// Bytes still missing from disk.
    pub fn bytes_left(&self) -> u64 {
        self.pieces.iter().map(|p| p.missing_len()).sum()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Reopens every file read-only once the package is complete and all
    /// pieces validated. Returns true if the switch happened.
    pub async fn finish_read_only(&self) -> Result<bool, StorageError> {
        if self.is_read_only() || !self.is_complete() {
            return Ok(false);
        }
        for piece in &self.pieces {
            if !piece.is_valid().await? {
                return Ok(false);
            }
        }
        self.files.reopen_read_only().await?;
        self.read_only.store(true, Ordering::Release);
        Ok(true)
    }
}

fn validate_relative(path: &Path) -> Result<(), StorageError> {
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}
