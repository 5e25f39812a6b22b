use std::path::PathBuf;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tempfile::TempDir;

use super::*;
use crate::metainfo::{FileSpec, Info};

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn single_file_info(content: &[u8], piece_length: u64) -> Info {
    let pieces = content
        .chunks(piece_length as usize)
        .map(sha1_of)
        .collect::<Vec<_>>();
    Info {
        name: "test.dat".to_string(),
        piece_length,
        pieces,
        files: vec![FileSpec {
            path: PathBuf::from("test.dat"),
            length: content.len() as u64,
            offset: 0,
        }],
        total_len: content.len() as u64,
        multi_file: false,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_block_identity_excludes_data() {
    let mut a = Block::new(3, 0, 8);
    let b = Block::new(3, 0, 8);
    a.add_chunk(b"1234");
    assert_eq!(a, b);
    assert!(!a.is_complete());
    a.add_chunk(b"5678");
    assert!(a.is_complete());

    let c = Block::new(3, 8, 8);
    assert_ne!(a, c);
}

#[tokio::test]
async fn test_piece_add_block_and_validate() {
    let temp = TempDir::new().unwrap();
    let content = pattern(32768);
    let info = single_file_info(&content, 16384);
    let package = Package::bind(&info, &temp.path().join("test.dat"), true)
        .await
        .unwrap();

    let piece = package.piece(0).unwrap();
    assert!(!piece.is_started());

    let first = Block::with_data(0, 0, Bytes::copy_from_slice(&content[..8192]));
    let second = Block::with_data(0, 8192, Bytes::copy_from_slice(&content[8192..16384]));

    assert!(!piece.add_block(&first).await.unwrap());
    assert!(piece.is_started());
    assert!(!piece.is_complete());
    assert_eq!(piece.missing_len(), 8192);

    assert!(piece.add_block(&second).await.unwrap());
    assert!(piece.is_complete());
    assert!(piece.is_valid().await.unwrap());
}

#[tokio::test]
async fn test_piece_hash_mismatch_and_discard() {
    let temp = TempDir::new().unwrap();
    let content = pattern(16384);
    let info = single_file_info(&content, 16384);
    let package = Package::bind(&info, &temp.path().join("test.dat"), true)
        .await
        .unwrap();
    let piece = package.piece(0).unwrap();

    // Corrupt one byte in the final block.
    let mut bad = content.clone();
    bad[16383] ^= 0xFF;
    let head = Block::with_data(0, 0, Bytes::copy_from_slice(&bad[..8192]));
    let tail = Block::with_data(0, 8192, Bytes::copy_from_slice(&bad[8192..]));

    piece.add_block(&head).await.unwrap();
    assert!(piece.add_block(&tail).await.unwrap());
    assert!(!piece.is_valid().await.unwrap());

    piece.discard();
    assert!(!piece.is_started());
    assert!(!piece.is_complete());
    assert_eq!(piece.unclaimed_len(), 16384);
}

#[tokio::test]
async fn test_claim_and_unclaim() {
    let temp = TempDir::new().unwrap();
    let content = pattern(16384);
    let info = single_file_info(&content, 16384);
    let package = Package::bind(&info, &temp.path().join("test.dat"), true)
        .await
        .unwrap();
    let piece = package.piece(0).unwrap();

    let block = Block::new(0, 0, 4096);
    piece.claim_block(&block).unwrap();
    piece.claim_block(&block).unwrap(); // idempotent
    assert_eq!(piece.unclaimed_len(), 16384 - 4096);

    piece.unclaim_block(&block).unwrap();
    piece.unclaim_block(&block).unwrap();
    assert_eq!(piece.unclaimed_len(), 16384);
}

#[tokio::test]
async fn test_unclaimed_block_walk_ascending_chunks() {
    let temp = TempDir::new().unwrap();
    let content = pattern(16384);
    let info = single_file_info(&content, 16384);
    let package = Package::bind(&info, &temp.path().join("test.dat"), true)
        .await
        .unwrap();
    let piece = package.piece(0).unwrap();

    piece.claim_block(&Block::new(0, 4096, 4096)).unwrap();

    let mut blocks = Vec::new();
    piece
        .for_each_unclaimed_block(4096, |b| {
            blocks.push((b.begin, b.length));
            true
        })
        .unwrap();
    assert_eq!(blocks, vec![(0, 4096), (8192, 4096), (12288, 4096)]);

    // Early stop after the first block.
    let mut count = 0;
    piece
        .for_each_unclaimed_block(1024, |_| {
            count += 1;
            false
        })
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_read_block_requires_complete() {
    let temp = TempDir::new().unwrap();
    let content = pattern(16384);
    let info = single_file_info(&content, 16384);
    let package = Package::bind(&info, &temp.path().join("test.dat"), true)
        .await
        .unwrap();
    let piece = package.piece(0).unwrap();

    assert!(matches!(
        piece.read_block(0, 1024).await,
        Err(StorageError::PieceIncomplete(0))
    ));

    let whole = Block::with_data(0, 0, Bytes::copy_from_slice(&content));
    piece.add_block(&whole).await.unwrap();

    let block = piece.read_block(1024, 2048).await.unwrap();
    assert_eq!(block.data(), &content[1024..3072]);
}

#[tokio::test]
async fn test_multi_file_layout_and_spanning_write() {
    let temp = TempDir::new().unwrap();
    let content = pattern(30);
    let info = Info {
        name: "pkg".to_string(),
        piece_length: 16,
        pieces: content.chunks(16).map(sha1_of).collect(),
        files: vec![
            FileSpec {
                path: PathBuf::from("pkg/a.txt"),
                length: 10,
                offset: 0,
            },
            FileSpec {
                path: PathBuf::from("pkg/sub/b.txt"),
                length: 20,
                offset: 10,
            },
        ],
        total_len: 30,
        multi_file: true,
    };

    let package = Package::bind(&info, temp.path(), true).await.unwrap();
    assert_eq!(package.piece_count(), 2);

    let first = Block::with_data(0, 0, Bytes::copy_from_slice(&content[..16]));
    let second = Block::with_data(1, 0, Bytes::copy_from_slice(&content[16..]));
    package.piece(0).unwrap().add_block(&first).await.unwrap();
    package.piece(1).unwrap().add_block(&second).await.unwrap();

    assert!(package.is_complete());
    assert!(package.piece(0).unwrap().is_valid().await.unwrap());
    assert!(package.piece(1).unwrap().is_valid().await.unwrap());

    let a = std::fs::read(temp.path().join("pkg/a.txt")).unwrap();
    let b = std::fs::read(temp.path().join("pkg/sub/b.txt")).unwrap();
    assert_eq!(a, &content[..10]);
    assert_eq!(b, &content[10..]);
    // Logical bytes 10..16 are the head of b.txt.
    assert_eq!(&b[..6], &content[10..16]);
}

#[tokio::test]
async fn test_bind_assumes_existing_files_valid() {
    let temp = TempDir::new().unwrap();
    let content = pattern(32768);
    let path = temp.path().join("test.dat");
    std::fs::write(&path, &content).unwrap();

    let info = single_file_info(&content, 16384);
    let package = Package::bind(&info, &path, true).await.unwrap();
    assert!(package.is_complete());
    assert_eq!(package.bytes_left(), 0);

    // Optimism disabled: nothing is assumed.
    let package = Package::bind(&info, &path, false).await.unwrap();
    assert!(!package.is_complete());
    assert_eq!(package.bytes_left(), 32768);
}

#[tokio::test]
async fn test_bind_partial_existing_file() {
    let temp = TempDir::new().unwrap();
    let content = pattern(32768);
    let path = temp.path().join("test.dat");
    // Only the first piece's bytes exist on disk.
    std::fs::write(&path, &content[..16384]).unwrap();

    let info = single_file_info(&content, 16384);
    let package = Package::bind(&info, &path, true).await.unwrap();
    assert!(package.piece(0).unwrap().is_complete());
    assert!(!package.piece(1).unwrap().is_complete());
    assert_eq!(package.completed_count(), 1);
}

#[tokio::test]
async fn test_finish_read_only() {
    let temp = TempDir::new().unwrap();
    let content = pattern(16384);
    let path = temp.path().join("test.dat");
    std::fs::write(&path, &content).unwrap();

    let info = single_file_info(&content, 16384);
    let package = Package::bind(&info, &path, true).await.unwrap();

    assert!(package.finish_read_only().await.unwrap());
    assert!(package.is_read_only());
    assert!(!package.finish_read_only().await.unwrap());
}

#[tokio::test]
async fn test_path_traversal_rejected() {
    let temp = TempDir::new().unwrap();
    let info = Info {
        name: "pkg".to_string(),
        piece_length: 16,
        pieces: vec![[0u8; 20]],
        files: vec![FileSpec {
            path: PathBuf::from("pkg/../../evil"),
            length: 10,
            offset: 0,
        }],
        total_len: 10,
        multi_file: true,
    };

    assert!(matches!(
        Package::bind(&info, temp.path(), true).await,
        Err(StorageError::PathTraversal(_))
    ));
}
