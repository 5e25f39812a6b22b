use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::*;
use crate::metainfo::{FileSpec, Info};
use crate::storage::{Block, Package};

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_tag(), Some("TK0001"));
}

#[test]
fn test_message_round_trip() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0b1110_0000])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 2,
            begin: 0,
            data: Bytes::from_static(b"hello world"),
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
    ];

    for msg in messages {
        let encoded = msg.encode();
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, msg);
    }
}

#[test]
fn test_message_length_must_match_id() {
    // A have message with a 2-byte payload.
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&3u32.to_be_bytes());
    buf.extend_from_slice(&[4, 0, 0]);
    assert!(matches!(
        Message::decode(buf.freeze()),
        Err(PeerError::InvalidMessage(_))
    ));

    // A choke message with a payload.
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&2u32.to_be_bytes());
    buf.extend_from_slice(&[0, 9]);
    assert!(matches!(
        Message::decode(buf.freeze()),
        Err(PeerError::InvalidMessage(_))
    ));
}

#[test]
fn test_message_unknown_id() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&[21]);
    assert!(matches!(
        Message::decode(buf.freeze()),
        Err(PeerError::InvalidMessageId(21))
    ));
}

#[test]
fn test_message_oversize_frame() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&(600u32 * 1024).to_be_bytes());
    assert!(matches!(
        Message::decode(buf.freeze()),
        Err(PeerError::FrameTooLarge(_))
    ));
}

#[test]
fn test_handshake_parts() {
    let prefix = handshake_prefix();
    assert_eq!(prefix.len(), HANDSHAKE_PREFIX_LEN);
    assert_eq!(prefix[0], 19);
    assert_eq!(&prefix[1..20], b"BitTorrent protocol");
    assert_eq!(&prefix[20..28], &[0u8; 8]);

    let tail = handshake_tail(&[1u8; 20], &[2u8; 20]);
    assert_eq!(tail.len(), HANDSHAKE_TAIL_LEN);
    assert_eq!(&tail[..20], &[1u8; 20]);
    assert_eq!(&tail[20..], &[2u8; 20]);
}

#[test]
fn test_bitfield_basics() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));
    bf.set(0);
    bf.set(99);
    assert!(bf.has(0));
    assert!(bf.has(99));
    assert_eq!(bf.count(), 2);
    bf.clear(0);
    assert_eq!(bf.count(), 1);
    assert!(!bf.has(100));
}

#[test]
fn test_bitfield_encoded_size() {
    // ceil(P/8) bytes, exactly the completed bits set.
    let bf = Bitfield::from_fn(3, |i| i < 3);
    assert_eq!(bf.as_bytes().len(), 1);
    assert_eq!(bf.as_bytes()[0], 0b1110_0000);

    let bf = Bitfield::from_fn(9, |i| i == 8);
    assert_eq!(bf.as_bytes().len(), 2);
    assert_eq!(bf.as_bytes(), &[0x00, 0x80]);
}

#[test]
fn test_bitfield_wire_size_mismatch() {
    assert!(matches!(
        Bitfield::from_wire(Bytes::from_static(&[0, 0]), 8),
        Err(PeerError::BitfieldSizeMismatch {
            expected: 1,
            actual: 2
        })
    ));
    assert!(Bitfield::from_wire(Bytes::from_static(&[0xE0]), 3).is_ok());
}

#[test]
fn test_rate_meter() {
    let meter = RateMeter::new(Duration::from_secs(20));
    assert_eq!(meter.rate(), 0);
    meter.add(10_000);
    meter.add(10_000);
    assert_eq!(meter.windowed_total(), 20_000);
    assert_eq!(meter.lifetime_total(), 20_000);
    // 20k bytes over a 20s window.
    assert_eq!(meter.rate(), 1_000);
}

// ---------------------------------------------------------------------
// Connection integration
// ---------------------------------------------------------------------

/// Scheduler stub backed by a simple block pool.
struct PoolScheduler {
    pool: Mutex<Vec<Block>>,
    forgotten: Mutex<Vec<Block>>,
}

impl PoolScheduler {
    fn new(blocks: Vec<Block>) -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(blocks),
            forgotten: Mutex::new(Vec::new()),
        })
    }
}

impl BlockScheduler for PoolScheduler {
    fn claim_blocks(&self, want: &mut dyn FnMut(&Block) -> Claim) {
        let offers = self.pool.lock().clone();
        for block in &offers {
            match want(block) {
                Claim::Take => self.pool.lock().retain(|b| b != block),
                Claim::Pass => {}
                Claim::Stop => break,
            }
        }
    }

    fn forget_block(&self, block: &Block) {
        self.forgotten.lock().push(block.clone());
        self.pool.lock().push(block.clone());
    }

    fn peer_has_piece(&self, _conn_id: u64, _piece: u32) {}

    fn self_paced(&self) -> bool {
        true
    }
}

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

async fn bind_package(temp: &TempDir, content: &[u8], piece_length: u64) -> Arc<Package> {
    let info = Info {
        name: "test.dat".to_string(),
        piece_length,
        pieces: content.chunks(piece_length as usize).map(sha1_of).collect(),
        files: vec![FileSpec {
            path: PathBuf::from("test.dat"),
            length: content.len() as u64,
            offset: 0,
        }],
        total_len: content.len() as u64,
        multi_file: false,
    };
    Arc::new(
        Package::bind(&info, &temp.path().join("test.dat"), false)
            .await
            .unwrap(),
    )
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();

    let mut frame = BytesMut::with_capacity(4 + len);
    frame.extend_from_slice(&len_buf);
    frame.extend_from_slice(&body);
    Message::decode(frame.freeze()).unwrap()
}

async fn write_message(stream: &mut TcpStream, message: Message) {
    stream.write_all(&message.encode()).await.unwrap();
}

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    (accepted, connect.await.unwrap())
}

#[tokio::test]
async fn test_leecher_downloads_through_choke_transitions() {
    let temp = TempDir::new().unwrap();
    let content: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
    let package = bind_package(&temp, &content, 16384).await;

    let scheduler = PoolScheduler::new(vec![Block::new(0, 0, 16384)]);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (local, mut remote) = socket_pair().await;
    let addr = local.peer_addr().unwrap();

    let conn = PeerConnection::start(
        1,
        local,
        addr,
        PeerId::generate(),
        package.clone(),
        scheduler.clone(),
        events_tx,
    );

    // First message is always our (empty) bitfield.
    let msg = read_message(&mut remote).await;
    assert_eq!(msg, Message::Bitfield(Bytes::from_static(&[0x00])));

    // Seed declares the piece; leecher becomes interested exactly once.
    write_message(&mut remote, Message::Bitfield(Bytes::from_static(&[0x80]))).await;
    assert_eq!(read_message(&mut remote).await, Message::Interested);

    // Unchoke releases the request.
    write_message(&mut remote, Message::Unchoke).await;
    assert_eq!(
        read_message(&mut remote).await,
        Message::Request {
            index: 0,
            begin: 0,
            length: 16384,
        }
    );

    // Deliver the block; the piece completes and validates.
    write_message(
        &mut remote,
        Message::Piece {
            index: 0,
            begin: 0,
            data: Bytes::copy_from_slice(&content),
        },
    )
    .await;

    let event = events_rx.recv().await.unwrap();
    match event {
        PeerEvent::BlockReceived {
            piece_completed, ..
        } => assert!(piece_completed),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(package.piece(0).unwrap().is_complete());
    assert!(package.piece(0).unwrap().is_valid().await.unwrap());

    conn.shutdown();
}

#[tokio::test]
async fn test_no_duplicate_request_while_outstanding() {
    let temp = TempDir::new().unwrap();
    let content: Vec<u8> = vec![7u8; 32768];
    let package = bind_package(&temp, &content, 16384).await;

    let scheduler = PoolScheduler::new(vec![Block::new(0, 0, 16384)]);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (local, mut remote) = socket_pair().await;
    let addr = local.peer_addr().unwrap();

    let conn = PeerConnection::start(
        2,
        local,
        addr,
        PeerId::generate(),
        package.clone(),
        scheduler.clone(),
        events_tx,
    );

    let _bitfield = read_message(&mut remote).await;
    write_message(&mut remote, Message::Bitfield(Bytes::from_static(&[0x80]))).await;
    assert_eq!(read_message(&mut remote).await, Message::Interested);
    write_message(&mut remote, Message::Unchoke).await;
    assert_eq!(
        read_message(&mut remote).await,
        Message::Request {
            index: 0,
            begin: 0,
            length: 16384,
        }
    );

    // Repeated pumps must not re-send the outstanding request.
    conn.pump(u64::MAX, u64::MAX).await;
    conn.pump(u64::MAX, u64::MAX).await;
    write_message(&mut remote, Message::KeepAlive).await;

    // The next message on the wire reflects the keepalive round-trip,
    // not a duplicate request; give the writer a moment then close.
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.shutdown();

    let mut trailing = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_millis(200), remote.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => trailing.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break,
        }
    }
    // No request frame (id 6) in whatever trailed.
    assert!(!trailing.windows(5).any(|w| w == [0, 0, 0, 13, 6]));
}

#[tokio::test]
async fn test_seeder_serves_requests_after_unchoke() {
    let temp = TempDir::new().unwrap();
    let content: Vec<u8> = (0..16384u32).map(|i| (i / 7 % 256) as u8).collect();
    let path = temp.path().join("test.dat");
    std::fs::write(&path, &content).unwrap();

    let info = Info {
        name: "test.dat".to_string(),
        piece_length: 16384,
        pieces: vec![sha1_of(&content)],
        files: vec![FileSpec {
            path: PathBuf::from("test.dat"),
            length: content.len() as u64,
            offset: 0,
        }],
        total_len: content.len() as u64,
        multi_file: false,
    };
    let package = Arc::new(Package::bind(&info, &path, true).await.unwrap());
    assert!(package.is_complete());

    let scheduler = PoolScheduler::new(Vec::new());
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (local, mut remote) = socket_pair().await;
    let addr = local.peer_addr().unwrap();

    let conn = PeerConnection::start(
        3,
        local,
        addr,
        PeerId::generate(),
        package.clone(),
        scheduler,
        events_tx,
    );

    // Seeder advertises its one piece.
    assert_eq!(
        read_message(&mut remote).await,
        Message::Bitfield(Bytes::from_static(&[0x80]))
    );

    // Request before interest/unchoke is ignored.
    write_message(&mut remote, Message::Interested).await;
    conn.set_choking(false);
    assert_eq!(read_message(&mut remote).await, Message::Unchoke);

    write_message(
        &mut remote,
        Message::Request {
            index: 0,
            begin: 4096,
            length: 8192,
        },
    )
    .await;

    let msg = read_message(&mut remote).await;
    match msg {
        Message::Piece { index, begin, data } => {
            assert_eq!(index, 0);
            assert_eq!(begin, 4096);
            assert_eq!(&data[..], &content[4096..12288]);
        }
        other => panic!("expected piece, got {other:?}"),
    }

    conn.shutdown();
}

#[tokio::test]
async fn test_claims_released_on_disconnect() {
    let temp = TempDir::new().unwrap();
    let content: Vec<u8> = vec![1u8; 16384];
    let package = bind_package(&temp, &content, 16384).await;

    let scheduler = PoolScheduler::new(vec![Block::new(0, 0, 16384)]);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (local, mut remote) = socket_pair().await;
    let addr = local.peer_addr().unwrap();

    let _conn = PeerConnection::start(
        4,
        local,
        addr,
        PeerId::generate(),
        package,
        scheduler.clone(),
        events_tx,
    );

    let _bitfield = read_message(&mut remote).await;
    write_message(&mut remote, Message::Bitfield(Bytes::from_static(&[0x80]))).await;
    assert_eq!(read_message(&mut remote).await, Message::Interested);
    write_message(&mut remote, Message::Unchoke).await;
    assert_eq!(
        read_message(&mut remote).await,
        Message::Request {
            index: 0,
            begin: 0,
            length: 16384,
        }
    );

    // Remote hangs up; the outstanding claim must come back exactly once.
    drop(remote);
    let event = events_rx.recv().await.unwrap();
    assert!(matches!(event, PeerEvent::Disconnected { from: 4 }));
    assert_eq!(scheduler.forgotten.lock().len(), 1);
}
