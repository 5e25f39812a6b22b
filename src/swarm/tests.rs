use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::controller::next_retry_delay;
use super::*;
use crate::constants::{TRACKER_RETRY_CAP, TRACKER_RETRY_INITIAL};
use crate::metainfo::{FileSpec, Info, InfoHash, Metainfo};
use crate::peer::{BlockScheduler, Claim, PeerId};
use crate::storage::{Block, Package};

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn test_metainfo(piece_count: usize, piece_length: u64) -> Metainfo {
    let total = piece_count as u64 * piece_length;
    let content: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let info = Info {
        name: "pkg.dat".to_string(),
        piece_length,
        pieces: content
            .chunks(piece_length as usize)
            .map(sha1_of)
            .collect(),
        files: vec![FileSpec {
            path: PathBuf::from("pkg.dat"),
            length: total,
            offset: 0,
        }],
        total_len: total,
        multi_file: false,
    };
    Metainfo {
        info,
        info_hash: InfoHash::new([7u8; 20]),
        announce: "http://127.0.0.1:9/announce".to_string(),
        announce_list: Vec::new(),
        creation_date: None,
        created_by: None,
        comment: None,
        encoding: None,
    }
}

async fn test_swarm(
    temp: &TempDir,
    piece_count: usize,
) -> (Arc<Swarm>, mpsc::UnboundedReceiver<SwarmEvent>, Arc<Package>) {
    let metainfo = test_metainfo(piece_count, 16384);
    let package = Arc::new(
        Package::bind(&metainfo.info, &temp.path().join("pkg.dat"), false)
            .await
            .unwrap(),
    );
    let (swarm, events) = Swarm::create(
        &metainfo,
        package.clone(),
        PeerId::generate(),
        SwarmConfig::default(),
    );
    (swarm, events, package)
}

fn take_one_claim(swarm: &Swarm) -> Option<Block> {
    let mut taken = None;
    swarm.claim_blocks(&mut |block| {
        taken = Some(block.clone());
        Claim::Take
    });
    taken
}

// ---------------------------------------------------------------------
// Piece ordering
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_order_rarest_first() {
    let temp = TempDir::new().unwrap();
    let (_, _, package) = test_swarm(&temp, 4).await;

    let mut order = PieceOrder::new(4);
    // Piece popularity: 3, 1, 4, 2.
    for (piece, count) in [(0u32, 3), (1, 1), (2, 4), (3, 2)] {
        for _ in 0..count {
            order.bump(piece);
        }
    }
    order.recalc(&package, 5, false);

    // Jitter is below 1, so integral popularity gaps dominate.
    assert_eq!(order.order(), &[1, 3, 0, 2]);
}

#[tokio::test]
async fn test_order_prefers_started_and_buries_complete() {
    let temp = TempDir::new().unwrap();
    let (_, _, package) = test_swarm(&temp, 4).await;

    // Piece 1 is started; piece 2 is complete.
    package
        .piece(1)
        .unwrap()
        .claim_block(&Block::new(1, 0, 4096))
        .unwrap();
    package.piece(2).unwrap().assume_complete();

    let mut order = PieceOrder::new(4);
    for piece in [0u32, 1, 2, 3] {
        for _ in 0..2 {
            order.bump(piece);
        }
    }
    order.recalc(&package, 4, false);

    assert_eq!(order.order()[0], 1, "started piece first");
    assert_eq!(order.order()[3], 2, "complete piece last");
}

#[tokio::test]
async fn test_order_fuseki_favors_median_popularity() {
    let temp = TempDir::new().unwrap();
    let (_, _, package) = test_swarm(&temp, 3).await;

    let mut order = PieceOrder::new(3);
    // Popularity 0, 2, 4 with 4 peers: median distance 2, 0, 2.
    for _ in 0..2 {
        order.bump(1);
    }
    for _ in 0..4 {
        order.bump(2);
    }
    order.recalc(&package, 4, true);

    assert_eq!(order.order()[0], 1, "median-held piece first in fuseki");
}

// ---------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_claim_and_forget_round_trip() {
    let temp = TempDir::new().unwrap();
    let (swarm, _events, package) = test_swarm(&temp, 1).await;
    let piece = package.piece(0).unwrap();
    assert_eq!(piece.unclaimed_len(), 16384);

    let block = take_one_claim(&swarm).expect("a claimable block");
    assert_eq!((block.piece_index, block.begin, block.length), (0, 0, 16384));
    assert_eq!(piece.unclaimed_len(), 0);

    swarm.forget_block(&block);
    assert_eq!(piece.unclaimed_len(), 16384);
}

#[tokio::test]
async fn test_fuseki_yields_one_claim_per_call() {
    let temp = TempDir::new().unwrap();
    // 7 pieces: incomplete and zero completed, so the opening is active.
    let (swarm, _events, _package) = test_swarm(&temp, 7).await;

    let mut offered = 0;
    swarm.claim_blocks(&mut |_| {
        offered += 1;
        Claim::Take
    });
    assert_eq!(offered, 1, "opening mode stops after the first claim");
}

#[tokio::test]
async fn test_claims_do_not_repeat_outside_endgame() {
    let temp = TempDir::new().unwrap();
    let (swarm, _events, _package) = test_swarm(&temp, 7).await;

    let first = take_one_claim(&swarm).unwrap();
    let second = take_one_claim(&swarm).unwrap();
    assert_ne!(first, second, "claimed block must not be re-offered");
}

#[tokio::test]
async fn test_endgame_reoffers_claimed_blocks() {
    let temp = TempDir::new().unwrap();
    // 2 pieces remaining <= the end-game threshold.
    let (swarm, _events, _package) = test_swarm(&temp, 2).await;
    swarm.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(swarm.stats().endgame);

    let first = take_one_claim(&swarm).unwrap();
    let second = take_one_claim(&swarm).unwrap();
    assert_eq!(first, second, "end-game re-offers claimed blocks");

    swarm.shutdown().await;
}

// ---------------------------------------------------------------------
// Modes and stats
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_modes_after_heartbeat() {
    let temp = TempDir::new().unwrap();
    let (swarm, _events, _package) = test_swarm(&temp, 7).await;
    swarm.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = swarm.stats();
    assert!(stats.fuseki, "nothing completed yet");
    assert!(stats.antisnub, "no download traffic");
    assert!(!stats.endgame, "seven pieces remain");
    assert_eq!(stats.completed_pieces, 0);
    assert_eq!(stats.total_pieces, 7);
    assert_eq!(stats.num_peers, 0);
    assert_eq!(stats.downloaded, 0);

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let (swarm, _events, _package) = test_swarm(&temp, 1).await;
    swarm.start();
    swarm.shutdown().await;
    assert!(!swarm.is_running());
    swarm.shutdown().await;
}

// ---------------------------------------------------------------------
// Tracker backoff
// ---------------------------------------------------------------------

#[test]
fn test_tracker_backoff_doubles_to_cap() {
    let mut delay = TRACKER_RETRY_INITIAL;
    let mut seen = Vec::new();
    for _ in 0..12 {
        seen.push(delay.as_secs());
        delay = next_retry_delay(delay);
    }
    assert_eq!(
        seen,
        vec![5, 10, 20, 40, 80, 160, 320, 640, 1280, 2560, 3600, 3600]
    );
    assert_eq!(next_retry_delay(TRACKER_RETRY_CAP), TRACKER_RETRY_CAP);
}
