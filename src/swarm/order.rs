use std::time::Instant;

use rand::Rng as _;

use crate::constants::{POP_RECALC_LIMIT, POP_RECALC_THRESHOLD};
use crate::peer::Bitfield;
use crate::storage::Package;

/// Download ordering over the piece set.
///
/// Pieces are ranked by a score combining swarm popularity, completion
/// state, and a per-piece jitter fixed at startup for tie-breaking.
/// Ascending score is download order. Recalculation is deferred until
/// enough popularity changes accumulate or a time limit passes.
///
/// Scores:
/// - started but incomplete: `jitter - 1 + unclaimed/length`, so pieces
///   in progress finish first;
/// - complete: `jitter + piece_count`, pushing them past everything;
/// - opening (fuseki): `jitter + |popularity - peers/2|`, favoring
///   medium-held pieces over the rarest;
/// - otherwise: `jitter + popularity`, rarest first.
pub struct PieceOrder {
    popularity: Vec<u32>,
    jitter: Vec<f64>,
    order: Vec<u32>,
    changes: usize,
    last_recalc: Instant,
}

impl PieceOrder {
    pub fn new(piece_count: usize) -> Self {
        let mut rng = rand::rng();
        let jitter = (0..piece_count).map(|_| rng.random::<f64>()).collect();
        Self {
            popularity: vec![0; piece_count],
            jitter,
            order: (0..piece_count as u32).collect(),
            changes: 0,
            last_recalc: Instant::now(),
        }
    }

    /// Cached download order, ascending by score as of the last recalc.
    pub fn order(&self) -> &[u32] {
        &self.order
    }

    pub fn popularity(&self, piece: u32) -> u32 {
        self.popularity.get(piece as usize).copied().unwrap_or(0)
    }

    /// A peer declared one piece.
    pub fn bump(&mut self, piece: u32) {
        if let Some(count) = self.popularity.get_mut(piece as usize) {
            *count += 1;
            self.changes += 1;
        }
    }

    /// A peer left; drop its declared pieces from the counts.
    pub fn forget_peer(&mut self, bits: &Bitfield) {
        for piece in bits.present() {
            if let Some(count) = self.popularity.get_mut(piece) {
                *count = count.saturating_sub(1);
                self.changes += 1;
            }
        }
    }

    /// Whether enough has changed to warrant re-sorting.
    pub fn recalc_due(&self, fuseki: bool) -> bool {
        if self.changes >= POP_RECALC_THRESHOLD {
            return true;
        }
        self.last_recalc.elapsed() >= POP_RECALC_LIMIT && (self.changes > 0 || fuseki)
    }

    /// Re-scores and re-sorts the piece order.
    pub fn recalc(&mut self, package: &Package, num_peers: usize, fuseki: bool) {
        let piece_count = self.popularity.len();
        let mut scored: Vec<(f64, u32)> = (0..piece_count)
            .map(|i| {
                (
                    self.score(package, i, num_peers, fuseki),
                    i as u32,
                )
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        self.order = scored.into_iter().map(|(_, i)| i).collect();
        self.changes = 0;
        self.last_recalc = Instant::now();
    }

    fn score(&self, package: &Package, index: usize, num_peers: usize, fuseki: bool) -> f64 {
        let jitter = self.jitter[index];
        let Some(piece) = package.piece(index as u32) else {
            return jitter + self.popularity.len() as f64;
        };

        if piece.is_complete() {
            return jitter + self.popularity.len() as f64;
        }
        if piece.is_started() {
            let unclaimed = piece.unclaimed_len() as f64 / piece.length() as f64;
            return jitter - 1.0 + unclaimed;
        }
        if fuseki {
            let median = num_peers as f64 / 2.0;
            return jitter + (self.popularity[index] as f64 - median).abs();
        }
        jitter + self.popularity[index] as f64
    }
}
