//! Nearest-neighbour indexes.
//!
//! Three implementations behind one contract: exhaustive scan
//! ([`linear::LinearIndex`]), balanced spatial tree
//! ([`kdtree::KdTreeIndex`]), and random-hyperplane hashing
//! ([`lsh::LshIndex`]). All of them score with L2, hold chunk ids rather
//! than chunk data, and are rebuilt whole — total rebuild is the only
//! maintenance path.

pub mod kdtree;
pub mod linear;
pub mod lsh;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{IndexConfig, IndexKind};

pub use kdtree::KdTreeIndex;
pub use linear::LinearIndex;
pub use lsh::LshIndex;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// An `(id, vector)` pair handed to `build`. The id is a weak reference
/// into the chunk table; the index never owns chunk data.
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub id: Uuid,
    pub vector: Vec<f64>,
}

/// One ranked result: chunk id plus non-squared L2 distance.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub chunk_id: Uuid,
    pub distance: f64,
}

/// Size, build timestamp, kind tag, and a configuration echo.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub kind: IndexKind,
    pub points: usize,
    pub built_at: DateTime<Utc>,
    pub config: serde_json::Value,
}

/// Metadata acceptance test for one chunk id, closed over the entity
/// tables by the caller. Indexes apply it at scoring time and never prune
/// on metadata.
pub type AcceptFn<'a> = dyn Fn(Uuid) -> bool + 'a;

/// The common contract all index variants satisfy.
pub trait VectorIndex {
    /// Replace any prior state with an index over `points`. Idempotent.
    fn build(&mut self, points: Vec<IndexPoint>) -> Result<()>;

    /// Up to `k` hits sorted by ascending distance. Fewer than `k` come
    /// back when `accept` eliminates candidates.
    fn search(&self, query: &[f64], k: usize, accept: Option<&AcceptFn>) -> Result<Vec<Hit>>;

    fn stats(&self) -> IndexStats;
}

// ---------------------------------------------------------------------------
// Closed variant + factory
// ---------------------------------------------------------------------------

/// Closed tagged variant over the three implementations. Dispatch is a
/// match, not a vtable; the set of index kinds is part of the contract.
#[derive(Debug)]
pub enum AnyIndex {
    Linear(LinearIndex),
    KdTree(KdTreeIndex),
    Lsh(LshIndex),
}

impl AnyIndex {
    /// Factory: construct the variant selected by `config.kind` and build
    /// it over `points`.
    pub fn build_from(config: &IndexConfig, points: Vec<IndexPoint>) -> Result<Self> {
        let mut index = match config.kind {
            IndexKind::Linear => AnyIndex::Linear(LinearIndex::new()),
            IndexKind::KdTree => AnyIndex::KdTree(KdTreeIndex::new(config.leaf_size)),
            IndexKind::Lsh => AnyIndex::Lsh(LshIndex::new(config.lsh.clone())),
        };
        index.build(points)?;
        Ok(index)
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            AnyIndex::Linear(_) => IndexKind::Linear,
            AnyIndex::KdTree(_) => IndexKind::KdTree,
            AnyIndex::Lsh(_) => IndexKind::Lsh,
        }
    }
}

impl VectorIndex for AnyIndex {
    fn build(&mut self, points: Vec<IndexPoint>) -> Result<()> {
        match self {
            AnyIndex::Linear(i) => i.build(points),
            AnyIndex::KdTree(i) => i.build(points),
            AnyIndex::Lsh(i) => i.build(points),
        }
    }

    fn search(&self, query: &[f64], k: usize, accept: Option<&AcceptFn>) -> Result<Vec<Hit>> {
        match self {
            AnyIndex::Linear(i) => i.search(query, k, accept),
            AnyIndex::KdTree(i) => i.search(query, k, accept),
            AnyIndex::Lsh(i) => i.search(query, k, accept),
        }
    }

    fn stats(&self) -> IndexStats {
        match self {
            AnyIndex::Linear(i) => i.stats(),
            AnyIndex::KdTree(i) => i.stats(),
            AnyIndex::Lsh(i) => i.stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded k-best accumulator (shared by all variants)
// ---------------------------------------------------------------------------

use std::collections::BinaryHeap;

/// Heap entry ordered by (squared distance, insertion sequence) so the
/// worst candidate sits on top and distance ties resolve to the earlier
/// insertion — result order is stable across rebuilds.
struct Candidate {
    dist_sq: f64,
    seq: usize,
    id: Uuid,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.dist_sq == other.dist_sq && self.seq == other.seq
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Max-heap of capacity `k`, worst at the top. Distances stay squared
/// inside; the square root happens once per emitted hit.
pub(crate) struct KBest {
    cap: usize,
    heap: BinaryHeap<Candidate>,
}

impl KBest {
    pub fn new(cap: usize) -> Self {
        Self { cap, heap: BinaryHeap::with_capacity(cap + 1) }
    }

    /// Current k-th squared distance: the pruning bound. Infinite while
    /// the heap is not yet full.
    pub fn bound(&self) -> f64 {
        if self.heap.len() < self.cap {
            f64::INFINITY
        } else {
            self.heap.peek().map_or(f64::INFINITY, |c| c.dist_sq)
        }
    }

    pub fn push(&mut self, id: Uuid, dist_sq: f64, seq: usize) {
        if self.cap == 0 {
            return;
        }
        if self.heap.len() < self.cap {
            self.heap.push(Candidate { dist_sq, seq, id });
            return;
        }
        // Full: replace the worst only on a strict improvement. Equal
        // distances keep the earlier-inserted entry.
        let worst = self.heap.peek().expect("non-empty at capacity");
        let incoming = Candidate { dist_sq, seq, id };
        if incoming.cmp(worst) == std::cmp::Ordering::Less {
            self.heap.pop();
            self.heap.push(incoming);
        }
    }

    /// Ascending (distance, insertion order), truncated to `limit`.
    pub fn into_hits(self, limit: usize) -> Vec<Hit> {
        let mut entries = self.heap.into_sorted_vec();
        entries.truncate(limit);
        entries
            .into_iter()
            .map(|c| Hit { chunk_id: c.id, distance: c.dist_sq.sqrt() })
            .collect()
    }
}
