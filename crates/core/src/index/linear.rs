//! Exhaustive-scan index: the exact baseline every other variant is
//! measured against.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{AcceptFn, Hit, IndexPoint, IndexStats, KBest, VectorIndex};
use crate::error::Result;
use crate::model::IndexKind;
use crate::vector::squared_l2;

/// Stores `(id, vector)` pairs contiguously; build is O(1) beyond the
/// copy. Search scans every point with a bounded worst-at-top heap, so
/// memory stays O(k) regardless of library size. The metadata filter runs
/// before the distance computation — rejecting is cheaper than scoring.
#[derive(Debug)]
pub struct LinearIndex {
    points: Vec<IndexPoint>,
    built_at: DateTime<Utc>,
}

impl LinearIndex {
    pub fn new() -> Self {
        Self { points: Vec::new(), built_at: Utc::now() }
    }
}

impl Default for LinearIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex for LinearIndex {
    fn build(&mut self, points: Vec<IndexPoint>) -> Result<()> {
        self.points = points;
        self.built_at = Utc::now();
        Ok(())
    }

    fn search(&self, query: &[f64], k: usize, accept: Option<&AcceptFn>) -> Result<Vec<Hit>> {
        let mut best = KBest::new(k);
        for (seq, point) in self.points.iter().enumerate() {
            if let Some(accept) = accept {
                if !accept(point.id) {
                    continue;
                }
            }
            best.push(point.id, squared_l2(query, &point.vector), seq);
        }
        Ok(best.into_hits(k))
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            kind: IndexKind::Linear,
            points: self.points.len(),
            built_at: self.built_at,
            config: json!({}),
        }
    }
}
