//! Random-hyperplane LSH with banded bucket lookup.
//!
//! B bands of H sign hashes each; every hash is a random unit vector drawn
//! from N(0, I) with a seeded PRNG, so the whole family is reproducible
//! from the configured seed. A band signature packs its H sign bits into an
//! integer; each band keeps a hashtable from signature to point ids.
//! Candidates are scored exactly with L2, so approximation only ever loses
//! recall, never reorders survivors.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde_json::json;
use std::collections::{HashMap, HashSet};

use super::{AcceptFn, Hit, IndexPoint, IndexStats, KBest, VectorIndex};
use crate::error::{Error, Result};
use crate::model::{IndexKind, LshParams};
use crate::vector::{dot, squared_l2};

/// Signatures are packed into a u64; past 32 bits per band the buckets are
/// so fine that recall collapses, so the cap doubles as a sanity bound.
const MAX_HASHES_PER_BAND: u32 = 32;

#[derive(Debug)]
pub struct LshIndex {
    params: LshParams,
    points: Vec<IndexPoint>,
    /// Resolved H (either configured or derived from n at build time).
    hashes_per_band: u32,
    /// `bands * hashes_per_band` unit hyperplanes, band-major.
    planes: Vec<Vec<f64>>,
    /// Per band: signature → point indices.
    tables: Vec<HashMap<u64, Vec<u32>>>,
    built_at: DateTime<Utc>,
}

impl LshIndex {
    pub fn new(params: LshParams) -> Self {
        Self {
            params,
            points: Vec::new(),
            hashes_per_band: 0,
            planes: Vec::new(),
            tables: Vec::new(),
            built_at: Utc::now(),
        }
    }

    /// Default H when unconfigured: 2^H comparable to √n, clamped to a
    /// workable range.
    fn derive_hashes(n: usize) -> u32 {
        let target = (n.max(1) as f64).sqrt().log2().ceil() as u32;
        target.clamp(4, 16)
    }

    fn draw_planes(bands: usize, hashes: u32, dim: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..bands * hashes as usize)
            .map(|_| {
                let mut v: Vec<f64> =
                    (0..dim).map(|_| StandardNormal.sample(&mut rng)).collect();
                let norm = dot(&v, &v).sqrt();
                if norm > 0.0 {
                    for x in &mut v {
                        *x /= norm;
                    }
                }
                v
            })
            .collect()
    }

    /// Sign bits of the point against one band's hyperplanes, packed.
    fn band_signature(&self, band: usize, vector: &[f64]) -> u64 {
        let h = self.hashes_per_band as usize;
        let planes = &self.planes[band * h..(band + 1) * h];
        planes
            .iter()
            .enumerate()
            .fold(0u64, |sig, (bit, plane)| {
                if dot(plane, vector) >= 0.0 {
                    sig | (1u64 << bit)
                } else {
                    sig
                }
            })
    }

    fn signatures(&self, vector: &[f64]) -> Vec<u64> {
        (0..self.params.bands).map(|b| self.band_signature(b, vector)).collect()
    }

    /// Union of bucket contents for the query across all bands, plus the
    /// single-bit-flip probes when probing is enabled.
    fn candidates(&self, query: &[f64]) -> Vec<u32> {
        let mut seen: HashSet<u32> = HashSet::new();
        for (band, table) in self.tables.iter().enumerate() {
            let sig = self.band_signature(band, query);
            if let Some(bucket) = table.get(&sig) {
                seen.extend(bucket.iter().copied());
            }
            if self.params.probes > 0 {
                for bit in 0..self.hashes_per_band {
                    if let Some(bucket) = table.get(&(sig ^ (1u64 << bit))) {
                        seen.extend(bucket.iter().copied());
                    }
                }
            }
        }
        let mut out: Vec<u32> = seen.into_iter().collect();
        // Deterministic scoring order keeps tie-breaking stable.
        out.sort_unstable();
        out
    }

    fn scan(&self, query: &[f64], k: usize, accept: Option<&AcceptFn>, pool: &[u32]) -> Vec<Hit> {
        let mut best = KBest::new(k);
        for &i in pool {
            let point = &self.points[i as usize];
            if let Some(accept) = accept {
                if !accept(point.id) {
                    continue;
                }
            }
            best.push(point.id, squared_l2(query, &point.vector), i as usize);
        }
        best.into_hits(k)
    }
}

impl VectorIndex for LshIndex {
    fn build(&mut self, points: Vec<IndexPoint>) -> Result<()> {
        let params = &self.params;
        if params.bands == 0 {
            return Err(Error::invalid("lsh bands must be at least 1"));
        }
        let hashes = params.hashes.unwrap_or_else(|| Self::derive_hashes(points.len()));
        if hashes == 0 || hashes > MAX_HASHES_PER_BAND {
            return Err(Error::Invalid(format!(
                "lsh hashes per band must be in 1..={MAX_HASHES_PER_BAND}, got {hashes}"
            )));
        }

        self.hashes_per_band = hashes;
        self.points = points;
        self.tables = vec![HashMap::new(); params.bands];
        self.planes = Vec::new();

        if let Some(first) = self.points.first() {
            let dim = first.vector.len();
            self.planes = Self::draw_planes(params.bands, hashes, dim, params.seed);

            // Signature computation is embarrassingly parallel; bucket
            // insertion stays sequential and point-ordered.
            let signatures: Vec<Vec<u64>> = self
                .points
                .par_iter()
                .map(|p| self.signatures(&p.vector))
                .collect();
            for (i, sigs) in signatures.into_iter().enumerate() {
                for (band, sig) in sigs.into_iter().enumerate() {
                    self.tables[band].entry(sig).or_default().push(i as u32);
                }
            }
        }

        self.built_at = Utc::now();
        Ok(())
    }

    fn search(&self, query: &[f64], k: usize, accept: Option<&AcceptFn>) -> Result<Vec<Hit>> {
        if self.points.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = self.candidates(query);
        let hits = self.scan(query, k, accept, &candidates);
        if hits.len() >= k || self.params.strict {
            return Ok(hits);
        }
        // Short candidate set and strict is off: pad from a fall-back
        // exhaustive scan, which subsumes the bucket results.
        let everything: Vec<u32> = (0..self.points.len() as u32).collect();
        Ok(self.scan(query, k, accept, &everything))
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            kind: IndexKind::Lsh,
            points: self.points.len(),
            built_at: self.built_at,
            config: json!({
                "bands": self.params.bands,
                "hashes_per_band": self.hashes_per_band,
                "seed": self.params.seed,
                "probes": self.params.probes,
                "strict": self.params.strict,
            }),
        }
    }
}
