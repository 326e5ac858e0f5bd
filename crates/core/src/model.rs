//! Entity models and index configuration.
//!
//! Three entity kinds, each with a process-unique v4 UUID. The store owns
//! all entities; indexes hold chunk ids only and are rebuilt whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::filter::Metadata;

// ---------------------------------------------------------------------------
// Index configuration
// ---------------------------------------------------------------------------

/// Index variant tag. Selects one of the closed set of implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Linear,
    KdTree,
    Lsh,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Linear => "linear",
            IndexKind::KdTree => "kdtree",
            IndexKind::Lsh => "lsh",
        }
    }
}

impl std::str::FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(IndexKind::Linear),
            "kdtree" => Ok(IndexKind::KdTree),
            "lsh" => Ok(IndexKind::Lsh),
            other => Err(format!("unknown index kind '{other}'")),
        }
    }
}

/// Tuning for the random-hyperplane LSH index. Deterministic per seed.
/// Omitted fields fall back to the defaults, on the wire and in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LshParams {
    /// Number of bands. Recall rises with more bands.
    pub bands: usize,
    /// Hash functions per band. `None` derives H from the point count at
    /// build time so that 2^H is comparable to √n.
    pub hashes: Option<u32>,
    /// PRNG seed for the hyperplane family.
    pub seed: u64,
    /// Bucket probes per band beyond the exact signature (single-bit
    /// flips). 0 disables probing.
    pub probes: usize,
    /// Strict mode: never pad a short candidate set from a linear scan.
    pub strict: bool,
}

impl Default for LshParams {
    fn default() -> Self {
        Self { bands: 10, hashes: None, seed: 42, probes: 1, strict: false }
    }
}

/// Per-library index configuration, persisted in snapshots. The
/// materialized index itself is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub kind: IndexKind,
    /// KD-tree leaf capacity; below this a leaf scores points linearly.
    pub leaf_size: usize,
    pub lsh: LshParams,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { kind: IndexKind::Linear, leaf_size: 16, lsh: LshParams::default() }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Top-level container. Owns documents and a single current index. The
/// embedding dimension is set by the first chunk insert and fixed
/// thereafter; names need not be unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub index_config: IndexConfig,
    #[serde(default)]
    pub index_built_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dimension: Option<usize>,
}

impl Library {
    pub fn new(name: String, description: String, metadata: Metadata, index_config: IndexConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            description,
            metadata,
            created_at: now,
            updated_at: now,
            index_config,
            index_built_at: None,
            dimension: None,
        }
    }
}

/// A logical text unit within a library. Owns chunks; deleting it cascades
/// to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub library_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(library_id: Uuid, name: String, metadata: Metadata) -> Self {
        Self { id: Uuid::new_v4(), library_id, name, metadata, created_at: Utc::now() }
    }
}

/// The indexed unit: text, a fixed-dimension embedding, and scalar
/// metadata. Immutable apart from its metadata map. `library_id` is
/// denormalized so search results resolve without a document lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub library_id: Uuid,
    pub text: String,
    pub embedding: Vec<f64>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(
        document_id: Uuid,
        library_id: Uuid,
        text: String,
        embedding: Vec<f64>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            library_id,
            text,
            embedding,
            metadata,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_kind_round_trips_through_serde_and_str() {
        for (kind, tag) in [
            (IndexKind::Linear, "linear"),
            (IndexKind::KdTree, "kdtree"),
            (IndexKind::Lsh, "lsh"),
        ] {
            assert_eq!(kind.as_str(), tag);
            assert_eq!(tag.parse::<IndexKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{tag}\""));
        }
        assert!("hnsw".parse::<IndexKind>().is_err());
    }

    #[test]
    fn library_starts_without_dimension_or_build_stamp() {
        let lib = Library::new("docs".into(), String::new(), Metadata::new(), IndexConfig::default());
        assert!(lib.dimension.is_none());
        assert!(lib.index_built_at.is_none());
        assert_eq!(lib.created_at, lib.updated_at);
    }
}
