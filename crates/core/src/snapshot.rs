//! Durable snapshotting: the whole store as one self-describing JSON
//! document.
//!
//! Entities are written in dependency order (libraries, documents, chunks)
//! together with per-library index configuration; materialized indexes are
//! never persisted — they rebuild on demand after a load. Loads are
//! all-or-nothing: a partial, corrupt, or version-mismatched file fails
//! decode and leaves the process state untouched. Saves write to a
//! temporary sibling file and rename into place, so a crash mid-write
//! leaves the previous snapshot intact. serde_json emits shortest
//! round-trippable float representations, so embeddings survive the trip
//! bit-exact.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::model::{Chunk, Document, IndexConfig, Library};

pub const FORMAT_VERSION: u32 = 1;

/// The on-disk record. `version` is a monotonic format integer; decoding
/// an unknown version fails rather than guessing.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub libraries: Vec<Library>,
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
}

impl Snapshot {
    pub fn capture(db: &Database) -> Self {
        let (libraries, documents, chunks) = db.export_entities();
        Self { version: FORMAT_VERSION, libraries, documents, chunks }
    }

    /// Validated reconstruction. Referential integrity and dimension
    /// invariants are checked before any state is installed.
    pub fn restore(self, defaults: IndexConfig) -> Result<Database> {
        if self.version != FORMAT_VERSION {
            return Err(Error::Io(format!(
                "unsupported snapshot version {} (expected {FORMAT_VERSION})",
                self.version
            )));
        }
        Database::from_entities(defaults, self.libraries, self.documents, self.chunks)
    }
}

/// Serialize the store and atomically replace `path`.
pub fn save(db: &Database, path: &Path) -> Result<()> {
    let snapshot = Snapshot::capture(db);
    let bytes = serde_json::to_vec(&snapshot)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    info!(
        path = %path.display(),
        libraries = snapshot.libraries.len(),
        documents = snapshot.documents.len(),
        chunks = snapshot.chunks.len(),
        "snapshot written"
    );
    Ok(())
}

/// Read, decode, validate, and rebuild. Any failure leaves the caller's
/// state unchanged — the database is only constructed from a fully valid
/// snapshot.
pub fn load(path: &Path, defaults: IndexConfig) -> Result<Database> {
    let bytes = fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    let db = snapshot.restore(defaults)?;
    info!(path = %path.display(), "snapshot loaded");
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Metadata;
    use crate::model::IndexKind;
    use crate::store::ChunkInput;
    use uuid::Uuid;

    fn input(embedding: &[f64]) -> ChunkInput {
        ChunkInput { text: "t".into(), embedding: embedding.to_vec(), metadata: Metadata::new() }
    }

    /// Three libraries, ~100 documents, ~10k chunks.
    fn populated_db() -> Database {
        let db = Database::new(IndexConfig::default());
        for lib_idx in 0..3 {
            let lib = db.create_library(
                format!("lib-{lib_idx}"),
                "snapshot test".into(),
                Metadata::new(),
                Some(IndexKind::KdTree),
                None,
            );
            for doc_idx in 0..34 {
                let doc = db
                    .create_document(lib.id, format!("doc-{doc_idx}"), Metadata::new())
                    .unwrap();
                let batch: Vec<ChunkInput> = (0..100)
                    .map(|i| {
                        let x = (i as f64 + doc_idx as f64 * 100.0) * 1e-4;
                        input(&[x, 1.0 - x, x * x, 0.25])
                    })
                    .collect();
                db.add_chunks(lib.id, doc.id, batch).unwrap();
            }
        }
        db
    }

    #[test]
    fn save_then_load_round_trips_entities_and_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let db = populated_db();
        save(&db, &path).unwrap();
        let reloaded = load(&path, IndexConfig::default()).unwrap();

        let (libs_a, docs_a, chunks_a) = db.export_entities();
        let (libs_b, docs_b, chunks_b) = reloaded.export_entities();
        assert_eq!(libs_a.len(), libs_b.len());
        assert_eq!(docs_a.len(), docs_b.len());
        assert_eq!(chunks_a.len(), chunks_b.len());
        for (a, b) in libs_a.iter().zip(&libs_b) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.created_at, b.created_at);
            assert_eq!(a.updated_at, b.updated_at);
            assert_eq!(a.index_config, b.index_config);
            assert_eq!(a.dimension, b.dimension);
        }
        for (a, b) in chunks_a.iter().zip(&chunks_b) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.embedding, b.embedding, "floats must survive bit-exact");
            assert_eq!(a.created_at, b.created_at);
        }

        // Searches against the reloaded store (rebuilt on demand) match.
        let query = [0.3, 0.7, 0.09, 0.25];
        for lib in &libs_a {
            let before: Vec<Uuid> = db
                .search(lib.id, &query, 5, None)
                .unwrap()
                .iter()
                .map(|h| h.chunk.id)
                .collect();
            let after: Vec<Uuid> = reloaded
                .search(lib.id, &query, 5, None)
                .unwrap()
                .iter()
                .map(|h| h.chunk.id)
                .collect();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn corrupt_file_fails_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"{\"version\": 1, \"libraries\": [").unwrap();
        assert!(matches!(load(&path, IndexConfig::default()), Err(Error::Io(_))));
    }

    #[test]
    fn unknown_version_fails_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let db = Database::new(IndexConfig::default());
        let mut snapshot = Snapshot::capture(&db);
        snapshot.version = 99;
        fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();
        let err = load(&path, IndexConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn dangling_references_fail_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let db = populated_db();
        let mut snapshot = Snapshot::capture(&db);
        // Orphan every chunk of the first library.
        let victim = snapshot.libraries[0].id;
        snapshot.libraries.retain(|l| l.id != victim);
        snapshot.documents.retain(|d| d.library_id != victim);
        fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();
        assert!(matches!(load(&path, IndexConfig::default()), Err(Error::Io(_))));
    }

    #[test]
    fn save_is_atomic_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let db = populated_db();
        save(&db, &path).unwrap();
        save(&db, &path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(matches!(load(&path, IndexConfig::default()), Err(Error::Io(_))));
    }
}
