// Vector retrieval: trait seams over an opaque embedding model and
// nearest-neighbor index, a retriever with lazy collection initialization
// and an ordered fallback to the lexical retriever, plus an in-process
// cosine-similarity backend.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

use crate::db;
use crate::lexical;

/// Sentinel returned when no vector service is configured.
pub const VECTOR_UNAVAILABLE: &str =
    "Índice vetorial ou modelo de embeddings não configurado.";

/// Collection holding one document per movement.
pub const COLLECTION_NAME: &str = "movimentos";

/// Default number of nearest documents fetched per question.
pub const DEFAULT_TOP_K: usize = 3;

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Opaque embedding model: texts in, one vector per text out.
pub trait EmbeddingModel {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: i64,
    pub document: String,
}

/// A named nearest-neighbor collection. Upsert is keyed by id, so
/// re-indexing unchanged data never duplicates documents.
pub trait VectorCollection {
    fn count(&self) -> Result<usize>;
    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>>;
    fn upsert(&self, ids: &[i64], documents: &[String], embeddings: &[Vec<f32>]) -> Result<()>;
}

/// Opaque vector-store client.
pub trait VectorIndexClient {
    fn get_or_create_collection(&self, name: &str) -> Result<Box<dyn VectorCollection>>;
}

// ============================================================================
// RETRIEVER
// ============================================================================

/// Wraps the optional vector collaborators. The collection handle is
/// initialized at most once per retriever lifetime (execution is
/// single-threaded and request-scoped; index rebuilds must be serialized
/// by the caller).
pub struct VectorRetriever {
    client: Option<Box<dyn VectorIndexClient>>,
    embedder: Option<Box<dyn EmbeddingModel>>,
    collection: OnceCell<Box<dyn VectorCollection>>,
}

impl VectorRetriever {
    pub fn new(
        client: Option<Box<dyn VectorIndexClient>>,
        embedder: Option<Box<dyn EmbeddingModel>>,
    ) -> Self {
        VectorRetriever {
            client,
            embedder,
            collection: OnceCell::new(),
        }
    }

    /// A retriever with no vector service behind it.
    pub fn disabled() -> Self {
        VectorRetriever::new(None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some() && self.embedder.is_some()
    }

    fn collection(&self) -> Result<&dyn VectorCollection> {
        if let Some(collection) = self.collection.get() {
            return Ok(collection.as_ref());
        }
        let client = self
            .client
            .as_ref()
            .context("vector client not configured")?;
        let collection = client.get_or_create_collection(COLLECTION_NAME)?;
        // Another call cannot have raced us: single-threaded by contract
        let _ = self.collection.set(collection);
        Ok(self
            .collection
            .get()
            .context("collection cell just initialized")?
            .as_ref())
    }

    /// Re-embed and upsert every movement. Errors when the vector service
    /// is not configured: an explicit re-index request must not silently
    /// leave the index stale.
    pub fn reindex(&self, conn: &Connection) -> Result<usize> {
        if !self.is_enabled() {
            bail!("serviço vetorial ou modelo de embeddings não disponível");
        }
        let embedder = self
            .embedder
            .as_ref()
            .context("embedding model not configured")?;

        let docs = db::load_movement_docs(conn)?;
        if docs.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = docs.iter().map(|d| d.id).collect();
        let texts: Vec<String> = docs.iter().map(lexical::render_movement).collect();
        let embeddings = embedder.embed(&texts)?;

        self.collection()?.upsert(&ids, &texts, &embeddings)?;
        Ok(ids.len())
    }

    /// Retrieve semantic context for `question`. Unconfigured service
    /// yields the fixed sentinel; runtime failures and empty result sets
    /// degrade to the lexical retriever (embeddings can miss exact
    /// identifiers, so lexical context always rides along anyway).
    pub fn retrieve(&self, conn: &Connection, question: &str, k: usize) -> Result<String> {
        if !self.is_enabled() {
            return Ok(VECTOR_UNAVAILABLE.to_string());
        }

        match self.query_hits(conn, question, k) {
            Ok(hits) if !hits.is_empty() => {
                let mut context = hits
                    .iter()
                    .enumerate()
                    .map(|(i, hit)| {
                        format!("Documento {} (id={}): {}", i + 1, hit.id, hit.document)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                context.push_str("\n\nContexto lexical complementar:\n");
                context.push_str(&lexical::retrieve(conn, question, lexical::DEFAULT_LIMIT)?);
                Ok(context)
            }
            Ok(_) => lexical::retrieve(conn, question, lexical::DEFAULT_LIMIT),
            Err(err) => {
                log::warn!("busca vetorial falhou, usando retriever lexical: {err:#}");
                lexical::retrieve(conn, question, lexical::DEFAULT_LIMIT)
            }
        }
    }

    fn query_hits(&self, conn: &Connection, question: &str, k: usize) -> Result<Vec<VectorHit>> {
        let embedder = self
            .embedder
            .as_ref()
            .context("embedding model not configured")?;
        let embedding = embedder
            .embed(&[question.to_string()])?
            .into_iter()
            .next()
            .context("embedding model returned no vector")?;

        let collection = self.collection()?;
        if collection.count()? == 0 {
            let indexed = self.reindex(conn)?;
            if indexed == 0 {
                return Ok(Vec::new());
            }
        }

        self.collection()?.query(&embedding, k)
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

#[derive(Default)]
struct CollectionData {
    docs: BTreeMap<i64, (String, Vec<f32>)>,
}

/// In-process vector index ranking by cosine similarity. Collections are
/// shared by name, so every handle from `get_or_create_collection` sees
/// the same documents.
#[derive(Default)]
pub struct MemoryVectorIndex {
    collections: Mutex<HashMap<String, Arc<Mutex<CollectionData>>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryCollection {
    data: Arc<Mutex<CollectionData>>,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

impl VectorCollection for MemoryCollection {
    fn count(&self) -> Result<usize> {
        let data = self.data.lock().expect("collection lock poisoned");
        Ok(data.docs.len())
    }

    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let data = self.data.lock().expect("collection lock poisoned");
        let mut scored: Vec<(f32, VectorHit)> = data
            .docs
            .iter()
            .map(|(id, (document, vector))| {
                (
                    cosine_similarity(embedding, vector),
                    VectorHit {
                        id: *id,
                        document: document.clone(),
                    },
                )
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(k).map(|(_, hit)| hit).collect())
    }

    fn upsert(&self, ids: &[i64], documents: &[String], embeddings: &[Vec<f32>]) -> Result<()> {
        if ids.len() != documents.len() || ids.len() != embeddings.len() {
            bail!(
                "upsert length mismatch: {} ids, {} documents, {} embeddings",
                ids.len(),
                documents.len(),
                embeddings.len()
            );
        }
        let mut data = self.data.lock().expect("collection lock poisoned");
        for ((id, document), embedding) in ids.iter().zip(documents).zip(embeddings) {
            data.docs
                .insert(*id, (document.clone(), embedding.clone()));
        }
        Ok(())
    }
}

impl VectorIndexClient for MemoryVectorIndex {
    fn get_or_create_collection(&self, name: &str) -> Result<Box<dyn VectorCollection>> {
        let mut collections = self.collections.lock().expect("index lock poisoned");
        let data = collections
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(MemoryCollection { data }))
    }
}

// ============================================================================
// TESTS
// ============================================================================
