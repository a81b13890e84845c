// Contas RAG - Core Library
// Exposes all modules for use in the CLI and tests

pub mod agent;
pub mod db;
pub mod extraction;
pub mod insights;
pub mod intents;
pub mod lexical;
pub mod seed;
pub mod vector;

// Re-export commonly used types
pub use agent::{build_prompt, ConsultaAgent, DisabledLlm, LlmClient, LLM_FAILURE};
pub use db::{
    ensure_classificacao, ensure_pessoa, insert_movimento, insert_parcela, load_movement_docs,
    setup_database, MovementDoc, NewMovimento,
};
pub use extraction::{format_currency, format_percent, MONETARY_CUTOFF};
pub use lexical::NO_RECORDS;
pub use seed::{insert_records, load_csv, seed_from_csv, SeedOutcome, SeedRecord};
pub use vector::{
    EmbeddingModel, MemoryVectorIndex, VectorCollection, VectorHit, VectorIndexClient,
    VectorRetriever, VECTOR_UNAVAILABLE,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
