//! POS journal generation: transaction selection, account resolution,
//! chunked posting, and the job processors built on top of it.

pub mod engine;
pub mod postgres;
pub mod processor;
pub mod repository;
pub mod selection;

pub use engine::{
    GenerationPhase, GenerationProgress, GenerationProgressSink, JournalEngine, JournalGenerationError,
    JournalGenerationResult, NoProgress,
};
pub use postgres::PostgresJournalRepository;
pub use processor::{PosAggregatesExportProcessor, PosJournalsProcessor};
pub use repository::{
    ChunkCommit, CreatedJournal, FailedTransaction, InMemoryJournalRepository, JournalRepository, JournalStoreError,
};
pub use selection::{ForeignCompany, JournalJobMetadata, TransactionFilter, TransactionSelection};
