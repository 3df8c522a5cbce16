pub mod config;
pub mod delay_manager;
pub mod error;
pub mod input_loader;
pub mod keyword_expander;
pub mod logger;
pub mod model;
pub mod orchestrator;
pub mod ranking_client;
pub mod report;
pub mod result_sink;
pub mod signal_handler;

// Exporting types for convenience
pub use config::Settings;
pub use error::{Error, Result};
pub use keyword_expander::{expand, ExpandedKeyword};
pub use model::{KeywordJob, OutcomeRecord, RankingMatch, RowId, RunSummary, TaskOutcome};
pub use orchestrator::BatchOrchestrator;
pub use ranking_client::{FetchResult, FetchStatus, RankingApi, RankingClient};
pub use result_sink::{MemorySink, ResultSink, StateFileSink, TaskLedger};
