pub mod classifier;
pub mod database;
pub mod delta_builder;
pub mod fetcher;
pub mod ledger_writer;
pub mod memory_store;
pub mod metrics;
pub mod provider;
pub mod rollup;
pub mod store;
pub mod sync;

pub use database::Database;
pub use fetcher::FeedFetcher;
pub use ledger_writer::LedgerWriter;
pub use memory_store::MemoryLedgerStore;
pub use metrics::{get_metrics, init_metrics};
pub use provider::{FeedProvider, HttpFeedProvider};
pub use rollup::RollupAggregator;
pub use store::{LedgerStore, WriteBatch, WriteOp};
pub use sync::SyncService;
