//! Domain models for sync-service.

mod delta;
mod feed;
mod rollup;
mod snapshot;
mod sync;

pub use delta::{Delta, DeltaFields, DeltaOp, DeltaSummary};
pub use feed::{FeedPage, FeedRecord, FetchResult, RemovedRecord};
pub use rollup::{
    ApplyResult, DeltaResult, Granularity, MutationRecord, MutationStatus, PeriodSummary,
    RollupBucket, RollupField,
};
pub use snapshot::{SourceItem, TransactionSnapshot, TxnType};
pub use sync::{ItemSyncResult, SyncScope, SyncSummary};
