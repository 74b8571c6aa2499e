//! Price-series caching: merge, corporate-action factors, and incremental
//! synchronization against the provider.

pub mod adjust;
pub mod merge;
pub mod sync;

pub use adjust::{adjust, recompute_factors, AdjustOptions};
pub use merge::{merge, DuplicateTimestamps};
pub use sync::{HistoryRequest, SeriesSynchronizer, SyncOutcome, SyncState};
