pub mod batch;
pub mod cleanup;
pub mod dedup;
pub mod sort;
pub mod sync;

pub use batch::{BatchOutcome, BatchRunner};
pub use cleanup::{CleanupReport, CleanupRunner};
pub use dedup::{DedupRunner, DedupSnapshot};
pub use sort::{SortReport, SortRunner};
pub use sync::{RefreshSummary, SyncStart, SyncTracker};
