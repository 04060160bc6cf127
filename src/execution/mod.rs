//! Turning plans into confirmed transactions.

pub mod orchestrator;
pub mod result;
pub mod retry;

pub use orchestrator::{PairContext, RebalanceOrchestrator, HISTORY_CAPACITY};
pub use result::{ActionOutcome, PlanOutcome};
pub use retry::{AttemptContext, RetryExecutor, RetryOutcome, RetryPolicy};
