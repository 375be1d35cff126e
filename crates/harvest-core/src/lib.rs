pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod egress;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod partition;
pub mod retry;
pub mod sink;
pub mod testutil;
pub mod throttle;
pub mod traits;
pub mod util;
pub mod walker;

pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointTracker};
pub use clock::{Clock, SystemClock};
pub use config::HarvestConfig;
pub use dedup::Deduplicator;
pub use egress::{Credentials, EgressIdentity, EgressPool};
pub use error::{HarvestError, ResponseClass};
pub use models::{Page, PageRequest, Partition, RawRecord, Record, Region, Session};
pub use orchestrator::{Orchestrator, Plan, RunEvent, RunReporter, RunSummary, TracingRunReporter};
pub use partition::{InstanceSlice, KeyAlphabet, PartitionEnumerator};
pub use retry::{RetryConfig, RetryPolicy};
pub use sink::RecordSink;
pub use throttle::ThrottleConfig;
pub use traits::PortalAdapter;
pub use walker::{PageWalker, WalkOutcome, WalkReport};
