pub mod collector;
pub mod parser;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use collector::{Clock, CollectionError, Collector, MetricsSource, RawSample, SysinfoSource};
pub use parser::{parse, CanonicalRecord, ParseError, ParseInput};
pub use scheduler::{Pipeline, RunSummary, ScheduleState, Scheduler, SchedulerError, TickOutcome};
pub use store::{PersistError, Persister, RecordStore, StoreUrl};
