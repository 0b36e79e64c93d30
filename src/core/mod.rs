pub mod dedup;
pub mod differ;
pub mod engine;
pub mod exclude;
pub mod pool;
pub mod project;
pub mod scanner;
pub mod task;

pub use dedup::{ChangeGuard, GcTrigger};
pub use differ::SnapshotDiff;
pub use engine::{EngineConfig, SyncEngine, TickReport};
pub use exclude::ExcludeSet;
pub use pool::ConnectionPool;
pub use project::{Endpoint, PathMapping, Project};
pub use scanner::{EntryKind, FileIndex, ScannedEntry, TreeScanner, TreeSnapshot};
pub use task::{RemoteOp, SendOrigin, SyncTask, TaskBuilder};
