//! 同步模块：远端协作方、冲突解决、同步引擎与后台调度

pub mod conflict;
pub mod remote;
pub mod scheduler;
pub mod sync_engine;

pub use conflict::{
    ConflictError, ConflictResolution, ConflictResolver, ConflictStrategy, MergeFn, SyncConflict,
};
pub use remote::{ApplyOutcome, FetchFilter, InMemoryRemoteStore, RemoteRecord, RemoteStore};
pub use scheduler::{SchedulerConfig, SyncScheduler, TickReport};
pub use sync_engine::{
    entity_cache_key, entity_tags, invalidation_tags, ResolveOutcome, SyncCycleReport, SyncEngine,
    SyncEngineConfig, SyncPhase,
};
