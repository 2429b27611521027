//! Worker system: job admission, execution and cleanup.
//!
//! Core components:
//! - `job`: Job record, typed requests and handler outputs
//! - `state`: Job state machine (Queued → Processing → Done/Error)
//! - `registry`: In-memory job table and queue positions
//! - `scheduler`: FIFO admission queue and status queries
//! - `pool`: Bounded set of worker loops running handlers
//! - `reaper`: Periodic removal of finished jobs and their files

pub mod job;
pub mod pool;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use job::{
    AudioSource, Job, JobKind, JobOutput, JobRequest, MediaKind, OutputFormat, StemSelection,
    TrackMetadata,
};
pub use pool::WorkerPool;
pub use reaper::{Reaper, spawn_reaper};
pub use registry::{JobRegistry, RegistrySummary};
pub use scheduler::Scheduler;
pub use state::JobStatus;
