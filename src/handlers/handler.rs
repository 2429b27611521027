//! Handler abstraction: one implementation per job kind.

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::HandlerError;
use crate::worker::job::{JobKind, JobOutput};

/// Executes the actual work of one job kind.
///
/// Implementations report progress through the [`JobContext`] and return the
/// output on success. An `Err` is recorded on the job as its message; it never
/// reaches the caller that admitted the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job kind this handler serves.
    fn kind(&self) -> JobKind;

    /// Run the job to completion.
    async fn run(&self, ctx: JobContext) -> Result<JobOutput, HandlerError>;
}
