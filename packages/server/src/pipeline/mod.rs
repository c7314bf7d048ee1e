//! Stream-to-queue routing, the jobs service workers talk to, and the
//! background loops driving both.

pub mod host;
pub mod jobs;
pub mod router;
pub mod sweeper;

pub use host::PipelineHost;
pub use jobs::JobsService;
pub use router::{QueueRouter, RouterError};
pub use sweeper::{STALE_JOB_ERROR, sweep_stale_jobs};
