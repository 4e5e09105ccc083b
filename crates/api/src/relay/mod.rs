//! Client-to-engine relay: one session per submitted job.

pub mod cached;
pub mod job_names;
pub mod protocol;
pub mod session;

pub use cached::CachedResultDispatcher;
pub use job_names::JobNameRegistry;
pub use session::{RelaySession, SessionState};
