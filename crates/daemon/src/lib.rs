//! Archivist daemon library.
//!
//! Continuous PostgreSQL backup: a control loop schedules basebackups,
//! keeps log streamers alive, applies retention, and moves produced files
//! through compression and upload worker pools.

pub mod alert;
pub mod compression;
pub mod error;
pub mod orchestrator;
pub mod pg;
pub mod producer;
pub mod queue;
pub mod retention;
pub mod scheduler;
pub mod settings;
pub mod state;
pub mod streamer;
pub mod watcher;
pub mod workers;

pub use error::{SiteError, SiteResult};
pub use orchestrator::{Collaborators, ControlMessage, Lifecycle, Orchestrator, OrchestratorHandle};
