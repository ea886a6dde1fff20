//! Command execution core
//!
//! This module handles:
//! - Persisting commands and querying them by status
//! - Tracking the single running command and its cancellation token
//! - Gating automatic dequeue with the processing lock
//! - Dispatching each command to the executor for its type

pub mod executor;
pub mod processing_lock;
pub mod repository;
pub mod running;
pub mod service;

pub use executor::{CommandExecutor, ExecutorDeps, ExecutorRouter};
pub use processing_lock::ProcessingLock;
pub use repository::{CommandRepository, InMemoryCommandRepository, ListCommandsParams, Page};
pub use running::{CancelableCommand, RunningCommandRegistry};
pub use service::CommandService;
