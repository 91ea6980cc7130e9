//! relay-core: tool-calling orchestration, cancellation and the gateway context.

pub mod cancel;
pub mod config;
mod error;
pub mod executor;
pub mod gateway;
pub mod orchestrator;
#[cfg(test)]
mod testing;

pub use cancel::{ActiveStream, CancellationRegistry, StreamId};
pub use config::{Config, ConfigStore};
pub use error::RelayError;
pub use executor::{NoTools, ToolExecutor};
pub use gateway::{CompareEvent, CompareResult, CompareTarget, Gateway};
pub use orchestrator::{
    LoopCompletion, LoopConfig, LoopEvent, LoopEventKind, LoopOutcome, Orchestrator,
    OrchestratorError,
};
