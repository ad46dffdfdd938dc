//! Computation worker channel.
//!
//! - **channel**: `WorkerChannel` - execute code on a persistent subprocess
//! - **id**: correlation id generation
//! - **spawner**: how the subprocess is started

pub mod channel;
pub mod id;
pub mod spawner;

pub use channel::{
    DEFAULT_RESPONSE_TIMEOUT, ExecuteError, Variables, WorkerChannel, WorkerConfig, WorkerError,
    WorkerState, WorkerStatus,
};
pub use id::IdGenerator;
pub use spawner::{CommandSpawner, SpawnError, WorkerSpawner};
