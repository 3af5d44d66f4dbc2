mod collective;
mod data;
mod errors;
pub mod process;
mod runtime;
mod state;
mod trainer;

pub use collective::{Collective, CollectiveError, LocalCollective};
pub use data::{Batch, DataSource, SyntheticData};
pub use errors::WorkerError;
pub use runtime::{WorkerConfig, WorkerContext, WorkerRuntime};
pub use state::ShardState;
pub use trainer::{DummyTrainer, ShardTrainer, StepOutput};
