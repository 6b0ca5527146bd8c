// Orchestration - classify, dispatch and aggregate across expert services

pub mod aggregator;
pub mod classifier;
pub mod dispatcher;
pub mod experts;
pub mod orchestrator;
pub mod types;

pub use classifier::{CapabilityTable, ClassificationError, Classifier};
pub use dispatcher::{DispatchLimits, Dispatcher};
pub use experts::{ExpertRegistry, RegistrySnapshot};
pub use orchestrator::{Orchestrator, OrchestratorError, RequestState};
pub use types::*;
