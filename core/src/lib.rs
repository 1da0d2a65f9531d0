pub mod anomaly;
pub mod config;
pub mod error;
pub mod event;
pub mod feature_engine;
pub mod forecast;
pub mod orchestrator;
pub mod query;
pub mod rng;
pub mod run;
pub mod segmentation;
pub mod snapshot;
pub mod store;
pub mod transaction;
pub mod types;
pub mod validator;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use orchestrator::PipelineOrchestrator;
pub use run::{CancelToken, PipelineRun, RunState};
pub use store::ArtifactStore;
