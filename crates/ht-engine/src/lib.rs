// Hypertune tuning engine
// Executions, instances, result storage and the tuner loop

pub mod callbacks;
pub mod checkpoint;
pub mod execution;
pub mod instance;
pub mod model;
pub mod results;
pub mod storage;
pub mod tuner;

pub use callbacks::{CallbackAction, EarlyStopping, TerminateOnNaN, TrainingCallback};
pub use checkpoint::{checkpoint_path, CheckpointTracker};
pub use execution::{average_histories, Execution, ExecutionStatus};
pub use instance::{Instance, InstanceRegistry};
pub use model::{
    FitOptions, HyperModel, HyperModelFn, Logs, SampleCounts, TrainableModel, TrainingSet,
};
pub use results::{InstanceResults, MetricAggregate};
pub use storage::{
    ArtifactCategory, ArtifactLocator, DirectoryMirror, RemoteStore, ResultStore, StorageStats,
};
pub use tuner::{SearchSummary, TerminationReason, Tuner, TunerState};
