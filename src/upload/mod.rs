pub mod stage;
pub mod walker;
pub mod runner;

pub use stage::{StageExecutor, StageRequest, StageSink, StageSource, StagedFile};
pub use walker::DirectoryWalker;
pub use runner::UploadRunner;
