pub mod archiver;
pub mod checksum;
pub mod container;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod selector;

pub use archiver::{ArchiveError, ArchiveSummary, ArchiveTask, archive_directory};
pub use container::{
    ContainerRegistry, ContainerState, ContainerSummary, DockerRegistry, REQUIRED_STATE,
    VerificationError, verify_container_state,
};
pub use models::{BackupJob, FailurePolicy, JobReport, JobStage, RunOptions, RunSummary};
pub use orchestrator::{JobError, Orchestrator, RunError};
pub use progress::{ArchiveProgress, LogProgress, NoProgress, ProgressReporter, TerminalProgress};
pub use selector::select_jobs;
