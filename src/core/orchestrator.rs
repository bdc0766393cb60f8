//! Runs backup jobs: verify the container, archive the volume, then keep a
//! dated copy when a history directory is configured.
//!
//! Jobs run strictly one after another. Nothing is retried; a failed stage
//! fails its job.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::ServiceName;
use crate::core::archiver::{self, ArchiveError, ArchiveTask};
use crate::core::checksum;
use crate::core::container::{
    ContainerRegistry, REQUIRED_STATE, VerificationError, verify_container_state,
};
use crate::core::models::{BackupJob, FailurePolicy, JobReport, JobStage, RunOptions, RunSummary};
use crate::core::progress::ProgressReporter;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("Volume path of '{}' does not exist.", .0.display())]
    VolumeNotFound(PathBuf),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(
        "History directory '{}' does not exist. Must be a valid directory or unset.",
        .0.display()
    )]
    HistoryDirectoryMissing(PathBuf),

    #[error(
        "Failed to copy '{}' to '{}': {source}",
        archive.display(),
        destination.display()
    )]
    HistoryCopyFailed {
        archive: PathBuf,
        destination: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl JobError {
    /// The stage that was running when the job failed.
    pub fn stage(&self) -> JobStage {
        match self {
            Self::Verification(_) | Self::VolumeNotFound(_) => JobStage::Verifying,
            Self::Archive(_) => JobStage::Archiving,
            Self::HistoryDirectoryMissing(_) | Self::HistoryCopyFailed { .. } => {
                JobStage::CopyingHistory
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Backup of service '{service}' failed during {stage}")]
    JobFailed {
        service: ServiceName,
        stage: JobStage,
        #[source]
        source: JobError,
    },

    #[error("{} of {attempted} backup job(s) failed", failed.len())]
    Incomplete {
        attempted: usize,
        failed: Vec<ServiceName>,
    },
}

pub struct Orchestrator {
    options: RunOptions,
    registry: Option<Arc<dyn ContainerRegistry>>,
    progress: Arc<dyn ProgressReporter>,
}

impl Orchestrator {
    /// `registry` may be `None` only when the container check is skipped.
    pub fn new(
        options: RunOptions,
        registry: Option<Arc<dyn ContainerRegistry>>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            options,
            registry,
            progress,
        }
    }

    /// Run every job in order, applying the configured [`FailurePolicy`].
    pub async fn run(&self, jobs: &[BackupJob]) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary::default();

        for job in jobs {
            match self.run_job(job).await {
                Ok(report) => summary.completed.push(report),
                Err(e) => match self.options.failure_policy {
                    FailurePolicy::AbortOnFirst => {
                        return Err(RunError::JobFailed {
                            service: job.service,
                            stage: e.stage(),
                            source: e,
                        });
                    }
                    FailurePolicy::KeepGoing => summary.failed.push((job.service, e)),
                },
            }
        }

        if summary.is_success() {
            Ok(summary)
        } else {
            Err(RunError::Incomplete {
                attempted: jobs.len(),
                failed: summary.failed.iter().map(|(s, _)| *s).collect(),
            })
        }
    }

    /// Back up a single volume.
    pub async fn run_job(&self, job: &BackupJob) -> Result<JobReport, JobError> {
        let span = info_span!(
            "backup_job",
            service = %job.service,
            container = %job.container_name,
            run_id = %self.options.run_id
        );

        async {
            let start_time = Instant::now();
            let mut stage = JobStage::Pending;

            match self.run_stages(job, &mut stage).await {
                Ok((archive_path, historical_path, archive)) => {
                    advance(&mut stage, JobStage::Done);
                    let elapsed = start_time.elapsed();
                    let rounded = Duration::from_secs(elapsed.as_secs());
                    info!(
                        elapsed = %humantime::format_duration(rounded),
                        "Backup job complete"
                    );
                    Ok(JobReport {
                        service: job.service,
                        archive_path,
                        historical_path,
                        archive,
                        elapsed,
                    })
                }
                Err(e) => {
                    error!(stage = %stage, error = %e, "Backup job failed");
                    advance(&mut stage, JobStage::Failed);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        job: &BackupJob,
        stage: &mut JobStage,
    ) -> Result<(PathBuf, Option<PathBuf>, archiver::ArchiveSummary), JobError> {
        let options = &self.options;

        info!(
            "Backing up container '{}' with volume '{}' to '{}'...",
            job.container_name,
            job.volume_path.display(),
            options.backup_directory.display()
        );

        advance(stage, JobStage::Verifying);
        verify_container_state(
            self.registry.as_deref(),
            &job.container_name,
            REQUIRED_STATE,
            options.skip_docker_check,
        )
        .await?;

        if !path_exists(&job.volume_path).await {
            return Err(JobError::VolumeNotFound(job.volume_path.clone()));
        }

        advance(stage, JobStage::Archiving);
        let archive_path = job.archive_path(&options.backup_directory);
        debug!(
            "Zipping directory '{}' to '{}'...",
            job.volume_path.display(),
            archive_path.display()
        );
        let task = ArchiveTask {
            source: job.volume_path.clone(),
            output: archive_path.clone(),
        };
        let archive = archiver::archive_directory_async(task, self.progress.clone()).await?;

        let Some(history_directory) = &options.history_directory else {
            debug!("Skipping copy of historical zip, no history directory configured");
            return Ok((archive_path, None, archive));
        };

        advance(stage, JobStage::CopyingHistory);
        if !is_directory(history_directory).await {
            return Err(JobError::HistoryDirectoryMissing(history_directory.clone()));
        }

        let historical_path = job.historical_path(history_directory, options.run_date);
        info!(
            "Copying zip '{}' to '{}' for historical purposes...",
            archive_path.display(),
            historical_path.display()
        );
        copy_historical(&archive_path, &historical_path).await?;

        Ok((archive_path, Some(historical_path), archive))
    }
}

fn advance(stage: &mut JobStage, next: JobStage) {
    debug!(from = %stage, to = %next, "Job stage");
    *stage = next;
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn is_directory(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Copy the finished archive to its dated location, overwriting any copy from
/// earlier the same day, and confirm the copy is byte-identical.
pub async fn copy_historical(archive: &Path, destination: &Path) -> Result<(), JobError> {
    let archive = archive.to_path_buf();
    let destination = destination.to_path_buf();

    let copy_failed = {
        let archive = archive.clone();
        let destination = destination.clone();
        move |source: io::Error| JobError::HistoryCopyFailed {
            archive,
            destination,
            source,
        }
    };

    tokio::task::spawn_blocking(move || -> io::Result<()> {
        std::fs::copy(&archive, &destination)?;

        let metadata = std::fs::metadata(&archive)?;
        let atime = filetime::FileTime::from_last_access_time(&metadata);
        let mtime = filetime::FileTime::from_last_modification_time(&metadata);
        if let Err(e) = filetime::set_file_times(&destination, atime, mtime) {
            debug!(
                dest = %destination.display(),
                error = %e,
                "Failed to preserve historical copy timestamps"
            );
        }

        if !checksum::files_match(&archive, &destination)? {
            return Err(io::Error::other("copied file does not match the archive"));
        }
        Ok(())
    })
    .await
    .map_err(io::Error::other)
    .and_then(|result| result)
    .map_err(copy_failed)
}
