use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::config::ServiceName;
use crate::core::archiver::ArchiveSummary;
use crate::core::orchestrator::JobError;

/// One unit of work: archive the volume behind one service's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub service: ServiceName,
    pub container_name: String,
    pub volume_path: PathBuf,
}

impl BackupJob {
    pub fn new(
        service: ServiceName,
        container_name: impl Into<String>,
        volume_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service,
            container_name: container_name.into(),
            volume_path: volume_path.into(),
        }
    }

    /// Final path component of the volume, e.g. `jenkins_home`.
    pub fn volume_base_name(&self) -> String {
        self.volume_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `<backup_directory>/<volume>-backup.zip`
    pub fn archive_path(&self, backup_directory: &Path) -> PathBuf {
        backup_directory.join(format!("{}-backup.zip", self.volume_base_name()))
    }

    /// `<history_directory>/<volume>-backup-<YYYY-MM-DD>.zip`
    pub fn historical_path(&self, history_directory: &Path, date: NaiveDate) -> PathBuf {
        history_directory.join(format!(
            "{}-backup-{}.zip",
            self.volume_base_name(),
            date.format("%Y-%m-%d")
        ))
    }
}

/// Where a job is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Pending,
    Verifying,
    Archiving,
    CopyingHistory,
    Done,
    /// Terminal; the reason is the [`JobError`](crate::core::JobError) the job returned.
    Failed,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Archiving => "archiving",
            Self::CopyingHistory => "copying_history",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What to do with the remaining jobs once one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the run at the first failed job.
    #[default]
    AbortOnFirst,
    /// Attempt every job and report the failures together.
    KeepGoing,
}

/// Per-run settings shared by every job.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub skip_docker_check: bool,
    pub backup_directory: PathBuf,
    pub history_directory: Option<PathBuf>,
    /// Date stamped into historical file names; captured once per run.
    pub run_date: NaiveDate,
    pub failure_policy: FailurePolicy,
    pub run_id: Uuid,
}

impl RunOptions {
    pub fn new(backup_directory: impl Into<PathBuf>, run_date: NaiveDate) -> Self {
        Self {
            skip_docker_check: false,
            backup_directory: backup_directory.into(),
            history_directory: None,
            run_date,
            failure_policy: FailurePolicy::default(),
            run_id: Uuid::now_v7(),
        }
    }
}

/// Artifacts produced by a successful job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub service: ServiceName,
    pub archive_path: PathBuf,
    pub historical_path: Option<PathBuf>,
    pub archive: ArchiveSummary,
    pub elapsed: Duration,
}

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<JobReport>,
    pub failed: Vec<(ServiceName, JobError)>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> BackupJob {
        BackupJob::new(ServiceName::Jenkins, "cicd_jenkins_1", "/srv/jenkins_home")
    }

    #[test]
    fn test_archive_path() {
        assert_eq!(
            job().archive_path(Path::new("/backups")),
            PathBuf::from("/backups/jenkins_home-backup.zip")
        );
    }

    #[test]
    fn test_historical_path_uses_run_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            job().historical_path(Path::new("/history"), date),
            PathBuf::from("/history/jenkins_home-backup-2024-03-07.zip")
        );
    }

    #[test]
    fn test_volume_base_name_ignores_trailing_slash() {
        let job = BackupJob::new(ServiceName::Nexus, "cicd_nexus_1", "/srv/nexus-data/");
        assert_eq!(job.volume_base_name(), "nexus-data");
    }

    #[test]
    fn test_job_stage_display() {
        assert_eq!(JobStage::CopyingHistory.to_string(), "copying_history");
    }
}
