use tracing::debug;

use crate::config::ServiceName;
use crate::core::BackupJob;

/// Restrict `jobs` to the services named in `filter`, keeping the original order.
///
/// No filter selects everything. Names without a configured job are ignored.
pub fn select_jobs(jobs: &[BackupJob], filter: Option<&[ServiceName]>) -> Vec<BackupJob> {
    let Some(filter) = filter else {
        return jobs.to_vec();
    };

    jobs.iter()
        .filter(|job| {
            let included = filter.contains(&job.service);
            if !included {
                debug!(
                    "Not including service '{}' due to a '--service' flag that does not include it",
                    job.service
                );
            }
            included
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jobs() -> Vec<BackupJob> {
        vec![
            BackupJob::new(ServiceName::Jenkins, "cicd_jenkins_1", "/srv/jenkins_home"),
            BackupJob::new(ServiceName::Nexus, "cicd_nexus_1", "/srv/nexus-data"),
        ]
    }

    fn services(jobs: &[BackupJob]) -> Vec<ServiceName> {
        jobs.iter().map(|j| j.service).collect()
    }

    #[test]
    fn test_no_filter_selects_all_in_order() {
        let selected = select_jobs(&jobs(), None);
        assert_eq!(
            services(&selected),
            vec![ServiceName::Jenkins, ServiceName::Nexus]
        );
    }

    #[test]
    fn test_single_service_filter() {
        let selected = select_jobs(&jobs(), Some(&[ServiceName::Nexus]));
        assert_eq!(services(&selected), vec![ServiceName::Nexus]);
    }

    #[test]
    fn test_order_follows_jobs_not_filter() {
        let selected = select_jobs(&jobs(), Some(&[ServiceName::Nexus, ServiceName::Jenkins]));
        assert_eq!(
            services(&selected),
            vec![ServiceName::Jenkins, ServiceName::Nexus]
        );
    }

    #[test]
    fn test_filter_without_matching_job() {
        let only_jenkins = vec![BackupJob::new(
            ServiceName::Jenkins,
            "cicd_jenkins_1",
            "/srv/jenkins_home",
        )];
        let selected = select_jobs(&only_jenkins, Some(&[ServiceName::Nexus]));
        assert!(selected.is_empty());
    }

    #[test]
    fn test_empty_filter_selects_nothing() {
        let selected = select_jobs(&jobs(), Some(&[]));
        assert!(selected.is_empty());
    }
}
