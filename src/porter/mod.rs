//! Collect [`MetricRecord`]s from the services of the applications deployed with Porter.

pub mod cache;
pub mod client;
pub mod types;

use crate::record::{MetricRecord, ResourceQuantity, WorkloadKind};
use cache::LocationResolver;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tracing::{instrument, warn};
use types::{Application, ApplicationDetail, Cluster, DeploymentTarget, Service};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to reach the Porter API")]
    Http(#[from] reqwest::Error),

    #[error("Porter API responded with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode the response of {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read-only catalog of one Porter project.
#[allow(async_fn_in_trait)]
pub trait PorterCatalog {
    async fn applications(&self) -> Result<Vec<Application>, Error>;

    async fn application(&self, id: &str) -> Result<ApplicationDetail, Error>;

    /// every target of the project, in one call
    async fn deployment_targets(&self) -> Result<Vec<DeploymentTarget>, Error>;

    /// every cluster of the project, in one call
    async fn clusters(&self) -> Result<Vec<Cluster>, Error>;
}

/// Observer notified as each application is processed.
pub trait Progress {
    /// `current` starts at 1
    fn on_application(&self, current: usize, total: usize, name: &str);

    /// Runs `f` with the progress display hidden, so log lines are not torn.
    fn suspend<F: FnOnce()>(&self, f: F) {
        f()
    }

    fn finish(&self) {}
}

impl Progress for () {
    fn on_application(&self, _current: usize, _total: usize, _name: &str) {}
}

/// Spinner on stderr, cleared once the collection is done or given up.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Spinner { bar }
    }
}

impl Default for Spinner {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for Spinner {
    fn on_application(&self, current: usize, total: usize, name: &str) {
        self.bar.set_length(total as u64);
        self.bar.set_position(current as u64);
        self.bar.set_message(name.to_string());
    }

    fn suspend<F: FnOnce()>(&self, f: F) {
        self.bar.suspend(f)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

/// (desired, max) replicas: the autoscaling bounds when enabled, else the declared instances.
pub fn replica_bounds(service: &Service) -> (i32, i32) {
    match &service.autoscaling {
        Some(autoscaling) if autoscaling.enabled => {
            (autoscaling.min_instances, autoscaling.max_instances)
        }
        _ => (service.instances, service.instances),
    }
}

/// Resources of one instance, memory is read as MiB.
pub fn per_instance(service: &Service) -> ResourceQuantity {
    ResourceQuantity::new(
        (service.cpu_cores * 1000.0) as i64,
        service.ram_megabytes * 1024 * 1024,
    )
}

pub fn service_record(app_name: &str, location: &str, service: &Service) -> MetricRecord {
    let (desired, max) = replica_bounds(service);
    let per_instance = per_instance(service);
    let mut record = MetricRecord::new(
        &format!("{app_name}-{}", service.name),
        location,
        WorkloadKind::Deployment,
    );
    record.current_replicas = service.instances;
    record.desired_replicas = desired;
    record.max_replicas = max;
    record.requests = per_instance.times(i64::from(service.instances));
    record.max_requests = per_instance.times(i64::from(max));
    record
}

/// One record per service of every application (or of the application named `app_name`).
///
/// Failing to list the applications is fatal, a failure on one application only skips it.
#[instrument(skip(catalog, locations, progress, records))]
pub async fn collect_from_porter<C: PorterCatalog, P: Progress>(
    catalog: &C,
    locations: &mut LocationResolver,
    app_name: Option<&str>,
    progress: &P,
    records: &mut Vec<MetricRecord>,
) -> Result<(), crate::Error> {
    let applications = match catalog.applications().await {
        Ok(applications) => applications,
        Err(source) => {
            progress.finish();
            return Err(crate::Error::Porter {
                context: "list applications".to_string(),
                source,
            });
        }
    };
    let total = applications.len();
    for (i, app) in applications.iter().enumerate() {
        progress.on_application(i + 1, total, &app.name);
        if app_name.is_some_and(|n| n != app.name) {
            continue;
        }
        let detail = match catalog.application(&app.id).await {
            Ok(detail) => detail,
            Err(err) => {
                progress.suspend(|| {
                    warn!(application = app.name.as_str(), ?err, "skip application")
                });
                continue;
            }
        };
        let location = locations
            .resolve(catalog, &detail.deployment_target_id)
            .await;
        records.extend(
            detail
                .services
                .iter()
                .map(|service| service_record(&app.name, &location, service)),
        );
    }
    progress.finish();
    Ok(())
}
