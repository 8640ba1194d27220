//! Collect [`MetricRecord`]s from the cluster: Deployments (with their
//! HorizontalPodAutoscaler) and CronJobs.

use crate::Error;
use crate::metrics::PodMetrics;
use crate::qty;
use crate::record::{MetricRecord, ResourceQuantity, WorkloadKind};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use itertools::Itertools;
use kube::api::{Api, ListParams};
use tracing::{debug, instrument, warn};

/// Read-only lookups against the cluster (apiserver + metrics-server).
#[allow(async_fn_in_trait)]
pub trait ControlPlane {
    async fn deployment(&self, namespace: &str, name: &str) -> Result<Deployment, Error>;

    /// `namespace = None` lists across all namespaces
    async fn deployments(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<Deployment>, Error>;

    async fn cron_job(&self, namespace: &str, name: &str) -> Result<CronJob, Error>;

    async fn cron_jobs(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<CronJob>, Error>;

    /// Scheduled pods matching the label selector.
    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    async fn pod_metrics(&self, namespace: &str, selector: &str)
    -> Result<Vec<PodMetrics>, Error>;

    async fn pod_metrics_by_name(&self, namespace: &str, pod_name: &str)
    -> Result<PodMetrics, Error>;

    async fn autoscalers(&self, namespace: &str) -> Result<Vec<HorizontalPodAutoscaler>, Error>;
}

#[derive(Clone)]
pub struct KubeControlPlane {
    client: kube::Client,
}

impl KubeControlPlane {
    pub fn new(client: kube::Client) -> Self {
        KubeControlPlane { client }
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn list_params(selector: Option<&str>) -> ListParams {
    match selector {
        Some(selector) => ListParams::default().labels(selector),
        None => ListParams::default(),
    }
}

impl ControlPlane for KubeControlPlane {
    async fn deployment(&self, namespace: &str, name: &str) -> Result<Deployment, Error> {
        self.api::<Deployment>(Some(namespace))
            .get(name)
            .await
            .map_err(|source| Error::on_get(source, "deployment", namespace, name))
    }

    async fn deployments(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<Deployment>, Error> {
        let list = self
            .api::<Deployment>(namespace)
            .list(&list_params(selector))
            .await
            .map_err(|source| Error::KubeError {
                context: "list deployments".to_string(),
                source,
            })?;
        Ok(list.items)
    }

    async fn cron_job(&self, namespace: &str, name: &str) -> Result<CronJob, Error> {
        self.api::<CronJob>(Some(namespace))
            .get(name)
            .await
            .map_err(|source| Error::on_get(source, "cronjob", namespace, name))
    }

    async fn cron_jobs(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<CronJob>, Error> {
        let list = self
            .api::<CronJob>(namespace)
            .list(&list_params(selector))
            .await
            .map_err(|source| Error::KubeError {
                context: "list cronjobs".to_string(),
                source,
            })?;
        Ok(list.items)
    }

    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let list = self
            .api::<Pod>(Some(namespace))
            .list(&list_params(Some(selector)))
            .await
            .map_err(|source| Error::KubeError {
                context: format!("list pods in {namespace} with {selector}"),
                source,
            })?;
        Ok(list.items.into_iter().filter(is_scheduled).collect())
    }

    async fn pod_metrics(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodMetrics>, Error> {
        let list = self
            .api::<PodMetrics>(Some(namespace))
            .list(&list_params(Some(selector)))
            .await
            .map_err(|source| Error::KubeError {
                context: "list podmetrics, maybe Metrics API not available".to_string(),
                source,
            })?;
        Ok(list.items)
    }

    async fn pod_metrics_by_name(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<PodMetrics, Error> {
        self.api::<PodMetrics>(Some(namespace))
            .get(pod_name)
            .await
            .map_err(|source| Error::on_get(source, "podmetrics", namespace, pod_name))
    }

    async fn autoscalers(&self, namespace: &str) -> Result<Vec<HorizontalPodAutoscaler>, Error> {
        let list = self
            .api::<HorizontalPodAutoscaler>(Some(namespace))
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::KubeError {
                context: format!("list horizontalpodautoscalers in {namespace}"),
                source,
            })?;
        Ok(list.items)
    }
}

/*
The phase of a Pod is a simple, high-level summary of where the Pod is in its lifecycle.
Pending: accepted by the cluster, maybe not yet bound to a node.
Running: bound to a node, all containers created.
Succeeded / Failed: all containers terminated, they will not be restarted.
Unknown: typically the node is down (kubelet is not responding).

More info: https://kubernetes.io/docs/concepts/workloads/pods/pod-lifecycle#pod-phase
*/

pub fn is_scheduled(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|ps| {
            ps.phase.as_ref().and_then(|phase| match &phase[..] {
                "Succeeded" | "Failed" => Some(false),
                "Running" => Some(true),
                "Unknown" => None,
                "Pending" => ps.conditions.as_ref().map(|o| {
                    o.iter()
                        .any(|c| c.type_ == "PodScheduled" && c.status == "True")
                }),
                &_ => None,
            })
        })
        .unwrap_or(false)
}

/// kube-style string form of a selector (`a=b,c in (d,e),!f`), `None` if it has no requirement.
pub fn format_label_selector(selector: &LabelSelector) -> Option<String> {
    let mut requirements: Vec<(String, String)> = vec![];
    for (key, value) in selector.match_labels.iter().flatten() {
        requirements.push((key.clone(), format!("{key}={value}")));
    }
    for expr in selector.match_expressions.iter().flatten() {
        let mut values = expr.values.clone().unwrap_or_default();
        values.sort();
        let key = &expr.key;
        let txt = match expr.operator.as_str() {
            "In" => format!("{key} in ({})", values.join(",")),
            "NotIn" => format!("{key} notin ({})", values.join(",")),
            "Exists" => key.clone(),
            "DoesNotExist" => format!("!{key}"),
            other => {
                warn!(key = key.as_str(), operator = other, "unsupported label selector operator, ignored");
                continue;
            }
        };
        requirements.push((key.clone(), txt));
    }
    if requirements.is_empty() {
        return None;
    }
    requirements.sort();
    Some(requirements.into_iter().map(|(_, txt)| txt).join(","))
}

/// The declared selector when there is one, else the `app=<name>` convention.
pub fn pod_selector(declared: Option<&LabelSelector>, workload_name: &str) -> String {
    declared
        .and_then(format_label_selector)
        .unwrap_or_else(|| format!("app={workload_name}"))
}

/// Sum of the declared requests of the containers, a missing request counts as zero.
pub fn container_requests(containers: &[Container]) -> Result<ResourceQuantity, qty::Error> {
    let mut sum = ResourceQuantity::default();
    for requests in containers
        .iter()
        .filter_map(|c| c.resources.as_ref().and_then(|r| r.requests.as_ref()))
    {
        if let Some(cpu) = requests.get("cpu") {
            sum.cpu_millicores += qty::kube_millicores(&cpu.0)?;
        }
        if let Some(memory) = requests.get("memory") {
            sum.memory_bytes += qty::kube_bytes(&memory.0)?;
        }
    }
    Ok(sum)
}

fn pod_requests(pod: &Pod) -> Result<ResourceQuantity, qty::Error> {
    pod.spec
        .as_ref()
        .map(|s| container_requests(&s.containers))
        .unwrap_or(Ok(ResourceQuantity::default()))
}

/// Requests at `max_replicas`, extrapolated from the average of the current pods.
///
/// Zero when there is no headroom (`max <= desired`) or no pod to average on.
pub fn project_max_requests(
    requests: ResourceQuantity,
    pod_count: usize,
    desired_replicas: i32,
    max_replicas: i32,
) -> ResourceQuantity {
    if max_replicas > desired_replicas && pod_count > 0 {
        requests
            .per(pod_count as i64)
            .times(i64::from(max_replicas))
    } else {
        ResourceQuantity::default()
    }
}

/// Pods run by one job: completions, else parallelism, else 1.
pub fn job_replicas(completions: Option<i32>, parallelism: Option<i32>) -> i32 {
    completions.or(parallelism).unwrap_or(1)
}

/// `maxReplicas` of the first autoscaler targeting the deployment.
pub fn autoscaler_max_replicas(
    autoscalers: &[HorizontalPodAutoscaler],
    deployment_name: &str,
) -> Option<i32> {
    autoscalers
        .iter()
        .filter_map(|hpa| hpa.spec.as_ref())
        .find(|spec| {
            spec.scale_target_ref.name == deployment_name
                && spec.scale_target_ref.kind == "Deployment"
        })
        .map(|spec| spec.max_replicas)
}

fn parse_error(namespace: &str, name: &str) -> impl FnOnce(qty::Error) -> Error {
    let location = format!("{namespace}/{name}");
    move |source| Error::ResourceQtyParseError { location, source }
}

#[instrument(skip(cp, deployment), fields(namespace = ?deployment.metadata.namespace, name = ?deployment.metadata.name))]
pub async fn deployment_record<C: ControlPlane>(
    cp: &C,
    deployment: &Deployment,
) -> Result<MetricRecord, Error> {
    let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let spec = deployment.spec.as_ref();

    let mut record = MetricRecord::new(&name, &namespace, WorkloadKind::Deployment);
    let replicas = spec.and_then(|s| s.replicas).unwrap_or(0);
    record.desired_replicas = replicas;
    record.max_replicas = replicas;
    record.current_replicas = deployment
        .status
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0);

    let selector = pod_selector(spec.map(|s| &s.selector), &name);
    let pods = match cp.pods(&namespace, &selector).await {
        Ok(pods) => pods,
        Err(err) => {
            warn!(?err, "pods unavailable, requests left at zero");
            vec![]
        }
    };
    record.requests = pods
        .iter()
        .map(pod_requests)
        .sum::<Result<ResourceQuantity, _>>()
        .map_err(parse_error(&namespace, &name))?;

    match cp.pod_metrics(&namespace, &selector).await {
        Ok(pod_metrics) => {
            record.usage = pod_metrics
                .iter()
                .map(PodMetrics::usage)
                .sum::<Result<ResourceQuantity, _>>()
                .map_err(parse_error(&namespace, &name))?;
        }
        Err(err) => warn!(?err, "usage unavailable, left at zero"),
    }

    match cp.autoscalers(&namespace).await {
        Ok(autoscalers) => {
            if let Some(max_replicas) = autoscaler_max_replicas(&autoscalers, &name) {
                record.max_replicas = max_replicas;
                record.max_requests = project_max_requests(
                    record.requests,
                    pods.len(),
                    record.desired_replicas,
                    max_replicas,
                );
            }
        }
        Err(err) => warn!(?err, "autoscalers unavailable, max replicas left at desired"),
    }
    Ok(record)
}

#[instrument(skip(cp, cron_job), fields(namespace = ?cron_job.metadata.namespace, name = ?cron_job.metadata.name))]
pub async fn cron_job_record<C: ControlPlane>(
    cp: &C,
    cron_job: &CronJob,
) -> Result<MetricRecord, Error> {
    let namespace = cron_job.metadata.namespace.clone().unwrap_or_default();
    let name = cron_job.metadata.name.clone().unwrap_or_default();
    let job_spec = cron_job
        .spec
        .as_ref()
        .and_then(|s| s.job_template.spec.as_ref());

    let replicas = job_replicas(
        job_spec.and_then(|s| s.completions),
        job_spec.and_then(|s| s.parallelism),
    );
    let active_jobs = cron_job
        .status
        .as_ref()
        .and_then(|s| s.active.as_deref())
        .unwrap_or_default();

    let mut record = MetricRecord::new(&name, &namespace, WorkloadKind::CronJob);
    record.desired_replicas = replicas;
    record.max_replicas = replicas;
    // every active job is counted at its full size, even while its pods are still starting
    record.current_replicas = replicas * active_jobs.len() as i32;

    let containers = job_spec
        .and_then(|s| s.template.spec.as_ref())
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    record.requests = container_requests(containers)
        .map_err(parse_error(&namespace, &name))?
        .times(i64::from(replicas));
    record.max_requests = record.requests;

    for job_name in active_jobs.iter().filter_map(|job| job.name.as_deref()) {
        let pods = match cp.pods(&namespace, &format!("job-name={job_name}")).await {
            Ok(pods) => pods,
            Err(err) => {
                debug!(job_name, ?err, "skip usage of job");
                continue;
            }
        };
        for pod_name in pods.iter().filter_map(|p| p.metadata.name.as_deref()) {
            match cp.pod_metrics_by_name(&namespace, pod_name).await {
                Ok(pod_metrics) => {
                    record.usage += pod_metrics
                        .usage()
                        .map_err(parse_error(&namespace, &name))?;
                }
                Err(err) => debug!(pod_name, ?err, "skip usage of pod"),
            }
        }
    }
    Ok(record)
}

/// Which workloads to report.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// `None` means every namespace
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub selector: Option<String>,
    pub include_cron_jobs: bool,
}

fn push_or_warn(records: &mut Vec<MetricRecord>, kind: &str, res: Result<MetricRecord, Error>) {
    match res {
        Ok(record) => records.push(record),
        Err(err) => warn!(kind, ?err, "skip workload"),
    }
}

#[instrument(skip(cp, records))]
pub async fn collect_from_cluster<C: ControlPlane>(
    cp: &C,
    scope: &Scope,
    records: &mut Vec<MetricRecord>,
) -> Result<(), Error> {
    collect_deployments(cp, scope, records).await?;
    if scope.include_cron_jobs {
        collect_cron_jobs(cp, scope, records).await?;
    }
    Ok(())
}

async fn collect_deployments<C: ControlPlane>(
    cp: &C,
    scope: &Scope,
    records: &mut Vec<MetricRecord>,
) -> Result<(), Error> {
    match (&scope.name, &scope.namespace) {
        // explicitly requested: any failure is fatal
        (Some(name), Some(namespace)) => {
            let deployment = cp.deployment(namespace, name).await?;
            records.push(deployment_record(cp, &deployment).await?);
        }
        (Some(name), None) => {
            let found = cp
                .deployments(None, None)
                .await?
                .into_iter()
                .filter(|d| d.metadata.name.as_deref() == Some(name.as_str()))
                .collect::<Vec<_>>();
            if found.is_empty() {
                return Err(Error::NotFound {
                    kind: "deployment",
                    name: name.clone(),
                    scope: "any namespace".to_string(),
                });
            }
            for deployment in &found {
                push_or_warn(records, "deployment", deployment_record(cp, deployment).await);
            }
        }
        (None, namespace) => {
            let deployments = cp
                .deployments(namespace.as_deref(), scope.selector.as_deref())
                .await?;
            for deployment in &deployments {
                push_or_warn(records, "deployment", deployment_record(cp, deployment).await);
            }
        }
    }
    Ok(())
}

async fn collect_cron_jobs<C: ControlPlane>(
    cp: &C,
    scope: &Scope,
    records: &mut Vec<MetricRecord>,
) -> Result<(), Error> {
    match (&scope.name, &scope.namespace) {
        (Some(name), Some(namespace)) => match cp.cron_job(namespace, name).await {
            Ok(cron_job) => {
                push_or_warn(records, "cronjob", cron_job_record(cp, &cron_job).await);
            }
            Err(err) => warn!(?err, "skip cronjob"),
        },
        (Some(name), None) => {
            let found = cp
                .cron_jobs(None, None)
                .await?
                .into_iter()
                .filter(|c| c.metadata.name.as_deref() == Some(name.as_str()))
                .collect::<Vec<_>>();
            if found.is_empty() {
                warn!(name = name.as_str(), "no cronjob with this name in any namespace");
            }
            for cron_job in &found {
                push_or_warn(records, "cronjob", cron_job_record(cp, cron_job).await);
            }
        }
        (None, namespace) => {
            let cron_jobs = cp
                .cron_jobs(namespace.as_deref(), scope.selector.as_deref())
                .await?;
            for cron_job in &cron_jobs {
                push_or_warn(records, "cronjob", cron_job_record(cp, cron_job).await);
            }
        }
    }
    Ok(())
}
