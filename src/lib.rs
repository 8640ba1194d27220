pub mod metrics;
pub mod porter;
pub mod qty;
pub mod record;
pub mod rollup;
pub mod workload;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use porter::cache::LocationResolver;
use porter::client::{DEFAULT_BASE_URL, PorterClient};
use porter::{Spinner, collect_from_porter};
#[cfg(feature = "prettytable")]
use prettytable::{Cell, Row, Table, format, row};
use record::{MetricRecord, WorkloadKind};
use rollup::{Rollup, ValuationMode, replicas_label};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, instrument, warn};
use workload::{KubeControlPlane, Scope, collect_from_cluster};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{kind} '{name}' not found in {scope}")]
    NotFound {
        kind: &'static str,
        name: String,
        scope: String,
    },

    #[error("Failed to read resource quantities of {location}")]
    ResourceQtyParseError {
        location: String,
        source: qty::Error,
    },

    #[error("Failed to {context}")]
    KubeError {
        context: String,
        source: kube::Error,
    },

    #[error("Failed to {context}")]
    KubeConfigError {
        context: String,
        source: kube::config::KubeconfigError,
    },

    #[error("Failed to {context}")]
    KubeInferConfigError {
        context: String,
        source: kube::config::InferConfigError,
    },

    #[error("Failed to {context}")]
    Porter {
        context: String,
        source: porter::Error,
    },

    #[error("Missing required option {0}")]
    MissingOption(&'static str),

    #[error("Collection did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Failed to write the report")]
    WriteError(#[from] std::io::Error),
}

impl Error {
    /// A 404 on a get becomes [`Error::NotFound`], anything else a [`Error::KubeError`].
    pub fn on_get(source: kube::Error, kind: &'static str, namespace: &str, name: &str) -> Self {
        match source {
            kube::Error::Api(ref response) if response.code == 404 => Error::NotFound {
                kind,
                name: name.to_string(),
                scope: format!("namespace {namespace}"),
            },
            source => Error::KubeError {
                context: format!("get {kind} {namespace}/{name}"),
                source,
            },
        }
    }
}

#[derive(Debug, Eq, PartialEq, ValueEnum, Clone)]
#[allow(non_camel_case_types)]
pub enum Output {
    table,
    csv,
}

#[derive(Parser, Debug)]
#[command(version, about, propagate_version = true)]
pub struct CliOpts {
    /// Value to report: live usage (require metrics-server https://github.com/kubernetes-sigs/metrics-server),
    /// declared requests, or requests at the autoscaler maximum
    #[arg(short, long, value_enum, ignore_case = true, default_value_t = ValuationMode::Requests)]
    pub output: ValuationMode,

    /// Output format
    #[arg(long, value_enum, ignore_case = true, default_value = "table")]
    pub format: Output,

    /// Namespace to report (default: the namespace of the kubeconfig context)
    #[arg(short, long, conflicts_with = "all_namespaces")]
    pub namespace: Option<String>,

    /// Report every namespace
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Only the workload (or Porter application) with this name
    #[arg(short, long, conflicts_with = "selector")]
    pub deployment: Option<String>,

    /// Label selector to filter workloads (e.g. app=web,tier!=cache)
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Report CronJobs too
    #[arg(long = "include-cronjobs")]
    pub include_cron_jobs: bool,

    /// Print only the TOTAL row
    #[arg(long)]
    pub total_only: bool,

    /// The name of the kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Path of the kubeconfig file (default: $KUBECONFIG, then ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Read the services of a Porter project instead of the cluster
    #[arg(long)]
    pub porter: bool,

    /// Porter API token
    #[arg(long, env = "PORTER_TOKEN", hide_env_values = true)]
    pub porter_token: Option<String>,

    /// Porter project id
    #[arg(long, env = "PORTER_PROJECT_ID")]
    pub porter_project_id: Option<String>,

    /// Porter API base url
    #[arg(long, env = "PORTER_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub porter_url: String,

    /// Stop collecting after this many seconds, report what was collected and fail
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

pub async fn new_client(cli_opts: &CliOpts) -> Result<kube::Client, Error> {
    let options = kube::config::KubeConfigOptions {
        context: cli_opts.context.clone(),
        ..Default::default()
    };
    let client_config = match (&cli_opts.kubeconfig, &cli_opts.context) {
        (Some(path), _) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path).map_err(|source| {
                Error::KubeConfigError {
                    context: format!("read the kubeconfig {}", path.display()),
                    source,
                }
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|source| Error::KubeConfigError {
                    context: "create the kube client config".to_string(),
                    source,
                })?
        }
        (None, Some(_)) => kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|source| Error::KubeConfigError {
                context: "create the kube client config".to_string(),
                source,
            })?,
        (None, None) => kube::Config::infer()
            .await
            .map_err(|source| Error::KubeInferConfigError {
                context: "create the kube client config".to_string(),
                source,
            })?,
    };
    info!(cluster_url = client_config.cluster_url.to_string().as_str());
    kube::Client::try_from(client_config).map_err(|source| Error::KubeError {
        context: "create the kube client".to_string(),
        source,
    })
}

/// The workloads selected by the options, `default_namespace` applies unless
/// a namespace (or every namespace) is requested.
pub fn scope_of(cli_opts: &CliOpts, default_namespace: &str) -> Scope {
    let namespace = if cli_opts.all_namespaces {
        None
    } else {
        Some(
            cli_opts
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
        )
    };
    Scope {
        namespace,
        name: cli_opts.deployment.clone(),
        selector: cli_opts.selector.clone(),
        include_cron_jobs: cli_opts.include_cron_jobs,
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, Error> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingOption(name))
}

async fn collect_from_porter_project(
    cli_opts: &CliOpts,
    records: &mut Vec<MetricRecord>,
) -> Result<(), Error> {
    let token = required(&cli_opts.porter_token, "--porter-token (or PORTER_TOKEN)")?;
    let project_id = required(
        &cli_opts.porter_project_id,
        "--porter-project-id (or PORTER_PROJECT_ID)",
    )?;
    if cli_opts.selector.is_some() {
        warn!("--selector is ignored with --porter");
    }
    if cli_opts.include_cron_jobs {
        warn!("--include-cronjobs is ignored with --porter");
    }
    let client = PorterClient::new(cli_opts.porter_url.as_str(), token, project_id).map_err(
        |source| Error::Porter {
            context: "create the Porter client".to_string(),
            source,
        },
    )?;
    let mut locations = LocationResolver::default();
    collect_from_porter(
        &client,
        &mut locations,
        cli_opts.deployment.as_deref(),
        &Spinner::new(),
        records,
    )
    .await
}

/// Appends the records of the selected source to `records`.
pub async fn collect(cli_opts: &CliOpts, records: &mut Vec<MetricRecord>) -> Result<(), Error> {
    if cli_opts.porter {
        collect_from_porter_project(cli_opts, records).await
    } else {
        let client = new_client(cli_opts).await?;
        let scope = scope_of(cli_opts, client.default_namespace());
        let cp = KubeControlPlane::new(client);
        collect_from_cluster(&cp, &scope, records).await
    }
}

/// Runs `collecting` until it completes or `timeout` elapses.
///
/// Records pushed before the deadline stay in the caller's vec.
pub async fn within<F>(timeout: Option<Duration>, collecting: F) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    match timeout {
        Some(deadline) => tokio::time::timeout(deadline, collecting)
            .await
            .map_err(|_| Error::Timeout(deadline))?,
        None => collecting.await,
    }
}

#[instrument(skip(cli_opts))]
pub async fn do_main(cli_opts: &CliOpts) -> Result<(), Error> {
    let mut records = vec![];
    let timeout = cli_opts.timeout.map(Duration::from_secs);
    let collected = within(timeout, collect(cli_opts, &mut records)).await;
    match collected {
        Ok(()) => render(cli_opts, &records),
        Err(err @ Error::Timeout(_)) => {
            warn!(collected = records.len(), "timed out, the report is partial");
            render(cli_opts, &records)?;
            Err(err)
        }
        Err(err) => Err(err),
    }
}

fn render(cli_opts: &CliOpts, records: &[MetricRecord]) -> Result<(), Error> {
    let rollup = rollup::rollup(records, cli_opts.output);
    let location_header = if cli_opts.porter {
        "TARGET"
    } else {
        "NAMESPACE"
    };
    let mut out = std::io::stdout().lock();
    match &cli_opts.format {
        Output::table => display_with_prettytable(
            &mut out,
            &rollup,
            cli_opts.output,
            location_header,
            cli_opts.total_only,
        )?,
        Output::csv => display_as_csv(&mut out, &rollup, cli_opts.output, cli_opts.total_only)?,
    }
    out.flush()?;
    Ok(())
}

pub fn display_as_csv(
    out: &mut impl Write,
    rollup: &Rollup<'_>,
    mode: ValuationMode,
    total_only: bool,
) -> std::io::Result<()> {
    let datetime = Utc::now().to_rfc3339();
    writeln!(
        out,
        "Date,Name,Type,Location,Replicas,CpuMillicores,MemoryBytes"
    )?;
    if !total_only {
        for row in &rollup.rows {
            let record = row.record;
            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                datetime,
                record.name,
                record.kind,
                record.location,
                replicas_label(record, mode),
                row.selected.cpu_millicores,
                row.selected.memory_bytes
            )?;
        }
    }
    writeln!(
        out,
        "{},TOTAL,,,,{},{}",
        datetime, rollup.total.cpu_millicores, rollup.total.memory_bytes
    )
}

#[cfg(not(feature = "prettytable"))]
pub fn display_with_prettytable(
    _out: &mut impl Write,
    _rollup: &Rollup<'_>,
    _mode: ValuationMode,
    _location_header: &str,
    _total_only: bool,
) -> std::io::Result<()> {
    warn!("feature 'prettytable' not enabled");
    Ok(())
}

#[cfg(feature = "prettytable")]
pub fn display_with_prettytable(
    out: &mut impl Write,
    rollup: &Rollup<'_>,
    mode: ValuationMode,
    location_header: &str,
    total_only: bool,
) -> std::io::Result<()> {
    if rollup.rows.is_empty() {
        return writeln!(out, "No deployments found");
    }
    // a TYPE column only when the kinds are mixed
    let with_kind = rollup
        .rows
        .iter()
        .any(|row| row.record.kind == WorkloadKind::CronJob);

    let mut table = Table::new();
    let format = format::FormatBuilder::new()
        .separators(&[], format::LineSeparator::new('-', '+', '+', '+'))
        .padding(1, 1)
        .build();
    table.set_format(format);

    if !total_only {
        let row_titles = if with_kind {
            row![bl->"NAME", bl->"TYPE", bl->location_header, br->"REPLICAS", br->"CPU", br->"MEMORY"]
        } else {
            row![bl->"DEPLOYMENT", bl->location_header, br->"REPLICAS", br->"CPU", br->"MEMORY"]
        };
        table.set_titles(row_titles);

        for row in &rollup.rows {
            let record = row.record;
            let mut cells = vec![Cell::new(&record.name)];
            if with_kind {
                cells.push(Cell::new(&record.kind.to_string()));
            }
            cells.push(Cell::new(&record.location));
            cells.push(Cell::new(&replicas_label(record, mode)).style_spec("r"));
            cells.push(Cell::new(&qty::format_cpu(row.selected.cpu_millicores)).style_spec("r"));
            cells.push(Cell::new(&qty::format_memory(row.selected.memory_bytes)).style_spec("r"));
            table.add_row(Row::new(cells));
        }
    }

    let blank_columns = if with_kind { 3 } else { 2 };
    let mut total = vec![Cell::new("TOTAL").style_spec("b")];
    total.extend((0..blank_columns).map(|_| Cell::new("")));
    total.push(Cell::new(&qty::format_cpu(rollup.total.cpu_millicores)).style_spec("br"));
    total.push(Cell::new(&qty::format_memory(rollup.total.memory_bytes)).style_spec("br"));
    table.add_row(Row::new(total));

    table.print(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ResourceQuantity;
    use pretty_assertions::assert_eq;

    const MI: i64 = 1024 * 1024;

    fn record(name: &str, kind: WorkloadKind, desired: i32, max: i32) -> MetricRecord {
        let mut record = MetricRecord::new(name, "prod", kind);
        record.current_replicas = desired;
        record.desired_replicas = desired;
        record.max_replicas = max;
        record.usage = ResourceQuantity::new(50, 64 * MI);
        record.requests = ResourceQuantity::new(500, 512 * MI);
        if max > desired {
            record.max_requests = ResourceQuantity::new(1500, 1536 * MI);
        }
        record
    }

    fn render_table(records: &[MetricRecord], mode: ValuationMode, total_only: bool) -> String {
        let mut out = Vec::new();
        let rollup = rollup::rollup(records, mode);
        display_with_prettytable(&mut out, &rollup, mode, "NAMESPACE", total_only)
            .expect("write to a Vec");
        String::from_utf8(out).expect("utf8 output")
    }

    fn words(line: &str) -> Vec<&str> {
        line.split_whitespace().collect()
    }

    #[test]
    fn test_table_with_deployments_only() {
        let records = vec![
            record("web", WorkloadKind::Deployment, 2, 6),
            record("api", WorkloadKind::Deployment, 1, 1),
        ];
        let txt = render_table(&records, ValuationMode::Requests, false);
        let lines = txt.lines().collect::<Vec<_>>();
        assert_eq!(
            words(lines[0]),
            vec!["DEPLOYMENT", "NAMESPACE", "REPLICAS", "CPU", "MEMORY"]
        );
        assert_eq!(words(lines[1]), vec!["web", "prod", "2/6", "500m", "512.00", "MB"]);
        assert_eq!(
            words(lines[3]),
            vec!["TOTAL", "1.00", "cores", "1.00", "GB"]
        );
    }

    #[test]
    fn test_table_max_requests() {
        let records = vec![
            record("web", WorkloadKind::Deployment, 2, 6),
            record("api", WorkloadKind::Deployment, 1, 1),
        ];
        let txt = render_table(&records, ValuationMode::MaxRequests, false);
        let lines = txt.lines().collect::<Vec<_>>();
        assert_eq!(words(lines[1]), vec!["web", "prod", "6", "1.50", "cores", "1.50", "GB"]);
        assert_eq!(words(lines[2]), vec!["api", "prod", "1", "500m", "512.00", "MB"]);
        assert_eq!(words(lines[3]), vec!["TOTAL", "2.00", "cores", "2.00", "GB"]);
    }

    #[test]
    fn test_table_with_cron_jobs_has_type_column() {
        let records = vec![
            record("web", WorkloadKind::Deployment, 1, 1),
            record("nightly", WorkloadKind::CronJob, 3, 3),
        ];
        let txt = render_table(&records, ValuationMode::Usage, false);
        let lines = txt.lines().collect::<Vec<_>>();
        assert_eq!(
            words(lines[0]),
            vec!["NAME", "TYPE", "NAMESPACE", "REPLICAS", "CPU", "MEMORY"]
        );
        assert_eq!(words(lines[2]), vec!["nightly", "CronJob", "prod", "3/3", "50m", "64.00", "MB"]);
        assert_eq!(words(lines[3]), vec!["TOTAL", "100m", "128.00", "MB"]);
    }

    #[test]
    fn test_table_total_only() {
        let records = vec![record("web", WorkloadKind::Deployment, 2, 2)];
        let txt = render_table(&records, ValuationMode::Requests, true);
        let lines = txt.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 1);
        assert_eq!(words(lines[0]), vec!["TOTAL", "500m", "512.00", "MB"]);
    }

    #[test]
    fn test_table_empty() {
        let txt = render_table(&[], ValuationMode::Requests, false);
        assert_eq!(txt, "No deployments found\n");
    }

    #[test]
    fn test_csv() {
        let records = vec![
            record("web", WorkloadKind::Deployment, 2, 6),
            record("nightly", WorkloadKind::CronJob, 3, 3),
        ];
        let mode = ValuationMode::MaxRequests;
        let mut out = Vec::new();
        display_as_csv(&mut out, &rollup::rollup(&records, mode), mode, false)
            .expect("write to a Vec");
        let txt = String::from_utf8(out).expect("utf8 output");
        // drop the date column
        let lines = txt
            .lines()
            .map(|l| l.split_once(',').map(|(_, rest)| rest).unwrap_or(l))
            .collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "Name,Type,Location,Replicas,CpuMillicores,MemoryBytes",
                "web,Deployment,prod,6,1500,1610612736",
                "nightly,CronJob,prod,3,500,536870912",
                "TOTAL,,,,2000,2147483648",
            ]
        );
    }

    #[test]
    fn test_scope_of() {
        let opts = CliOpts::parse_from(["kubectl-workload-resources", "-l", "tier=web"]);
        let scope = scope_of(&opts, "team-a");
        assert_eq!(scope.namespace.as_deref(), Some("team-a"));
        assert_eq!(scope.selector.as_deref(), Some("tier=web"));
        assert!(!scope.include_cron_jobs);

        let opts = CliOpts::parse_from([
            "kubectl-workload-resources",
            "-A",
            "-d",
            "web",
            "--include-cronjobs",
        ]);
        let scope = scope_of(&opts, "team-a");
        assert_eq!(scope.namespace, None);
        assert_eq!(scope.name.as_deref(), Some("web"));
        assert!(scope.include_cron_jobs);
    }

    #[test]
    fn test_cli_opts() {
        let opts = CliOpts::parse_from(["kubectl-workload-resources", "-o", "max-requests"]);
        assert_eq!(opts.output, ValuationMode::MaxRequests);
        assert_eq!(opts.format, Output::table);

        let res = CliOpts::try_parse_from(["kubectl-workload-resources", "-n", "a", "-A"]);
        assert!(res.is_err());
        let res = CliOpts::try_parse_from(["kubectl-workload-resources", "-d", "a", "-l", "b=c"]);
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_porter_requires_token() {
        let mut opts = CliOpts::parse_from(["kubectl-workload-resources", "--porter"]);
        opts.porter_token = None;
        opts.porter_project_id = Some("42".to_string());
        let mut records = vec![];
        let res = collect(&opts, &mut records).await;
        assert!(matches!(res, Err(Error::MissingOption(_))));
    }

    #[tokio::test]
    async fn test_deadline_keeps_collected_records() {
        let mut records = vec![];
        let res = within(Some(Duration::from_millis(10)), async {
            records.push(MetricRecord::new("web", "prod", WorkloadKind::Deployment));
            std::future::pending::<()>().await;
            Ok::<_, Error>(())
        })
        .await;
        assert!(matches!(res, Err(Error::Timeout(_))));
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_no_deadline_waits_for_collection() {
        let mut records = vec![];
        let res = within(None, async {
            tokio::task::yield_now().await;
            records.push(MetricRecord::new("web", "prod", WorkloadKind::Deployment));
            Ok::<_, Error>(())
        })
        .await;
        assert!(res.is_ok());
        assert_eq!(records.len(), 1);
    }
}
