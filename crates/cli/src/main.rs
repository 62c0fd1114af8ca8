use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use knd_core::{build_service_spec, build_workload_spec, StructuralPolicy};
use knd_kubehub::KubeStore;
use knd_ops::{OutputFormat, Pacing, Reconciler, ReconcilerConfig, Reporter};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "knd",
    version,
    about = "knd (Kubernetes NGINX deployer) deploys NGINX on a Kubernetes cluster and reconciles it to the requested state"
)]
struct Cli {
    /// Desired number of replicas
    #[arg(short = 'r', long = "replicas", env = "KND_REPLICAS", default_value_t = 1, allow_negative_numbers = true)]
    replicas: i32,

    /// nginx image tag to deploy
    #[arg(short = 'v', long = "image-version", env = "KND_IMAGE_VERSION", default_value = "1.20.1")]
    image_version: String,

    /// Deployment (and Service) name, e.g. nginx-deployment
    #[arg(short = 'd', long = "name", env = "KND_NAME")]
    name: String,

    /// Delete the deployment and service instead of reconciling them
    #[arg(short = 'D', long = "delete", action = ArgAction::SetTrue)]
    delete: bool,

    /// Kubernetes namespace
    #[arg(long = "ns", env = "KND_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,

    /// YAML file overriding the structural policy (ports, resources, capabilities, labels)
    #[arg(long = "policy", env = "KND_POLICY")]
    policy: Option<PathBuf>,

    /// Per-replica reporting delay after each action, in milliseconds
    #[arg(long = "pace-ms", env = "KND_PACE_MS", default_value_t = 500)]
    pace_ms: u64,

    /// Skip the reporting delay
    #[arg(long = "no-pace", action = ArgAction::SetTrue)]
    no_pace: bool,

    /// Timeout for each API call, in seconds
    #[arg(long = "timeout-secs", env = "KND_CALL_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

impl From<Output> for OutputFormat {
    fn from(o: Output) -> Self {
        match o {
            Output::Human => OutputFormat::Human,
            Output::Json => OutputFormat::Json,
        }
    }
}

impl Cli {
    fn pacing(&self) -> Pacing {
        if self.no_pace || self.pace_ms == 0 {
            Pacing::disabled()
        } else {
            Pacing::per_replica(Duration::from_millis(self.pace_ms))
        }
    }

    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig { namespace: self.namespace.clone(), pacing: self.pacing(), ..ReconcilerConfig::default() }
    }
}

fn init_tracing() {
    let env = std::env::var("KND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KND_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_policy(path: Option<&Path>) -> Result<StructuralPolicy> {
    let Some(path) = path else { return Ok(StructuralPolicy::default()) };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading policy file {}", path.display()))?;
    let policy: StructuralPolicy =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing policy file {}", path.display()))?;
    Ok(policy)
}

/// Returns whether the pass succeeded; setup failures come back as `Err`.
async fn run(cli: Cli) -> Result<bool> {
    let policy = load_policy(cli.policy.as_deref())?;
    let mut reporter = Reporter::new(std::io::stdout(), cli.output.into());

    // Input errors are reported before any cluster access.
    let specs = build_workload_spec(&policy, cli.replicas, &cli.image_version, &cli.name)
        .and_then(|w| build_service_spec(&policy, &cli.name).map(|s| (w, s)));
    let (workload, service) = match specs {
        Ok(v) => v,
        Err(e) => {
            reporter.report(&Err(e))?;
            return Ok(false);
        }
    };

    let client = knd_kubehub::get_kube_client().await?;
    let store = KubeStore::new(client, Duration::from_secs(cli.timeout_secs));
    let reconciler = Reconciler::new(store, cli.reconciler_config());

    info!(name = %cli.name, ns = %cli.namespace, delete = cli.delete, replicas = cli.replicas, image_version = %cli.image_version, "knd invoked");
    let result = if cli.delete {
        reconciler.delete(&cli.name).await
    } else {
        reconciler.reconcile(&workload, &service).await
    };
    reporter.report(&result)?;
    Ok(result.is_ok())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = ?e, "setup failed");
            eprintln!("knd error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_baseline() {
        let cli = Cli::try_parse_from(["knd", "-d", "nginx-deployment"]).expect("parse");
        assert_eq!(cli.replicas, 1);
        assert_eq!(cli.image_version, "1.20.1");
        assert!(!cli.delete);
        assert_eq!(cli.namespace, "default");
        assert_eq!(cli.output, Output::Human);
        assert!(cli.pacing().is_enabled());
    }

    #[test]
    fn name_is_required() {
        assert!(Cli::try_parse_from(["knd"]).is_err());
    }

    #[test]
    fn negative_replicas_parse_so_the_builder_can_reject_them() {
        let cli = Cli::try_parse_from(["knd", "-d", "web", "-r", "-1"]).expect("parse");
        assert_eq!(cli.replicas, -1);
        assert!(build_workload_spec(&StructuralPolicy::default(), cli.replicas, &cli.image_version, &cli.name).is_err());
    }

    #[test]
    fn delete_and_no_pace_flags() {
        let cli = Cli::try_parse_from(["knd", "-d", "web", "-D", "--no-pace", "-o", "json"]).expect("parse");
        assert!(cli.delete);
        assert!(!cli.pacing().is_enabled());
        assert_eq!(OutputFormat::from(cli.output), OutputFormat::Json);
        assert_eq!(cli.reconciler_config().namespace, "default");
    }

    #[test]
    fn missing_policy_file_is_a_setup_error() {
        let err = load_policy(Some(Path::new("/nonexistent/knd-policy.yaml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("reading policy file"), "err={:#}", err);
        assert_eq!(load_policy(None).expect("default"), StructuralPolicy::default());
    }
}
