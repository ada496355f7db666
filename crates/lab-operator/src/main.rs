//! Lab Operator - grades Kubernetes training exercises against live cluster state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lab_common::crd::Lab;
use lab_common::kube_utils::create_client;
use lab_common::FIELD_MANAGER;
use lab_controller::controller::DEFAULT_MANIFEST_ROOT;
use lab_controller::{error_policy, reconcile, Context, ControllerConfig};

/// Watcher timeout (seconds), kept below the client read timeout so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

const DEFAULT_LOG_FILTER: &str = "info,lab=debug,kube=info";

/// Lab operator - applies broken Lab setups and grades the fixes
#[derive(Parser, Debug)]
#[command(name = "lab-operator", version, about, long_about = None)]
struct Cli {
    /// Print the Lab CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Directory `givenFile` and `expectedFile` resolve against
    #[arg(long, env = "LAB_MANIFEST_ROOT", default_value = DEFAULT_MANIFEST_ROOT)]
    manifest_root: PathBuf,

    /// Seconds between re-grades of an unchanged Lab
    #[arg(long, env = "LAB_REVALIDATE_INTERVAL_SECS", default_value_t = 30)]
    revalidate_interval_secs: u64,

    /// Seconds to wait for deleted resources to disappear
    #[arg(long, env = "LAB_DELETE_TIMEOUT_SECS", default_value_t = 60)]
    delete_timeout_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "LAB_LOG_JSON")]
    log_json: bool,

    /// Don't install or update the Lab CRD on startup
    #[arg(long, env = "LAB_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            manifest_root: self.manifest_root.clone(),
            revalidate_interval: Duration::from_secs(self.revalidate_interval_secs),
            delete_timeout: Duration::from_secs(self.delete_timeout_secs),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Lab::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_json);
    run_controller(cli).await
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Install the Lab CRD with server-side apply so it always matches this build
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Lab CRD...");
    crds.patch(Lab::crd_name(), &params, &Patch::Apply(&Lab::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Lab CRD: {}", e))?;
    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !cli.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let config = cli.controller_config();
    tracing::info!(
        manifest_root = %config.manifest_root.display(),
        revalidate_secs = config.revalidate_interval.as_secs(),
        delete_timeout_secs = config.delete_timeout.as_secs(),
        "Starting Lab controller"
    );

    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());
    let labs: Api<Lab> = Api::all(client);

    Controller::new(labs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Lab"))
        .await;

    tracing::info!("Lab controller stopped");
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
