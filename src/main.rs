use std::{fs, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{error::ErrorKind, Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wif_bootstrap::config::{project_override, Config, ConfigFile};
use wif_bootstrap::descriptor::RepoId;
use wif_bootstrap::error::ProvisionError;
use wif_bootstrap::gateway::{gcloud::GcloudGateway, memory::MemoryGateway, ProviderGateway};
use wif_bootstrap::reconcile::Reconciler;
use wif_bootstrap::report::{self, Report};

/// Placeholder project number used by `--dry-run`.
const DRY_RUN_PROJECT_NUMBER: &str = "000000000000";

const EXAMPLE: &str = "Example:\n  wif-bootstrap acme/widgets\n  wif-bootstrap --project-id my-proj https://github.com/acme/widgets.git";

#[derive(Parser)]
#[command(
    name = "wif-bootstrap",
    about = "Provision Workload Identity Federation for a GitHub repository",
    version,
    after_help = EXAMPLE
)]
struct Cli {
    /// GitHub repository as owner/repo (URLs and .git suffixes accepted)
    repository: Option<String>,

    /// Target project (falls back to PROJECT_ID, GOOGLE_CLOUD_PROJECT, GCP_PROJECT)
    #[arg(long)]
    project_id: Option<String>,

    /// Deployment region
    #[arg(long, env = "REGION")]
    region: Option<String>,

    /// JSON file overriding resource ids, roles, retry and parallelism
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format on stdout
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Also write the JSON report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Plan and simulate against an in-memory backend; touch nothing
    #[arg(long)]
    dry_run: bool,

    /// Stop dispatching new operations after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    init_tracing(cli.verbose);

    let Some(repository) = cli.repository.clone() else {
        eprintln!("error: missing required argument <REPOSITORY>\n");
        eprintln!("Usage: wif-bootstrap [OPTIONS] <REPOSITORY>\n");
        eprintln!("{EXAMPLE}");
        return ExitCode::from(1);
    };

    match run(cli, &repository).await {
        Ok(code) => code,
        Err(e) => {
            let code = e
                .downcast_ref::<ProvisionError>()
                .map_or(1, ProvisionError::exit_code);
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "wif_bootstrap=debug"
    } else {
        "wif_bootstrap=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::default();
    if let Some(path) = &cli.config {
        config = config.apply_file(ConfigFile::load(path)?);
    }
    let project = project_override(cli.project_id.clone(), |var| std::env::var(var).ok());
    let config = config.with_overrides(project, cli.region.clone());
    config.validate().map_err(ProvisionError::from)?;
    Ok(config)
}

/// Cancels on Ctrl-C, or once `timeout` elapses.
fn install_cancellation(timeout: Option<u64>) -> CancellationToken {
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; no new operations will be started");
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(secs, "timeout reached; no new operations will be started");
            on_timeout.cancel();
        });
    }
    cancel
}

async fn run(cli: Cli, repository: &str) -> Result<ExitCode> {
    let repo = RepoId::parse(repository).map_err(ProvisionError::from)?;
    let config = load_config(&cli)?;

    let gateway: Arc<dyn ProviderGateway> = if cli.dry_run {
        info!("dry run: using the in-memory backend, nothing will be changed");
        Arc::new(MemoryGateway::new(DRY_RUN_PROJECT_NUMBER))
    } else {
        Arc::new(GcloudGateway::new())
    };
    let reconciler = Reconciler::new(config, gateway);
    let cancel = install_cancellation(cli.timeout);

    if cli.dry_run {
        let (plan, _) = reconciler.plan(&repo, &cancel).await?;
        eprint!("Plan for {repo}:\n{plan}");
    }

    let report = reconciler.converge(&repo, cancel).await?;
    emit_output(&cli, &report)?;

    if let Some(identity) = report.identity() {
        info!("store the identity as repository secrets:");
        for cmd in report::secret_commands(&report.repository, identity) {
            info!("  {cmd}");
        }
    }
    Ok(ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(2)))
}

fn emit_output(cli: &Cli, report: &Report) -> Result<()> {
    for w in report.warnings() {
        warn!(key = %w.key, reason = %w.reason, "optional operation did not succeed");
    }

    if cli.format == Format::Json || cli.report.is_some() {
        let doc = report::render_json(report)?;
        let pretty = serde_json::to_string_pretty(&doc)?;
        if let Some(path) = &cli.report {
            fs::write(path, &pretty).with_context(|| format!("write {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        if cli.format == Format::Json {
            println!("{pretty}");
        }
    }

    if cli.format == Format::Text {
        print!("{}", report::render_text(report));
    }
    if !report.is_ready() {
        eprint!("{}", report::render_failures(report));
    }
    Ok(())
}
