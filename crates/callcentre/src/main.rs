//! callcentre: Shaken Fist load tester
//!
//! Launches instances that phone home once booted, reports progress until
//! every instance has called in, then removes everything the run created.

use anyhow::{bail, Context as _, Result};
use callcentre::config::RunSettings;
use callcentre::orchestrator::cleanup::{cleanup_namespace, CleanupResult};
use callcentre::orchestrator::provision::is_run_namespace;
use callcentre::orchestrator::{
    LogReporter, Orchestrator, ProgressSnapshot, RunOutcome, RunSummary,
};
use clap::{Parser, Subcommand};
use shakenfist_client::{Client, ClientError};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "callcentre")]
#[command(about = "Launch Shaken Fist instances and wait for them to phone home")]
#[command(version)]
struct Args {
    #[command(flatten)]
    api: ApiArgs,

    #[command(subcommand)]
    command: Command,
}

/// Control-plane credentials
#[derive(clap::Args, Debug)]
struct ApiArgs {
    /// Base URL of the Shaken Fist API
    #[arg(long, env = "SHAKENFIST_API_URL")]
    api_url: String,

    /// Namespace to authenticate as (must be allowed to create namespaces)
    #[arg(long, env = "SHAKENFIST_NAMESPACE", default_value = "system")]
    api_namespace: String,

    /// Key for the authenticating namespace
    #[arg(long, env = "SHAKENFIST_KEY", hide_env_values = true)]
    api_key: String,
}

/// Arguments for the run command (boxed to keep the enum small)
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Number of instances to launch
    #[arg(long, env = "CALLCENTRE_COUNT")]
    count: Option<usize>,

    /// vCPUs per instance
    #[arg(long, env = "CALLCENTRE_CPU")]
    cpu: Option<u32>,

    /// Memory per instance in MiB
    #[arg(long, env = "CALLCENTRE_MEMORY")]
    memory: Option<u32>,

    /// Address the instances use to reach this host
    #[arg(long, env = "CALLCENTRE_IP")]
    ip: Option<String>,

    /// Port the instances phone home on
    /// (default: 8089)
    #[arg(long, env = "CALLCENTRE_CALLBACK_PORT")]
    callback_port: Option<u16>,

    /// Local address for the callback listener (default: 0.0.0.0:<callback-port>)
    #[arg(long, env = "CALLCENTRE_LISTEN")]
    listen: Option<String>,

    /// Boot-config template (default: phone-home.yaml)
    #[arg(long, env = "CALLCENTRE_CLOUDINIT")]
    cloudinit: Option<PathBuf>,

    /// Seconds to wait between launches
    #[arg(long, env = "CALLCENTRE_DELAY")]
    delay: Option<u64>,

    /// Delete each instance as soon as it phones home
    #[arg(long, env = "CALLCENTRE_DEL_CALLBACK")]
    del_callback: bool,

    /// Upper bound on concurrent create-instance calls
    #[arg(long, env = "CALLCENTRE_MAX_CONCURRENT_LAUNCHES")]
    max_concurrent_launches: Option<usize>,

    /// Give up on an instance after this many failed creates (default: never)
    #[arg(long, env = "CALLCENTRE_LAUNCH_MAX_ATTEMPTS")]
    launch_max_attempts: Option<u32>,

    /// Initial backoff between create retries in milliseconds (default: none)
    #[arg(long, env = "CALLCENTRE_LAUNCH_BACKOFF_MS")]
    launch_backoff_ms: Option<u64>,

    /// Seconds between progress reports
    #[arg(long, env = "CALLCENTRE_PROGRESS_INTERVAL")]
    progress_interval: Option<u64>,

    /// Seconds to wait for callbacks before tearing down (default: forever)
    #[arg(long, env = "CALLCENTRE_TIMEOUT")]
    timeout: Option<u64>,

    /// Leave partially provisioned resources behind when setup fails
    #[arg(long, env = "CALLCENTRE_NO_ROLLBACK")]
    no_rollback: bool,

    /// Base image for the root disk
    #[arg(long, env = "CALLCENTRE_DISK_BASE")]
    disk_base: Option<String>,

    /// Root disk size in GiB
    #[arg(long, env = "CALLCENTRE_DISK_SIZE")]
    disk_size: Option<u32>,

    /// TOML file with run settings; flags and environment take precedence
    #[arg(long, env = "CALLCENTRE_CONFIG")]
    config: Option<PathBuf>,
}

impl From<&RunArgs> for RunSettings {
    fn from(args: &RunArgs) -> Self {
        Self {
            count: args.count,
            cpus: args.cpu,
            memory: args.memory,
            callback_host: args.ip.clone(),
            callback_port: args.callback_port,
            listen: args.listen.clone(),
            template: args.cloudinit.clone(),
            delay: args.delay,
            // Unset switches defer to the config file
            delete_on_callback: args.del_callback.then_some(true),
            max_concurrent_launches: args.max_concurrent_launches,
            launch_max_attempts: args.launch_max_attempts,
            launch_backoff_ms: args.launch_backoff_ms,
            progress_interval: args.progress_interval,
            timeout: args.timeout,
            rollback_on_failure: args.no_rollback.then_some(false),
            netblock: None,
            disk_base: args.disk_base.clone(),
            disk_size: args.disk_size,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a load test
    Run(Box<RunArgs>),

    /// Remove what a failed run left behind in a namespace
    Cleanup {
        /// Run namespace to clean up (e.g. loadtest-0a1b2c3d)
        #[arg(long)]
        namespace: String,

        /// Actually delete resources (default is dry-run)
        #[arg(long)]
        execute: bool,

        /// Allow namespaces that were not created by a run
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();

    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }

    if let Some(hint) = e
        .chain()
        .find_map(|cause| cause.downcast_ref::<ClientError>())
        .and_then(ClientError::suggestion)
    {
        let _ = writeln!(stderr, "\n\x1b[36mHint:\x1b[0m {hint}");
    }

    if std::env::var("RUST_BACKTRACE").is_err() {
        let _ = writeln!(
            stderr,
            "\n\x1b[2mSet RUST_BACKTRACE=1 for a detailed backtrace\x1b[0m"
        );
    } else {
        let backtrace = e.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            let _ = writeln!(stderr, "\n\x1b[2mBacktrace:\x1b[0m\n{backtrace}");
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let client = Client::new(&args.api.api_url, &args.api.api_namespace, &args.api.api_key)
        .context("Failed to build API client")?;

    match args.command {
        Command::Run(run_args) => handle_run(client, &run_args).await,
        Command::Cleanup {
            namespace,
            execute,
            force,
        } => handle_cleanup(client, &namespace, execute, force).await,
    }
}

/// Handle the run command
async fn handle_run(client: Client, args: &RunArgs) -> Result<()> {
    let file = match &args.config {
        Some(path) => RunSettings::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => RunSettings::default(),
    };
    let params = RunSettings::from(args).or(file).resolve()?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let count = params.count;
    let orchestrator = Orchestrator::new(client, params, LogReporter::new());
    let summary = orchestrator.run(cancel).await?;
    print_summary(&summary);

    match summary.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Cancelled => {
            info!("Run cancelled by user");
            Ok(())
        }
        RunOutcome::TimedOut => bail!("{}", timeout_message(count, &summary.snapshot)),
    }
}

/// Describe a timed-out run against the number of instances requested
fn timeout_message(count: usize, snapshot: &ProgressSnapshot) -> String {
    format!(
        "Timed out with {} of {} instances not phoned home ({} started, {} outstanding)",
        count.saturating_sub(snapshot.callbacks),
        count,
        snapshot.started,
        snapshot.outstanding_count()
    )
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Run Summary ===");
    println!("Namespace: {}", summary.namespace);
    println!("Outcome:   {}", summary.outcome);
    println!(
        "Started:   {}",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("Elapsed:   {:.1}s", summary.elapsed.as_secs_f64());
    println!();
    println!("Instances started:  {}", summary.snapshot.started);
    println!("Callbacks received: {}", summary.snapshot.callbacks);
    println!("Failed launches:    {}", summary.snapshot.failed_launches);
    println!("Deleted on callback: {}", summary.deleted_on_callback);
    println!();
    println!("Teardown:");
    println!(
        "  Instances: {} ({} removed)",
        summary.teardown.instances, summary.teardown.instances_deleted
    );
    println!("  Network:   {}", summary.teardown.network);
    println!("  Namespace: {}", summary.teardown.namespace);

    if !summary.teardown.is_clean() {
        warn!(namespace = %summary.namespace, "Teardown incomplete");
        println!(
            "\nSome resources were left behind. Remove them with:\n  callcentre cleanup --namespace {} --execute",
            summary.namespace
        );
    }
}

/// Handle the cleanup command
async fn handle_cleanup(client: Client, namespace: &str, execute: bool, force: bool) -> Result<()> {
    if !force && !is_run_namespace(namespace) {
        bail!(
            "Namespace {namespace:?} does not look like a load test namespace \
             (expected {}<hex>); pass --force to clean it up anyway",
            callcentre::orchestrator::NAMESPACE_PREFIX
        );
    }

    let mode = if execute { "EXECUTE" } else { "DRY-RUN" };
    info!(%namespace, mode, force, "Cleaning up load test namespace");

    let report = cleanup_namespace(&client, namespace, execute).await;

    println!("\n=== Cleanup Report ===");
    println!("Mode: {mode}");
    println!("Namespace: {}", report.namespace);
    println!();
    if execute {
        println!(
            "Instances: {} ({} deleted)",
            report.instances,
            report.deleted_instances.len()
        );
        println!(
            "Networks:  {} ({} deleted)",
            report.networks,
            report.deleted_networks.len()
        );
        println!("Namespace: {}", report.namespace_result);
    } else {
        println!("Would delete all instances, all networks, then the namespace.");
        println!();
        println!("Run with --execute to actually delete resources.");
        return Ok(());
    }

    let failed = [report.instances, report.networks, report.namespace_result]
        .into_iter()
        .filter(|r| *r == CleanupResult::Failed)
        .count();
    if failed > 0 {
        bail!("{failed} cleanup step(s) failed; see the log for details");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["callcentre", "--api-url", "http://sf/api", "--api-key", "secret"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_run_flags_map_to_settings() {
        let args = parse(&[
            "run", "--count", "10", "--cpu", "2", "--memory", "1024", "--ip", "10.0.0.5",
            "--del-callback", "--no-rollback", "--launch-max-attempts", "3",
        ]);
        let Command::Run(run_args) = args.command else {
            panic!("expected run command");
        };
        let settings = RunSettings::from(run_args.as_ref());

        assert_eq!(settings.count, Some(10));
        assert_eq!(settings.cpus, Some(2));
        assert_eq!(settings.memory, Some(1024));
        assert_eq!(settings.callback_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(settings.delete_on_callback, Some(true));
        assert_eq!(settings.rollback_on_failure, Some(false));
        assert_eq!(settings.launch_max_attempts, Some(3));
    }

    #[test]
    fn test_unset_switches_defer_to_file() {
        let args = parse(&["run", "--count", "1"]);
        let Command::Run(run_args) = args.command else {
            panic!("expected run command");
        };
        let file = RunSettings::from_toml("delete_on_callback = true\ncpus = 4\n").unwrap();
        let merged = RunSettings::from(run_args.as_ref()).or(file);

        assert_eq!(merged.delete_on_callback, Some(true));
        assert_eq!(merged.cpus, Some(4));
        assert_eq!(merged.count, Some(1));
        assert_eq!(merged.callback_port, None);
    }

    #[test]
    fn test_cleanup_flags() {
        let args = parse(&["cleanup", "--namespace", "loadtest-ab12", "--execute"]);
        match args.command {
            Command::Cleanup {
                namespace,
                execute,
                force,
            } => {
                assert_eq!(namespace, "loadtest-ab12");
                assert!(execute);
                assert!(!force);
            }
            Command::Run(_) => panic!("expected cleanup command"),
        }
    }

    #[test]
    fn test_timeout_message_counts_unlaunched_instances() {
        use callcentre::orchestrator::types::OutstandingEntry;

        // 10 requested, 4 launched, 1 phoned home
        let snapshot = ProgressSnapshot {
            started: 4,
            callbacks: 1,
            failed_launches: 0,
            outstanding: (1..4)
                .map(|index| OutstandingEntry {
                    index,
                    instance_id: format!("uuid-{index}"),
                    node: None,
                })
                .collect(),
        };

        assert_eq!(
            timeout_message(10, &snapshot),
            "Timed out with 9 of 10 instances not phoned home (4 started, 3 outstanding)"
        );
    }
}
