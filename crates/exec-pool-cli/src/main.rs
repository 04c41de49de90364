//! Exec Pool CLI - provision the exec pool and run commands on it.
//!
//! This is the entry point for the `exec-pool` binary.
//!
//! # Commands
//!
//! - `exec-pool run -c <COMMAND>` - set up the pool, run the command on
//!   randomly chosen pods, tear the pool down
//! - `exec-pool teardown` - delete a pool left behind by an earlier run

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use exec_pool::{
    CommandExecutor, ExecPoolConfig, ExecPoolError, ExecService, K8sCluster, KubectlShell,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exec Pool CLI - shared helper pods for load tests.
#[derive(Parser, Debug)]
#[command(name = "exec-pool")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace that hosts the pool.
    #[arg(long, env = "EXEC_POOL_NAMESPACE")]
    namespace: Option<String>,

    /// Path to the kubectl binary used for exec.
    #[arg(long, env = "EXEC_POOL_KUBECTL", default_value = "kubectl")]
    kubectl: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set up the pool, run a command on pool pods and tear the pool down.
    Run {
        /// Shell command to run.
        #[arg(short, long)]
        command: String,

        /// Number of randomly chosen pods to run the command on.
        #[arg(short = 'n', long, default_value_t = 1)]
        pods: usize,

        /// Number of pool replicas.
        #[arg(long, env = "EXEC_POOL_REPLICAS")]
        replicas: Option<u32>,

        /// Leave the pool running afterwards.
        #[arg(long, default_value = "false")]
        keep: bool,
    },
    /// Delete the pool namespace and wait until it is gone.
    Teardown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,exec_pool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = ExecPoolConfig::from_env();
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }

    match args.command {
        Commands::Run {
            command,
            pods,
            replicas,
            keep,
        } => {
            if let Some(replicas) = replicas {
                config.replicas = replicas;
            }
            run(config, args.kubectl, &command, pods, keep).await
        }
        Commands::Teardown => teardown(config).await,
    }
}

async fn run(
    config: ExecPoolConfig,
    kubectl: PathBuf,
    command: &str,
    pods: usize,
    keep: bool,
) -> anyhow::Result<()> {
    tracing::info!(
        namespace = %config.namespace,
        replicas = config.replicas,
        image = %config.image,
        "Loaded exec pool configuration"
    );

    let cluster = K8sCluster::new(config.namespace_delete_poll_interval)
        .await
        .context("failed to connect to Kubernetes cluster")?;
    let service = Arc::new(ExecService::new(config));
    let executor = Arc::new(CommandExecutor::new(KubectlShell::new().with_binary(kubectl)));

    let cancel = ctrl_c_token();
    if let Err(e) = service.set_up_with_cancellation(&cluster, &cancel).await {
        if keep {
            tracing::error!(error = %e, "Exec pool setup failed, leaving resources in place");
        } else {
            tracing::error!(error = %e, "Exec pool setup failed, cleaning up");
            if let Err(cleanup) = service.tear_down(&cluster).await {
                tracing::error!(error = %cleanup, "Cleanup after failed setup failed");
            }
        }
        return Err(e).context("failed to set up exec pool");
    }

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..pods.max(1) {
        let service = Arc::clone(&service);
        let executor = Arc::clone(&executor);
        let command = command.to_string();
        tasks.spawn(async move {
            let pod = service.get_pod().await?;
            let result = executor.run_command(&pod, &command).await;
            Ok::<_, ExecPoolError>((pod, result))
        });
    }

    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("command task panicked")? {
            Ok((pod, Ok(output))) => {
                println!("==> {pod}");
                print!("{output}");
            }
            Ok((pod, Err(e))) => {
                failures += 1;
                eprintln!("==> {pod}: {e}");
                if let Some(stderr) = e.output() {
                    eprint!("{stderr}");
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("==> no pod: {e}");
            }
        }
    }

    if keep {
        tracing::info!("Leaving exec pool running");
    } else {
        service
            .tear_down(&cluster)
            .await
            .context("failed to tear down exec pool")?;
    }

    anyhow::ensure!(failures == 0, "{failures} command(s) failed");
    Ok(())
}

/// Token cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling exec pool setup");
            trigger.cancel();
        }
    });
    token
}

async fn teardown(config: ExecPoolConfig) -> anyhow::Result<()> {
    let cluster = K8sCluster::new(config.namespace_delete_poll_interval)
        .await
        .context("failed to connect to Kubernetes cluster")?;
    let service = ExecService::new(config);

    service
        .tear_down(&cluster)
        .await
        .context("failed to tear down exec pool")?;
    Ok(())
}
