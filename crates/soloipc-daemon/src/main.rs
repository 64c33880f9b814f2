//! soloipc daemon host.
//!
//! `serve` hosts one component's root service as a single-instance daemon.
//! `status`, `stop` and `list` talk to daemons that are already running.

mod echo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soloipc_core::config::DaemonConfig;
use soloipc_core::{
    AnnouncementDir, ComponentName, DaemonBuilder, DaemonClient, Launch, ServiceFactories,
    ServiceRegistry,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Parser, Debug)]
#[command(name = "soloipc-daemon")]
#[command(about = "Single-instance service daemon host")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Registry database (defaults to ~/.config/soloipc/registry.db)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the root service for a component, e.g. `soloipc/.Echo`
    Serve {
        component: ComponentName,

        /// Directory for announcement files
        #[arg(long)]
        announce_dir: Option<PathBuf>,
    },
    /// Print the status of a running daemon
    Status { component: ComponentName },
    /// Ask a running daemon to stop
    Stop {
        component: ComponentName,

        /// Send `$terminate` instead of `stop`
        #[arg(long)]
        force: bool,
    },
    /// List registered daemons
    List {
        /// Drop entries whose process is gone first
        #[arg(long)]
        cleanup: bool,
    },
}

fn init_logging(debug: bool) -> FilterHandle {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
    handle
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = init_logging(cli.debug);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let status = match cli.command {
        Command::Serve {
            component,
            announce_dir,
        } => serve(&runtime, component, cli.registry, announce_dir, filter)?,
        Command::Status { component } => {
            runtime.block_on(print_status(open_registry(cli.registry)?, component))?
        }
        Command::Stop { component, force } => {
            runtime.block_on(stop(open_registry(cli.registry)?, component, force))?
        }
        Command::List { cleanup } => list(&open_registry(cli.registry)?, cleanup)?,
    };

    runtime.shutdown_timeout(Duration::from_secs(1));
    std::process::exit(status);
}

fn open_registry(path: Option<PathBuf>) -> Result<ServiceRegistry> {
    let registry = match path {
        Some(path) => ServiceRegistry::open_at(&path)?,
        None => ServiceRegistry::open()?,
    };
    Ok(registry)
}

fn factories() -> ServiceFactories {
    let mut factories = ServiceFactories::new();
    factories.register(echo::CLASS, echo::EchoService::default);
    factories
}

fn serve(
    runtime: &Runtime,
    component: ComponentName,
    registry: Option<PathBuf>,
    announce_dir: Option<PathBuf>,
    filter: FilterHandle,
) -> Result<i32> {
    info!("Starting {}", component);

    let mut builder = DaemonBuilder::new(component.clone())
        .factories(factories())
        .on_verbosity_change(move |verbose| {
            let level = if verbose { "debug" } else { "info" };
            if let Err(e) = filter.reload(EnvFilter::new(level)) {
                warn!("Failed to switch log level to {}: {}", level, e);
            }
        });
    if let Some(path) = registry {
        builder = builder.registry_path(path);
    }
    if let Some(dir) = announce_dir {
        builder = builder.announcer(AnnouncementDir::new(dir));
    }

    let daemon = match runtime.block_on(builder.build())? {
        Launch::Started(daemon) => daemon,
        Launch::Ceded => {
            info!("{} is served by another process", component);
            return Ok(DaemonConfig::EXIT_SUCCESS);
        }
    };

    // Read by launchers that spawn the daemon directly.
    println!("SOLOIPC_PORT={}", daemon.port());

    let handle = daemon.handle();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping");
            let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
        }
    });

    Ok(daemon.run())
}

async fn connect(registry: &ServiceRegistry, component: &ComponentName) -> Result<Option<DaemonClient>> {
    let Some(entry) = registry.lookup(&component.service_name())? else {
        return Ok(None);
    };
    let client = DaemonClient::connect_local(entry.port, entry.pid)
        .await
        .with_context(|| format!("{} is registered but not answering", component))?;
    Ok(Some(client))
}

async fn print_status(registry: ServiceRegistry, component: ComponentName) -> Result<i32> {
    let Some(client) = connect(&registry, &component).await? else {
        println!("{}: not running", component);
        return Ok(DaemonConfig::EXIT_FAILURE);
    };
    let status = client.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(DaemonConfig::EXIT_SUCCESS)
}

async fn stop(registry: ServiceRegistry, component: ComponentName, force: bool) -> Result<i32> {
    let Some(client) = connect(&registry, &component).await? else {
        println!("{}: not running", component);
        return Ok(DaemonConfig::EXIT_FAILURE);
    };
    if force {
        client.terminate().await?;
    } else {
        client.stop().await?;
    }
    println!("{}: stop requested (PID {})", component, client.daemon_pid);
    Ok(DaemonConfig::EXIT_SUCCESS)
}

fn list(registry: &ServiceRegistry, cleanup: bool) -> Result<i32> {
    if cleanup {
        let removed = registry.cleanup_stale()?;
        if removed > 0 {
            info!("Removed {} stale entries", removed);
        }
    }
    for entry in registry.list()? {
        println!(
            "{}\tpid={}\tport={}\t{}",
            entry.name,
            entry.pid,
            entry.port,
            if entry.discoverable { "discoverable" } else { "bound" }
        );
    }
    Ok(DaemonConfig::EXIT_SUCCESS)
}
