//! dedupio node daemon
//!
//! Runs the scheduled chunk garbage collection for one node, and offers
//! one-shot sweep and archive import commands for operators.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dedupio_cluster::{
    ClusterDirectory, CommandRegistry, DirectoryChunkSweeper, GarbageCollector, GcCoordinationLock,
    GcScheduler, GroupDirectory, LocalGroup, RemoveChunksHandler, RequestOptions, SweepPolicy,
    command::tags,
};
use dedupio_common::{Config, EventHandle, EventKind, NodeAddress, StorageNodeRef};
use dedupio_replication::{
    ArchiveImporter, DirectoryArchive, FsMetadataStore, ImportManifest, ImportRegistry,
    ImportRequest, ScanTransferFactory,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dedupio-node")]
#[command(about = "dedupio storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/dedupio/node.toml", env = "DEDUPIO_CONFIG")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon with scheduled garbage collection (default)
    Serve,
    /// Run one garbage collection sweep and exit
    Sweep {
        /// Bypass the soft-delete grace period
        #[arg(long)]
        force: bool,
    },
    /// Import a replicated archive into the local volume
    Import {
        /// Unpacked archive directory
        src: PathBuf,
        /// Destination path inside the volume
        dest: String,
        /// Replication source
        #[arg(long, default_value = "localhost")]
        server: String,
        #[arg(long, default_value_t = dedupio_replication::import::DEFAULT_PORT)]
        port: u16,
        #[arg(long, env = "DEDUPIO_REPLICATION_PASSWORD", default_value = "")]
        password: String,
        #[arg(long, default_value_t = dedupio_replication::import::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        #[arg(long)]
        tls: bool,
        /// Print the manifest as JSON instead of XML
        #[arg(long)]
        json: bool,
    },
}

/// Everything one node runs
struct Node {
    config: Config,
    lock: GcCoordinationLock,
    directory: Arc<GroupDirectory>,
}

impl Node {
    /// Join a single-member group whose only member is this node
    fn start(config: Config) -> Self {
        let address = NodeAddress::new(config.node.name.clone());
        let sweeper = Arc::new(DirectoryChunkSweeper::new(&config.node.chunk_dir));

        let registry = Arc::new(CommandRegistry::new());
        registry.register(
            tags::RUN_REMOVE,
            Arc::new(RemoveChunksHandler::new(address.clone(), sweeper)),
        );

        let mut member = StorageNodeRef::new(address.as_str(), config.node.role);
        for volume in std::iter::once(&config.volume.name).chain(&config.cluster.volumes) {
            if !member.volumes.contains(volume) {
                member = member.with_volume(volume.clone());
            }
        }

        let group = LocalGroup::new();
        group.join(member, registry);
        let directory = Arc::new(GroupDirectory::new(Arc::new(group.endpoint(address))));
        info!(
            "Node {} serving volumes {:?} (coordinator: {})",
            config.node.name,
            directory.volumes(),
            directory.is_coordinator()
        );

        Self {
            config,
            lock: GcCoordinationLock::new(),
            directory,
        }
    }

    fn request_options(&self) -> RequestOptions {
        let cluster = &self.config.cluster;
        let options = if cluster.wait_for_all {
            RequestOptions::all()
        } else {
            RequestOptions::first()
        };
        if cluster.response_timeout_ms > 0 {
            options.with_timeout(Duration::from_millis(cluster.response_timeout_ms))
        } else {
            options
        }
    }

    fn garbage_collector(&self, force: bool) -> GarbageCollector {
        let policy = SweepPolicy {
            min_age: Duration::from_secs(self.config.gc.min_age_secs),
            force: force || self.config.gc.force,
        };
        GarbageCollector::new(self.lock.clone(), self.directory.clone(), policy)
            .with_request_options(self.request_options())
    }

    fn importer(&self) -> ArchiveImporter {
        ArchiveImporter::new(
            self.lock.clone(),
            ImportRegistry::new(),
            Arc::new(FsMetadataStore::new(&self.config.volume.path)),
            Arc::new(DirectoryArchive),
            Arc::new(ScanTransferFactory),
            self.config.volume.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let log_level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting dedupio node");
    info!("Config file: {}", args.config.display());

    if let Some(listen) = config.metrics.listen {
        PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Metrics available at http://{}/metrics", listen);
    }

    let node = Node::start(config);
    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&node).await,
        Command::Sweep { force } => {
            let event = node.garbage_collector(force).run_sweep().await?;
            info!(
                "Sweep finished: {} chunks removed ({:?})",
                event.action_count, event.outcome
            );
            Ok(())
        }
        Command::Import {
            src,
            dest,
            server,
            port,
            password,
            batch_size,
            tls,
            json,
        } => {
            let request = ImportRequest::new(src, dest, server)
                .with_port(port)
                .with_password(password)
                .with_batch_size(batch_size)
                .with_tls(tls);
            let event = EventHandle::new(EventKind::ArchiveImport, "archive import");
            let manifest =
                import(&node.importer(), request, event, tokio::signal::ctrl_c()).await?;
            let rendered = if json {
                manifest.to_json()?
            } else {
                manifest.to_xml()?
            };
            println!("{rendered}");
            Ok(())
        }
    }
}

/// Run one import. When `interrupt` completes first the import is cancelled
/// and its rollback awaited.
async fn import<F>(
    importer: &ArchiveImporter,
    request: ImportRequest,
    event: EventHandle,
    interrupt: F,
) -> Result<ImportManifest>
where
    F: Future + Send,
{
    let id = event.id();
    let running = importer.import_archive(request, event);
    tokio::pin!(running);

    tokio::select! {
        biased;
        result = &mut running => Ok(result?),
        _ = interrupt => {
            warn!("Interrupted, cancelling import {}", id);
            match importer.stop_job(&id) {
                Ok(()) => Ok(running.await?),
                // Not registered yet, so nothing has been staged
                Err(e) => anyhow::bail!("import interrupted before it started: {e}"),
            }
        }
    }
}

async fn serve(node: &Node) -> Result<()> {
    let mut scheduler = if node.config.gc.enabled {
        let gc = Arc::new(node.garbage_collector(false));
        match GcScheduler::start(&node.config.gc.schedule, gc) {
            Ok(scheduler) => Some(scheduler),
            Err(e) => {
                error!("Unable to schedule garbage collection: {}", e);
                None
            }
        }
    } else {
        warn!("Garbage collection schedule disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.stop();
    }
    info!("Node shut down gracefully");
    Ok(())
}
