use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use shotsync::{
    config::Config,
    db,
    engine::{Notifier, Orchestrator, Reconciler},
    mirror::{self, FlatFileMirror, SheetFile},
    models::{Envelope, SyncDirection},
    server::{self, AppState},
    service::RecordService,
    store::RecordStore,
    structure::StructureProvider,
    transport::{HttpPeer, PeerTransport, API_KEY_HEADER},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "shotsync", version, about = "Keeps production records in step between two nodes")]
struct Cli {
    /// Configuration file (defaults to the platform config dir).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node: HTTP surface, startup pass and timer.
    Serve {
        #[arg(long)]
        bind: Option<String>,

        /// Skip the startup pass.
        #[arg(long)]
        no_startup_sync: bool,
    },
    /// Ask the running node for a reconciliation pass.
    Sync {
        /// pull, push or bidirectional
        #[arg(long, short)]
        direction: Option<SyncDirection>,
    },
    /// Show the running node's sync status.
    Status,
    /// Write the store to the flat-file mirror. The node must be stopped.
    ExportMirror {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Seed an empty store from the flat-file mirror. The node must be stopped.
    ImportMirror {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    std::fs::create_dir_all(&config.storage.data_dir)
        .with_context(|| format!("creating {}", config.storage.data_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(&config.storage.data_dir, "shotsync.log");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_appender))
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async move {
        match cli.command {
            Command::Serve { bind, no_startup_sync } => serve(config, bind, !no_startup_sync).await,
            Command::Sync { direction } => remote_sync(&config, direction).await,
            Command::Status => remote_status(&config).await,
            Command::ExportMirror { path } => export_mirror(&config, path).await,
            Command::ImportMirror { path } => import_mirror(&config, path).await,
        }
    })
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<RecordStore>> {
    let handle = db::init(&config.storage.data_dir)
        .await
        .with_context(|| format!("opening database in {}", config.storage.data_dir.display()))?;
    Ok(Arc::new(RecordStore::new(handle)))
}

async fn serve(config: Config, bind: Option<String>, startup_sync: bool) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let mirror: Option<Arc<dyn FlatFileMirror>> = config
        .storage
        .mirror_enabled
        .then(|| Arc::new(SheetFile::new(config.storage.mirror_path())) as Arc<dyn FlatFileMirror>);

    let mut service = RecordService::new(store.clone());
    if let Some(mirror) = &mirror {
        service = service.with_mirror(mirror.clone());
    }

    let mut orchestrator = None;
    match &config.peer {
        Some(peer_config) => {
            let peer: Arc<dyn PeerTransport> = Arc::new(HttpPeer::new(peer_config)?);
            tracing::info!(peer = %peer_config.url, "peer configured");
            let o = Orchestrator::new(Reconciler::new(store.clone(), peer.clone()), config.sync.clone(), mirror.clone());
            if config.sync.notify_peer {
                service = service.with_notifier(Notifier::new(peer, store.clone()));
            }
            service = service.with_orchestrator(o.clone(), config.sync.reconcile_on_mutation);
            orchestrator = Some(o);
        }
        None => tracing::warn!("no [peer] configured, running standalone"),
    }

    let state = AppState {
        service: Arc::new(service),
        structure: StructureProvider::new(config.storage.structure_root.clone()),
        api_key: config.server.api_key.clone(),
    };
    let (server, _) = server::start(state, &bind).with_context(|| format!("binding {bind}"))?;

    if let Some(o) = orchestrator {
        if startup_sync {
            let o = o.clone();
            tokio::spawn(async move {
                if let Err(e) = o.startup().await {
                    tracing::error!(error = %e, "startup pass failed");
                }
            });
        }
        o.spawn_timer();
    }

    server.await.context("server error")
}

fn local_url(config: &Config) -> String {
    let bind = &config.server.bind;
    let bind = bind.strip_prefix("0.0.0.0").map(|port| format!("127.0.0.1{port}")).unwrap_or_else(|| bind.clone());
    format!("http://{bind}")
}

async fn call_local(config: &Config, request: reqwest::RequestBuilder) -> anyhow::Result<serde_json::Value> {
    let request = match &config.server.api_key {
        Some(key) => request.header(API_KEY_HEADER, key),
        None => request,
    };
    let response = request.send().await.with_context(|| format!("is the node running at {}?", local_url(config)))?;
    let status = response.status();
    let envelope: Envelope<serde_json::Value> = response.json().await.context("malformed response")?;
    if !status.is_success() || !envelope.success {
        bail!("{status}: {}", envelope.error.unwrap_or_default());
    }
    Ok(envelope.data.unwrap_or_default())
}

async fn remote_sync(config: &Config, direction: Option<SyncDirection>) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let body = serde_json::json!({ "direction": direction });
    let report = call_local(config, client.post(format!("{}/sync/trigger", local_url(config))).json(&body)).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn remote_status(config: &Config) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let status = call_local(config, client.get(format!("{}/sync/status", local_url(config)))).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn export_mirror(config: &Config, path: Option<PathBuf>) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let sheet = SheetFile::new(path.unwrap_or_else(|| config.storage.mirror_path()));
    let written = mirror::regenerate(&store, &sheet).await?;
    println!("wrote {written} record(s) to {}", sheet.path().display());
    Ok(())
}

async fn import_mirror(config: &Config, path: Option<PathBuf>) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let sheet = SheetFile::new(path.unwrap_or_else(|| config.storage.mirror_path()));
    let report = mirror::import(&store, &sheet).await?;
    println!(
        "imported {} record(s) from {} ({} duplicate row(s) skipped)",
        report.imported,
        sheet.path().display(),
        report.duplicates
    );
    Ok(())
}
