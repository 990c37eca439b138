//! Command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use relaybox_backend::{HttpBackend, MemoryBackend, StorageBackend};
use relaybox_protocol::{TransferState, UploadedFile};
use relaybox_session::{TransferEvent, TransferManager, TransferOutput};
use relaybox_transfer::Gateway;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RelayConfig;

/// Shared state for one CLI invocation.
pub struct Context {
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
}

impl Context {
    pub fn new(config: &RelayConfig, memory: bool) -> anyhow::Result<Self> {
        let backend: Arc<dyn StorageBackend> = if memory {
            warn!("using the in-memory backend; nothing is persisted");
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(HttpBackend::new(config.http_config()?)?)
        };
        info!(backend = backend.name(), "backend ready");

        let gateway = Gateway::new(
            backend,
            config.transport_config(),
            Arc::new(config.server_secret()?),
            config.upload_options(),
            config.download_options(),
        );

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling transfers");
                on_signal.cancel();
            }
        });

        Ok(Self {
            gateway: Arc::new(gateway),
            cancel,
        })
    }
}

fn default_manifest_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".relaybox.json");
    PathBuf::from(name)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into())
}

fn write_manifest(file: &UploadedFile, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(file)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(manifest = %path.display(), file_id = %file.file_id, "manifest written");
    Ok(())
}

/// Writes the config file at `path`, keeping any values already in it that
/// are not given here. Environment overrides are never persisted.
pub fn init(
    path: &Path,
    bot_token: Option<String>,
    chat_id: Option<String>,
    server_secret: Option<String>,
) -> anyhow::Result<()> {
    let mut config = if path.exists() {
        RelayConfig::load_from(path)?
    } else {
        RelayConfig::default()
    };
    if let Some(token) = bot_token {
        config.bot_token = token;
    }
    if let Some(chat_id) = chat_id {
        config.chat_id = chat_id;
    }
    if let Some(secret) = server_secret {
        config.server_secret = secret;
    }
    if !config.server_secret.is_empty() {
        config.server_secret()?;
    }

    config.save_to(path)?;
    info!(path = %path.display(), "config written");
    Ok(())
}

pub async fn upload(ctx: &Context, path: &Path, manifest: Option<PathBuf>) -> anyhow::Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file = ctx
        .gateway
        .upload_file(&data, &display_name(path), &ctx.cancel)
        .await?;

    let manifest = manifest.unwrap_or_else(|| default_manifest_path(path));
    write_manifest(&file, &manifest)?;
    info!(
        chunks = file.total_chunks,
        bytes = file.size,
        "upload finished"
    );
    Ok(())
}

pub async fn download(ctx: &Context, manifest: &Path, out: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(manifest)
        .await
        .with_context(|| format!("reading {}", manifest.display()))?;
    let file: UploadedFile = serde_json::from_str(&content)
        .with_context(|| format!("parsing manifest {}", manifest.display()))?;

    let data = ctx.gateway.download_file(&file, &ctx.cancel).await?;
    tokio::fs::write(out, &data)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    info!(out = %out.display(), bytes = data.len(), "download finished");
    Ok(())
}

pub async fn batch(ctx: &Context, config: &RelayConfig, paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut manager = TransferManager::new(ctx.gateway.clone(), config.manager_config());
    let mut events = manager
        .take_events()
        .context("event stream already taken")?;

    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Progress {
                    id,
                    chunk_index,
                    progress,
                } => info!(
                    transfer = %id,
                    chunk = chunk_index,
                    done = progress.chunks_completed,
                    total = progress.total_chunks,
                    percent = progress.percentage().round() as u64,
                    bytes_per_sec = progress.throughput_bps as u64,
                    eta_ms = ?progress.eta_ms,
                    "progress"
                ),
                TransferEvent::StateChanged { id, state, failure } => match failure {
                    Some(f) => warn!(transfer = %id, state = %state, error = %f, "state changed"),
                    None => info!(transfer = %id, state = %state, "state changed"),
                },
                TransferEvent::Removed { id } => info!(transfer = %id, "removed"),
            }
        }
    });

    let mut queued = Vec::with_capacity(paths.len());
    for path in paths {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let id = manager.enqueue_upload(display_name(path), data).await?;
        queued.push((id, path));
    }

    let cancel_all = async {
        ctx.cancel.cancelled().await;
        for (id, _) in &queued {
            let _ = manager.cancel(*id).await;
        }
    };
    let settle_all = async {
        let mut failed = 0usize;
        for (id, path) in &queued {
            let record = manager.wait_settled(*id).await?;
            match record.state {
                TransferState::Completed => {
                    if let TransferOutput::Uploaded(file) = manager.output(*id).await? {
                        write_manifest(&file, &default_manifest_path(path))?;
                    }
                }
                state => {
                    failed += 1;
                    match record.failure {
                        Some(f) => error!(path = %path.display(), state = %state, error = %f, "transfer failed"),
                        None => error!(path = %path.display(), state = %state, "transfer did not complete"),
                    }
                }
            }
        }
        anyhow::Ok(failed)
    };

    let failed = tokio::select! {
        result = settle_all => result?,
        _ = cancel_all => {
            anyhow::bail!("batch interrupted");
        }
    };

    manager.shutdown();
    drop(manager);
    let _ = logger.await;

    if failed > 0 {
        anyhow::bail!("{failed} of {} transfers failed", queued.len());
    }
    info!(files = queued.len(), "batch finished");
    Ok(())
}
