use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use projsync_core::{ProjectMetadata, StoreClient};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sync::engine::{EngineConfig, SyncEngine};
use crate::sync::fs_store::FsProjectStore;
use crate::sync::local_watcher::{LocalEvent, start_notify_watcher};
use crate::sync::paths::{local_path_for, project_path_for};
use crate::sync::store::{DurableStore, StoreError};
use crate::sync::vfs::{MemoryVfs, ObservedFs, VirtualFs};

const DEFAULT_PROJECTS_DIR_NAME: &str = "Projects";
const DEFAULT_TICK_SECS: u64 = 5;
const DEFAULT_MAX_PERMANENT_ATTEMPTS: u64 = 5;
const DEFAULT_LOAD_CONCURRENCY: u64 = 4;

type ProjectEngine<S> = SyncEngine<S, MemoryVfs>;
type ProjectFs<S> = ObservedFs<MemoryVfs, ProjectEngine<S>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreTarget {
    Http {
        base_url: String,
        token: Option<String>,
    },
    Directory(PathBuf),
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub project_id: String,
    pub workdir: PathBuf,
    pub store: StoreTarget,
    pub engine: EngineConfig,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let project_id = std::env::var("PROJSYNC_PROJECT").context("PROJSYNC_PROJECT is not set")?;
        let workdir = std::env::var("PROJSYNC_WORKDIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| default_workdir(&home, &project_id));
        let store = match std::env::var("PROJSYNC_STORE_DIR") {
            Ok(dir) => StoreTarget::Directory(expand_with_home(&dir, &home)),
            Err(_) => StoreTarget::Http {
                base_url: std::env::var("PROJSYNC_STORE_URL")
                    .context("set PROJSYNC_STORE_URL or PROJSYNC_STORE_DIR")?,
                token: std::env::var("PROJSYNC_TOKEN").ok().filter(|t| !t.is_empty()),
            },
        };
        let max_permanent_failures = u32::try_from(read_u64_env(
            "PROJSYNC_MAX_PERMANENT_ATTEMPTS",
            DEFAULT_MAX_PERMANENT_ATTEMPTS,
        ))
        .unwrap_or(u32::MAX);
        let load_concurrency = usize::try_from(read_u64_env(
            "PROJSYNC_LOAD_CONCURRENCY",
            DEFAULT_LOAD_CONCURRENCY,
        ))
        .unwrap_or(usize::MAX);
        let engine = EngineConfig {
            tick_interval: Duration::from_secs(
                read_u64_env("PROJSYNC_TICK_SECS", DEFAULT_TICK_SECS).max(1),
            ),
            max_permanent_failures,
            load_concurrency,
            flush_on_unbind: read_bool_env("PROJSYNC_FLUSH_ON_UNBIND", true),
        };

        Ok(Self {
            project_id,
            workdir,
            store,
            engine,
            enable_local_watcher: read_bool_env("PROJSYNC_ENABLE_LOCAL_WATCHER", true),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonMode {
    /// Mirror the working directory and sync until interrupted.
    Watch,
    /// Upload the working directory once and exit.
    Flush,
}

/// Opens the configured store and runs the daemon in `mode`.
pub async fn launch(config: DaemonConfig, mode: DaemonMode) -> anyhow::Result<()> {
    match config.store.clone() {
        StoreTarget::Http { base_url, token } => {
            let mut client = StoreClient::new(&base_url)
                .with_context(|| format!("invalid store url {base_url}"))?;
            if let Some(token) = token {
                client = client.with_token(token);
            }
            DaemonRuntime::bootstrap(config, Arc::new(client))
                .await?
                .execute(mode)
                .await
        }
        StoreTarget::Directory(root) => {
            let store = FsProjectStore::new(&root);
            ensure_local_project(&store, &config.project_id).await?;
            DaemonRuntime::bootstrap(config, Arc::new(store))
                .await?
                .execute(mode)
                .await
        }
    }
}

async fn ensure_local_project(store: &FsProjectStore, project_id: &str) -> anyhow::Result<()> {
    match store.project(project_id).await {
        Ok(_) => Ok(()),
        Err(StoreError::ProjectNotFound(_)) => {
            info!(project = project_id, root = %store.root().display(), "creating project in local store");
            store
                .create_project(&ProjectMetadata::named(project_id, project_id))
                .await
                .context("failed to create project")
        }
        Err(err) => Err(err).context("failed to open project"),
    }
}

pub struct DaemonRuntime<S> {
    config: DaemonConfig,
    engine: ProjectEngine<S>,
}

impl<S: DurableStore> DaemonRuntime<S> {
    pub async fn bootstrap(config: DaemonConfig, store: Arc<S>) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.workdir)
            .await
            .with_context(|| format!("failed to create workdir at {:?}", config.workdir))?;

        let metadata = store
            .project(&config.project_id)
            .await
            .with_context(|| format!("failed to fetch project {}", config.project_id))?;
        let engine = SyncEngine::new(store, Arc::new(MemoryVfs::new()), config.engine.clone());
        engine.bind(Some(metadata)).await;

        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &ProjectEngine<S> {
        &self.engine
    }

    pub async fn execute(self, mode: DaemonMode) -> anyhow::Result<()> {
        match mode {
            DaemonMode::Watch => self.run().await,
            DaemonMode::Flush => self.flush().await,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            project = %self.config.project_id,
            workdir = %self.config.workdir.display(),
            local_watcher = self.config.enable_local_watcher,
            "projsyncd started"
        );

        let report = self
            .engine
            .load_initial(&self.config.project_id)
            .await
            .context("failed to load project files")?;
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "some project files could not be loaded");
        }
        let fs = self.engine.observed_fs();
        let written = materialize_workdir(fs.inner().as_ref(), &self.config.workdir).await?;
        info!(loaded = report.loaded, written, "workdir materialized");

        let status_task = spawn_status_logger(&self.engine);

        let watcher = if self.config.enable_local_watcher {
            Some(
                start_notify_watcher(&self.config.workdir)
                    .context("failed to start local watcher")?,
            )
        } else {
            None
        };

        match watcher {
            Some((_watcher, mut events)) => loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        if let Err(err) = apply_local_event(&fs, &self.config.workdir, event).await {
                            warn!(error = %err, "failed to apply local change");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            },
            None => {
                tokio::signal::ctrl_c()
                    .await
                    .context("failed to wait for ctrl-c")?;
            }
        }

        info!("shutting down");
        self.engine.dispose().await;
        status_task.abort();
        Ok(())
    }

    /// Reads the whole working directory and persists it in one batch.
    pub async fn flush(self) -> anyhow::Result<()> {
        let fs = self.engine.observed_fs();
        let imported = import_workdir(fs.inner().as_ref(), &self.config.workdir).await?;
        let result = self.engine.flush_now().await;
        self.engine.dispose().await;
        let sent = result.context("flush failed")?;
        info!(imported, sent, project = %self.config.project_id, "flush finished");
        Ok(())
    }
}

fn spawn_status_logger<S: DurableStore>(engine: &ProjectEngine<S>) -> JoinHandle<()> {
    let mut status = engine.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!(
                project = current.project_id().unwrap_or("-"),
                syncing = current.syncing,
                last_synced = %current.last_synced_label(),
                "sync status"
            );
        }
    })
}

/// Writes every file of the virtual filesystem into `workdir`, skipping
/// files whose content already matches.
async fn materialize_workdir<F: VirtualFs>(fs: &F, workdir: &Path) -> anyhow::Result<usize> {
    let mut written = 0;
    for file in fs.list_with_contents() {
        let local = local_path_for(workdir, &file.path)?;
        if let Ok(existing) = tokio::fs::read(&local).await
            && existing == file.content
        {
            continue;
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, &file.content)
            .await
            .with_context(|| format!("failed to write {}", local.display()))?;
        written += 1;
    }
    Ok(written)
}

/// Copies every file under `workdir` into `fs` without notifying anyone.
async fn import_workdir<F: VirtualFs>(fs: &F, workdir: &Path) -> anyhow::Result<usize> {
    let mut imported = 0;
    for local in collect_files(workdir).await? {
        let Some(path) = project_path_for(workdir, &local) else {
            continue;
        };
        let content = tokio::fs::read(&local)
            .await
            .with_context(|| format!("failed to read {}", local.display()))?;
        fs.write(&path, content)?;
        imported += 1;
    }
    Ok(imported)
}

async fn apply_local_event<S: DurableStore>(
    fs: &ProjectFs<S>,
    workdir: &Path,
    event: LocalEvent,
) -> anyhow::Result<()> {
    match event {
        LocalEvent::Write { path } => upload_local_path(fs, workdir, &path).await,
        LocalEvent::Delete { path } => {
            remove_project_path(fs, &path);
            Ok(())
        }
        LocalEvent::Move { from, to } => {
            remove_project_path(fs, &from);
            upload_local_path(fs, workdir, &to).await
        }
    }
}

/// Pushes the on-disk content of `path` (a file or a whole directory)
/// through the observed filesystem when it differs from what is known.
async fn upload_local_path<F: VirtualFs>(fs: &F, workdir: &Path, path: &str) -> anyhow::Result<()> {
    let local = local_path_for(workdir, path)?;
    let Ok(metadata) = tokio::fs::metadata(&local).await else {
        debug!(path, "local path vanished before upload");
        return Ok(());
    };
    let files = if metadata.is_dir() {
        collect_files(&local).await?
    } else {
        vec![local]
    };
    for local in files {
        let Some(path) = project_path_for(workdir, &local) else {
            continue;
        };
        let content = match tokio::fs::read(&local).await {
            Ok(content) => content,
            Err(err) => {
                debug!(path = %path, error = %err, "skipping unreadable local file");
                continue;
            }
        };
        if fs.read(&path).as_deref() == Some(content.as_slice()) {
            continue;
        }
        fs.write(&path, content)?;
    }
    Ok(())
}

/// Removes `path`, or everything below it when it names a directory.
fn remove_project_path<F: VirtualFs>(fs: &F, path: &str) {
    if fs.remove(path).is_ok() {
        return;
    }
    let prefix = format!("{}/", path.trim_end_matches('/'));
    for file in fs.list_with_contents() {
        if file.path.starts_with(&prefix) {
            let _ = fs.remove(&file.path);
        }
    }
}

async fn collect_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
