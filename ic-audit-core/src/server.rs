//! The audit collector server
//!
//! ## Lifecycle
//!
//! ```text
//! Starting ──► Listening ──► Stopping ──► Stopped
//!  (load        (accept loop,   (stop accepting,
//!   snapshot,    periodic        drain connections,
//!   bind)        snapshots)      final snapshot)
//! ```
//!
//! Every accepted connection gets its own task, which decodes frames and
//! appends them to the [`Store`] until the client closes. A malformed frame,
//! an oversized frame, or an idle timeout drops that connection only. Nothing
//! is ever written back to clients.
//!
//! Snapshots are taken on a timer (skipped when nothing changed), after each
//! dump, after pruning, and at shutdown. A failed snapshot is logged and the
//! server keeps running with its in-memory state intact.
//!
//! The operator hooks (`dump_now`, `dump_all`, `compact_dump`, `prune`,
//! `save_snapshot`) are synchronous and write files with fsync. Call them from
//! a plain thread, through [`BlockingServer`], or inside
//! `tokio::task::spawn_blocking` when on a runtime.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::config::ServerConfig;
use crate::dump::{DumpReport, DumpWindow, Dumper};
use crate::error::{Error, Result};
use crate::persistence::SnapshotFile;
use crate::store::Store;
use crate::transport::FrameReader;

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Listening,
    Stopping,
    Stopped,
}

/// Writes snapshots, skipping the write when the store has not changed.
struct Persister {
    file: SnapshotFile,
    /// Store revision captured by the last successful save; also serializes saves
    last_saved: StdMutex<Option<u64>>,
}

impl Persister {
    fn new(file: SnapshotFile, loaded_revision: u64) -> Self {
        Self {
            file,
            last_saved: StdMutex::new(Some(loaded_revision)),
        }
    }

    /// Returns whether a snapshot was written.
    fn flush(&self, store: &Store) -> Result<bool> {
        let mut last_saved = self
            .last_saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let revision = store.revision();
        if *last_saved == Some(revision) {
            return Ok(false);
        }

        let trails = store.snapshot();
        self.file.save(&trails)?;
        *last_saved = Some(revision);
        Ok(true)
    }
}

/// State shared between the server handle and its tasks.
struct Shared {
    config: ServerConfig,
    store: Store,
    persister: Persister,
    dumper: Dumper,
}

impl Shared {
    fn snapshot_logged(&self, reason: &str) {
        match self.persister.flush(&self.store) {
            Ok(true) => tracing::debug!(reason, "Snapshot written"),
            Ok(false) => {}
            Err(e) => tracing::warn!(reason, error = %e, "Snapshot failed, keeping in-memory state"),
        }
    }
}

struct ServerTasks {
    accept: JoinHandle<()>,
    snapshots: JoinHandle<()>,
}

/// A running audit collector.
pub struct AuditServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    state: watch::Sender<ServerState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Option<ServerTasks>>,
}

impl AuditServer {
    /// Load the snapshot, bind the listener and start accepting connections.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ServerState::Starting);

        let file = SnapshotFile::new(config.snapshot_path());
        let loader = file.clone();
        let trails = tokio::task::spawn_blocking(move || loader.load_or_recover())
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let store = Store::from_trails(trails, config.event_cap());
        tracing::info!(
            path = %file.path().display(),
            projects = store.project_count(),
            events = store.len(),
            "Loaded audit trails"
        );

        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let persister = Persister::new(file, store.revision());
        let shared = Arc::new(Shared {
            dumper: Dumper::new(config.dump.clone()),
            config,
            store,
            persister,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            shutdown_rx.clone(),
        ));
        let snapshots = tokio::spawn(snapshot_loop(Arc::clone(&shared), shutdown_rx));

        state.send_replace(ServerState::Listening);
        tracing::info!(addr = %local_addr, "Audit server is ready to receive data");

        Ok(Self {
            shared,
            local_addr,
            state,
            shutdown,
            tasks: Mutex::new(Some(ServerTasks { accept, snapshots })),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    pub fn snapshot_path(&self) -> &Path {
        self.shared.persister.file.path()
    }

    /// Write the trailing-window JSON dump, then snapshot.
    ///
    /// Blocking file I/O; see the module docs.
    pub fn dump_now(&self) -> Result<DumpReport> {
        self.dump(self.shared.dumper.default_window())
    }

    /// Write a JSON dump of every stored event, then snapshot.
    pub fn dump_all(&self) -> Result<DumpReport> {
        self.dump(DumpWindow::All)
    }

    fn dump(&self, window: DumpWindow) -> Result<DumpReport> {
        let trails = self.shared.store.snapshot();
        let report = self.shared.dumper.write_json(&trails, window)?;
        self.shared.snapshot_logged("dump");
        Ok(report)
    }

    /// Write the compact text dump, optionally limited to some projects.
    pub fn compact_dump(&self, project_filters: &[String]) -> Result<DumpReport> {
        let trails = self.shared.store.snapshot();
        self.shared.dumper.write_compact(&trails, project_filters)
    }

    /// Drop every event of `event_type`; snapshots when anything was removed.
    pub fn prune(&self, event_type: &str) -> usize {
        let removed = self.shared.store.prune_event_type(event_type);
        if removed > 0 {
            tracing::info!(event_type, removed, "Pruned events");
            self.shared.snapshot_logged("prune");
        }
        removed
    }

    /// Snapshot now if the store changed since the last save.
    pub fn save_snapshot(&self) -> Result<bool> {
        self.shared.persister.flush(&self.shared.store)
    }

    /// Stop accepting, drain connections within the grace period and write
    /// the final snapshot. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };

        self.state.send_replace(ServerState::Stopping);
        tracing::info!("Shutting down audit server");
        self.shutdown.send_replace(true);

        for (name, task) in [("accept", tasks.accept), ("snapshot", tasks.snapshots)] {
            if let Err(e) = task.await {
                tracing::warn!(task = name, error = %e, "Server task ended abnormally");
            }
        }

        let shared = Arc::clone(&self.shared);
        let flushed = tokio::task::spawn_blocking(move || shared.persister.flush(&shared.store))
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
            .and_then(|result| result);

        self.state.send_replace(ServerState::Stopped);
        match flushed {
            Ok(_) => {
                tracing::info!(
                    path = %self.snapshot_path().display(),
                    events = self.store().len(),
                    "Audit server stopped"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Final snapshot failed");
                Err(e)
            }
        }
    }
}

impl Drop for AuditServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Connection established");
                    let shared = Arc::clone(&shared);
                    connections.spawn(async move {
                        handle_connection(stream, peer, &shared).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "Connection task failed");
                }
            }
        }
    }

    drop(listener);

    let grace = shared.config.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            remaining = connections.len(),
            "Aborting connections still open after grace period"
        );
        connections.abort_all();
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: &Shared) {
    let mut frames = FrameReader::new(stream, shared.config.max_frame_bytes);
    let read_timeout = shared.config.read_timeout();
    let mut received = 0usize;

    loop {
        match tokio::time::timeout(read_timeout, frames.next_envelope()).await {
            Ok(Ok(Some(envelope))) => {
                tracing::debug!(
                    %peer,
                    project = %envelope.project_name,
                    event_type = %envelope.event_type,
                    "Received event"
                );
                let evicted = shared.store.append(envelope);
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted oldest events over the per-project cap");
                }
                received += 1;
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                tracing::warn!(%peer, error = %e, "Dropping connection after invalid frame");
                break;
            }
            Err(_) => {
                tracing::warn!(%peer, timeout = ?read_timeout, "Dropping idle connection");
                break;
            }
        }
    }

    tracing::debug!(%peer, received, "Client disconnected");
}

async fn snapshot_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.snapshot_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and the store was just loaded.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let shared = Arc::clone(&shared);
                if let Err(e) = tokio::task::spawn_blocking(move || shared.snapshot_logged("periodic")).await {
                    tracing::warn!(error = %e, "Periodic snapshot task failed");
                }
            }
        }
    }
}

/// Synchronous wrapper for [`AuditServer`]
///
/// Owns a multi-threaded runtime so blocking callers (the CLI) can run the
/// server and call its hooks from plain threads.
pub struct BlockingServer {
    inner: AuditServer,
    runtime: tokio::runtime::Runtime,
}

impl BlockingServer {
    pub fn start(config: ServerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("ic-audit-server")
            .build()?;
        let inner = runtime.block_on(AuditServer::start(config))?;
        Ok(Self { inner, runtime })
    }

    pub fn server(&self) -> &AuditServer {
        &self.inner
    }

    pub fn dump_now(&self) -> Result<DumpReport> {
        self.inner.dump_now()
    }

    /// Stop the server (blocking)
    pub fn shutdown(&self) -> Result<()> {
        self.runtime.block_on(self.inner.shutdown())
    }
}
