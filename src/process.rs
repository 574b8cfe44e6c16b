use crate::config::BackendSettings;
use crate::error::{GatewayError, Result};
use crate::site::{BackendConfig, BackendKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long the exit watcher lets the readers flush remaining output
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// State of a backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Slot reserved, process being spawned
    Starting,
    Running,
    /// Kill requested, waiting for the exit watcher
    Stopping,
    Stopped,
}

struct BackendInstance {
    state: BackendState,
    generation: u64,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

/// Receiving end of a backend's stdout/stderr lines.
///
/// Clones share the same underlying channel; each line is delivered once.
#[derive(Clone)]
pub struct LogChannel {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
}

impl LogChannel {
    fn new(rx: mpsc::Receiver<String>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Next line, or `None` once the process has exited and every
    /// buffered line has been read
    pub async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

/// Launches and tracks one backend child process per site.
///
/// Used behind an `Arc`: each process gets an exit-watcher task that
/// holds a reference back to the supervisor for cleanup.
pub struct BackendSupervisor {
    settings: BackendSettings,
    instances: Mutex<HashMap<String, BackendInstance>>,
    logs: Mutex<HashMap<String, (u64, LogChannel)>>,
    next_generation: AtomicU64,
}

impl BackendSupervisor {
    pub fn new(settings: BackendSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            instances: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Start the backend of `site` unless it is already starting or running.
    ///
    /// The log channel is registered before this returns.
    pub fn launch(self: &Arc<Self>, site: &str, backend: &BackendConfig) -> Result<()> {
        if backend.entry_file.trim().is_empty() {
            return Err(GatewayError::EmptyBackendFile(site.to_string()));
        }

        // Reserve the slot, then spawn outside the lock
        let generation = {
            let mut instances = self.instances.lock();
            if let Some(existing) = instances.get(site) {
                if matches!(
                    existing.state,
                    BackendState::Starting | BackendState::Running | BackendState::Stopping
                ) {
                    debug!(site, state = ?existing.state, "Backend already active, skipping launch");
                    return Ok(());
                }
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            instances.insert(
                site.to_string(),
                BackendInstance {
                    state: BackendState::Starting,
                    generation,
                    pid: None,
                    kill_tx: None,
                    watcher: None,
                },
            );
            generation
        };

        let mut child = match self.spawn_child(site, backend) {
            Ok(child) => child,
            Err(e) => {
                self.forget(site, generation);
                return Err(e);
            }
        };
        let pid = child.id();
        info!(site, pid, entry = %backend.entry_path().display(), "Backend process spawned");

        let (line_tx, line_rx) = mpsc::channel(self.settings.log_capacity);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, line_tx.clone()));
        }
        drop(line_tx);

        self.logs
            .lock()
            .insert(site.to_string(), (generation, LogChannel::new(line_rx)));

        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(Arc::clone(self).watch_exit(
            site.to_string(),
            generation,
            child,
            kill_rx,
            readers,
        ));

        let mut instances = self.instances.lock();
        match instances.get_mut(site) {
            Some(instance)
                if instance.generation == generation && instance.state == BackendState::Starting =>
            {
                instance.state = BackendState::Running;
                instance.pid = pid;
                instance.kill_tx = Some(kill_tx);
                instance.watcher = Some(watcher);
            }
            _ => {
                debug!(site, "Backend stopped while starting, killing it");
                let _ = kill_tx.send(());
            }
        }
        Ok(())
    }

    fn spawn_child(&self, site: &str, backend: &BackendConfig) -> Result<Child> {
        let program = match backend.kind {
            BackendKind::Node => &self.settings.node_command,
        };

        let mut cmd = Command::new(program);
        cmd.arg(backend.entry_path());
        cmd.current_dir(&backend.dir);
        cmd.env("PORT", backend.internal_port.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd.spawn().map_err(|source| GatewayError::Spawn {
            site: site.to_string(),
            source,
        })
    }

    async fn watch_exit(
        self: Arc<Self>,
        site: String,
        generation: u64,
        mut child: Child,
        mut kill_rx: oneshot::Receiver<()>,
        readers: Vec<JoinHandle<()>>,
    ) {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => info!(site = %site, ?status, "Backend process exited"),
                Err(e) => warn!(site = %site, error = %e, "Error waiting for backend"),
            },
            Ok(()) = &mut kill_rx => {
                terminate(&site, &mut child, self.settings.stop_grace_period()).await;
            }
        }

        self.set_state(&site, generation, BackendState::Stopped);

        let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, futures::future::join_all(readers))
            .await
            .is_err()
        {
            debug!(site = %site, "Log readers still busy, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        {
            let mut logs = self.logs.lock();
            if logs.get(&site).map(|(g, _)| *g) == Some(generation) {
                logs.remove(&site);
            }
        }
        self.forget(&site, generation);
    }

    /// Drop the instance record of `site` if it still belongs to `generation`
    fn forget(&self, site: &str, generation: u64) {
        let mut instances = self.instances.lock();
        if instances.get(site).map(|i| i.generation) == Some(generation) {
            instances.remove(site);
        }
    }

    fn set_state(&self, site: &str, generation: u64, state: BackendState) {
        if let Some(instance) = self.instances.lock().get_mut(site) {
            if instance.generation == generation {
                instance.state = state;
            }
        }
    }

    /// Kill the backend of `site` and wait until its cleanup has finished.
    /// Does nothing when no backend runs for the site.
    pub async fn stop(&self, site: &str) {
        let (kill_tx, watcher) = {
            let mut instances = self.instances.lock();
            match instances.get_mut(site) {
                Some(instance) => {
                    // A launch still spawning sees this and kills its child
                    if matches!(instance.state, BackendState::Starting | BackendState::Running) {
                        instance.state = BackendState::Stopping;
                    }
                    (instance.kill_tx.take(), instance.watcher.take())
                }
                None => return,
            }
        };

        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!(site, error = %e, "Backend exit watcher failed");
            }
        }
    }

    pub async fn stop_all(&self) {
        let sites: Vec<String> = self.instances.lock().keys().cloned().collect();
        futures::future::join_all(sites.iter().map(|site| self.stop(site))).await;
    }

    pub fn log_channel(&self, site: &str) -> Option<LogChannel> {
        self.logs.lock().get(site).map(|(_, channel)| channel.clone())
    }

    pub fn state(&self, site: &str) -> BackendState {
        self.instances
            .lock()
            .get(site)
            .map(|i| i.state)
            .unwrap_or(BackendState::Stopped)
    }

    pub fn is_running(&self, site: &str) -> bool {
        matches!(
            self.state(site),
            BackendState::Starting | BackendState::Running
        )
    }

    pub fn pid(&self, site: &str) -> Option<u32> {
        self.instances.lock().get(site).and_then(|i| i.pid)
    }

    /// Sites whose backend is starting or running, sorted
    pub fn active_backends(&self) -> Vec<String> {
        let mut sites: Vec<String> = self
            .instances
            .lock()
            .iter()
            .filter(|(_, i)| matches!(i.state, BackendState::Starting | BackendState::Running))
            .map(|(site, _)| site.clone())
            .collect();
        sites.sort();
        sites
    }
}

fn spawn_reader<R>(stream: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    })
}

/// Kill immediately, or SIGTERM first when a grace period is configured
async fn terminate(site: &str, child: &mut Child, grace_period: Duration) {
    #[cfg(unix)]
    if !grace_period.is_zero() {
        if let Some(pid) = child.id() {
            info!(site, pid, "Sending SIGTERM to backend");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            match tokio::time::timeout(grace_period, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(site, ?status, "Backend exited gracefully");
                    return;
                }
                Ok(Err(e)) => warn!(site, error = %e, "Error waiting for backend to exit"),
                Err(_) => warn!(
                    site,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, killing backend"
                ),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace_period;

    match child.kill().await {
        Ok(()) => info!(site, "Backend killed"),
        Err(e) => warn!(site, error = %e, "Failed to kill backend"),
    }
}
