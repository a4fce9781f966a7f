use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use docbot_core::{Deployment, FileStore, ObjectKey, PullRequest, ResourceKind, ResourceStore};
use docbot_sync::{
    BatchRefresher, CommitResolver, Deployer, GithubHost, Reconcile, RefreshSummary,
    RepositoryHost,
};
use docbot_workload::WorkloadBuilder;

use crate::config::ControllerConfig;
use crate::error::{io_err, DaemonError};
use crate::paths::{pid_path, resources_root, run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse, CMD_REFRESH, CMD_STATUS, CMD_STOP};
use crate::queue::{Backoff, WorkQueue};

type TaskResult = Result<(), DaemonError>;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Process-wide stop signal. The flag lets blocking work poll it.
#[derive(Clone)]
struct Shutdown {
    tx: broadcast::Sender<()>,
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

/// A reconciler with its own queue and worker pool.
struct Controller {
    reconciler: Arc<dyn Reconcile>,
    queue: Arc<WorkQueue>,
    workers: usize,
    reconciled: AtomicU64,
    failed: AtomicU64,
}

impl Controller {
    fn new(reconciler: Arc<dyn Reconcile>, backoff: Backoff, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            queue: WorkQueue::new(backoff),
            workers,
            reconciled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    fn name(&self) -> &'static str {
        self.reconciler.name()
    }

    fn status(&self) -> Value {
        json!({
            "name": self.name(),
            "workers": self.workers,
            "queue_depth": self.queue.len(),
            "reconciled": self.reconciled.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
        })
    }
}

/// Outcome of one batch refresh, as reported over the socket.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshRecord {
    pub source: String,
    pub finished_at_unix: u64,
    pub duration_ms: u128,
    pub summary: RefreshSummary,
}

struct RefreshJob {
    respond_to: oneshot::Sender<Result<RefreshRecord, String>>,
}

struct Context {
    home: PathBuf,
    config: ControllerConfig,
    controllers: Vec<Arc<Controller>>,
    last_refresh: RwLock<Option<RefreshRecord>>,
    refresh_tx: mpsc::Sender<RefreshJob>,
    shutdown: Shutdown,
    started_at_unix: u64,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Start the supervisor and block the current thread until it exits.
pub fn start_blocking(home: &Path, config: ControllerConfig) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the supervisor against GitHub.
pub async fn run(home: PathBuf, config: ControllerConfig) -> Result<(), DaemonError> {
    let host = Arc::new(GithubHost::new(
        config.github_api_url.clone(),
        config.github_token.clone(),
    ));
    run_with_host(home, config, host).await
}

/// Run the supervisor against any repository host.
pub async fn run_with_host<H: RepositoryHost + 'static>(
    home: PathBuf,
    config: ControllerConfig,
    host: Arc<H>,
) -> Result<(), DaemonError> {
    config.validate()?;
    ensure_runtime_dirs(&home)?;

    // Canonical so watcher paths (real paths on macOS) map back to keys.
    let root = resources_root(&home);
    let root = fs::canonicalize(&root).unwrap_or(root);
    let store = Arc::new(FileStore::with_root(root));

    let backoff = config.backoff();
    let deployer: Arc<dyn Reconcile> = Arc::new(Deployer::new(
        Arc::clone(&store),
        WorkloadBuilder::new(config.workload.clone()),
    ));
    let resolver: Arc<dyn Reconcile> =
        Arc::new(CommitResolver::new(Arc::clone(&store), Arc::clone(&host)));
    let controllers = vec![
        Controller::new(deployer, backoff, config.workers),
        Controller::new(resolver, backoff, config.workers),
    ];
    let refresher = Arc::new(BatchRefresher::new(Arc::clone(&store), host));

    let shutdown = Shutdown::new();
    let (refresh_tx, refresh_rx) = mpsc::channel::<RefreshJob>(16);
    let ctx = Arc::new(Context {
        home: home.clone(),
        config: config.clone(),
        controllers: controllers.clone(),
        last_refresh: RwLock::new(None),
        refresh_tx,
        shutdown: shutdown.clone(),
        started_at_unix: unix_seconds_now(),
    });

    // Watch before the initial resync so no write by the first reconciles is missed.
    let (watcher, events) = start_watcher(store.root())?;
    write_pid_file(&home)?;
    resync(Arc::clone(&store), &controllers).await;

    tracing::info!(
        workers = config.workers,
        enable_pr_sync = config.enable_pr_sync,
        sync_interval_secs = config.sync_interval_secs,
        resources = %store.root().display(),
        "controller started"
    );

    let mut handles: Vec<(&'static str, JoinHandle<TaskResult>)> = Vec::new();

    handles.push(spawn_task(
        "watcher",
        &shutdown,
        watcher_task(
            watcher,
            events,
            Arc::clone(&store),
            controllers.clone(),
            shutdown.subscribe(),
        ),
    ));

    for controller in &controllers {
        for id in 0..controller.workers {
            handles.push(spawn_task(
                "worker",
                &shutdown,
                worker_task(Arc::clone(controller), id),
            ));
        }
    }

    handles.push(spawn_task(
        "queue_closer",
        &shutdown,
        close_queues_on_shutdown(controllers.clone(), shutdown.subscribe()),
    ));

    let interval = config.enable_pr_sync.then(|| config.sync_interval());
    handles.push(spawn_task(
        "refresh",
        &shutdown,
        refresh_task(
            Arc::clone(&ctx),
            refresher,
            interval,
            refresh_rx,
            shutdown.subscribe(),
        ),
    ));

    handles.push(spawn_task(
        "socket_server",
        &shutdown,
        socket_server_task(Arc::clone(&ctx), shutdown.subscribe()),
    ));

    handles.push(spawn_task(
        "signal_handler",
        &shutdown,
        signal_task(shutdown.clone(), shutdown.subscribe()),
    ));

    let mut first_err = None;
    for (task, handle) in handles {
        if let Err(err) = handle_join(task, handle.await) {
            tracing::error!(task, error = %err, "task failed");
            first_err.get_or_insert(err);
        }
    }

    remove_pid_file(&home);
    tracing::info!("controller stopped");
    first_err.map_or(Ok(()), Err)
}

/// Spawn a task that brings the whole process down when it exits.
fn spawn_task<F>(name: &'static str, shutdown: &Shutdown, task: F) -> (&'static str, JoinHandle<TaskResult>)
where
    F: std::future::Future<Output = TaskResult> + Send + 'static,
{
    let shutdown = shutdown.clone();
    let handle = tokio::spawn(async move {
        let result = task.await;
        shutdown.trigger();
        result
    });
    (name, handle)
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

type EventRx = mpsc::UnboundedReceiver<notify::Result<Event>>;

fn start_watcher(root: &Path) -> Result<(RecommendedWatcher, EventRx), DaemonError> {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    tracing::debug!(path = %root.display(), "watching resources");
    Ok((watcher, event_rx))
}

async fn watcher_task(
    _watcher: RecommendedWatcher,
    mut event_rx: EventRx,
    store: Arc<FileStore>,
    controllers: Vec<Arc<Controller>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> TaskResult {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    let Some((kind, key)) = store.locate(&path) else {
                        continue;
                    };
                    let target = match kind {
                        ResourceKind::PullRequest => key,
                        ResourceKind::Deployment => owner_key(Arc::clone(&store), key).await,
                    };
                    tracing::debug!(kind = %kind, key = %target, "change observed");
                    for controller in &controllers {
                        controller.queue.add(target.clone());
                    }
                }
            }
        }
    }
    Ok(())
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Key of the pull request controlling a deployment.
///
/// Falls back to the deployment's own key, which is the owner's key for
/// every deployment this controller creates.
async fn owner_key(store: Arc<FileStore>, key: ObjectKey) -> ObjectKey {
    let lookup = key.clone();
    let owner = tokio::task::spawn_blocking(move || {
        store
            .try_get::<Deployment>(&lookup)
            .ok()
            .flatten()
            .and_then(|dep| {
                dep.metadata
                    .controller_ref()
                    .filter(|owner| owner.kind == ResourceKind::PullRequest.name())
                    .map(|owner| ObjectKey::new(lookup.namespace.clone(), owner.name.clone()))
            })
    })
    .await
    .ok()
    .flatten();
    owner.unwrap_or(key)
}

/// Enqueue every tracked pull request on every controller.
async fn resync(store: Arc<FileStore>, controllers: &[Arc<Controller>]) {
    let listed = tokio::task::spawn_blocking(move || store.list::<PullRequest>(None)).await;
    match listed {
        Ok(Ok(prs)) => {
            tracing::info!(count = prs.len(), "initial resync");
            for pr in prs {
                let key = pr.metadata.key();
                for controller in controllers {
                    controller.queue.add(key.clone());
                }
            }
        }
        Ok(Err(err)) => tracing::error!(error = %err, "initial resync failed"),
        Err(err) => tracing::error!(error = %err, "initial resync join error"),
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn worker_task(controller: Arc<Controller>, id: usize) -> TaskResult {
    let name = controller.name();
    tracing::debug!(controller = name, worker = id, "worker started");
    while let Some(key) = controller.queue.get().await {
        let reconciler = Arc::clone(&controller.reconciler);
        let job_key = key.clone();
        let result = tokio::task::spawn_blocking(move || reconciler.reconcile(&job_key)).await;

        match result {
            Ok(Ok(outcome)) => {
                controller.queue.forget(&key);
                controller.reconciled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(controller = name, key = %key, outcome = %outcome, "reconciled");
            }
            Ok(Err(err)) => {
                controller.failed.fetch_add(1, Ordering::Relaxed);
                let delay = controller.queue.add_rate_limited(key.clone());
                tracing::warn!(
                    controller = name,
                    key = %key,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed; requeued",
                );
            }
            Err(err) => {
                controller.failed.fetch_add(1, Ordering::Relaxed);
                let delay = controller.queue.add_rate_limited(key.clone());
                tracing::error!(
                    controller = name,
                    key = %key,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile panicked; requeued",
                );
            }
        }
        controller.queue.done(&key);
    }
    tracing::debug!(controller = name, worker = id, "worker stopped");
    Ok(())
}

async fn close_queues_on_shutdown(
    controllers: Vec<Arc<Controller>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> TaskResult {
    let _ = shutdown_rx.recv().await;
    for controller in &controllers {
        controller.queue.shutdown();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Batch refresh
// ---------------------------------------------------------------------------

/// Serves refresh requests and, when `interval` is set, the periodic ticker.
/// Passes run one at a time, so they never overlap.
async fn refresh_task<H: RepositoryHost + 'static>(
    ctx: Arc<Context>,
    refresher: Arc<BatchRefresher<FileStore, H>>,
    interval: Option<Duration>,
    mut jobs: mpsc::Receiver<RefreshJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> TaskResult {
    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = next_tick(&mut ticker) => {
                let _ = run_refresh(&ctx, Arc::clone(&refresher), "ticker").await;
            }
            job = jobs.recv() => {
                let Some(job) = job else { break };
                let outcome = run_refresh(&ctx, Arc::clone(&refresher), "socket").await;
                let _ = job.respond_to.send(outcome);
            }
        }
    }
    Ok(())
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_refresh<H: RepositoryHost + 'static>(
    ctx: &Context,
    refresher: Arc<BatchRefresher<FileStore, H>>,
    source: &'static str,
) -> Result<RefreshRecord, String> {
    let started = Instant::now();
    let stop = ctx.shutdown.clone();
    let result =
        tokio::task::spawn_blocking(move || refresher.refresh_until(|| stop.is_requested())).await;

    let summary = match result {
        Ok(Ok(summary)) => summary,
        Ok(Err(err)) => {
            tracing::warn!(source, error = %err, "refresh failed");
            return Err(err.to_string());
        }
        Err(err) => {
            tracing::error!(source, error = %err, "refresh join error");
            return Err(format!("refresh task join error: {err}"));
        }
    };

    let record = RefreshRecord {
        source: source.to_string(),
        finished_at_unix: unix_seconds_now(),
        duration_ms: started.elapsed().as_millis(),
        summary,
    };
    *ctx.last_refresh.write().await = Some(record.clone());
    Ok(record)
}

async fn enqueue_refresh(ctx: &Context) -> Result<RefreshRecord, DaemonError> {
    let (tx, rx) = oneshot::channel();
    ctx.refresh_tx
        .send(RefreshJob { respond_to: tx })
        .await
        .map_err(|_| DaemonError::ChannelClosed("refresh queue"))?;
    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("refresh response"))?;
    outcome.map_err(DaemonError::Protocol)
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn socket_server_task(
    ctx: Arc<Context>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> TaskResult {
    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, ctx: Arc<Context>) -> TaskResult {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = dispatch(&ctx, &request).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == CMD_STOP {
            break;
        }
    }
    Ok(())
}

async fn dispatch(ctx: &Context, request: &DaemonRequest) -> DaemonResponse {
    match request.cmd.as_str() {
        CMD_STATUS => DaemonResponse::ok(build_status_payload(ctx).await),
        CMD_REFRESH => match enqueue_refresh(ctx).await {
            Ok(record) => DaemonResponse::ok(json!(record)),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        CMD_STOP => {
            tracing::info!("stop requested over control socket");
            ctx.shutdown.trigger();
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

async fn build_status_payload(ctx: &Context) -> Value {
    let last_refresh = ctx.last_refresh.read().await.clone();
    let controllers: Vec<Value> = ctx.controllers.iter().map(|c| c.status()).collect();
    let now = unix_seconds_now();

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at_unix": ctx.started_at_unix,
        "uptime_secs": now.saturating_sub(ctx.started_at_unix),
        "enable_pr_sync": ctx.config.enable_pr_sync,
        "sync_interval_secs": ctx.config.sync_interval_secs,
        "controllers": controllers,
        "last_refresh": last_refresh,
        "socket": socket_path(&ctx.home).display().to_string(),
        "resources_root": resources_root(&ctx.home).display().to_string(),
    })
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("control socket flush", e))?;
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "controller socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale controller socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

// ---------------------------------------------------------------------------
// Signals, files, tracing
// ---------------------------------------------------------------------------

async fn signal_task(shutdown: Shutdown, mut shutdown_rx: broadcast::Receiver<()>) -> TaskResult {
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down controller");
                    shutdown.trigger();
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [resources_root(home), run_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn write_pid_file(home: &Path) -> Result<(), DaemonError> {
    let path = pid_path(home);
    fs::write(&path, format!("{}\n", std::process::id())).map_err(|e| io_err(&path, e))
}

fn remove_pid_file(home: &Path) {
    let path = pid_path(home);
    if let Err(err) = fs::remove_file(&path) {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove pid file");
        }
    }
}

/// Pid recorded by a running controller, if any.
pub fn read_pid(home: &Path) -> Option<u32> {
    fs::read_to_string(pid_path(home)).ok()?.trim().parse().ok()
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
