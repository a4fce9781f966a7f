//! Runs the whole supervisor in a temp home against an in-memory host.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use docbot_core::{Deployment, FileStore, ObjectKey, PullRequest, ResourceStore};
use docbot_daemon::{paths, read_pid, request_refresh, request_status, request_stop, ControllerConfig};
use docbot_sync::host::fake::RecordingHost;
use docbot_workload::commit_slot;
use tempfile::TempDir;

const URL: &str = "https://github.com/acme/widgets/pull/42";

fn config() -> ControllerConfig {
    ControllerConfig {
        enable_pr_sync: true,
        sync_interval_secs: 1,
        workers: 1,
        requeue_backoff_ms: 10,
        requeue_max_ms: 100,
        ..ControllerConfig::default()
    }
}

async fn eventually<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.expect("join")
}

fn deployed_commit(store: &FileStore, key: &ObjectKey) -> Option<String> {
    let dep: Deployment = store.try_get(key).ok()??;
    commit_slot(&dep).map(str::to_owned)
}

fn start(
    home: &Path,
    host: Arc<RecordingHost>,
) -> impl Future<Output = Result<Result<(), docbot_daemon::DaemonError>, tokio::task::JoinError>> {
    let home = home.to_path_buf();
    tokio::spawn(docbot_daemon::run_with_host(home, config(), host))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tracked_pull_request_converges_and_follows_pushes() {
    let home = TempDir::new().expect("home");
    let store = FileStore::at(home.path());
    let key = ObjectKey::new("default", "acme-widgets-pr-42");
    store.create(&PullRequest::new(&key, URL)).expect("track");

    let host = Arc::new(RecordingHost::new());
    host.set_head("acme/widgets", 42, "deadbeef");
    let supervisor = start(home.path(), Arc::clone(&host));

    let commit = eventually("initial deployment", || {
        deployed_commit(&store, &key).filter(|c| !c.is_empty())
    })
    .await;
    assert_eq!(commit, "deadbeef");

    let mut dep: Deployment = store.get(&key).expect("deployment");
    dep.status.available_replicas = 1;
    store.update(&dep).expect("mark available");
    let link = eventually("preview link", || {
        let pr: PullRequest = store.get(&key).ok()?;
        (!pr.status.preview_link.is_empty()).then_some(pr.status.preview_link)
    })
    .await;
    assert_eq!(
        link,
        "https://acme-widgets-pr-42.serveo.net/pkg/github.com/acme/widgets"
    );

    host.set_head("acme/widgets", 42, "cafef00d");
    eventually("rolled deployment", || {
        deployed_commit(&store, &key).filter(|c| c == "cafef00d")
    })
    .await;

    let status_home = home.path().to_path_buf();
    let status = blocking(move || request_status(&status_home))
        .await
        .expect("status");
    assert_eq!(status["running"], true);
    assert_eq!(status["controllers"].as_array().map(Vec::len), Some(2));
    assert_eq!(read_pid(home.path()), Some(std::process::id()));

    let refresh_home = home.path().to_path_buf();
    let refresh = blocking(move || request_refresh(&refresh_home))
        .await
        .expect("refresh");
    assert_eq!(refresh["summary"]["groups"], 1);
    assert_eq!(refresh["summary"]["updated"], 0);

    let stop_home = home.path().to_path_buf();
    blocking(move || request_stop(&stop_home)).await.expect("stop");
    tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .expect("supervisor exits")
        .expect("join")
        .expect("clean exit");

    assert!(!paths::socket_path(home.path()).exists());
    assert_eq!(read_pid(home.path()), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_tracked_pull_request_removes_preview() {
    let home = TempDir::new().expect("home");
    let store = FileStore::at(home.path());
    let key = ObjectKey::new("default", "acme-widgets-pr-7");
    let host = Arc::new(RecordingHost::new());
    host.set_head("acme/widgets", 7, "abc123");
    let supervisor = start(home.path(), Arc::clone(&host));

    // The socket is bound after the watcher is live.
    let socket = paths::socket_path(home.path());
    eventually("control socket", || socket.exists().then_some(())).await;

    store
        .create(&PullRequest::new(
            &key,
            "https://github.com/acme/widgets/pull/7",
        ))
        .expect("track");
    eventually("deployment", || deployed_commit(&store, &key)).await;

    store.delete::<PullRequest>(&key).expect("delete");
    assert!(store.try_get::<Deployment>(&key).expect("get").is_none());

    let stop_home = home.path().to_path_buf();
    blocking(move || request_stop(&stop_home)).await.expect("stop");
    tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .expect("supervisor exits")
        .expect("join")
        .expect("clean exit");
}

#[tokio::test]
async fn invalid_config_is_rejected_before_start() {
    let home = TempDir::new().expect("home");
    let config = ControllerConfig {
        workers: 0,
        ..ControllerConfig::default()
    };
    let err = docbot_daemon::run_with_host(
        home.path().to_path_buf(),
        config,
        Arc::new(RecordingHost::new()),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("workers"));
    assert!(!paths::socket_path(home.path()).exists());
}
