//! Load generator client against a local HTTP stand-in.
//!
//! The stand-in answers the control surface the way the real load
//! generator does: plain text bodies, a test id embedded in the start
//! response, and an append-only log that eventually reports finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use vmscale_core::{RetryError, RetryPolicy, StopFlag};
use vmscale_loadgen::{LoadGenClient, PollError, RpcError, TestLogPoller};

#[derive(Default)]
struct Stand {
    /// Start calls rejected with 503 before one succeeds.
    failing_starts: AtomicU32,
    start_calls: AtomicU32,
    log_calls: AtomicU32,
    /// Log fetches before `Test finished` appears.
    finish_after: u32,
}

#[derive(serde::Deserialize)]
struct DnsParam {
    dns: String,
}

#[derive(serde::Deserialize)]
struct NameParam {
    name: String,
}

async fn start(State(stand): State<Arc<Stand>>, Query(q): Query<DnsParam>) -> (StatusCode, String) {
    stand.start_calls.fetch_add(1, Ordering::SeqCst);
    if stand
        .failing_starts
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "booting".to_string());
    }
    (
        StatusCode::OK,
        format!("Test for {} started: <a href='/log?name=test.4242.log'>log</a>", q.dns),
    )
}

async fn log(State(stand): State<Arc<Stand>>, Query(q): Query<NameParam>) -> (StatusCode, String) {
    if q.name != "test.4242.log" {
        return (StatusCode::NOT_FOUND, String::new());
    }
    let n = stand.log_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let mut body = String::from("[Test]\ntype=autoscaling\nstarttime=2024-01-30 10:00:00\n\n");
    for i in 0..n {
        body.push_str(&format!("[Current rps={}.5]\n", 10 * (i + 1)));
    }
    if n >= stand.finish_after {
        body.push_str("\n[Test finished]\n");
    }
    (StatusCode::OK, body)
}

async fn serve(stand: Arc<Stand>) -> String {
    let app = Router::new()
        .route("/autoscaling", get(start))
        .route("/warmup", get(start))
        .route("/test/horizontal", get(start))
        .route("/test/horizontal/add", get(start))
        .route("/log", get(log))
        .with_state(stand);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

fn client(address: &str) -> LoadGenClient {
    LoadGenClient::new(
        address,
        Duration::from_secs(2),
        RetryPolicy::unbounded(Duration::from_millis(10)),
    )
}

#[tokio::test]
async fn start_retries_until_load_generator_answers() {
    let stand = Arc::new(Stand {
        failing_starts: AtomicU32::new(3),
        ..Default::default()
    });
    let addr = serve(stand.clone()).await;

    let body = client(&addr)
        .start_autoscaling("lb.example", async || false)
        .await
        .unwrap();

    assert!(body.contains("lb.example"));
    assert_eq!(stand.start_calls.load(Ordering::SeqCst), 4);
    assert_eq!(TestLogPoller::test_id(&body).unwrap().as_str(), "4242");
}

#[tokio::test]
async fn stop_predicate_bounds_a_failing_call() {
    let stand = Arc::new(Stand {
        failing_starts: AtomicU32::new(u32::MAX),
        ..Default::default()
    });
    let addr = serve(stand.clone()).await;

    let attempts = AtomicU32::new(0);
    let err = client(&addr)
        .add_horizontal("ws.example", async || {
            attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 5
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RetryError::Stopped));
    assert_eq!(stand.start_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn bounded_policy_reports_last_error() {
    let stand = Arc::new(Stand {
        failing_starts: AtomicU32::new(u32::MAX),
        ..Default::default()
    });
    let addr = serve(stand).await;

    let client = LoadGenClient::new(
        &addr,
        Duration::from_secs(2),
        RetryPolicy::bounded(Duration::from_millis(5), 3),
    );
    let err = client.start_warmup("lb.example", async || false).await.unwrap_err();
    match err {
        RetryError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last, RpcError::Status { status: 503, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn poller_persists_and_parses_artifact() {
    let stand = Arc::new(Stand {
        finish_after: 100,
        ..Default::default()
    });
    let addr = serve(stand).await;
    let dir = tempfile::tempdir().unwrap();
    let poller = TestLogPoller::new(client(&addr), dir.path());
    let id = TestLogPoller::test_id("see test.4242.log").unwrap();

    let first = poller.fetch(&id).await.unwrap();
    assert_eq!(first.current_rps, Some(10.5));
    assert!(!first.finished);

    let second = poller.fetch(&id).await.unwrap();
    assert_eq!(second.current_rps, Some(20.5));
    assert_eq!(
        second.artifact.section_value("Test", "starttime"),
        Some("2024-01-30 10:00:00")
    );

    let saved = std::fs::read_to_string(dir.path().join("test.4242.log")).unwrap();
    assert!(saved.contains("[Current rps=20.5]"));
}

#[tokio::test]
async fn wait_until_finished_returns_final_log() {
    let stand = Arc::new(Stand {
        finish_after: 3,
        ..Default::default()
    });
    let addr = serve(stand.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let poller = TestLogPoller::new(client(&addr), dir.path());
    let id = TestLogPoller::test_id("test.4242.log").unwrap();

    let log = poller
        .wait_until_finished(&id, Duration::from_millis(5), &StopFlag::never())
        .await
        .unwrap();

    assert!(log.finished);
    assert_eq!(log.current_rps, Some(30.5));
    assert_eq!(stand.log_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn wait_until_finished_honors_stop_flag() {
    let stand = Arc::new(Stand {
        finish_after: u32::MAX,
        ..Default::default()
    });
    let addr = serve(stand).await;
    let dir = tempfile::tempdir().unwrap();
    let poller = TestLogPoller::new(client(&addr), dir.path());
    let id = TestLogPoller::test_id("test.4242.log").unwrap();

    let (tx, stop) = StopFlag::new();
    tx.send(true).unwrap();
    let err = poller
        .wait_until_finished(&id, Duration::from_secs(60), &stop)
        .await
        .unwrap_err();
    assert!(matches!(err, PollError::Stopped(_)));
}

#[tokio::test]
async fn unknown_log_is_a_retryable_status_error() {
    let addr = serve(Arc::new(Stand::default())).await;
    let dir = tempfile::tempdir().unwrap();
    let poller = TestLogPoller::new(client(&addr), dir.path());
    let id = TestLogPoller::test_id("test.1.log").unwrap();

    let err = poller.fetch(&id).await.unwrap_err();
    assert!(matches!(err, PollError::Rpc(RpcError::Status { status: 404, .. })));
}
