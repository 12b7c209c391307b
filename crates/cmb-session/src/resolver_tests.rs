use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cmb_config::{ExecutorConfig, ExecutorKind, SelectionReason};
use cmb_sandbox::{ExecuteOutcome, ToolSet};

struct FakeBackend {
    disposed: Arc<AtomicUsize>,
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::MicroVm
    }

    async fn execute(&self, _script: &str, _tools: ToolSet) -> ExecuteOutcome {
        ExecuteOutcome::success(serde_json::Value::Null, Vec::new())
    }

    async fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    created: Arc<AtomicUsize>,
    disposed: Arc<AtomicUsize>,
    fail_first: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        Self {
            created: Arc::new(AtomicUsize::new(0)),
            disposed: Arc::new(AtomicUsize::new(0)),
            fail_first: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Factory failing for the first `n` invocations.
    fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    fn factory(&self) -> ExecutorFactory {
        let created = self.created.clone();
        let disposed = self.disposed.clone();
        let fail_first = self.fail_first.clone();
        Arc::new(move || {
            let created = created.clone();
            let disposed = disposed.clone();
            let fail_first = fail_first.clone();
            Box::pin(async move {
                // Simulate real executor construction taking a moment so
                // concurrent resolvers overlap.
                tokio::time::sleep(Duration::from_millis(20)).await;
                if fail_first.load(Ordering::SeqCst) > 0 {
                    fail_first.fetch_sub(1, Ordering::SeqCst);
                    anyhow::bail!("backend probe failed");
                }
                created.fetch_add(1, Ordering::SeqCst);
                let backend: Arc<dyn SandboxBackend> =
                    Arc::new(FakeBackend { disposed: disposed.clone() });
                let info = ExecutorInfo {
                    kind: ExecutorKind::MicroVm,
                    reason: SelectionReason::AutoDetected,
                    timeout_ms: ExecutorConfig::default().timeout_ms,
                };
                Ok((backend, info))
            })
        })
    }
}

fn resolver(harness: &Harness, idle: Duration, protected: bool) -> SessionResolver {
    SessionResolver::new(harness.factory(), idle, protected)
}

#[tokio::test]
async fn concurrent_resolves_create_one_executor() {
    let harness = Harness::new();
    let resolver = resolver(&harness, Duration::from_secs(60), true);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve(Some("shared")).await.unwrap() })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(harness.created.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.session_count(), 1);
}

#[tokio::test]
async fn empty_session_id_addresses_singleton() {
    let harness = Harness::new();
    let resolver = resolver(&harness, Duration::from_secs(60), true);

    resolver.resolve(None).await.unwrap();
    resolver.resolve(Some("")).await.unwrap();

    assert_eq!(harness.created.load(Ordering::SeqCst), 1);
    assert!(resolver.has_session(SINGLETON_SESSION_ID));
    assert!(resolver.singleton_info().is_some());
}

#[tokio::test]
async fn idle_session_is_disposed_exactly_once() {
    let harness = Harness::new();
    let resolver = resolver(&harness, Duration::from_millis(100), true);

    resolver.resolve(Some("ephemeral")).await.unwrap();
    assert!(resolver.has_session("ephemeral"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!resolver.has_session("ephemeral"));
    assert_eq!(harness.disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resolve_resets_the_idle_timer() {
    let harness = Harness::new();
    let resolver = resolver(&harness, Duration::from_millis(300), true);

    resolver.resolve(Some("active")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    resolver.resolve(Some("active")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // 350ms after creation but only 200ms after the last touch.
    assert!(resolver.has_session("active"));
    assert_eq!(harness.created.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!resolver.has_session("active"));
}

#[tokio::test]
async fn protected_singleton_never_expires() {
    let harness = Harness::new();
    let resolver = resolver(&harness, Duration::from_millis(100), true);

    resolver.resolve(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(resolver.has_session(SINGLETON_SESSION_ID));
    assert_eq!(harness.disposed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unprotected_singleton_participates_in_eviction() {
    let harness = Harness::new();
    let resolver = resolver(&harness, Duration::from_millis(100), false);

    resolver.resolve(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(!resolver.has_session(SINGLETON_SESSION_ID));
}

#[tokio::test]
async fn failed_creation_falls_back_to_singleton() {
    let harness = Harness::new().failing_first(1);
    let resolver = resolver(&harness, Duration::from_secs(60), true);

    let executor = resolver.resolve(Some("doomed")).await.unwrap();
    let _ = executor;

    assert!(!resolver.has_session("doomed"));
    assert!(resolver.has_session(SINGLETON_SESSION_ID));
    assert_eq!(harness.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn singleton_is_recreated_after_disposal() {
    let harness = Harness::new();
    let resolver = resolver(&harness, Duration::from_secs(60), false);

    resolver.resolve(None).await.unwrap();
    resolver.dispose_session(SINGLETON_SESSION_ID).await;
    assert!(!resolver.has_session(SINGLETON_SESSION_ID));

    resolver.resolve(None).await.unwrap();
    assert!(resolver.has_session(SINGLETON_SESSION_ID));
    assert_eq!(harness.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dispose_all_disposes_every_executor() {
    let harness = Harness::new();
    let resolver = resolver(&harness, Duration::from_secs(60), true);

    resolver.resolve(Some("a")).await.unwrap();
    resolver.resolve(Some("b")).await.unwrap();
    resolver.resolve(None).await.unwrap();
    assert_eq!(resolver.session_count(), 3);

    resolver.dispose_all().await;
    assert_eq!(resolver.session_count(), 0);
    assert_eq!(harness.disposed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn generated_session_ids_are_unique() {
    let a = new_session_id();
    let b = new_session_id();
    assert_ne!(a, b);
    assert!(!a.is_empty());
}
