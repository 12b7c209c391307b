use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cmb_sandbox::{ExecutorInfo, SandboxBackend};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;

/// Reserved session id addressing the shared fallback executor.
pub const SINGLETON_SESSION_ID: &str = "__singleton__";

/// Builds one executor instance per session.
pub type ExecutorFactory = Arc<
    dyn Fn() -> BoxFuture<'static, Result<(Arc<dyn SandboxBackend>, ExecutorInfo)>> + Send + Sync,
>;

/// Generate a fresh session id for a connection that did not present one.
pub fn new_session_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

#[derive(Clone)]
struct SessionSeed {
    executor: Arc<dyn SandboxBackend>,
    info: ExecutorInfo,
}

type InflightFuture = Shared<BoxFuture<'static, Result<SessionSeed, String>>>;

struct SessionEntry {
    executor: Arc<dyn SandboxBackend>,
    info: ExecutorInfo,
    last_activity: Instant,
    idle_timer: Option<JoinHandle<()>>,
    protected: bool,
}

struct Inner {
    factory: ExecutorFactory,
    idle_timeout: Duration,
    singleton_protected: bool,
    sessions: StdMutex<HashMap<String, SessionEntry>>,
    inflight: StdMutex<HashMap<String, InflightFuture>>,
}

/// Maps client session ids to executor instances.
///
/// Creation is single-flight per id; non-protected sessions are evicted
/// after the idle timeout; a failed creation falls back to the singleton,
/// which is re-created lazily if it was itself evicted.
#[derive(Clone)]
pub struct SessionResolver {
    inner: Arc<Inner>,
}

impl SessionResolver {
    pub fn new(factory: ExecutorFactory, idle_timeout: Duration, singleton_protected: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                idle_timeout,
                singleton_protected,
                sessions: StdMutex::new(HashMap::new()),
                inflight: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve a session to its executor, creating it on first use.
    ///
    /// An empty or missing id addresses the singleton. Resolving an existing
    /// session resets its idle timer.
    pub async fn resolve(&self, session_id: Option<&str>) -> Result<Arc<dyn SandboxBackend>> {
        let id = match session_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => SINGLETON_SESSION_ID.to_string(),
        };

        if let Some(executor) = self.touch_existing(&id) {
            return Ok(executor);
        }

        match self.create_single_flight(&id).await {
            Ok(executor) => Ok(executor),
            Err(error) if id != SINGLETON_SESSION_ID => {
                tracing::warn!(
                    session = %id,
                    error = %error,
                    "executor creation failed, falling back to singleton session"
                );
                self.resolve_singleton().await
            }
            Err(error) => Err(anyhow::anyhow!(error))
                .context("failed to create the singleton session executor"),
        }
    }

    async fn resolve_singleton(&self) -> Result<Arc<dyn SandboxBackend>> {
        if let Some(executor) = self.touch_existing(SINGLETON_SESSION_ID) {
            return Ok(executor);
        }
        self.create_single_flight(SINGLETON_SESSION_ID)
            .await
            .map_err(|error| anyhow::anyhow!(error))
            .context("failed to create the singleton session executor")
    }

    fn touch_existing(&self, id: &str) -> Option<Arc<dyn SandboxBackend>> {
        let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let entry = sessions.get_mut(id)?;
        entry.last_activity = Instant::now();
        if !entry.protected {
            if let Some(timer) = entry.idle_timer.take() {
                timer.abort();
            }
            entry.idle_timer = Some(spawn_idle_timer(
                Arc::downgrade(&self.inner),
                id.to_string(),
                self.inner.idle_timeout,
            ));
        }
        Some(entry.executor.clone())
    }

    async fn create_single_flight(&self, id: &str) -> Result<Arc<dyn SandboxBackend>, String> {
        let future = {
            let mut inflight = self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = inflight.get(id) {
                existing.clone()
            } else {
                let factory = self.inner.factory.clone();
                let created: InflightFuture = async move {
                    let (executor, info) =
                        factory().await.map_err(|error| format!("{error:#}"))?;
                    Ok(SessionSeed { executor, info })
                }
                .boxed()
                .shared();
                inflight.insert(id.to_string(), created.clone());
                created
            }
        };

        let outcome = future.await;
        self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner()).remove(id);

        let seed = outcome?;
        let protected = id == SINGLETON_SESSION_ID && self.inner.singleton_protected;
        let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sessions.get(id) {
            // A concurrent waiter registered the session first.
            return Ok(existing.executor.clone());
        }
        let idle_timer = if protected {
            None
        } else {
            Some(spawn_idle_timer(
                Arc::downgrade(&self.inner),
                id.to_string(),
                self.inner.idle_timeout,
            ))
        };
        tracing::info!(
            session = %id,
            executor = %seed.info.kind,
            protected,
            "session created"
        );
        sessions.insert(
            id.to_string(),
            SessionEntry {
                executor: seed.executor.clone(),
                info: seed.info,
                last_activity: Instant::now(),
                idle_timer,
                protected,
            },
        );
        Ok(seed.executor)
    }

    /// Remove one session and dispose its executor.
    pub async fn dispose_session(&self, id: &str) {
        Inner::dispose_session_inner(&self.inner, id).await;
    }

    /// Dispose every session concurrently.
    pub async fn dispose_all(&self) {
        let entries: Vec<(String, SessionEntry)> = {
            let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.drain().collect()
        };
        let disposals = entries.into_iter().map(|(id, mut entry)| async move {
            if let Some(timer) = entry.idle_timer.take() {
                timer.abort();
            }
            entry.executor.dispose().await;
            tracing::debug!(session = %id, "session disposed");
        });
        futures::future::join_all(disposals).await;
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner()).contains_key(id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }

    /// Executor info of one session, if it exists.
    pub fn executor_info(&self, id: &str) -> Option<ExecutorInfo> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.info.clone())
    }

    /// Executor info of the singleton session.
    pub fn singleton_info(&self) -> Option<ExecutorInfo> {
        self.executor_info(SINGLETON_SESSION_ID)
    }
}

impl Inner {
    async fn dispose_session_inner(inner: &Arc<Inner>, id: &str) {
        let entry = {
            let mut sessions = inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(id)
        };
        let Some(mut entry) = entry else {
            return;
        };
        if let Some(timer) = entry.idle_timer.take() {
            timer.abort();
        }
        entry.executor.dispose().await;
        tracing::info!(session = %id, "session disposed");
    }
}

fn spawn_idle_timer(inner: Weak<Inner>, id: String, idle_timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(idle_timeout).await;
        if let Some(inner) = inner.upgrade() {
            tracing::info!(session = %id, idle_ms = idle_timeout.as_millis() as u64, "idle session expired");
            Inner::dispose_session_inner(&inner, &id).await;
        }
    })
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
