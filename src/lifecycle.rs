//! Registry of disposable resources with ordered shutdown.
//!
//! Services register a named dispose closure at startup; shutdown runs them
//! in reverse registration order so dependents close before dependencies.
//! Background tasks observe the shared cancellation token.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type DisposeFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Disposable {
    name: &'static str,
    dispose: DisposeFn,
}

pub struct Lifecycle {
    token: CancellationToken,
    disposables: Mutex<Vec<Disposable>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            disposables: Mutex::new(Vec::new()),
        }
    }

    /// Token background tasks select on to notice shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn register<F, Fut>(&self, name: &'static str, dispose: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut disposables = self.disposables.lock().await;
        disposables.push(Disposable {
            name,
            dispose: Box::new(move || Box::pin(dispose())),
        });
        tracing::debug!("lifecycle: registered `{}`", name);
    }

    /// Register a task handle; disposal aborts it if still running.
    pub async fn register_task(&self, name: &'static str, handle: tokio::task::JoinHandle<()>) {
        self.register(name, move || async move {
            handle.abort();
            let _ = handle.await;
        })
        .await;
    }

    /// Cancel background work, then dispose everything in reverse order.
    /// Each dispose gets a bounded grace period so one hung resource cannot
    /// stall process exit.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let mut disposables = self.disposables.lock().await;
        while let Some(d) = disposables.pop() {
            tracing::info!("lifecycle: disposing `{}`", d.name);
            if tokio::time::timeout(Duration::from_secs(10), (d.dispose)())
                .await
                .is_err()
            {
                tracing::warn!("lifecycle: `{}` did not dispose within 10s", d.name);
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
