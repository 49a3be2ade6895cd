//! OS-signal capture and shutdown escalation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

/// Signal observed by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSignal {
    /// First termination signal: begin graceful shutdown.
    Shutdown,
    /// Second signal while shutting down: skip remaining niceties.
    Emergency,
}

impl std::fmt::Display for PoolSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolSignal::Shutdown => write!(f, "SHUTDOWN"),
            PoolSignal::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

type HookFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type HookFn = Box<dyn Fn() -> HookFuture + Send + Sync>;

struct ShutdownHook {
    name: String,
    priority: i32,
    timeout: Duration,
    run: HookFn,
}

/// Result of one shutdown hook.
#[derive(Debug, Clone)]
pub struct HookResult {
    /// Hook name.
    pub name: String,
    /// Whether it finished in time without error.
    pub success: bool,
    /// Failure detail, if any.
    pub error: Option<String>,
}

/// Captures termination signals once and fans them out; a second
/// signal escalates to emergency shutdown.
#[derive(Clone)]
pub struct SignalHandler {
    sender: broadcast::Sender<PoolSignal>,
    shutdown_requested: Arc<AtomicBool>,
    emergency: Arc<AtomicBool>,
    hooks: Arc<Mutex<Vec<ShutdownHook>>>,
}

impl SignalHandler {
    /// Create a handler. OS signals are wired separately via
    /// `install_os_handlers`.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            emergency: Arc::new(AtomicBool::new(false)),
            hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to signal notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolSignal> {
        self.sender.subscribe()
    }

    /// Request shutdown. The first call begins graceful shutdown; a
    /// repeat call escalates to emergency.
    pub fn request_shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            if !self.emergency.swap(true, Ordering::SeqCst) {
                warn!("Second shutdown request, escalating to emergency");
                let _ = self.sender.send(PoolSignal::Emergency);
            }
            return;
        }
        info!("Shutdown requested");
        let _ = self.sender.send(PoolSignal::Shutdown);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Whether shutdown has escalated to emergency.
    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    /// Register a named shutdown hook. Lower priority runs first.
    pub async fn register_handler<F, Fut>(
        &self,
        name: impl Into<String>,
        priority: i32,
        timeout: Duration,
        f: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let mut hooks = self.hooks.lock().await;
        hooks.push(ShutdownHook {
            name: name.into(),
            priority,
            timeout,
            run: Box::new(move || Box::pin(f())),
        });
        hooks.sort_by_key(|h| h.priority);
    }

    /// Run every registered hook in priority order, each on its own
    /// monitored task under its own hard timeout. A hook that times
    /// out or fails is recorded but never blocks the rest.
    pub async fn run_handlers(&self) -> Vec<HookResult> {
        let hooks = self.hooks.lock().await;
        let mut results = Vec::with_capacity(hooks.len());

        for hook in hooks.iter() {
            let fut = (hook.run)();
            let handle = tokio::spawn(fut);
            let outcome = tokio::time::timeout(hook.timeout, handle).await;

            let result = match outcome {
                Ok(Ok(Ok(()))) => HookResult {
                    name: hook.name.clone(),
                    success: true,
                    error: None,
                },
                Ok(Ok(Err(e))) => HookResult {
                    name: hook.name.clone(),
                    success: false,
                    error: Some(e),
                },
                Ok(Err(join_err)) => HookResult {
                    name: hook.name.clone(),
                    success: false,
                    error: Some(format!("panicked: {join_err}")),
                },
                Err(_) => HookResult {
                    name: hook.name.clone(),
                    success: false,
                    error: Some(format!("timed out after {:?}", hook.timeout)),
                },
            };

            if !result.success {
                warn!(
                    "Shutdown hook '{}' failed: {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown")
                );
            }
            results.push(result);
        }

        results
    }

    /// Install OS signal handlers (Unix: SIGTERM + SIGINT).
    #[cfg(unix)]
    pub fn install_os_handlers(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let term_handler = self.clone();
        tokio::spawn(async move {
            while sigterm.recv().await.is_some() {
                info!("Received SIGTERM");
                term_handler.request_shutdown();
            }
        });

        let mut sigint = signal(SignalKind::interrupt())?;
        let int_handler = self.clone();
        tokio::spawn(async move {
            while sigint.recv().await.is_some() {
                info!("Received SIGINT");
                int_handler.request_shutdown();
            }
        });

        info!("OS signal handlers installed (SIGTERM, SIGINT)");
        Ok(())
    }

    /// Install OS signal handlers (non-Unix: Ctrl+C only).
    #[cfg(not(unix))]
    pub fn install_os_handlers(&self) -> std::io::Result<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                handler.request_shutdown();
            }
        });
        Ok(())
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Send SIGKILL to a process. Best-effort, Unix only.
#[cfg(unix)]
pub fn kill_process(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!("Failed to kill pid {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
pub fn kill_process(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_second_request_escalates() {
        let handler = SignalHandler::new();
        assert!(!handler.is_shutdown_requested());

        handler.request_shutdown();
        assert!(handler.is_shutdown_requested());
        assert!(!handler.is_emergency());

        handler.request_shutdown();
        assert!(handler.is_emergency());
    }

    #[tokio::test]
    async fn test_subscribers_see_signals() {
        let handler = SignalHandler::new();
        let mut rx = handler.subscribe();

        handler.request_shutdown();
        assert_eq!(rx.recv().await.unwrap(), PoolSignal::Shutdown);

        handler.request_shutdown();
        assert_eq!(rx.recv().await.unwrap(), PoolSignal::Emergency);
    }

    #[tokio::test]
    async fn test_handlers_run_in_priority_order() {
        let handler = SignalHandler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("last", 30), ("first", 10), ("middle", 20)] {
            let order = order.clone();
            handler
                .register_handler(name, priority, Duration::from_secs(1), move || {
                    let order = order.clone();
                    async move {
                        order.lock().await.push(name);
                        Ok(())
                    }
                })
                .await;
        }

        let results = handler.run_handlers().await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(*order.lock().await, vec!["first", "middle", "last"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_fails_but_does_not_block() {
        let handler = SignalHandler::new();
        let ran = Arc::new(AtomicU32::new(0));

        handler
            .register_handler("stuck", 1, Duration::from_millis(50), || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        let ran_clone = ran.clone();
        handler
            .register_handler("quick", 2, Duration::from_secs(1), move || {
                let ran = ran_clone.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let results = handler.run_handlers().await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
        assert!(results[1].success);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_reported() {
        let handler = SignalHandler::new();
        handler
            .register_handler("broken", 1, Duration::from_secs(1), || async {
                Err("disk on fire".to_string())
            })
            .await;

        let results = handler.run_handlers().await;
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("disk on fire"));
    }
}
