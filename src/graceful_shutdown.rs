use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Graceful shutdown coordinator. The listener and any background tasks
/// subscribe to the broadcast signal to stop admitting new sessions; already
/// established sessions are left to finish the relay on their own, and
/// registered components (the HTTP metrics server, the DNS resolver's
/// receive loop) get a bounded window to wind down.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    components: Arc<Mutex<Vec<ShutdownComponent>>>,
}

type ShutdownResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type ShutdownFn = Box<dyn Fn() -> tokio::task::JoinHandle<ShutdownResult> + Send + Sync>;

struct ShutdownComponent {
    name: String,
    shutdown_fn: ShutdownFn,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            components: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get a shutdown receiver for components to listen on.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Register a component for graceful shutdown.
    pub async fn register_component<F, Fut>(&self, name: String, shutdown_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ShutdownResult> + Send + 'static,
    {
        let component = ShutdownComponent {
            name,
            shutdown_fn: Box::new(move || {
                let fut = shutdown_fn();
                tokio::spawn(fut)
            }),
        };

        self.components.lock().await.push(component);
    }

    /// Initiate graceful shutdown: stop admission, give in-flight sessions a
    /// moment to wind down, then tear down registered components.
    pub async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("initiating graceful shutdown");

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("failed to send shutdown signal: {e}");
        }

        info!("waiting for in-flight sessions to wind down");
        tokio::time::sleep(Duration::from_millis(500)).await;

        let components = self.components.lock().await;
        let mut handles = Vec::new();

        for component in components.iter() {
            info!("shutting down component: {}", component.name);
            let handle = (component.shutdown_fn)();
            handles.push((component.name.clone(), handle));
        }

        for (name, handle) in handles {
            match timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(Ok(()))) => info!("component '{name}' shut down successfully"),
                Ok(Ok(Err(e))) => error!("component '{name}' shutdown failed: {e}"),
                Ok(Err(e)) => error!("component '{name}' shutdown task panicked: {e}"),
                Err(_) => warn!("component '{name}' shutdown timed out"),
            }
        }

        info!("graceful shutdown completed");
        Ok(())
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
