use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use balboa_core::{
    ConnectionRegistry, ControlPlaneConfig, ControlPlaneError, ControlPlaneServer,
    InterceptConfig, InterceptionEngine, MockableClient,
};
use balboa_proxy::{ProxyConfig, ProxyServer};
use tokio::task::JoinHandle;

/// Assembles the mocking runtime embedded in the server under test: one
/// registry shared by the control-plane server, the streaming proxy, and the
/// interception engine.
pub struct MockRuntimeBuilder {
    control: ControlPlaneConfig,
    proxy: ProxyConfig,
    intercept: InterceptConfig,
}

impl Default for MockRuntimeBuilder {
    fn default() -> Self {
        Self {
            control: ControlPlaneConfig::default(),
            proxy: ProxyConfig::default(),
            intercept: InterceptConfig::default(),
        }
    }
}

impl MockRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(mut self, config: ControlPlaneConfig) -> Self {
        self.control = config;
        self
    }

    pub fn proxy(mut self, config: ProxyConfig) -> Self {
        self.proxy = config;
        self
    }

    pub fn intercept(mut self, config: InterceptConfig) -> Self {
        self.intercept = config;
        self
    }

    /// Binds both servers and spawns them. The returned runtime owns the
    /// server tasks until `shutdown`.
    pub async fn start(self) -> Result<MockRuntime, ControlPlaneError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(InterceptionEngine::new(
            Arc::clone(&registry),
            self.intercept,
        )?);

        let control = ControlPlaneServer::new(self.control, Arc::clone(&registry))?;
        let control_listener = control.bind_listener().await?;
        let control_addr = control_listener.local_addr()?;

        let proxy = ProxyServer::new(self.proxy, Arc::clone(&registry))?;
        let proxy_listener = proxy.bind_listener().await?;
        let proxy_addr = proxy_listener.local_addr()?;

        let tasks = vec![
            tokio::spawn(control.run_with_listener(control_listener)),
            tokio::spawn(proxy.run_with_listener(proxy_listener)),
        ];
        tracing::debug!(%control_addr, %proxy_addr, "mock runtime started");

        Ok(MockRuntime {
            registry,
            engine,
            control_addr,
            proxy_addr,
            tasks,
        })
    }
}

pub struct MockRuntime {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<InterceptionEngine>,
    control_addr: SocketAddr,
    proxy_addr: SocketAddr,
    tasks: Vec<JoinHandle<io::Result<()>>>,
}

impl MockRuntime {
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn engine(&self) -> Arc<InterceptionEngine> {
        Arc::clone(&self.engine)
    }

    /// HTTP client whose outbound calls resolve through the interception
    /// engine; what framework adapters hand to application code.
    pub fn mockable_client(&self) -> MockableClient {
        MockableClient::new(Arc::clone(&self.engine))
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), ControlPlaneError> {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result?,
                Ok(Err(error)) if error.is_cancelled() => {}
                Ok(Err(error)) => return Err(ControlPlaneError::Join(error)),
                Err(_) => {
                    return Err(ControlPlaneError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for mock runtime shutdown",
                    )));
                }
            }
        }
        Ok(())
    }
}
