//! Lifecycle of the single HTTP daemon instance and its route table.

use std::sync::{Mutex, MutexGuard};

use crate::config::HttpConfig;
use crate::error::RegistryError;
use crate::http::{Method, Route};

/// A running HTTP daemon.
pub trait RouteServer: Send {
    fn register(&mut self, route: &Route) -> Result<(), RegistryError>;
    fn deregister(&mut self, path: &str, method: Method) -> Result<(), RegistryError>;
}

/// Creates and destroys daemon instances.
pub trait ServerFactory: Send + Sync {
    type Server: RouteServer;

    fn start(&self, config: &HttpConfig) -> Result<Self::Server, RegistryError>;

    /// Tear the daemon down. Every route bound to it goes with it.
    fn stop(&self, server: Self::Server) -> Result<(), RegistryError> {
        drop(server);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Reference to one daemon instance. Only valid for the generation it was
/// issued for; a restarted daemon gets a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle {
    generation: u32,
}

impl ServiceHandle {
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<S> {
    server: Option<S>,
    status: ServerStatus,
    generation: u32,
    routes: Vec<(&'static str, Method)>,
}

pub struct HttpService<F: ServerFactory> {
    factory: F,
    config: HttpConfig,
    slot: Mutex<Slot<F::Server>>,
}

impl<F: ServerFactory> HttpService<F> {
    pub fn new(factory: F, config: HttpConfig) -> Self {
        Self {
            factory,
            config,
            slot: Mutex::new(Slot {
                server: None,
                status: ServerStatus::Stopped,
                generation: 0,
                routes: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<F::Server>> {
        // A panicking handler must not wedge the lifecycle forever.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the daemon, or return the live handle if it is already running.
    pub fn start(&self) -> Result<ServiceHandle, RegistryError> {
        let mut slot = self.lock();
        if slot.server.is_some() {
            log::warn!("HTTP server is already running");
            return Ok(ServiceHandle { generation: slot.generation });
        }

        slot.status = ServerStatus::Starting;
        log::info!("Starting HTTP server on port {}...", self.config.port);

        match self.factory.start(&self.config) {
            Ok(server) => {
                slot.server = Some(server);
                slot.generation = slot.generation.wrapping_add(1);
                slot.routes.clear();
                slot.status = ServerStatus::Running;
                log::info!("HTTP server started on port {}", self.config.port);
                Ok(ServiceHandle { generation: slot.generation })
            }
            Err(e) => {
                log::error!("Failed to start HTTP server: {}", e);
                slot.status = ServerStatus::Error;
                Err(e)
            }
        }
    }

    /// Stop the daemon. The handle is cleared only after teardown finished.
    pub fn stop(&self) -> Result<(), RegistryError> {
        let mut slot = self.lock();
        let Some(server) = slot.server.take() else {
            log::warn!("HTTP server is not running");
            return Ok(());
        };

        log::info!("Stopping HTTP server...");
        match self.factory.stop(server) {
            Ok(()) => {
                slot.routes.clear();
                slot.status = ServerStatus::Stopped;
                log::info!("HTTP server stopped");
                Ok(())
            }
            Err(e) => {
                // The instance is gone either way; never hand it out again.
                log::error!("Failed to stop HTTP server: {}", e);
                slot.routes.clear();
                slot.status = ServerStatus::Error;
                Err(e)
            }
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.lock().server.is_some()
    }

    /// Handle of the live instance, `None` when stopped.
    pub fn handle(&self) -> Option<ServiceHandle> {
        let slot = self.lock();
        slot.server.as_ref().map(|_| ServiceHandle { generation: slot.generation })
    }

    pub fn is_registered(&self, handle: ServiceHandle, path: &str, method: Method) -> bool {
        let slot = self.lock();
        slot.server.is_some()
            && slot.generation == handle.generation
            && slot.routes.iter().any(|(p, m)| *p == path && *m == method)
    }

    pub fn register(&self, handle: ServiceHandle, route: Route) -> Result<(), RegistryError> {
        let mut slot = self.lock();
        let generation = slot.generation;
        let Slot { server, routes, .. } = &mut *slot;

        let server = match server.as_mut() {
            Some(server) if generation == handle.generation => server,
            _ => {
                log::error!("HTTP server is not running. Cannot register handler for URI: {}", route.path);
                return Err(RegistryError::NotRunning);
            }
        };

        if routes.iter().any(|(p, m)| *p == route.path && *m == route.method) {
            return Err(RegistryError::AlreadyRegistered {
                path: route.path.to_string(),
                method: route.method,
            });
        }

        match server.register(&route) {
            Ok(()) => {
                routes.push((route.path, route.method));
                log::info!("Registered handler for URI: {} {}", route.method, route.path);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to register handler for URI {}: {}", route.path, e);
                Err(e)
            }
        }
    }

    pub fn deregister(&self, handle: ServiceHandle, path: &str, method: Method) -> Result<(), RegistryError> {
        let mut slot = self.lock();
        let generation = slot.generation;
        let Slot { server, routes, .. } = &mut *slot;

        let server = match server.as_mut() {
            Some(server) if generation == handle.generation => server,
            _ => {
                log::error!("HTTP server is not running. Cannot unregister handler for URI: {}", path);
                return Err(RegistryError::NotRunning);
            }
        };

        let Some(index) = routes.iter().position(|(p, m)| *p == path && *m == method) else {
            return Err(RegistryError::NotRegistered { path: path.to_string(), method });
        };

        server.deregister(path, method)?;
        routes.remove(index);
        log::info!("Unregistered handler for URI: {} {}", method, path);
        Ok(())
    }
}
