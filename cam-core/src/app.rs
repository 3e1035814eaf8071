//! Application services brought up once the link is established.
//!
//! The connectivity manager only guarantees the server and the update route.
//! [`AppServices::poll`] runs from the main loop and finishes the job: it makes
//! sure the update route is present and binds the camera routes once the
//! camera is ready. The latch remembers the server instance it completed on,
//! so a reconnect (which restarts the server) triggers a fresh bring-up.

use crate::capture::CaptureSource;
use crate::connectivity::{ConnectivityManager, ConnectivityState, Radio};
use crate::http::Route;
use crate::platform::Platform;
use crate::registry::{ServerFactory, ServiceHandle};
use crate::stream::VideoStream;

pub struct AppServices<C, D> {
    ota_route: Route,
    video: VideoStream<C, D>,
    started_on: Option<ServiceHandle>,
}

impl<C, D> AppServices<C, D>
where
    C: CaptureSource + 'static,
    D: Platform + 'static,
{
    pub fn new(ota_route: Route, video: VideoStream<C, D>) -> Self {
        Self { ota_route, video, started_on: None }
    }

    pub fn video(&self) -> &VideoStream<C, D> {
        &self.video
    }

    /// Whether every service is live on the current server instance.
    pub fn is_started(&self) -> bool {
        self.started_on.is_some()
    }

    /// One pass of the orchestration loop. Returns whether all services are up.
    pub fn poll<R, F>(&mut self, link: &ConnectivityManager<R, F>) -> bool
    where
        R: Radio,
        F: ServerFactory,
    {
        if link.status() != ConnectivityState::Connected {
            log::debug!("Waiting for WiFi, services not started");
            return false;
        }

        let http = link.http();
        let handle = match http.handle() {
            Some(handle) => handle,
            None => match http.start() {
                Ok(handle) => handle,
                Err(e) => {
                    log::error!("Failed to start HTTP server: {}", e);
                    self.started_on = None;
                    return false;
                }
            },
        };

        if self.started_on == Some(handle) {
            return true;
        }
        self.started_on = None;

        match link.ip_address() {
            Some(ip) => log::info!("WiFi Connected (IP: {}), initializing services", ip),
            None => log::info!("WiFi Connected, initializing services"),
        }

        let ota = &self.ota_route;
        if !http.is_registered(handle, ota.path, ota.method) {
            if let Err(e) = http.register(handle, ota.clone()) {
                log::error!("Failed to initialize OTA service: {}", e);
                return false;
            }
        }
        log::info!("OTA service initialized");

        if !self.video.camera_ready() {
            log::warn!("Camera not ready, video stream deferred");
            return false;
        }
        if let Err(e) = self.video.init(http, handle) {
            log::error!("Failed to start video stream: {}", e);
            return false;
        }

        if let Some(ip) = link.ip_address() {
            log::info!("Web interface available at: http://{}", ip);
        }
        self.started_on = Some(handle);
        true
    }
}
