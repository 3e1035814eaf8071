//! Landing page, still capture and the MJPEG feed.
//!
//! The feed is one `multipart/x-mixed-replace` response per client. Each part
//! is the boundary, a part header with the exact frame length, then the JPEG
//! bytes. The loop runs until a send fails (client gone) or the camera stops
//! delivering frames.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::capture::{CaptureSource, FrameGuard, PixelFormat};
use crate::config::StreamConfig;
use crate::error::{HandlerError, RegistryError, TransportError};
use crate::http::{respond, ErrorResponse, Exchange, Handler, Method, Route, Status, NO_CACHE_HEADERS};
use crate::platform::Platform;
use crate::registry::{HttpService, ServerFactory, ServiceHandle};

pub const INDEX_PATH: &str = "/";
pub const CAPTURE_PATH: &str = "/capture";
pub const STREAM_PATH: &str = "/stream";

pub const BOUNDARY_TOKEN: &str = "123456789000000000000987654321";
pub const STREAM_CONTENT_TYPE: &str =
    "multipart/x-mixed-replace; boundary=123456789000000000000987654321";
pub const STREAM_BOUNDARY: &str = "\r\n--123456789000000000000987654321\r\n";

pub const INDEX_HTML: &str = include_str!("../templates/index.html");

/// Part header for a frame of `len` bytes.
pub fn part_header(len: usize) -> heapless::String<80> {
    let mut header = heapless::String::new();
    // 46 fixed bytes plus at most 20 digits
    let _ = write!(header, "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", len);
    header
}

pub struct IndexHandler;

impl Handler for IndexHandler {
    fn handle(&self, exchange: &mut dyn Exchange) -> Result<(), HandlerError> {
        let headers = [
            ("Content-Type", "text/html"),
            NO_CACHE_HEADERS[0],
            NO_CACHE_HEADERS[1],
            NO_CACHE_HEADERS[2],
        ];
        respond(exchange, Status::Ok, &headers, INDEX_HTML.as_bytes())?;
        Ok(())
    }
}

pub struct CaptureHandler<C> {
    source: Arc<C>,
}

impl<C: CaptureSource> CaptureHandler<C> {
    pub fn new(source: Arc<C>) -> Self {
        Self { source }
    }
}

impl<C: CaptureSource> Handler for CaptureHandler<C> {
    fn handle(&self, exchange: &mut dyn Exchange) -> Result<(), HandlerError> {
        if !self.source.is_ready() {
            log::error!("Camera is not ready for capture");
            ErrorResponse::internal("Camera not ready").send(exchange);
            return Err(HandlerError::NotReady);
        }

        let Some(frame) = FrameGuard::acquire(&*self.source) else {
            log::error!("Camera capture failed");
            ErrorResponse::internal("Camera capture failed").send(exchange);
            return Err(HandlerError::CaptureFailed);
        };

        let headers = [
            ("Content-Type", frame.format().mime_type().unwrap_or("application/octet-stream")),
            ("Content-Disposition", "inline; filename=capture.jpg"),
            NO_CACHE_HEADERS[0],
            NO_CACHE_HEADERS[1],
            NO_CACHE_HEADERS[2],
        ];
        let sent = respond(exchange, Status::Ok, &headers, frame.data());
        let size = frame.len();
        drop(frame);

        match sent {
            Ok(()) => {
                log::info!("Image captured and sent, size: {} bytes", size);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to send captured image: {}", e);
                Err(e.into())
            }
        }
    }
}

pub struct StreamHandler<C, D> {
    source: Arc<C>,
    platform: D,
    frame_interval: Duration,
}

impl<C: CaptureSource, D: Platform> StreamHandler<C, D> {
    pub fn new(source: Arc<C>, platform: D, config: &StreamConfig) -> Self {
        Self { source, platform, frame_interval: config.frame_interval() }
    }

    fn send_part(exchange: &mut dyn Exchange, frame: &FrameGuard<'_, C>) -> Result<(), TransportError> {
        exchange.send(STREAM_BOUNDARY.as_bytes())?;
        exchange.send(part_header(frame.len()).as_bytes())?;
        exchange.send(frame.data())
    }
}

impl<C: CaptureSource, D: Platform> Handler for StreamHandler<C, D> {
    fn handle(&self, exchange: &mut dyn Exchange) -> Result<(), HandlerError> {
        if !self.source.is_ready() {
            log::error!("Camera is not ready for streaming");
            ErrorResponse::internal("Camera not ready").send(exchange);
            return Err(HandlerError::NotReady);
        }

        let headers = [
            ("Content-Type", STREAM_CONTENT_TYPE),
            NO_CACHE_HEADERS[0],
            NO_CACHE_HEADERS[1],
            NO_CACHE_HEADERS[2],
            ("Access-Control-Allow-Origin", "*"),
        ];
        exchange.begin_response(Status::Ok, &headers)?;
        log::info!("Starting video stream for client");

        let mut frames: u64 = 0;
        let result = loop {
            let Some(frame) = FrameGuard::acquire(&*self.source) else {
                log::error!("Camera capture failed");
                break Err(HandlerError::CaptureFailed);
            };

            if frame.format() != PixelFormat::Jpeg {
                log::error!("Non-JPEG frame received ({:?})", frame.format());
                break Err(HandlerError::UnsupportedFormat(frame.format()));
            }

            let sent = Self::send_part(exchange, &frame);
            drop(frame);

            if let Err(e) = sent {
                log::trace!("Stream send failed after {} frames: {}", frames, e);
                break Err(e.into());
            }

            frames += 1;
            self.platform.delay(self.frame_interval);
        };

        log::info!("Video stream ended for client after {} frames", frames);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

struct StreamState {
    status: StreamStatus,
    handle: Option<ServiceHandle>,
}

/// The three camera routes as one service bound to a server instance.
pub struct VideoStream<C, D> {
    index: Arc<IndexHandler>,
    capture: Arc<CaptureHandler<C>>,
    stream: Arc<StreamHandler<C, D>>,
    state: Mutex<StreamState>,
}

impl<C, D> VideoStream<C, D>
where
    C: CaptureSource + 'static,
    D: Platform + 'static,
{
    pub fn new(source: Arc<C>, platform: D, config: &StreamConfig) -> Self {
        Self {
            index: Arc::new(IndexHandler),
            capture: Arc::new(CaptureHandler::new(Arc::clone(&source))),
            stream: Arc::new(StreamHandler::new(source, platform, config)),
            state: Mutex::new(StreamState { status: StreamStatus::Stopped, handle: None }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn routes(&self) -> [Route; 3] {
        [
            Route::new(INDEX_PATH, Method::Get, self.index.clone()),
            Route::new(STREAM_PATH, Method::Get, self.stream.clone()),
            Route::new(CAPTURE_PATH, Method::Get, self.capture.clone()),
        ]
    }

    pub fn status(&self) -> StreamStatus {
        self.state().status
    }

    pub fn camera_ready(&self) -> bool {
        self.stream.source.is_ready()
    }

    /// Whether the routes are live on the server instance behind `handle`.
    pub fn is_active_on(&self, handle: ServiceHandle) -> bool {
        let state = self.state();
        state.status == StreamStatus::Running && state.handle == Some(handle)
    }

    /// Register the camera routes on `handle`. A no-op when they are already
    /// live on that instance.
    pub fn init<F: ServerFactory>(
        &self,
        http: &HttpService<F>,
        handle: ServiceHandle,
    ) -> Result<(), RegistryError> {
        let mut state = self.state();
        let bound = self
            .routes()
            .iter()
            .all(|route| http.is_registered(handle, route.path, route.method));
        if state.status == StreamStatus::Running && state.handle == Some(handle) && bound {
            log::warn!("Video stream is already running");
            return Ok(());
        }

        log::info!("Starting video stream...");
        state.status = StreamStatus::Starting;
        state.handle = Some(handle);

        for route in self.routes() {
            if http.is_registered(handle, route.path, route.method) {
                continue;
            }
            let path = route.path;
            if let Err(e) = http.register(handle, route) {
                log::error!("Failed to register {} handler: {}", path, e);
                state.status = StreamStatus::Error;
                return Err(e);
            }
        }

        state.status = StreamStatus::Running;
        log::info!("Video stream started successfully");
        Ok(())
    }

    /// Remove the camera routes. Deregistration failures are logged; the
    /// service is stopped afterwards regardless.
    pub fn stop<F: ServerFactory>(&self, http: &HttpService<F>) {
        let mut state = self.state();
        if state.status == StreamStatus::Stopped {
            log::warn!("Video stream is already stopped");
            return;
        }

        log::info!("Stopping video stream...");
        if let Some(handle) = state.handle.take() {
            for route in self.routes() {
                if let Err(e) = http.deregister(handle, route.path, route.method) {
                    log::warn!("Failed to unregister {}: {}", route.path, e);
                }
            }
        }

        state.status = StreamStatus::Stopped;
        log::info!("Video stream stopped");
    }
}
