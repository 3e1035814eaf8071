//! Transport-facing types shared by every request handler.
//!
//! Handlers never see the HTTP daemon directly. They talk to one in-flight
//! request through [`Exchange`], which the firmware implements on top of the
//! ESP-IDF connection and the tests implement with scripted buffers.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::{HandlerError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Server Error",
        }
    }
}

pub const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

/// One request/response pair as seen by a handler.
pub trait Exchange {
    fn header(&self, name: &str) -> Option<&str>;

    /// Declared payload length, `None` when the request carried no length.
    fn content_len(&self) -> Option<u64>;

    /// Receive up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Send the status line and headers. May be called once.
    fn begin_response(&mut self, status: Status, headers: &[(&str, &str)]) -> Result<(), TransportError>;

    /// Send one chunk of body on the open response.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

/// Request handler bound to one route.
pub trait Handler: Send + Sync {
    fn handle(&self, exchange: &mut dyn Exchange) -> Result<(), HandlerError>;
}

#[derive(Clone)]
pub struct Route {
    pub path: &'static str,
    pub method: Method,
    pub handler: Arc<dyn Handler>,
}

impl Route {
    pub fn new(path: &'static str, method: Method, handler: Arc<dyn Handler>) -> Self {
        Self { path, method, handler }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("method", &self.method)
            .finish()
    }
}

/// Send a complete response in one go.
pub fn respond(
    exchange: &mut dyn Exchange,
    status: Status,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<(), TransportError> {
    exchange.begin_response(status, headers)?;
    if !body.is_empty() {
        exchange.send(body)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            ErrorCode::BadRequest => Status::BadRequest,
            ErrorCode::NotFound => Status::NotFound,
            ErrorCode::Internal => Status::InternalError,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ApiError,
    #[serde(skip)]
    status: Status,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ApiError {
                code: code.as_str(),
                message: message.into(),
                request_id: generate_request_id(),
            },
            status: code.status(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Write the JSON body. A failure here means the peer is gone, so it is
    /// logged and otherwise ignored.
    pub fn send(self, exchange: &mut dyn Exchange) {
        let json = match serde_json::to_string(&self) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize error response: {}", e);
                return;
            }
        };
        let headers = [("Content-Type", "application/json")];
        if let Err(e) = respond(exchange, self.status, &headers, json.as_bytes()) {
            log::warn!("Error response {} not delivered: {}", self.status.code(), e);
        }
    }
}

fn generate_request_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u32;

    format!("req_{:08x}{:04x}", timestamp, count & 0xFFFF)
}
