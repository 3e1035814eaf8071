use thiserror::Error;

use crate::capture::PixelFormat;

/// Failure reported by the HTTP transport while receiving or sending bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("receive failed (code {0})")]
    Recv(i32),
    #[error("send failed (code {0})")]
    Send(i32),
    #[error("response already started")]
    ResponseStarted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("HTTP server is not running")]
    NotRunning,
    #[error("handler for {method} {path} already registered")]
    AlreadyRegistered { path: String, method: crate::http::Method },
    #[error("no handler registered for {method} {path}")]
    NotRegistered { path: String, method: crate::http::Method },
    #[error("failed to start HTTP server: {0}")]
    StartFailed(String),
    #[error("failed to stop HTTP server: {0}")]
    StopFailed(String),
    #[error("failed to register {path}: {reason}")]
    RegisterFailed { path: String, reason: String },
    #[error("failed to unregister {path}: {reason}")]
    UnregisterFailed { path: String, reason: String },
}

/// Errors from the firmware update partition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("no inactive update partition available")]
    NoUpdatePartition,
    #[error("failed to begin update session (code {0})")]
    Begin(i32),
    #[error("partition write failed (code {0})")]
    Write(i32),
    #[error("image finalize failed (code {0})")]
    Finalize(i32),
    #[error("failed to set boot partition (code {0})")]
    SetBoot(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio connect request failed (code {0})")]
    Connect(i32),
    #[error("failed to spawn connectivity task: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("WiFi SSID cannot be empty")]
    EmptySsid,
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Why a request handler stopped. Every variant has already been answered
/// (or the peer is gone) by the time it is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("capture source not ready")]
    NotReady,
    #[error("frame capture failed")]
    CaptureFailed,
    #[error("unsupported frame format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error(transparent)]
    Ota(#[from] OtaError),
}
