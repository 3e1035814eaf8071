//! Streamed firmware upload into the inactive OTA partition.
//!
//! Flow for one `POST /ota`:
//! 1. Reject a missing or zero Content-Length before touching flash
//! 2. Open a write session on the next update partition
//! 3. Copy the body in fixed chunks, exactly as many bytes as declared
//! 4. Finalize the image, then switch the boot partition
//! 5. Answer, give the response time to flush, restart
//!
//! Any failure before step 4 completes aborts the session, so a partially
//! written image is never marked bootable.

use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::OtaConfig;
use crate::error::{HandlerError, OtaError};
use crate::http::{respond, ErrorCode, ErrorResponse, Exchange, Handler, Status};
use crate::platform::Platform;

pub const OTA_PATH: &str = "/ota";

/// Source of update sessions, one per upload.
pub trait UpdatePartition: Send + Sync {
    type Session: UpdateSession;

    /// Locate the next inactive partition and open a session of unknown size.
    fn begin(&self) -> Result<Self::Session, OtaError>;
}

/// One open write session on an update partition.
pub trait UpdateSession {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError>;

    /// Validate and close the image. The session is closed even on failure.
    fn finalize(&mut self) -> Result<(), OtaError>;

    /// Make the finalized image the next boot target.
    fn set_boot(&mut self) -> Result<(), OtaError>;

    fn abort(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Closed,
}

/// Aborts the session on drop unless it was finalized.
struct SessionGuard<S: UpdateSession> {
    session: S,
    state: SessionState,
}

impl<S: UpdateSession> SessionGuard<S> {
    fn new(session: S) -> Self {
        Self { session, state: SessionState::Open }
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        self.session.write(chunk)
    }

    fn finalize(&mut self) -> Result<(), OtaError> {
        self.state = SessionState::Closed;
        self.session.finalize()
    }

    fn set_boot(&mut self) -> Result<(), OtaError> {
        self.session.set_boot()
    }
}

impl<S: UpdateSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            log::warn!("Aborting OTA session");
            self.session.abort();
        }
    }
}

/// Outcome of a fully written and activated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub bytes_written: u64,
    pub sha256: String,
}

struct Rejection {
    code: ErrorCode,
    message: String,
    cause: HandlerError,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>, cause: impl Into<HandlerError>) -> Self {
        Self { code, message: message.into(), cause: cause.into() }
    }
}

pub struct UpdateHandler<P, D> {
    partition: P,
    platform: D,
    config: OtaConfig,
}

impl<P: UpdatePartition, D: Platform> UpdateHandler<P, D> {
    pub fn new(partition: P, platform: D, config: OtaConfig) -> Self {
        Self { partition, platform, config }
    }

    fn receive_image(&self, exchange: &mut dyn Exchange) -> Result<UpdateReport, Rejection> {
        let declared = exchange.content_len().unwrap_or(0);
        if declared == 0 {
            log::error!("OTA request without payload");
            return Err(Rejection::new(
                ErrorCode::BadRequest,
                "Content-Length required",
                HandlerError::BadRequest("empty upload"),
            ));
        }

        log::info!("OTA update started, size: {} bytes", declared);

        let session = self.partition.begin().map_err(|e| {
            log::error!("OTA begin failed: {}", e);
            Rejection::new(ErrorCode::Internal, e.to_string(), e)
        })?;
        let mut session = SessionGuard::new(session);

        let chunk_size = self.config.chunk_size.max(1);
        let interval = self.config.progress_interval.max(1) as u64;
        let mut buffer = vec![0u8; chunk_size];
        let mut hasher = Sha256::new();
        let mut remaining = declared;
        let mut written: u64 = 0;

        while remaining > 0 {
            let want = remaining.min(chunk_size as u64) as usize;
            let received = match exchange.recv(&mut buffer[..want]) {
                Ok(0) => {
                    log::error!("Peer closed after {} of {} bytes", written, declared);
                    return Err(Rejection::new(
                        ErrorCode::BadRequest,
                        "Upload ended early",
                        HandlerError::BadRequest("truncated upload"),
                    ));
                }
                Ok(n) => n.min(want),
                Err(e) => {
                    log::error!("OTA receive failed after {} bytes: {}", written, e);
                    return Err(Rejection::new(ErrorCode::BadRequest, "Receive failed", e));
                }
            };

            let chunk = &buffer[..received];
            if let Err(e) = session.write(chunk) {
                log::error!("OTA write failed after {} bytes: {}", written, e);
                return Err(Rejection::new(ErrorCode::Internal, e.to_string(), e));
            }
            hasher.update(chunk);

            let before = written;
            written += received as u64;
            remaining -= received as u64;

            if written / interval > before / interval {
                log::info!(
                    "OTA progress: {}/{} bytes ({}%)",
                    written,
                    declared,
                    written * 100 / declared
                );
            }
        }

        if let Err(e) = session.finalize() {
            log::error!("OTA finalize failed: {}", e);
            return Err(Rejection::new(ErrorCode::Internal, e.to_string(), e));
        }
        if let Err(e) = session.set_boot() {
            log::error!("Failed to switch boot partition: {}", e);
            return Err(Rejection::new(ErrorCode::Internal, e.to_string(), e));
        }

        Ok(UpdateReport {
            bytes_written: written,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }
}

impl<P: UpdatePartition, D: Platform> Handler for UpdateHandler<P, D> {
    fn handle(&self, exchange: &mut dyn Exchange) -> Result<(), HandlerError> {
        match self.receive_image(exchange) {
            Ok(report) => {
                log::info!(
                    "OTA update successful ({} bytes, sha256 {}), restarting...",
                    report.bytes_written,
                    report.sha256
                );
                let body = format!(
                    "OTA update successful ({} bytes, sha256 {}). Restarting...\n",
                    report.bytes_written, report.sha256
                );
                if let Err(e) = respond(
                    exchange,
                    Status::Ok,
                    &[("Content-Type", "text/plain")],
                    body.as_bytes(),
                ) {
                    log::warn!("OTA success response not delivered: {}", e);
                }
                self.platform
                    .delay(Duration::from_millis(self.config.restart_delay_ms as u64));
                self.platform.restart();
                Ok(())
            }
            Err(rejection) => {
                ErrorResponse::new(rejection.code, rejection.message).send(exchange);
                Err(rejection.cause)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Journal {
        begun: usize,
        writes: Vec<usize>,
        finalized: bool,
        aborted: bool,
        boot_set: bool,
    }

    #[derive(Clone, Default)]
    struct FakePartition {
        journal: Arc<Mutex<Journal>>,
    }

    struct FakeSession {
        journal: Arc<Mutex<Journal>>,
    }

    impl UpdatePartition for FakePartition {
        type Session = FakeSession;

        fn begin(&self) -> Result<FakeSession, OtaError> {
            self.journal.lock().unwrap().begun += 1;
            Ok(FakeSession { journal: self.journal.clone() })
        }
    }

    impl UpdateSession for FakeSession {
        fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
            self.journal.lock().unwrap().writes.push(chunk.len());
            Ok(())
        }
        fn finalize(&mut self) -> Result<(), OtaError> {
            self.journal.lock().unwrap().finalized = true;
            Ok(())
        }
        fn set_boot(&mut self) -> Result<(), OtaError> {
            self.journal.lock().unwrap().boot_set = true;
            Ok(())
        }
        fn abort(&mut self) {
            self.journal.lock().unwrap().aborted = true;
        }
    }

    #[test]
    fn test_guard_aborts_unless_finalized() {
        let partition = FakePartition::default();
        {
            let _guard = SessionGuard::new(partition.begin().unwrap());
        }
        assert!(partition.journal.lock().unwrap().aborted);

        let partition = FakePartition::default();
        {
            let mut guard = SessionGuard::new(partition.begin().unwrap());
            guard.finalize().unwrap();
        }
        let journal = partition.journal.lock().unwrap();
        assert!(journal.finalized);
        assert!(!journal.aborted);
    }
}
