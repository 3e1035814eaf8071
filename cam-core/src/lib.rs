//! Camera Core - Hardware-independent logic for the ESP32-S3 camera firmware
//!
//! Connectivity state machine, firmware update pipeline and the MJPEG
//! streaming handlers, written against small traits so they run on the host
//! with mock collaborators. The firmware crate implements the traits on top
//! of ESP-IDF.

pub mod app;
pub mod capture;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod http;
pub mod ota;
pub mod platform;
pub mod registry;
pub mod stream;

pub use error::{HandlerError, OtaError, RadioError, RegistryError, TransportError};
