use std::time::Duration;

/// Scheduler and reset hooks of the target.
pub trait Platform: Send + Sync {
    /// Yield the calling task for `duration`.
    fn delay(&self, duration: Duration);

    /// Reboot the chip. Does not return on hardware.
    fn restart(&self);
}

/// Host implementation backed by `std::thread::sleep`. Restart only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPlatform;

impl Platform for StdPlatform {
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn restart(&self) {
        log::warn!("Restart requested on host platform, ignoring");
    }
}
