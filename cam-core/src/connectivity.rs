//! Station link state machine.
//!
//! Radio events arrive on the system event task and are applied synchronously
//! by [`ConnectivityManager::handle_event`]. That is also the only place the
//! HTTP server is started or stopped, so a route is never registered against
//! an instance that is being torn down. A background thread drives the
//! connect/retry loop and otherwise idles while the link is up.

use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ConnectivityConfig;
use crate::error::RadioError;
use crate::http::Route;
use crate::registry::{HttpService, ServerFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered by the radio driver and the IP stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    Started,
    Disconnected { reason: u16 },
    GotIp { ip: Ipv4Addr },
}

/// The station interface of the radio.
pub trait Radio: Send + Sync {
    /// Ask the driver to associate. The outcome arrives later as an event.
    fn connect(&self) -> Result<(), RadioError>;
}

const CONNECTED_BIT: u8 = 1 << 0;
const FAILED_BIT: u8 = 1 << 1;

/// Latched condition bits. A wait consumes the bits it returns.
#[derive(Default)]
struct EventFlags {
    bits: Mutex<u8>,
    changed: Condvar,
}

impl EventFlags {
    fn set(&self, bits: u8) {
        let mut current = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        *current |= bits;
        self.changed.notify_all();
    }

    /// Block until any bit in `mask` is set or `timeout` elapses. Returns the
    /// matched bits (zero on timeout) and clears them.
    fn wait(&self, mask: u8, timeout: Option<Duration>) -> u8 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut bits = self.bits.lock().unwrap_or_else(PoisonError::into_inner);

        while *bits & mask == 0 {
            bits = match deadline {
                None => self.changed.wait(bits).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    self.changed
                        .wait_timeout(bits, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        let hit = *bits & mask;
        *bits &= !mask;
        hit
    }
}

struct Link {
    state: ConnectivityState,
    ip: Option<Ipv4Addr>,
}

pub struct ConnectivityManager<R: Radio, F: ServerFactory> {
    radio: R,
    http: Arc<HttpService<F>>,
    on_connect: Vec<Route>,
    config: ConnectivityConfig,
    link: Mutex<Link>,
    flags: EventFlags,
}

impl<R: Radio, F: ServerFactory> ConnectivityManager<R, F> {
    pub fn new(radio: R, http: Arc<HttpService<F>>, config: ConnectivityConfig) -> Self {
        Self {
            radio,
            http,
            on_connect: Vec::new(),
            config,
            link: Mutex::new(Link { state: ConnectivityState::Disconnected, ip: None }),
            flags: EventFlags::default(),
        }
    }

    /// Register `route` every time this manager brings the server up.
    pub fn with_route(mut self, route: Route) -> Self {
        self.on_connect.push(route);
        self
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectivityState) {
        let mut link = self.link();
        link.state = state;
        if state != ConnectivityState::Connected {
            link.ip = None;
        }
    }

    /// Move to `to` only if the link is still in `from`. Checked and applied
    /// under the link lock, so an event applied concurrently wins.
    fn transition_if(&self, from: ConnectivityState, to: ConnectivityState) -> bool {
        let mut link = self.link();
        if link.state != from {
            return false;
        }
        link.state = to;
        if to != ConnectivityState::Connected {
            link.ip = None;
        }
        true
    }

    pub fn status(&self) -> ConnectivityState {
        self.link().state
    }

    /// Station address, only while connected.
    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        let link = self.link();
        match link.state {
            ConnectivityState::Connected => link.ip,
            _ => None,
        }
    }

    pub fn is_http_server_running(&self) -> bool {
        self.status() == ConnectivityState::Connected && self.http.is_running()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn http(&self) -> &Arc<HttpService<F>> {
        &self.http
    }

    /// Apply one radio or IP event.
    pub fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Started => {
                log::info!("WiFi started, attempting to connect...");
                self.set_state(ConnectivityState::Connecting);
                if let Err(e) = self.radio.connect() {
                    log::error!("WiFi connect request failed: {}", e);
                }
            }
            RadioEvent::Disconnected { reason } => {
                log::warn!(
                    "WiFi disconnected (reason: {}), will retry in {} ms",
                    reason,
                    self.config.retry_delay_ms
                );
                self.set_state(ConnectivityState::Disconnected);

                if self.http.is_running() {
                    log::info!("Stopping HTTP server due to WiFi disconnection");
                    if let Err(e) = self.http.stop() {
                        log::error!("HTTP server did not stop cleanly: {}", e);
                    }
                }

                self.flags.set(FAILED_BIT);
            }
            RadioEvent::GotIp { ip } => {
                log::info!("WiFi connected! IP: {}", ip);
                {
                    let mut link = self.link();
                    link.state = ConnectivityState::Connected;
                    link.ip = Some(ip);
                }

                if !self.http.is_running() {
                    self.bring_up_server();
                }

                self.flags.set(CONNECTED_BIT);
            }
        }
    }

    fn bring_up_server(&self) {
        let handle = match self.http.start() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Failed to start HTTP server: {}", e);
                return;
            }
        };

        for route in &self.on_connect {
            if let Err(e) = self.http.register(handle, route.clone()) {
                log::error!("Failed to register {} {}: {}", route.method, route.path, e);
            }
        }
    }

    /// One round of the background loop. Returns once the round ends without
    /// a link, or after an established link has dropped again.
    pub fn step(&self) -> ConnectivityState {
        if self.status() == ConnectivityState::Disconnected {
            log::info!("Attempting WiFi connection...");
            self.set_state(ConnectivityState::Connecting);
            if let Err(e) = self.radio.connect() {
                log::error!("WiFi connect failed: {}", e);
                self.set_state(ConnectivityState::Disconnected);
            }
        }

        let bits = self
            .flags
            .wait(CONNECTED_BIT | FAILED_BIT, Some(self.config.connect_timeout()));

        // Both bits may be latched; the link state says which event was last
        if bits != 0 && self.status() == ConnectivityState::Connected {
            log::info!("WiFi connection successful");
            self.flags.wait(FAILED_BIT, None);
        } else {
            if bits != 0 {
                log::warn!("WiFi connection failed, retrying");
            } else {
                log::warn!("WiFi connection timeout, retrying...");
            }
            // A GotIp applied since the wait returned must survive
            self.transition_if(ConnectivityState::Connecting, ConnectivityState::Disconnected);
        }

        let state = self.status();
        if state != ConnectivityState::Connected {
            std::thread::sleep(self.config.retry_delay());
        }
        state
    }
}

impl<R, F> ConnectivityManager<R, F>
where
    R: Radio + 'static,
    F: ServerFactory + 'static,
{
    /// Spawn the background connect loop.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, RadioError> {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("wifi".into())
            .stack_size(self.config.task_stack_size)
            .spawn(move || {
                log::info!("WiFi task started");
                loop {
                    manager.step();
                }
            })
            .map_err(|e| {
                log::error!("Failed to create WiFi task: {}", e);
                RadioError::Spawn(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::error::{HandlerError, RegistryError};
    use crate::http::{Exchange, Handler, Method};
    use crate::registry::RouteServer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRadio {
        connects: AtomicUsize,
        fail: bool,
    }

    impl Radio for CountingRadio {
        fn connect(&self) -> Result<(), RadioError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RadioError::Connect(-1));
            }
            Ok(())
        }
    }

    struct NullServer;

    impl RouteServer for NullServer {
        fn register(&mut self, _route: &Route) -> Result<(), RegistryError> {
            Ok(())
        }
        fn deregister(&mut self, _path: &str, _method: Method) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    struct NullFactory;

    impl ServerFactory for NullFactory {
        type Server = NullServer;

        fn start(&self, _config: &HttpConfig) -> Result<NullServer, RegistryError> {
            Ok(NullServer)
        }
    }

    struct Noop;

    impl Handler for Noop {
        fn handle(&self, _exchange: &mut dyn Exchange) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn fast_config() -> ConnectivityConfig {
        ConnectivityConfig { connect_timeout_ms: 20, retry_delay_ms: 0, ..Default::default() }
    }

    fn manager(radio: CountingRadio) -> ConnectivityManager<CountingRadio, NullFactory> {
        let http = Arc::new(HttpService::new(NullFactory, HttpConfig::default()));
        ConnectivityManager::new(radio, http, fast_config())
            .with_route(Route::new("/ota", Method::Post, Arc::new(Noop)))
    }

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);

    #[test]
    fn test_started_issues_connect() {
        let m = manager(CountingRadio::default());
        m.handle_event(RadioEvent::Started);
        assert_eq!(m.status(), ConnectivityState::Connecting);
        assert_eq!(m.radio.connects.load(Ordering::SeqCst), 1);
        assert!(m.ip_address().is_none());
    }

    #[test]
    fn test_got_ip_starts_server_and_registers_routes() {
        let m = manager(CountingRadio::default());
        m.handle_event(RadioEvent::GotIp { ip: IP });

        assert_eq!(m.status(), ConnectivityState::Connected);
        assert_eq!(m.ip_address(), Some(IP));
        assert!(m.is_http_server_running());
        let handle = m.http().handle().unwrap();
        assert!(m.http().is_registered(handle, "/ota", Method::Post));
    }

    #[test]
    fn test_disconnect_stops_server() {
        let m = manager(CountingRadio::default());
        m.handle_event(RadioEvent::GotIp { ip: IP });
        m.handle_event(RadioEvent::Disconnected { reason: 201 });

        assert_eq!(m.status(), ConnectivityState::Disconnected);
        assert!(m.ip_address().is_none());
        assert!(!m.http().is_running());
        assert!(!m.is_http_server_running());
    }

    #[test]
    fn test_step_times_out_back_to_disconnected() {
        let m = manager(CountingRadio::default());
        assert_eq!(m.step(), ConnectivityState::Disconnected);
        assert_eq!(m.step(), ConnectivityState::Disconnected);
        assert_eq!(m.radio.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_step_survives_connect_request_failure() {
        let m = manager(CountingRadio { fail: true, ..Default::default() });
        assert_eq!(m.step(), ConnectivityState::Disconnected);
        assert_eq!(m.radio.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_signal_is_consumed_by_one_round() {
        let m = manager(CountingRadio::default());
        m.handle_event(RadioEvent::Disconnected { reason: 2 });
        assert_eq!(m.step(), ConnectivityState::Disconnected);
        // Nothing left latched: the next round has to time out.
        let started = Instant::now();
        m.step();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_step_idles_while_connected() {
        let m = Arc::new(manager(CountingRadio::default()));
        let worker = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || m.step())
        };

        m.handle_event(RadioEvent::GotIp { ip: IP });
        std::thread::sleep(Duration::from_millis(60));
        assert!(!worker.is_finished());

        m.handle_event(RadioEvent::Disconnected { reason: 8 });
        assert_eq!(worker.join().unwrap(), ConnectivityState::Disconnected);
    }

    #[test]
    fn test_up_then_down_before_wait_does_not_idle() {
        let m = Arc::new(manager(CountingRadio::default()));
        m.handle_event(RadioEvent::GotIp { ip: IP });
        m.handle_event(RadioEvent::Disconnected { reason: 8 });

        let worker = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || m.step())
        };
        let started = Instant::now();
        while !worker.is_finished() && started.elapsed() < Duration::from_millis(500) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.is_finished(), "retry round blocked while the link is down");
        assert_eq!(worker.join().unwrap(), ConnectivityState::Disconnected);

        // Both latched bits were consumed; the next round times out normally.
        assert_eq!(m.step(), ConnectivityState::Disconnected);
    }

    #[test]
    fn test_down_then_up_before_wait_idles() {
        let m = Arc::new(manager(CountingRadio::default()));
        m.handle_event(RadioEvent::Disconnected { reason: 8 });
        m.handle_event(RadioEvent::GotIp { ip: IP });

        let worker = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || m.step())
        };
        std::thread::sleep(Duration::from_millis(60));
        assert!(!worker.is_finished());

        m.handle_event(RadioEvent::Disconnected { reason: 8 });
        assert_eq!(worker.join().unwrap(), ConnectivityState::Disconnected);
    }

    #[test]
    fn test_timeout_does_not_clobber_late_connect() {
        let m = manager(CountingRadio::default());
        // GotIp applied after the wait already gave up: state is Connected
        // but the round saw no bits.
        m.handle_event(RadioEvent::GotIp { ip: IP });
        assert_eq!(m.flags.wait(CONNECTED_BIT, Some(Duration::ZERO)), CONNECTED_BIT);

        assert_eq!(m.step(), ConnectivityState::Connected);
        assert_eq!(m.ip_address(), Some(IP));
        assert!(m.is_http_server_running());
    }

    #[test]
    fn test_transition_if_requires_expected_state() {
        let m = manager(CountingRadio::default());
        m.handle_event(RadioEvent::GotIp { ip: IP });
        assert!(!m.transition_if(ConnectivityState::Connecting, ConnectivityState::Disconnected));
        assert_eq!(m.status(), ConnectivityState::Connected);
        assert_eq!(m.ip_address(), Some(IP));

        m.handle_event(RadioEvent::Started);
        assert!(m.transition_if(ConnectivityState::Connecting, ConnectivityState::Disconnected));
        assert_eq!(m.status(), ConnectivityState::Disconnected);
    }

    #[test]
    fn test_event_flags_wait_times_out() {
        let flags = EventFlags::default();
        assert_eq!(flags.wait(CONNECTED_BIT, Some(Duration::from_millis(5))), 0);
        flags.set(FAILED_BIT);
        assert_eq!(flags.wait(CONNECTED_BIT, Some(Duration::from_millis(5))), 0);
        assert_eq!(flags.wait(CONNECTED_BIT | FAILED_BIT, None), FAILED_BIT);
    }
}
