//! Digital-input monitor for the bench fixture's GPIO expander.
//!
//! The fixture wires test points to byte-wide GPIO ports with arbitrary
//! polarity: some signals assert high, some low. [`GpioMonitor`] polls the
//! registered inputs on a fixed cadence, normalizes each raw bit into a
//! logical active/inactive level, and dispatches the registered callback
//! exactly once per observed transition. A double toggle inside one poll
//! interval is invisible; only the observed level counts.
//!
//! Callbacks run on the polling thread **while the registry lock is held**,
//! so they must be short and non-blocking. A slow callback stalls every
//! other input and blocks [`GpioMonitor::set_callback`] /
//! [`GpioMonitor::set_output`] callers for its full duration.

use crate::fault::FaultLatch;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Which electrical level counts as logically active for a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    High,
    Low,
}

impl ActiveState {
    /// Normalize a raw electrical bit into a logical level.
    pub fn logical_level(self, raw_bit: bool) -> bool {
        match self {
            Self::High => raw_bit,
            Self::Low => !raw_bit,
        }
    }

    /// Electrical bit that realizes a requested logical level. The same
    /// involution as [`Self::logical_level`], named for the write path.
    pub fn electrical_level(self, logical: bool) -> bool {
        self.logical_level(logical)
    }
}

/// Immutable per-signal descriptor. Defined once at startup.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub port: String,
    pub pin: u8,
    pub active_state: ActiveState,
}

impl ChannelConfig {
    pub fn new(
        name: impl Into<String>,
        port: impl Into<String>,
        pin: u8,
        active_state: ActiveState,
    ) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
            pin,
            active_state,
        }
    }
}

/// One byte-wide GPIO port on the fixture hardware.
pub trait GpioPort: Send + Sync {
    fn read(&self) -> std::io::Result<u8>;
    fn write(&self, value: u8) -> std::io::Result<()>;
}

/// Transition callback: receives the new logical level. User data travels
/// in the closure's captures.
pub type InputCallback = Box<dyn FnMut(bool) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("Fixture I/O fault latched: {0}")]
    Faulted(String),

    #[error("'{0}' is not a configured input")]
    UnknownInput(String),

    #[error("Port '{0}' is not bound")]
    PortNotBound(String),

    #[error("Reading '{port}' failed: {source}")]
    PortIo {
        port: String,
        source: std::io::Error,
    },
}

struct Registration {
    callback: InputCallback,
    last_known_active: bool,
}

/// Everything the polling thread and the orchestrator share. One mutex
/// guards the whole table; it is small and touched infrequently relative
/// to the poll cadence, so finer locking buys nothing.
struct Registry {
    ports: HashMap<String, Option<Arc<dyn GpioPort>>>,
    callbacks: HashMap<String, Registration>,
}

struct Shared {
    inputs: Vec<ChannelConfig>,
    outputs: Vec<ChannelConfig>,
    registry: Mutex<Registry>,
    fault: FaultLatch,
    stop: AtomicBool,
    poll_interval: Duration,
}

/// Polling monitor over a fixed set of input and output signals.
///
/// Dropping the monitor stops the polling thread.
pub struct GpioMonitor {
    shared: Arc<Shared>,
    poll_thread: Option<JoinHandle<()>>,
}

impl GpioMonitor {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

    pub fn new(inputs: Vec<ChannelConfig>, outputs: Vec<ChannelConfig>) -> Self {
        Self::with_poll_interval(inputs, outputs, Self::POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        inputs: Vec<ChannelConfig>,
        outputs: Vec<ChannelConfig>,
        poll_interval: Duration,
    ) -> Self {
        let mut ports = HashMap::new();
        for config in inputs.iter().chain(outputs.iter()) {
            ports.entry(config.port.clone()).or_insert(None);
        }

        let shared = Arc::new(Shared {
            inputs,
            outputs,
            registry: Mutex::new(Registry {
                ports,
                callbacks: HashMap::new(),
            }),
            fault: FaultLatch::new(),
            stop: AtomicBool::new(false),
            poll_interval,
        });

        let poll_shared = Arc::clone(&shared);
        let poll_thread = thread::spawn(move || poll_loop(&poll_shared));

        Self {
            shared,
            poll_thread: Some(poll_thread),
        }
    }

    /// Bind a port handle to one of the configured port names. Handles are
    /// assigned once at fixture setup and treated as read-only thereafter.
    pub fn set_port(&self, name: &str, port: Arc<dyn GpioPort>) -> bool {
        let mut registry = lock_registry(&self.shared);
        match registry.ports.get_mut(name) {
            Some(slot) => {
                *slot = Some(port);
                true
            }
            None => false,
        }
    }

    /// Install or replace the transition callback for a configured input.
    ///
    /// The tracked level resets to inactive, so the next tick re-evaluates
    /// the signal: an input already active at registration fires once.
    pub fn set_callback(
        &self,
        name: &str,
        callback: impl FnMut(bool) + Send + 'static,
    ) -> bool {
        if find_channel(&self.shared.inputs, name).is_none() {
            return false;
        }
        let mut registry = lock_registry(&self.shared);
        registry.callbacks.insert(
            name.to_string(),
            Registration {
                callback: Box::new(callback),
                last_known_active: false,
            },
        );
        true
    }

    /// Remove the callback for `name`. False when none was registered.
    pub fn clear_callback(&self, name: &str) -> bool {
        let mut registry = lock_registry(&self.shared);
        registry.callbacks.remove(name).is_some()
    }

    /// On-demand synchronous read of a signal's logical level, bypassing
    /// the callback path.
    pub fn read_logical_state(&self, name: &str) -> Result<bool, GpioError> {
        if let (true, message) = self.shared.fault.info() {
            return Err(GpioError::Faulted(message));
        }
        let config = find_channel(&self.shared.inputs, name)
            .ok_or_else(|| GpioError::UnknownInput(name.to_string()))?;

        let port = {
            let registry = lock_registry(&self.shared);
            bound_port(&registry, &config.port)
                .ok_or_else(|| GpioError::PortNotBound(config.port.clone()))?
        };

        match port.read() {
            Ok(byte) => {
                let raw = byte & (1 << config.pin) != 0;
                Ok(config.active_state.logical_level(raw))
            }
            Err(source) => {
                self.shared
                    .fault
                    .latch(format!("Reading '{}' failed", config.port));
                Err(GpioError::PortIo {
                    port: config.port.clone(),
                    source,
                })
            }
        }
    }

    /// Drive a configured output to the requested logical state.
    ///
    /// The port byte is read-modify-written under the registry mutex so the
    /// poll tick cannot interleave, and only when the bit actually changes.
    /// Returns false without latching when the name is unknown or the port
    /// unbound; latches the fault on a real I/O error.
    pub fn set_output(&self, name: &str, active: bool, settle: Duration) -> bool {
        if self.shared.fault.is_faulted() {
            return false;
        }
        let Some(config) = find_channel(&self.shared.outputs, name) else {
            return false;
        };

        {
            let registry = lock_registry(&self.shared);
            let Some(port) = bound_port(&registry, &config.port) else {
                return false;
            };

            let current = match port.read() {
                Ok(byte) => byte,
                Err(_) => {
                    self.shared
                        .fault
                        .latch(format!("Reading '{}' failed", config.port));
                    return false;
                }
            };

            let pin_bit = 1u8 << config.pin;
            let want_set = config.active_state.electrical_level(active);
            let updated = if want_set {
                current | pin_bit
            } else {
                current & !pin_bit
            };

            if updated != current && port.write(updated).is_err() {
                self.shared
                    .fault
                    .latch(format!("Writing '{}' failed", config.port));
                return false;
            }
        }

        if !settle.is_zero() {
            thread::sleep(settle);
        }
        true
    }

    /// Drive every configured output to its inactive state, in
    /// configuration order, then optionally settle.
    pub fn reset_all_outputs(&self, delay: Duration) -> bool {
        if self.shared.fault.is_faulted() {
            return false;
        }
        for config in &self.shared.outputs {
            if !self.set_output(&config.name, false, Duration::ZERO) {
                return false;
            }
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        true
    }

    pub fn io_fault_info(&self) -> (bool, String) {
        self.shared.fault.info()
    }
}

impl Drop for GpioMonitor {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}

fn find_channel<'a>(table: &'a [ChannelConfig], name: &str) -> Option<&'a ChannelConfig> {
    table.iter().find(|config| config.name == name)
}

fn bound_port(registry: &Registry, port_name: &str) -> Option<Arc<dyn GpioPort>> {
    registry.ports.get(port_name).and_then(Clone::clone)
}

fn lock_registry(shared: &Shared) -> MutexGuard<'_, Registry> {
    // A panicking callback must not take the whole fixture down with it.
    shared.registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polling thread body. Exits permanently once the fault latch is set or
/// the monitor is dropped; a failing port is never retried.
fn poll_loop(shared: &Shared) {
    while !shared.stop.load(Ordering::Relaxed) {
        thread::sleep(shared.poll_interval);
        if shared.fault.is_faulted() {
            log::warn!("Input polling halted by latched I/O fault");
            return;
        }

        let mut registry = lock_registry(shared);
        let registry = &mut *registry;
        for (name, registration) in &mut registry.callbacks {
            let Some(config) = find_channel(&shared.inputs, name) else {
                continue;
            };
            let Some(port) = registry.ports.get(&config.port).and_then(Clone::clone) else {
                continue;
            };

            let byte = match port.read() {
                Ok(byte) => byte,
                Err(_) => {
                    shared
                        .fault
                        .latch(format!("Reading '{}' failed", config.port));
                    break;
                }
            };

            let raw = byte & (1 << config.pin) != 0;
            let level = config.active_state.logical_level(raw);
            if level != registration.last_known_active {
                registration.last_known_active = level;
                // Contract: callbacks run under the registry lock and must
                // return quickly.
                (registration.callback)(level);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, AtomicUsize};
    use std::sync::mpsc;
    use std::time::Instant;

    /// Fixture port with a settable byte and a scripted failure switch.
    struct TestPort {
        value: AtomicU8,
        fail_reads: AtomicBool,
        writes: Mutex<Vec<u8>>,
    }

    impl TestPort {
        fn new(initial: u8) -> Arc<Self> {
            Arc::new(Self {
                value: AtomicU8::new(initial),
                fail_reads: AtomicBool::new(false),
                writes: Mutex::new(Vec::new()),
            })
        }

        fn set_value(&self, value: u8) {
            self.value.store(value, Ordering::SeqCst);
        }

        fn written(&self) -> Vec<u8> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl GpioPort for TestPort {
        fn read(&self) -> std::io::Result<u8> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("i2c bus stuck"));
            }
            Ok(self.value.load(Ordering::SeqCst))
        }

        fn write(&self, value: u8) -> std::io::Result<()> {
            self.writes.lock().unwrap().push(value);
            self.value.store(value, Ordering::SeqCst);
            Ok(())
        }
    }

    const FAST_POLL: Duration = Duration::from_millis(5);
    /// Long enough that a changed port value is observed by several ticks.
    const OBSERVE: Duration = Duration::from_millis(60);

    fn input(name: &str, pin: u8, active_state: ActiveState) -> ChannelConfig {
        ChannelConfig::new(name, "gpioA", pin, active_state)
    }

    fn monitor_with_port(
        inputs: Vec<ChannelConfig>,
        outputs: Vec<ChannelConfig>,
        port: &Arc<TestPort>,
    ) -> GpioMonitor {
        let monitor = GpioMonitor::with_poll_interval(inputs, outputs, FAST_POLL);
        assert!(monitor.set_port("gpioA", Arc::clone(port) as Arc<dyn GpioPort>));
        monitor
    }

    #[test]
    fn polarity_truth_table() {
        assert!(ActiveState::High.logical_level(true));
        assert!(!ActiveState::High.logical_level(false));
        assert!(!ActiveState::Low.logical_level(true));
        assert!(ActiveState::Low.logical_level(false));
    }

    #[test]
    fn active_low_sequence_fires_twice() {
        // Raw 1,1,0,0,1 on an active-low input: logical stays inactive,
        // goes active at the third sample, back inactive at the fifth.
        let port = TestPort::new(0x01);
        let monitor = monitor_with_port(
            vec![input("FLOW1", 0, ActiveState::Low)],
            vec![],
            &port,
        );

        let levels = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&levels);
        assert!(monitor.set_callback("FLOW1", move |level| {
            seen.lock().unwrap().push(level);
        }));

        thread::sleep(OBSERVE); // raw 1 observed, logical inactive
        port.set_value(0x00);
        thread::sleep(OBSERVE); // raw 0 observed, logical active
        port.set_value(0x01);
        thread::sleep(OBSERVE); // raw 1 observed, logical inactive

        assert_eq!(*levels.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn active_at_start_fires_once() {
        let port = TestPort::new(0x02);
        let monitor = monitor_with_port(
            vec![input("BTN", 1, ActiveState::High)],
            vec![],
            &port,
        );

        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        assert!(monitor.set_callback("BTN", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));

        thread::sleep(OBSERVE);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Level unchanged across many further polls: no more invocations.
        thread::sleep(OBSERVE);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reregistering_resets_tracking_exactly_once() {
        let port = TestPort::new(0x01);
        let monitor = monitor_with_port(
            vec![input("BTN", 0, ActiveState::High)],
            vec![],
            &port,
        );

        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        assert!(monitor.set_callback("BTN", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(OBSERVE);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Replacing the registration forces one fresh evaluation, not two.
        let hits = Arc::clone(&count);
        assert!(monitor.set_callback("BTN", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(OBSERVE);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        thread::sleep(OBSERVE);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_input_is_rejected_without_fault() {
        let monitor = GpioMonitor::with_poll_interval(
            vec![input("BTN", 0, ActiveState::High)],
            vec![],
            FAST_POLL,
        );
        assert!(!monitor.set_callback("NOPE", |_| {}));
        assert!(!monitor.clear_callback("BTN"));
        assert!(matches!(
            monitor.read_logical_state("NOPE"),
            Err(GpioError::UnknownInput(_))
        ));
        assert_eq!(monitor.io_fault_info(), (false, String::new()));
    }

    #[test]
    fn clear_callback_removes_registration() {
        let port = TestPort::new(0x00);
        let monitor = monitor_with_port(
            vec![input("BTN", 0, ActiveState::High)],
            vec![],
            &port,
        );
        assert!(monitor.set_callback("BTN", |_| {}));
        assert!(monitor.clear_callback("BTN"));
        assert!(!monitor.clear_callback("BTN"));
    }

    #[test]
    fn read_logical_state_applies_polarity() {
        let port = TestPort::new(0x01);
        let monitor = monitor_with_port(
            vec![
                input("AH", 0, ActiveState::High),
                input("AL", 0, ActiveState::Low),
            ],
            vec![],
            &port,
        );
        assert_eq!(monitor.read_logical_state("AH").unwrap(), true);
        assert_eq!(monitor.read_logical_state("AL").unwrap(), false);
    }

    #[test]
    fn read_logical_state_requires_bound_port() {
        let monitor = GpioMonitor::with_poll_interval(
            vec![input("BTN", 0, ActiveState::High)],
            vec![],
            FAST_POLL,
        );
        assert!(matches!(
            monitor.read_logical_state("BTN"),
            Err(GpioError::PortNotBound(_))
        ));
    }

    #[test]
    fn read_failure_latches_and_halts_polling() {
        let port = TestPort::new(0x00);
        let monitor = monitor_with_port(
            vec![input("BTN", 0, ActiveState::High)],
            vec![],
            &port,
        );

        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        assert!(monitor.set_callback("BTN", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));

        port.fail_reads.store(true, Ordering::SeqCst);
        thread::sleep(OBSERVE);

        let (faulted, message) = monitor.io_fault_info();
        assert!(faulted);
        assert_eq!(message, "Reading 'gpioA' failed");

        // Polling has halted: a transition the thread would otherwise
        // report goes unobserved.
        port.fail_reads.store(false, Ordering::SeqCst);
        port.set_value(0x01);
        thread::sleep(OBSERVE);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(matches!(
            monitor.read_logical_state("BTN"),
            Err(GpioError::Faulted(_))
        ));
    }

    #[test]
    fn set_output_writes_only_on_change() {
        let port = TestPort::new(0x00);
        let monitor = monitor_with_port(
            vec![],
            vec![ChannelConfig::new("LED", "gpioA", 0, ActiveState::High)],
            &port,
        );

        assert!(monitor.set_output("LED", true, Duration::ZERO));
        assert_eq!(port.written(), vec![0x01]);

        // Bit already set: no further write.
        assert!(monitor.set_output("LED", true, Duration::ZERO));
        assert_eq!(port.written(), vec![0x01]);

        assert!(monitor.set_output("LED", false, Duration::ZERO));
        assert_eq!(port.written(), vec![0x01, 0x00]);
    }

    #[test]
    fn set_output_respects_polarity() {
        let port = TestPort::new(0x00);
        let monitor = monitor_with_port(
            vec![],
            vec![ChannelConfig::new("RELAY", "gpioA", 3, ActiveState::Low)],
            &port,
        );

        // Active-low: asserting the signal clears the bit, which at 0x00
        // is already the case, so the first write happens on deassert.
        assert!(monitor.set_output("RELAY", true, Duration::ZERO));
        assert_eq!(port.written(), Vec::<u8>::new());
        assert!(monitor.set_output("RELAY", false, Duration::ZERO));
        assert_eq!(port.written(), vec![0x08]);
    }

    #[test]
    fn set_output_unknown_or_unbound_fails_without_fault() {
        let monitor = GpioMonitor::with_poll_interval(
            vec![],
            vec![ChannelConfig::new("LED", "gpioA", 0, ActiveState::High)],
            FAST_POLL,
        );
        assert!(!monitor.set_output("NOPE", true, Duration::ZERO));
        assert!(!monitor.set_output("LED", true, Duration::ZERO)); // port unbound
        assert_eq!(monitor.io_fault_info(), (false, String::new()));
    }

    #[test]
    fn reset_all_outputs_deasserts_in_order() {
        let port = TestPort::new(0x0F);
        let monitor = monitor_with_port(
            vec![],
            vec![
                ChannelConfig::new("LED1", "gpioA", 0, ActiveState::High),
                ChannelConfig::new("LED2", "gpioA", 1, ActiveState::High),
                ChannelConfig::new("RELAY", "gpioA", 2, ActiveState::Low),
            ],
            &port,
        );

        assert!(monitor.reset_all_outputs(Duration::ZERO));
        // LED1 and LED2 clear their bits; RELAY inactive means bit set,
        // already the case at 0x0F.
        assert_eq!(port.written(), vec![0x0E, 0x0C]);
        assert_eq!(port.value.load(Ordering::SeqCst), 0x0C);
    }

    #[test]
    fn slow_callback_blocks_registry_access() {
        // Callbacks run under the registry lock. A deliberately slow
        // callback therefore stalls set_callback from the test thread,
        // which is exactly the documented contract.
        let port = TestPort::new(0x01);
        let monitor = monitor_with_port(
            vec![
                input("SLOW", 0, ActiveState::High),
                input("OTHER", 1, ActiveState::High),
            ],
            vec![],
            &port,
        );

        let (started_tx, started_rx) = mpsc::channel();
        assert!(monitor.set_callback("SLOW", move |_| {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(300));
        }));

        started_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("slow callback never ran");

        let start = Instant::now();
        assert!(monitor.set_callback("OTHER", |_| {}));
        assert!(
            start.elapsed() >= Duration::from_millis(150),
            "registry lock was not held across the callback"
        );
    }
}
