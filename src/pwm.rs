//! Software pulse-width modulation on top of a boolean output.
//!
//! A [`PwmChannel`] drives one [`BinaryOutput`] from two timers:
//!
//! - an interval timer, live exactly while the channel is enabled, that
//!   starts a pulse of `round(interval * duty)` milliseconds on every tick
//! - a one-shot duty timer, live only while a pulse is high, that ends it
//!
//! Every transition cancels the running timers before creating new ones, so
//! a channel never has more than one of each. Cancellation is enforced twice:
//! the tokio task is aborted, and a generation counter checked under the
//! state lock makes any tick or pulse end that was already past its await
//! point a no-op.
//!
//! Parameters changed while enabled restart the interval from zero phase.
//! Setting `duty = 0` while enabled ends the current pulse and forces the
//! output low but leaves the channel enabled with its interval timer running;
//! ticks are no-ops until the duty is raised again.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, warn};

use crate::core::Measurement;

/// Lower bound (exclusive) of the interval, in milliseconds.
pub const MIN_INTERVAL_MS: f64 = 32.0;
/// Upper bound (exclusive) of the interval, in milliseconds.
pub const MAX_INTERVAL_MS: f64 = 20_000.0;

/// Anything that can be switched on and off.
pub trait BinaryOutput: Send + Sync {
    /// Drive the output.
    fn set(&self, on: bool);
}

struct PwmState {
    interval: Measurement<f64>,
    duty: Measurement<f64>,
    mode: Measurement<bool>,
    interval_timer: Option<JoinHandle<()>>,
    duty_timer: Option<JoinHandle<()>>,
    generation: u64,
    pulse: u64,
}

struct Inner {
    name: String,
    output: OnceLock<Arc<dyn BinaryOutput>>,
    state: Mutex<PwmState>,
}

/// Duty-cycle generator owned by one boolean output.
pub struct PwmChannel {
    inner: Arc<Inner>,
}

impl PwmChannel {
    /// A disabled channel. The output is bound separately with [`bind`].
    ///
    /// [`bind`]: PwmChannel::bind
    pub fn new(name: impl Into<String>, interval_ms: f64, duty: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                output: OnceLock::new(),
                state: Mutex::new(PwmState {
                    interval: Measurement::new(interval_ms, "ms"),
                    duty: Measurement::new(duty, "0-1"),
                    mode: Measurement::new(false, ""),
                    interval_timer: None,
                    duty_timer: None,
                    generation: 0,
                    pulse: 0,
                }),
            }),
        }
    }

    /// Attach the output. Returns `false` if one was already attached.
    pub fn bind(&self, output: Arc<dyn BinaryOutput>) -> bool {
        self.inner.output.set(output).is_ok()
    }

    /// Current interval in milliseconds.
    pub fn interval(&self) -> Measurement<f64> {
        self.inner.state.lock().interval.clone()
    }

    /// Current duty fraction.
    pub fn duty(&self) -> Measurement<f64> {
        self.inner.state.lock().duty.clone()
    }

    /// Whether the channel is enabled.
    pub fn mode(&self) -> Measurement<bool> {
        self.inner.state.lock().mode.clone()
    }

    /// Whether the interval and duty timers are currently live.
    pub fn timers_live(&self) -> (bool, bool) {
        let state = self.inner.state.lock();
        (live(&state.interval_timer), live(&state.duty_timer))
    }

    /// Change the interval. Values outside `(32, 20000)` ms are ignored and
    /// `false` is returned.
    pub fn set_interval(&self, interval_ms: f64) -> bool {
        if !(interval_ms > MIN_INTERVAL_MS && interval_ms < MAX_INTERVAL_MS) {
            debug!("[{}] ignoring interval {}", self.inner.name, interval_ms);
            return false;
        }
        let mut state = self.inner.state.lock();
        state.interval.stamp(interval_ms);
        if state.mode.value {
            self.inner.restart(&mut state);
        }
        true
    }

    /// Change the duty fraction. Values outside `[0, 1]` are ignored and
    /// `false` is returned.
    pub fn set_duty(&self, duty: f64) -> bool {
        if !(0.0..=1.0).contains(&duty) {
            debug!("[{}] ignoring duty {}", self.inner.name, duty);
            return false;
        }
        let mut state = self.inner.state.lock();
        state.duty.stamp(duty);
        if !state.mode.value {
            return true;
        }
        if duty == 0.0 {
            state.pulse += 1;
            if let Some(timer) = state.duty_timer.take() {
                timer.abort();
            }
            self.inner.drive(false);
        } else {
            self.inner.restart(&mut state);
        }
        true
    }

    /// Enable or disable pulsing. Enabling an enabled channel restarts it;
    /// enabling a disabled one leaves the output alone until the first tick.
    pub fn set_mode(&self, enabled: bool) {
        let mut state = self.inner.state.lock();
        let was_enabled = state.mode.value;
        state.mode.stamp(enabled);
        match (was_enabled, enabled) {
            (true, true) => self.inner.restart(&mut state),
            (false, true) => {
                Inner::cancel(&mut state);
                self.inner.start(&mut state);
            }
            (_, false) => self.inner.stop(&mut state),
        }
    }
}

impl Drop for PwmChannel {
    fn drop(&mut self) {
        // The lock is held here when the output's last owner goes away while
        // it is being driven. Timers then stop at their next upgrade.
        if let Some(mut state) = self.inner.state.try_lock() {
            Inner::cancel(&mut state);
        }
    }
}

fn live(timer: &Option<JoinHandle<()>>) -> bool {
    timer.as_ref().is_some_and(|t| !t.is_finished())
}

impl Inner {
    fn drive(&self, on: bool) {
        match self.output.get() {
            Some(output) => output.set(on),
            None => debug!("[{}] no output bound", self.name),
        }
    }

    fn cancel(state: &mut PwmState) {
        state.generation += 1;
        if let Some(timer) = state.interval_timer.take() {
            timer.abort();
        }
        if let Some(timer) = state.duty_timer.take() {
            timer.abort();
        }
    }

    fn stop(&self, state: &mut PwmState) {
        Self::cancel(state);
        self.drive(false);
    }

    fn restart(self: &Arc<Self>, state: &mut PwmState) {
        self.stop(state);
        self.start(state);
    }

    fn start(self: &Arc<Self>, state: &mut PwmState) {
        let Ok(handle) = Handle::try_current() else {
            warn!("[{}] no runtime, PWM not started", self.name);
            return;
        };
        let generation = state.generation;
        let period = Duration::from_secs_f64(state.interval.value / 1000.0);
        let weak = Arc::downgrade(self);
        state.interval_timer = Some(handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.pulse(generation),
                    None => break,
                }
            }
        }));
    }

    fn pulse(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        let length = (state.interval.value * state.duty.value).round();
        if length < 1.0 {
            return;
        }
        if let Some(timer) = state.duty_timer.take() {
            timer.abort();
        }
        state.pulse += 1;
        let pulse = state.pulse;
        self.drive(true);

        let weak: Weak<Inner> = Arc::downgrade(self);
        state.duty_timer = Some(tokio::spawn(async move {
            sleep(Duration::from_millis(length as u64)).await;
            if let Some(inner) = weak.upgrade() {
                let state = inner.state.lock();
                if state.generation == generation && state.pulse == pulse {
                    inner.drive(false);
                }
            }
        }));
    }
}
