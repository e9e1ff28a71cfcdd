//! Device power lifecycle: INIT, ACTIVE, NAP, SLEEP and SUSPEND.

use super::device::{Device, DeviceInner};
use crate::error::{KgslError, KgslResult};
use crate::kgsl::device::PowerState;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Power bookkeeping, guarded by the device lock.
#[derive(Debug)]
pub(crate) struct PwrState {
    pub state: PowerState,
    /// Target of a transition in progress, `PowerState::None` otherwise.
    pub requested: PowerState,
    pub nap_allowed: bool,
    /// Operations in flight that a suspend must wait out.
    pub active_cnt: u32,
}

impl PwrState {
    pub const fn new(nap_allowed: bool) -> Self {
        Self {
            state: PowerState::Init,
            requested: PowerState::None,
            nap_allowed,
            active_cnt: 0,
        }
    }
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// One-shot timer that pushes an idle device into a deeper sleep.
///
/// Backed by a thread that only holds a weak reference to its device, so the device can be
/// dropped while the timer is armed.
#[derive(Debug, Default)]
pub(crate) struct IdleTimer {
    shared: Arc<TimerShared>,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, device: Weak<Device>, name: &str) -> KgslResult<()> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("{name}-idle"))
            .spawn(move || Self::run(&shared, &device))?;
        Ok(())
    }

    fn run(shared: &TimerShared, device: &Weak<Device>) {
        let mut st = shared.state.lock();
        loop {
            if st.shutdown {
                return;
            }
            match st.deadline {
                None => shared.cond.wait(&mut st),
                Some(deadline) if Instant::now() >= deadline => {
                    st.deadline = None;
                    let alive = MutexGuard::unlocked(&mut st, || {
                        device.upgrade().map(|dev| dev.idle_timer_expired()).is_some()
                    });
                    if !alive {
                        return;
                    }
                }
                Some(deadline) => {
                    shared.cond.wait_until(&mut st, deadline);
                }
            }
        }
    }

    /// (Re)arms the timer to fire `after` from now.
    pub fn arm(&self, after: Duration) {
        let mut st = self.shared.state.lock();
        st.deadline = Some(Instant::now() + after);
        self.shared.cond.notify_one();
    }

    pub fn cancel(&self) {
        let mut st = self.shared.state.lock();
        st.deadline = None;
        self.shared.cond.notify_one();
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        st.shutdown = true;
        self.shared.cond.notify_all();
    }
}

impl Device {
    /// Blocks while the device is suspended.
    pub(crate) fn check_suspended(&self, inner: &mut MutexGuard<'_, DeviceInner>) {
        while inner.pwr.state == PowerState::Suspend {
            self.hwaccess.wait(inner);
        }
    }

    /// Brings a napping or sleeping device back to ACTIVE.
    pub(crate) fn wake_locked(&self, inner: &mut DeviceInner) {
        if !inner.pwr.state.is_idle() {
            return;
        }
        match self.ops.wake() {
            Ok(()) => {
                inner.pwr.state = PowerState::Active;
                info!(device = %self.name, "state -> ACTIVE");
                self.idle_timer.arm(self.config.idle_timeout);
            }
            Err(e) => error!(device = %self.name, "wake from {} failed: {e}", inner.pwr.state),
        }
    }

    /// Naps the device if nothing is outstanding. A refused nap is retried by the idle timer.
    pub(crate) fn check_idle_locked(&self, inner: &mut DeviceInner) {
        let pwr = &mut inner.pwr;
        if !pwr.nap_allowed || pwr.state != PowerState::Active || pwr.active_cnt != 0 {
            return;
        }

        pwr.requested = PowerState::Nap;
        match self.ops.sleep(PowerState::Nap) {
            Ok(()) => {
                pwr.state = PowerState::Nap;
                info!(device = %self.name, "state -> NAP");
            }
            Err(e) => {
                debug!(device = %self.name, "nap refused, retrying later: {e}");
                self.idle_timer.arm(self.config.idle_timeout);
            }
        }
        pwr.requested = PowerState::None;
    }

    /// Idle check for callers that do not hold the device lock.
    pub fn check_idle(&self) {
        let mut inner = self.inner.lock();
        self.check_idle_locked(&mut inner);
    }

    /// Called from the idle timer thread.
    pub(crate) fn idle_timer_expired(&self) {
        let mut inner = self.inner.lock();
        let pwr = &mut inner.pwr;
        // The state may have moved on since the timer was armed.
        if !pwr.nap_allowed
            || !matches!(pwr.state, PowerState::Active | PowerState::Nap)
            || pwr.active_cnt != 0
            || pwr.requested != PowerState::None
        {
            return;
        }

        pwr.requested = PowerState::Sleep;
        match self.ops.sleep(PowerState::Sleep) {
            Ok(()) => {
                pwr.state = PowerState::Sleep;
                info!(device = %self.name, "state -> SLEEP");
            }
            Err(e) => {
                debug!(device = %self.name, "sleep refused, retrying later: {e}");
                self.idle_timer.arm(self.config.idle_timeout);
            }
        }
        pwr.requested = PowerState::None;
    }

    /// Quiesces and stops the device.
    ///
    /// Waits for every in-flight operation counted in the active count. Only valid from
    /// ACTIVE, NAP or SLEEP.
    ///
    /// # Errors
    /// Returns `KgslError::State` from any other state or while another suspend is in
    /// progress, and the hardware layer's error if stopping fails (the device is then left
    /// in INIT).
    pub fn suspend(&self) -> KgslResult<()> {
        let mut inner = self.inner.lock();
        let from = inner.pwr.state;
        if !matches!(
            from,
            PowerState::Active | PowerState::Nap | PowerState::Sleep
        ) {
            error!(device = %self.name, "suspend requested in state {from}");
            return Err(KgslError::State(format!("cannot suspend from {from}")));
        }
        if inner.pwr.requested == PowerState::Suspend {
            error!(device = %self.name, "suspend already in progress");
            return Err(KgslError::State("suspend already in progress".into()));
        }
        warn!(device = %self.name, "suspend start");

        let nap_allowed = inner.pwr.nap_allowed;
        inner.pwr.nap_allowed = false;
        inner.pwr.requested = PowerState::Suspend;

        while inner.pwr.active_cnt != 0 {
            self.quiescent.wait(&mut inner);
        }

        let result = self.suspend_locked(&mut inner);
        inner.pwr.nap_allowed = nap_allowed;
        inner.pwr.requested = PowerState::None;

        match &result {
            Ok(()) => warn!(device = %self.name, "suspend end"),
            Err(e) => error!(device = %self.name, "suspend failed: {e}"),
        }
        result
    }

    fn suspend_locked(&self, inner: &mut DeviceInner) -> KgslResult<()> {
        let state = inner.pwr.state;
        // The last handle may have closed while we waited.
        if !matches!(
            state,
            PowerState::Active | PowerState::Nap | PowerState::Sleep
        ) {
            return Err(KgslError::State(format!("cannot suspend from {state}")));
        }

        self.idle_timer.cancel();
        if state == PowerState::Active {
            if let Err(e) = self.ops.idle(self.config.idle_wait_timeout) {
                warn!(device = %self.name, "device did not idle before suspend: {e}");
            }
        }

        let contexts = self.ops.suspend_contexts();
        let stopped = self.ops.stop();
        if let Err(e) = contexts.and(stopped) {
            inner.pwr.state = PowerState::Init;
            warn!(device = %self.name, "state -> INIT");
            return Err(e);
        }

        inner.pwr.state = PowerState::Suspend;
        warn!(device = %self.name, "state -> SUSPEND");
        Ok(())
    }

    /// Restarts a suspended device and releases every operation blocked on it.
    ///
    /// A failed restart leaves the device in INIT.
    ///
    /// # Errors
    /// Returns `KgslError::State` unless the device is suspended, or the hardware layer's
    /// error from restarting it.
    pub fn resume(&self) -> KgslResult<()> {
        let mut inner = self.inner.lock();
        if inner.pwr.state != PowerState::Suspend {
            error!(device = %self.name, "resume requested in state {}", inner.pwr.state);
            return Err(KgslError::State(format!(
                "cannot resume from {}",
                inner.pwr.state
            )));
        }
        warn!(device = %self.name, "resume start");

        inner.pwr.requested = PowerState::Active;
        let result = match self.ops.start(false) {
            Ok(()) => {
                inner.pwr.state = PowerState::Active;
                warn!(device = %self.name, "state -> ACTIVE");
                self.idle_timer.arm(self.config.idle_timeout);
                self.ops.resume_contexts()
            }
            Err(e) => {
                inner.pwr.state = PowerState::Init;
                error!(device = %self.name, "resume failed, state -> INIT: {e}");
                Err(e)
            }
        };
        inner.pwr.requested = PowerState::None;
        self.hwaccess.notify_all();

        if result.is_ok() {
            warn!(device = %self.name, "resume end");
        }
        result
    }

    /// Enables or disables napping between operations.
    pub fn set_nap_allowed(&self, allowed: bool) {
        self.inner.lock().pwr.nap_allowed = allowed;
    }

    #[must_use]
    pub fn power_state(&self) -> PowerState {
        self.inner.lock().pwr.state
    }

    #[must_use]
    pub fn requested_state(&self) -> PowerState {
        self.inner.lock().pwr.requested
    }

    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.inner.lock().pwr.active_cnt
    }

    #[must_use]
    pub fn idle_timer_armed(&self) -> bool {
        self.idle_timer.is_armed()
    }
}
