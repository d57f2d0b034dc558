//! Active connection management: heartbeats and idle close.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand_config::{AcmClose, AcmHeartbeat, AcmSettings};
use tokio_util::sync::CancellationToken;

use crate::{Connection, Timer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcmConfig {
    pub timeout: Duration,
    pub heartbeat: AcmHeartbeat,
    pub close: AcmClose,
}

impl AcmConfig {
    /// How often the monitor should tick for this config.
    pub fn tick_interval(&self) -> Duration {
        (self.timeout / 2).max(Duration::from_secs(1))
    }
}

impl From<&AcmSettings> for AcmConfig {
    fn from(settings: &AcmSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            heartbeat: settings.heartbeat,
            close: settings.close,
        }
    }
}

/// What the monitor needs to know about a connection to make a decision.
#[derive(Debug, Clone, Copy)]
pub struct ActivitySnapshot {
    pub last_activity: Instant,
    /// A message is queued or partially written.
    pub write_pending: bool,
    /// A message is partially read.
    pub read_in_progress: bool,
    pub dispatch_count: usize,
    pub batch_pending: bool,
    pub outstanding: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleClose {
    Graceful,
    Forceful,
}

pub fn should_heartbeat(now: Instant, snapshot: &ActivitySnapshot, config: &AcmConfig) -> bool {
    let due = config.heartbeat == AcmHeartbeat::Always
        || (config.heartbeat != AcmHeartbeat::Off
            && !snapshot.write_pending
            && now >= snapshot.last_activity + config.timeout / 4);
    due && (config.heartbeat != AcmHeartbeat::OnInvocation || snapshot.dispatch_count > 0)
}

pub fn idle_close(now: Instant, snapshot: &ActivitySnapshot, config: &AcmConfig) -> Option<IdleClose> {
    // A stalled transfer is the read/write timeout's business.
    if snapshot.read_in_progress || snapshot.write_pending {
        return None;
    }
    if config.close == AcmClose::Off || now < snapshot.last_activity + config.timeout {
        return None;
    }

    if config.close == AcmClose::OnIdleForceful
        || (config.close != AcmClose::OnIdle && snapshot.outstanding > 0)
    {
        Some(IdleClose::Forceful)
    } else if config.close != AcmClose::OnInvocation
        && snapshot.dispatch_count == 0
        && !snapshot.batch_pending
        && snapshot.outstanding == 0
    {
        Some(IdleClose::Graceful)
    } else {
        None
    }
}

/// Watches the active connections that share one [`AcmConfig`].
///
/// Connections register themselves while they are `Active`. Something external calls
/// [`ActivityMonitor::tick`] periodically, either directly or through
/// [`ActivityMonitor::schedule`].
pub struct ActivityMonitor {
    config: AcmConfig,
    connections: Mutex<Vec<Weak<Connection>>>,
    stop: CancellationToken,
}

impl ActivityMonitor {
    pub fn new(config: AcmConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &AcmConfig {
        &self.config
    }

    pub(crate) fn add(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.lock();
        let weak = Arc::downgrade(connection);
        if !connections.iter().any(|c| c.ptr_eq(&weak)) {
            connections.push(weak);
        }
    }

    pub(crate) fn remove(&self, connection: &Weak<Connection>) {
        self.connections
            .lock()
            .retain(|c| !c.ptr_eq(connection) && c.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every registered connection at `now`.
    pub fn tick(&self, now: Instant) {
        let live: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock();
            connections.retain(|c| c.strong_count() > 0);
            connections.iter().filter_map(Weak::upgrade).collect()
        };

        for connection in live {
            connection.monitor(now, &self.config);
        }
    }

    /// Tick every [`AcmConfig::tick_interval`] until [`ActivityMonitor::stop`] is called.
    pub fn schedule(self: &Arc<Self>, timer: Arc<dyn Timer>) {
        let monitor = Arc::downgrade(self);
        let interval = self.config.tick_interval();
        let rearm = timer.clone();
        timer.schedule(
            interval,
            Box::new(move || {
                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                if monitor.stop.is_cancelled() {
                    return;
                }
                monitor.tick(Instant::now());
                monitor.schedule(rearm);
            }),
        );
    }

    pub fn stop(&self) {
        self.stop.cancel();
        tracing::debug!(target = "strand.rpc.acm", "activity monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(heartbeat: AcmHeartbeat, close: AcmClose) -> AcmConfig {
        AcmConfig {
            timeout: Duration::from_secs(40),
            heartbeat,
            close,
        }
    }

    fn idle(last_activity: Instant) -> ActivitySnapshot {
        ActivitySnapshot {
            last_activity,
            write_pending: false,
            read_in_progress: false,
            dispatch_count: 0,
            batch_pending: false,
            outstanding: 0,
        }
    }

    #[test]
    fn on_idle_heartbeats_after_a_quarter_of_the_timeout() {
        let t0 = Instant::now();
        let cfg = config(AcmHeartbeat::OnIdle, AcmClose::Off);
        let snap = idle(t0);

        assert!(!should_heartbeat(t0 + Duration::from_secs(9), &snap, &cfg));
        assert!(should_heartbeat(t0 + Duration::from_secs(10), &snap, &cfg));

        let mut busy = snap;
        busy.write_pending = true;
        assert!(!should_heartbeat(t0 + Duration::from_secs(30), &busy, &cfg));
    }

    #[test]
    fn on_invocation_heartbeats_only_while_dispatching() {
        let t0 = Instant::now();
        let cfg = config(AcmHeartbeat::OnInvocation, AcmClose::Off);
        let mut snap = idle(t0);
        let later = t0 + Duration::from_secs(20);

        assert!(!should_heartbeat(later, &snap, &cfg));
        snap.dispatch_count = 1;
        assert!(should_heartbeat(later, &snap, &cfg));
    }

    #[test]
    fn always_heartbeats_even_with_pending_writes() {
        let t0 = Instant::now();
        let mut snap = idle(t0);
        snap.write_pending = true;
        assert!(should_heartbeat(t0, &snap, &config(AcmHeartbeat::Always, AcmClose::Off)));
        assert!(!should_heartbeat(
            t0 + Duration::from_secs(100),
            &idle(t0),
            &config(AcmHeartbeat::Off, AcmClose::Off)
        ));
    }

    #[test]
    fn close_decisions_by_mode() {
        let t0 = Instant::now();
        let expired = t0 + Duration::from_secs(41);
        let idle_snap = idle(t0);
        let mut waiting = idle(t0);
        waiting.outstanding = 1;

        let on_idle = config(AcmHeartbeat::Off, AcmClose::OnIdle);
        assert_eq!(idle_close(expired, &idle_snap, &on_idle), Some(IdleClose::Graceful));
        assert_eq!(idle_close(expired, &waiting, &on_idle), None);
        assert_eq!(idle_close(t0 + Duration::from_secs(39), &idle_snap, &on_idle), None);

        let on_invocation = config(AcmHeartbeat::Off, AcmClose::OnInvocation);
        assert_eq!(idle_close(expired, &idle_snap, &on_invocation), None);
        assert_eq!(
            idle_close(expired, &waiting, &on_invocation),
            Some(IdleClose::Forceful)
        );

        let both = config(AcmHeartbeat::Off, AcmClose::OnInvocationAndIdle);
        assert_eq!(idle_close(expired, &idle_snap, &both), Some(IdleClose::Graceful));
        assert_eq!(idle_close(expired, &waiting, &both), Some(IdleClose::Forceful));

        let forceful = config(AcmHeartbeat::Off, AcmClose::OnIdleForceful);
        assert_eq!(idle_close(expired, &idle_snap, &forceful), Some(IdleClose::Forceful));
    }

    #[test]
    fn no_close_while_a_transfer_is_in_progress() {
        let t0 = Instant::now();
        let mut snap = idle(t0);
        snap.read_in_progress = true;
        let cfg = config(AcmHeartbeat::Off, AcmClose::OnIdleForceful);
        assert_eq!(idle_close(t0 + Duration::from_secs(100), &snap, &cfg), None);
    }

    #[test]
    fn graceful_close_waits_for_dispatch_and_batches() {
        let t0 = Instant::now();
        let cfg = config(AcmHeartbeat::Off, AcmClose::OnIdle);
        let expired = t0 + Duration::from_secs(50);

        let mut dispatching = idle(t0);
        dispatching.dispatch_count = 2;
        assert_eq!(idle_close(expired, &dispatching, &cfg), None);

        let mut batching = idle(t0);
        batching.batch_pending = true;
        assert_eq!(idle_close(expired, &batching, &cfg), None);
    }

    #[test]
    fn tick_interval_is_half_the_timeout_but_at_least_a_second() {
        let cfg = config(AcmHeartbeat::Off, AcmClose::Off);
        assert_eq!(cfg.tick_interval(), Duration::from_secs(20));
        let short = AcmConfig {
            timeout: Duration::from_millis(500),
            ..cfg
        };
        assert_eq!(short.tick_interval(), Duration::from_secs(1));
    }
}
