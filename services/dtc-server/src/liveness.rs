//! Liveness sweep
//!
//! The only owner of timeout-driven closes. Each sweep:
//! - closes authenticated sessions silent for more than twice the heartbeat
//!   interval
//! - closes sessions that have not logged on within the logon timeout
//! - queues a server heartbeat on authenticated sessions that are due one
//!
//! `sweep` takes the current instant so it can be driven with synthetic
//! clocks; `run` drives it from a timer every half heartbeat interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::messages::Heartbeat;
use protocol::Message;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backpressure::PushOutcome;
use crate::events::unix_nanos_now;
use crate::metrics::ServerMetrics;
use crate::registry::SessionRegistry;
use crate::session::{AuthState, CloseReason, SessionId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub heartbeats_sent: usize,
    pub heartbeat_timeouts: Vec<SessionId>,
    pub logon_timeouts: Vec<SessionId>,
}

pub struct LivenessSweep {
    registry: Arc<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
    heartbeat_interval: Duration,
    logon_timeout: Duration,
}

impl LivenessSweep {
    pub fn new(
        registry: Arc<SessionRegistry>,
        metrics: Arc<ServerMetrics>,
        heartbeat_interval: Duration,
        logon_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            heartbeat_interval,
            logon_timeout,
        }
    }

    /// Time between sweeps.
    pub fn period(&self) -> Duration {
        (self.heartbeat_interval / 2).max(Duration::from_millis(1))
    }

    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let stale_after = self.heartbeat_interval.saturating_mul(2);

        for session in self.registry.sessions() {
            match session.auth_state() {
                AuthState::Authenticated => {
                    let silent = now.saturating_duration_since(session.last_heartbeat_received());
                    if silent > stale_after {
                        if self.registry.close(session.id(), CloseReason::HeartbeatTimeout) {
                            ServerMetrics::incr(&self.metrics.heartbeat_timeouts);
                            report.heartbeat_timeouts.push(session.id());
                        }
                        continue;
                    }

                    if session.take_heartbeat_due(now, self.heartbeat_interval) {
                        let heartbeat = Message::from(Heartbeat {
                            num_dropped_messages: session.messages_dropped(),
                            current_date_time: unix_nanos_now(),
                        });
                        let outcome = session.enqueue(&heartbeat);
                        if outcome != PushOutcome::Closed {
                            self.metrics
                                .record_enqueue(outcome == PushOutcome::DroppedOldest);
                            ServerMetrics::incr(&self.metrics.heartbeats_sent);
                            report.heartbeats_sent += 1;
                        }
                    }
                }
                AuthState::Unauthenticated => {
                    let waiting = now.saturating_duration_since(session.connected_at());
                    if waiting > self.logon_timeout
                        && self.registry.close(session.id(), CloseReason::LogonTimeout)
                    {
                        ServerMetrics::incr(&self.metrics.logon_timeouts);
                        report.logon_timeouts.push(session.id());
                    }
                }
                // Closed by the logon handler.
                AuthState::Rejected => {}
            }
        }

        report
    }

    /// Sweep every [`period`](Self::period) until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = self.period().as_millis() as u64, "Liveness sweep started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep(Instant::now());
                    if !report.heartbeat_timeouts.is_empty() || !report.logon_timeouts.is_empty() {
                        debug!(
                            heartbeat_timeouts = report.heartbeat_timeouts.len(),
                            logon_timeouts = report.logon_timeouts.len(),
                            "Sweep closed sessions"
                        );
                    }
                }
            }
        }

        debug!("Liveness sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use protocol::{decode, SymbolId};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        sweep: LivenessSweep,
        start: Instant,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new(8));
        let sweep = LivenessSweep::new(
            Arc::clone(&registry),
            Arc::new(ServerMetrics::new()),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        Fixture {
            registry,
            sweep,
            start: Instant::now(),
        }
    }

    impl Fixture {
        fn admit(&self, authenticated: bool) -> Arc<Session> {
            self.registry
                .insert_with(|id| {
                    Session::new(id, "127.0.0.1:1".parse().unwrap(), self.start, authenticated, 8)
                })
                .unwrap()
        }

        fn at(&self, secs: u64) -> Instant {
            self.start + Duration::from_secs(secs)
        }
    }

    #[test]
    fn test_period_is_half_interval() {
        assert_eq!(fixture().sweep.period(), Duration::from_secs(15));
    }

    #[test]
    fn test_heartbeat_timeout_closes_stale_session() {
        let f = fixture();
        let stale = f.admit(true);
        let fresh = f.admit(true);
        stale.subscribe(SymbolId::new(1));
        fresh.record_heartbeat_received(f.at(50));

        let report = f.sweep.sweep(f.at(61));

        assert_eq!(report.heartbeat_timeouts, vec![stale.id()]);
        assert_eq!(stale.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert!(f.registry.subscribers(SymbolId::new(1)).is_empty());
        assert!(f.registry.contains(fresh.id()));
    }

    #[test]
    fn test_exactly_twice_interval_is_not_stale() {
        let f = fixture();
        let session = f.admit(true);

        let report = f.sweep.sweep(f.at(60));
        assert!(report.heartbeat_timeouts.is_empty());
        assert!(!session.is_closed());
    }

    #[test]
    fn test_heartbeat_sent_when_due() {
        let f = fixture();
        let session = f.admit(true);
        session.record_heartbeat_received(f.at(29));

        assert_eq!(f.sweep.sweep(f.at(29)).heartbeats_sent, 0);
        assert_eq!(f.sweep.sweep(f.at(30)).heartbeats_sent, 1);
        assert_eq!(f.sweep.sweep(f.at(45)).heartbeats_sent, 0);

        let frames = session.outbound().drain();
        assert_eq!(frames.len(), 1);
        assert!(matches!(decode(&frames[0]).unwrap(), Message::Heartbeat(_)));
    }

    #[test]
    fn test_heartbeat_reports_dropped_messages() {
        let f = fixture();
        let session = f.admit(true);
        session.record_heartbeat_received(f.at(30));
        for i in 0..10u8 {
            session.enqueue_frame(bytes::Bytes::from(vec![i]));
        }

        f.sweep.sweep(f.at(30));

        let frames = session.outbound().drain();
        let Message::Heartbeat(heartbeat) = decode(frames.last().unwrap()).unwrap() else {
            panic!("expected heartbeat last");
        };
        assert_eq!(heartbeat.num_dropped_messages, 2);
    }

    #[test]
    fn test_logon_timeout() {
        let f = fixture();
        let pending = f.admit(false);

        assert!(f.sweep.sweep(f.at(60)).logon_timeouts.is_empty());
        let report = f.sweep.sweep(f.at(61));

        assert_eq!(report.logon_timeouts, vec![pending.id()]);
        assert_eq!(pending.close_reason(), Some(CloseReason::LogonTimeout));
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_huge_interval_does_not_overflow() {
        let f = fixture();
        let sweep = LivenessSweep::new(
            Arc::clone(&f.registry),
            Arc::new(ServerMetrics::new()),
            Duration::MAX,
            Duration::from_secs(60),
        );
        let session = f.admit(true);

        let report = sweep.sweep(f.at(3_600));
        assert!(report.heartbeat_timeouts.is_empty());
        assert_eq!(report.heartbeats_sent, 0);
        assert!(!session.is_closed());
    }

    #[test]
    fn test_late_logon_is_not_stale() {
        let f = fixture();
        let session = f.admit(false);
        assert!(f.registry.authenticate(session.id(), "alice", f.at(55)));

        let report = f.sweep.sweep(f.at(61));
        assert!(report.heartbeat_timeouts.is_empty());
        assert!(report.logon_timeouts.is_empty());
        assert_eq!(report.heartbeats_sent, 0);
        assert!(!session.is_closed());

        // Silence is measured from the logon.
        assert_eq!(f.sweep.sweep(f.at(85)).heartbeats_sent, 1);
        assert_eq!(f.sweep.sweep(f.at(116)).heartbeat_timeouts, vec![session.id()]);
    }

    #[test]
    fn test_unauthenticated_sessions_get_no_heartbeats() {
        let f = fixture();
        let pending = f.admit(false);
        assert_eq!(f.sweep.sweep(f.at(45)).heartbeats_sent, 0);
        assert!(pending.outbound().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(f.sweep).run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
