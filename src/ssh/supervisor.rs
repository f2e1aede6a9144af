//! Connection Supervisor
//!
//! Owns the one live connection of a session and drives its lifecycle:
//!
//! ```text
//! CONNECTING ──► CONNECTED ──► RECONNECTING ──► CONNECTED
//!     │              │               │
//!     └──────────────┴───────────────┴──────► DISCONNECTED
//! ```
//!
//! A monitor task watches the transport (disconnect broadcast, keepalive
//! probes, and the jump host's state when there is one). On an unexpected
//! drop with auto-reconnect enabled it retries with `BackoffPolicy` delays
//! taken from a `Scheduler`. Authentication failures, a lost jump host, a
//! spent retry budget, or a manual disconnect end in DISCONNECTED, which is
//! terminal.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{SshConfig, Timeouts};
use super::error::SshError;
use super::transport::{ConnectionSource, Connector, PingResult, SshConnection};
use crate::session::events::EventEmitter;
use crate::session::reconnect::{BackoffPolicy, Scheduler};
use crate::session::state::ConnectionState;

const JUMP_LOST: &str = "jump host connection closed";

/// Why the monitor stopped watching a connection
enum LinkLoss {
    Transport(String),
    JumpLost,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub auto_reconnect: bool,
    pub timeouts: Timeouts,
    pub backoff: BackoffPolicy,
}

pub struct ConnectionSupervisor {
    session_id: String,
    target: SshConfig,
    jump: Option<Arc<ConnectionSupervisor>>,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    backoff: BackoffPolicy,
    timeouts: Timeouts,
    auto_reconnect: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    connection: RwLock<Option<Arc<dyn SshConnection>>>,
    retry_count: AtomicU32,
    last_error: RwLock<Option<String>>,
    shutdown: CancellationToken,
    emitter: EventEmitter,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        session_id: impl Into<String>,
        target: SshConfig,
        jump: Option<SshConfig>,
        options: SupervisorOptions,
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
        emitter: EventEmitter,
    ) -> Arc<Self> {
        let session_id = session_id.into();

        // The jump connection never reconnects on its own; losing it ends
        // the dependent session
        let jump = jump.map(|jump_config| {
            let jump_id = format!("{}/jump", session_id);
            ConnectionSupervisor::new(
                jump_id.clone(),
                jump_config,
                None,
                SupervisorOptions {
                    auto_reconnect: false,
                    ..options.clone()
                },
                connector.clone(),
                scheduler.clone(),
                EventEmitter::noop(jump_id),
            )
        });

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (transitions, _) = broadcast::channel(32);

        Arc::new(Self {
            session_id,
            target,
            jump,
            connector,
            scheduler,
            backoff: options.backoff,
            timeouts: options.timeouts,
            auto_reconnect: AtomicBool::new(options.auto_reconnect),
            state_tx,
            transitions,
            connection: RwLock::new(None),
            retry_count: AtomicU32::new(0),
            last_error: RwLock::new(None),
            shutdown: CancellationToken::new(),
            emitter,
            monitor: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target(&self) -> &SshConfig {
        &self.target
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Every transition, in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn jump(&self) -> Option<&Arc<ConnectionSupervisor>> {
        self.jump.as_ref()
    }

    /// Current live connection. Fails while reconnecting or after close.
    pub fn connection(&self) -> Result<Arc<dyn SshConnection>, SshError> {
        self.connection.read().clone().ok_or(SshError::Disconnected)
    }

    /// Apply a lifecycle edge; illegal edges are refused and logged
    fn transition(&self, next: ConnectionState, reason: Option<String>) -> bool {
        let mut from = next;
        let changed = self.state_tx.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            info!("Session {}: {} -> {}", self.session_id, from, next);
            if let Some(ref reason) = reason {
                *self.last_error.write() = Some(reason.clone());
            }
            let _ = self.transitions.send(next);
            self.emitter.emit_state(next, reason);
        } else if from != next {
            debug!(
                "Session {}: refused transition {} -> {}",
                self.session_id, from, next
            );
        }
        changed
    }

    async fn establish(&self) -> Result<Arc<dyn SshConnection>, SshError> {
        let via = match &self.jump {
            Some(jump) => Some(jump.connection()?),
            None => None,
        };
        // Dropping the connect future on timeout closes any half-open socket
        tokio::time::timeout(self.timeouts.connect(), self.connector.connect(&self.target, via))
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "Connection to {} timed out after {}s",
                    self.target.address(),
                    self.timeouts.connect_secs
                ))
            })?
    }

    /// Initial connection. On failure the session ends DISCONNECTED.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SshError> {
        if let Some(jump) = &self.jump {
            if let Err(e) = Box::pin(jump.connect()).await {
                let err = SshError::ConnectionFailed(format!("Jump host: {}", e));
                let err = if e.is_transient() { err } else { e };
                self.transition(ConnectionState::Disconnected, Some(err.to_string()));
                return Err(err);
            }
        }

        let result = tokio::select! {
            r = self.establish() => r,
            _ = self.shutdown.cancelled() => Err(SshError::Disconnected),
        };

        match result {
            Ok(conn) => {
                *self.connection.write() = Some(conn.clone());
                if !self.transition(ConnectionState::Connected, None) {
                    // Disconnected while the handshake was in flight
                    self.connection.write().take();
                    conn.disconnect().await;
                    self.close_jump().await;
                    return Err(SshError::Disconnected);
                }
                self.spawn_monitor(conn);
                Ok(())
            }
            Err(e) => {
                warn!("Session {} failed to connect: {}", self.session_id, e);
                self.transition(ConnectionState::Disconnected, Some(e.to_string()));
                self.close_jump().await;
                Err(e)
            }
        }
    }

    fn spawn_monitor(self: &Arc<Self>, conn: Arc<dyn SshConnection>) {
        let this = self.clone();
        let task = tokio::spawn(async move { this.supervise(conn).await });
        *self.monitor.lock() = Some(task);
    }

    async fn supervise(self: Arc<Self>, mut conn: Arc<dyn SshConnection>) {
        loop {
            let Some(loss) = self.watch_connection(&conn).await else {
                return;
            };

            self.connection.write().take();

            match loss {
                LinkLoss::JumpLost => {
                    conn.disconnect().await;
                    self.finish(JUMP_LOST.to_string()).await;
                    return;
                }
                LinkLoss::Transport(reason) => {
                    warn!("Session {} lost its connection: {}", self.session_id, reason);
                    if self.jump_is_lost() {
                        self.finish(JUMP_LOST.to_string()).await;
                        return;
                    }
                    if !self.auto_reconnect() {
                        self.finish(reason).await;
                        return;
                    }
                    if !self.transition(ConnectionState::Reconnecting, Some(reason)) {
                        return;
                    }
                    match self.reconnect_loop().await {
                        Some(next) => conn = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Watch one connection until it is lost; `None` on shutdown
    async fn watch_connection(&self, conn: &Arc<dyn SshConnection>) -> Option<LinkLoss> {
        let mut disconnect_rx = conn.subscribe_disconnect();
        if !conn.is_connected() {
            return Some(LinkLoss::Transport("transport closed".to_string()));
        }

        let mut keepalive = self.timeouts.keepalive_interval().map(|period| {
            tokio::time::interval_at(Instant::now() + period, period)
        });
        let mut jump_rx = self.jump.as_ref().map(|j| j.subscribe_state());
        let max_failures = self.timeouts.keepalive_max_failures.max(1);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = disconnect_rx.recv() => {
                    return Some(LinkLoss::Transport("connection closed".to_string()));
                }
                _ = jump_terminated(&mut jump_rx) => return Some(LinkLoss::JumpLost),
                _ = tick(&mut keepalive) => match conn.ping().await {
                    PingResult::Ok => failures = 0,
                    PingResult::Timeout => {
                        failures += 1;
                        debug!(
                            "Keepalive timeout {}/{} for session {}",
                            failures, max_failures, self.session_id
                        );
                        if failures >= max_failures {
                            return Some(LinkLoss::Transport("keepalive timed out".to_string()));
                        }
                    }
                    PingResult::IoError => {
                        return Some(LinkLoss::Transport("keepalive failed".to_string()));
                    }
                },
            }
        }
    }

    async fn reconnect_loop(&self) -> Option<Arc<dyn SshConnection>> {
        let max_attempts = self.backoff.max_attempts;
        let mut jump_rx = self.jump.as_ref().map(|j| j.subscribe_state());

        for attempt in 1..=max_attempts {
            let Some(delay) = self.backoff.delay_for(attempt) else {
                break;
            };
            self.retry_count.store(attempt, Ordering::SeqCst);
            self.emitter
                .emit_reconnect_progress(attempt, max_attempts, delay.as_millis() as u64);
            info!(
                "Session {} reconnect attempt {}/{} in {:?}",
                self.session_id, attempt, max_attempts, delay
            );

            tokio::select! {
                _ = self.scheduler.sleep(delay) => {}
                _ = self.shutdown.cancelled() => return None,
                _ = jump_terminated(&mut jump_rx) => {
                    self.finish(JUMP_LOST.to_string()).await;
                    return None;
                }
            }

            let result = tokio::select! {
                r = self.establish() => r,
                _ = self.shutdown.cancelled() => return None,
            };

            match result {
                Ok(conn) => {
                    *self.connection.write() = Some(conn.clone());
                    if !self.transition(ConnectionState::Connected, None) {
                        self.connection.write().take();
                        conn.disconnect().await;
                        return None;
                    }
                    info!("Session {} reconnected after {} attempt(s)", self.session_id, attempt);
                    self.retry_count.store(0, Ordering::SeqCst);
                    return Some(conn);
                }
                Err(e) if !e.is_transient() => {
                    // Never loop on rejected credentials
                    warn!("Session {} reconnect aborted: {}", self.session_id, e);
                    self.finish(e.to_string()).await;
                    return None;
                }
                Err(e) => {
                    warn!(
                        "Session {} reconnect attempt {} failed: {}",
                        self.session_id, attempt, e
                    );
                    if self.jump_is_lost() {
                        self.finish(JUMP_LOST.to_string()).await;
                        return None;
                    }
                }
            }
        }

        self.finish(format!("could not reconnect after {} attempts", max_attempts))
            .await;
        None
    }

    fn jump_is_lost(&self) -> bool {
        self.jump
            .as_ref()
            .map(|j| j.state().is_terminal())
            .unwrap_or(false)
    }

    /// Terminal failure from inside the monitor
    async fn finish(&self, reason: String) {
        self.shutdown.cancel();
        self.transition(ConnectionState::Disconnected, Some(reason));
        let conn = self.connection.write().take();
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
        self.close_jump().await;
    }

    async fn close_jump(&self) {
        if let Some(jump) = &self.jump {
            Box::pin(jump.disconnect()).await;
        }
    }

    /// Mark the session DISCONNECTED and stop all retries, without waiting
    /// on the network. Returns false if it was already disconnected.
    pub fn mark_disconnected(&self, reason: &str) -> bool {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.transition(ConnectionState::Disconnected, Some(reason.to_string()))
    }

    /// Close the transport and the jump connection behind it
    pub async fn close_transport(&self) {
        let conn = self.connection.write().take();
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
        self.close_jump().await;
        if let Some(task) = self.monitor.lock().take() {
            task.abort();
        }
    }

    /// Manual disconnect
    pub async fn disconnect(&self) {
        self.mark_disconnected("disconnected by user");
        self.close_transport().await;
    }
}

impl ConnectionSource for ConnectionSupervisor {
    fn current(&self) -> Result<Arc<dyn SshConnection>, SshError> {
        self.connection()
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves once the watched jump supervisor reaches DISCONNECTED
async fn jump_terminated(rx: &mut Option<watch::Receiver<ConnectionState>>) {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if rx.borrow_and_update().is_terminal() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::events::{event_channel, EngineEvent};
    use crate::session::state::ConnectionState::*;
    use crate::test_utils::{ssh_config, FakeConnector, InstantScheduler};

    fn options(auto_reconnect: bool, max_attempts: u32) -> SupervisorOptions {
        SupervisorOptions {
            auto_reconnect,
            timeouts: Timeouts {
                keepalive_interval_secs: 0,
                ..Default::default()
            },
            backoff: BackoffPolicy {
                max_attempts,
                base_delay_ms: 100,
                max_delay_ms: 1000,
                multiplier: 2.0,
            },
        }
    }

    fn supervisor(
        connector: &Arc<FakeConnector>,
        scheduler: &Arc<InstantScheduler>,
        opts: SupervisorOptions,
        jump: Option<SshConfig>,
    ) -> (Arc<ConnectionSupervisor>, crate::session::events::EventStream) {
        let (tx, rx) = event_channel();
        let sup = ConnectionSupervisor::new(
            "s1",
            ssh_config("target"),
            jump,
            opts,
            connector.clone(),
            scheduler.clone(),
            EventEmitter::new(tx, "s1"),
        );
        (sup, rx)
    }

    async fn wait_for(sup: &ConnectionSupervisor, state: ConnectionState) {
        let mut rx = sup.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    async fn next_transition(rx: &mut broadcast::Receiver<ConnectionState>) -> ConnectionState {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no transition")
            .unwrap()
    }

    fn states(rx: &mut crate::session::events::EventStream) -> Vec<ConnectionState> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::StateChanged { state, .. } = event {
                out.push(state);
            }
        }
        out
    }

    fn assert_legal_path(path: &[ConnectionState]) {
        let mut current = Connecting;
        for next in path {
            assert!(current.can_transition_to(*next), "{:?} -> {:?}", current, next);
            current = *next;
        }
    }

    #[tokio::test]
    async fn test_successful_connect_goes_through_connected() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::new();
        let (sup, mut rx) = supervisor(&connector, &scheduler, options(true, 3), None);

        sup.connect().await.unwrap();
        assert_eq!(sup.state(), Connected);
        sup.disconnect().await;

        let path = states(&mut rx);
        assert_eq!(path, vec![Connected, Disconnected]);
        assert_legal_path(&path);
    }

    #[tokio::test]
    async fn test_auth_failure_is_terminal_without_retry() {
        let connector = FakeConnector::new();
        connector.fail_next("target", SshError::AuthenticationFailed("bad password".into()));
        let scheduler = InstantScheduler::new();
        let (sup, mut rx) = supervisor(&connector, &scheduler, options(true, 3), None);

        let err = sup.connect().await.unwrap_err();
        assert!(matches!(err, SshError::AuthenticationFailed(_)));
        assert_eq!(sup.state(), Disconnected);
        assert_eq!(states(&mut rx), vec![Disconnected]);
        assert!(scheduler.delays().is_empty());
        assert_eq!(connector.attempts("target"), 1);
    }

    #[tokio::test]
    async fn test_drop_reconnects_with_backoff() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::new();
        let (sup, mut rx) = supervisor(&connector, &scheduler, options(true, 5), None);
        sup.connect().await.unwrap();

        let mut transitions = sup.subscribe_transitions();
        connector.fail_next("target", SshError::ConnectionFailed("refused".into()));
        connector.fail_next("target", SshError::Timeout("slow".into()));
        connector.last("target").unwrap().drop_transport();

        assert_eq!(next_transition(&mut transitions).await, Reconnecting);
        assert_eq!(next_transition(&mut transitions).await, Connected);
        assert!(sup.connection().is_ok());
        assert_eq!(sup.retry_count(), 0);
        assert_eq!(
            scheduler.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        sup.disconnect().await;
        let path = states(&mut rx);
        assert_eq!(path, vec![Connected, Reconnecting, Connected, Disconnected]);
        assert_legal_path(&path);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::new();
        let (sup, _rx) = supervisor(&connector, &scheduler, options(true, 2), None);
        sup.connect().await.unwrap();

        connector.fail_always("target", SshError::ConnectionFailed("down".into()));
        connector.last("target").unwrap().drop_transport();

        wait_for(&sup, Disconnected).await;
        assert_eq!(scheduler.delays().len(), 2);
        assert!(sup.last_error().unwrap().contains("could not reconnect"));
    }

    #[tokio::test]
    async fn test_auth_failure_during_reconnect_stops_retrying() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::new();
        let (sup, _rx) = supervisor(&connector, &scheduler, options(true, 5), None);
        sup.connect().await.unwrap();

        connector.fail_always("target", SshError::AuthenticationFailed("rotated".into()));
        connector.last("target").unwrap().drop_transport();

        wait_for(&sup, Disconnected).await;
        assert_eq!(scheduler.delays().len(), 1);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_terminal_failure_releases_connection() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::new();
        let (sup, _rx) = supervisor(&connector, &scheduler, options(false, 5), None);
        sup.connect().await.unwrap();
        assert!(sup.connection().is_ok());

        let fut = sup.clone().supervise(sup.connection().unwrap());
        assert_send(&fut);
        drop(fut);

        connector.last("target").unwrap().drop_transport();
        wait_for(&sup, Disconnected).await;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sup.connection().is_ok() {
            assert!(std::time::Instant::now() < deadline, "connection kept after failure");
            tokio::task::yield_now().await;
        }
        assert!(matches!(sup.connection(), Err(SshError::Disconnected)));
    }

    #[tokio::test]
    async fn test_drop_without_auto_reconnect_disconnects() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::new();
        let (sup, mut rx) = supervisor(&connector, &scheduler, options(false, 5), None);
        sup.connect().await.unwrap();

        connector.last("target").unwrap().drop_transport();
        wait_for(&sup, Disconnected).await;
        assert_eq!(states(&mut rx), vec![Connected, Disconnected]);
    }

    #[tokio::test]
    async fn test_manual_disconnect_cancels_pending_retries() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::blocking();
        let (sup, _rx) = supervisor(&connector, &scheduler, options(true, 5), None);
        sup.connect().await.unwrap();

        connector.last("target").unwrap().drop_transport();
        wait_for(&sup, Reconnecting).await;

        assert!(sup.mark_disconnected("user"));
        assert_eq!(sup.state(), Disconnected);
        sup.close_transport().await;
        assert_eq!(connector.attempts("target"), 1);
        assert!(!sup.mark_disconnected("again"));
    }

    #[tokio::test]
    async fn test_keepalive_timeout_triggers_reconnect() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::new();
        let mut opts = options(true, 3);
        opts.timeouts.keepalive_interval_secs = 1;
        let (sup, _rx) = supervisor(&connector, &scheduler, opts, None);

        sup.connect().await.unwrap();
        let mut transitions = sup.subscribe_transitions();
        connector
            .last("target")
            .unwrap()
            .set_ping(PingResult::Timeout);

        assert_eq!(next_transition(&mut transitions).await, Reconnecting);
        assert_eq!(next_transition(&mut transitions).await, Connected);
        assert_eq!(connector.attempts("target"), 2);
        sup.disconnect().await;
    }

    #[tokio::test]
    async fn test_jump_drop_cascades_to_dependent() {
        let connector = FakeConnector::new();
        let scheduler = InstantScheduler::new();
        let (sup, mut rx) = supervisor(
            &connector,
            &scheduler,
            options(true, 5),
            Some(ssh_config("bastion")),
        );

        sup.connect().await.unwrap();
        let jump = sup.jump().unwrap().clone();
        assert_eq!(jump.state(), Connected);
        assert!(connector.last("target").unwrap().tunnelled());

        connector.last("bastion").unwrap().drop_transport();

        wait_for(&jump, Disconnected).await;
        wait_for(&sup, Disconnected).await;
        assert_eq!(sup.last_error().as_deref(), Some(JUMP_LOST));
        assert!(scheduler.delays().is_empty());
        assert!(!connector.last("target").unwrap().is_connected());
        assert_legal_path(&states(&mut rx));
    }

    #[tokio::test]
    async fn test_jump_failure_fails_connect() {
        let connector = FakeConnector::new();
        connector.fail_next("bastion", SshError::ConnectionFailed("no route".into()));
        let scheduler = InstantScheduler::new();
        let (sup, _rx) = supervisor(
            &connector,
            &scheduler,
            options(true, 5),
            Some(ssh_config("bastion")),
        );

        assert!(sup.connect().await.is_err());
        assert_eq!(sup.state(), Disconnected);
        assert_eq!(connector.attempts("target"), 0);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let connector = FakeConnector::new();
        connector.hang("target");
        let scheduler = InstantScheduler::new();
        let mut opts = options(true, 5);
        opts.timeouts.connect_secs = 1;
        let (sup, _rx) = supervisor(&connector, &scheduler, opts, None);

        let err = sup.connect().await.unwrap_err();
        assert!(matches!(err, SshError::Timeout(_)));
        assert_eq!(sup.state(), Disconnected);
    }
}
