//! The queue/session state machine.
//!
//! [`Coordinator`] is the single authority over the wait queue, the
//! at-most-one active session, and the two token maps. All of that state
//! lives behind one `tokio::sync::Mutex`; every mutation — including the
//! store round trip during invite validation and the subprocess spawn during
//! session start — happens with the lock held, so joins are serialized
//! globally and a decision can never act on a stale slot. That same critical
//! section covers the reconnect takeover, so two near-simultaneous joins
//! cannot claim the same session.
//!
//! Timers (session warning, soft timeout, hard kill, disconnect grace) are
//! detached tasks that re-acquire the lock on fire and check the session
//! identity before acting; a timer whose session is gone is a no-op.
//!
//! ## Connection lifecycle
//!
//! ```text
//! connected ── join (slot free) ──────────────► active
//! connected ── join (slot held) ──────────────► queued
//! queued ───── leave / disconnect ────────────► gone from queue
//! queued ───── promotion on slot release ─────► active
//! active ───── timeout / exit / disconnect ───► connected (slot freed)
//! ```

pub mod queue;
pub mod session;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::invites::store::{KvStore, SessionRecord};
use crate::invites::{self, SessionAudit, Verdict};
use crate::metrics::GateMetrics;
use crate::spawn::{EnvFileGuard, Spawner};
use crate::token::TokenMinter;

use queue::WaitQueue;
use session::{ActiveSession, ClientState, EndReason, PendingEntry};

/// Path the reverse proxy serves the terminal subprocess under.
const TERMINAL_URL: &str = "/terminal";

/// Minutes before soft timeout at which `session_warning` fires.
const WARNING_LEAD_MINUTES: u64 = 5;

/// Minutes past soft timeout at which the subprocess is force-killed.
const HARD_KILL_LAG_MINUTES: u64 = 5;

/// SIGTERM → SIGKILL escalation delay on the session-end path.
const KILL_ESCALATION: Duration = Duration::from_secs(5);

/// One registered client connection.
pub struct ClientConn {
    tx: mpsc::Sender<Value>,
    pub state: ClientState,
    pub joined_at: Option<Instant>,
    pub source_address: String,
    pub user_agent: Option<String>,
    pub invite_token: Option<String>,
    pub pending_token: Option<String>,
}

/// Everything the coordinator mutates, behind the single lock.
struct CoordState {
    clients: HashMap<String, ClientConn>,
    queue: WaitQueue,
    active: Option<ActiveSession>,
    /// session token → session id, while the session exists.
    session_tokens: HashMap<String, String>,
    /// pending token → queue-admission record, until promotion.
    pending_tokens: HashMap<String, PendingEntry>,
}

/// Result of an auth sub-request token check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCheck {
    /// Token belongs to the current active session.
    Session(String),
    /// Token belongs to a queued (or just-admitted) client.
    Pending(String),
    Unknown,
}

/// Snapshot for `GET /status`.
pub struct StatusSnapshot {
    pub queue_size: usize,
    pub session_active: bool,
    pub estimated_wait: String,
}

/// Cloneable handle; all clones share the same state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Mutex<CoordState>>,
    config: Arc<Config>,
    store: KvStore,
    minter: TokenMinter,
    spawner: Arc<dyn Spawner>,
    metrics: GateMetrics,
}

/// Try-send an outbound frame; a full or closed channel drops the frame
/// rather than stalling the coordinator.
fn send_frame(client: &ClientConn, frame: Value) {
    if client.tx.try_send(frame).is_err() {
        warn!("Dropping frame for slow or closed client");
    }
}

/// Whether `token` + `source` match the active session or any pending-token
/// entry — the rejoin-eligibility test for exhausted invites.
fn rejoin_match(st: &CoordState, token: &str, source: &str) -> bool {
    if let Some(active) = &st.active {
        if active.invite_token.as_deref() == Some(token) && active.source_address == source {
            return true;
        }
    }
    st.pending_tokens
        .values()
        .any(|p| p.invite_token.as_deref() == Some(token) && p.source_address == source)
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        store: KvStore,
        spawner: Arc<dyn Spawner>,
        metrics: GateMetrics,
    ) -> Self {
        let minter = TokenMinter::new(&config.session.secret);
        let state = CoordState {
            clients: HashMap::new(),
            queue: WaitQueue::new(config.session.max_queue_size),
            active: None,
            session_tokens: HashMap::new(),
            pending_tokens: HashMap::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            config,
            store,
            minter,
            spawner,
            metrics,
        }
    }

    /// Register a new connection and send it the initial `status` frame.
    /// Returns the process-unique client id.
    pub async fn register(
        &self,
        tx: mpsc::Sender<Value>,
        source_address: String,
        user_agent: Option<String>,
    ) -> String {
        let client_id = Uuid::new_v4().to_string();
        let mut st = self.inner.lock().await;
        let conn = ClientConn {
            tx,
            state: ClientState::Connected,
            joined_at: None,
            source_address,
            user_agent,
            invite_token: None,
            pending_token: None,
        };
        send_frame(
            &conn,
            json!({
                "type": "status",
                "queue_size": st.queue.len(),
                "session_active": st.active.is_some(),
            }),
        );
        st.clients.insert(client_id.clone(), conn);
        debug!("Client {client_id} connected");
        client_id
    }

    /// Handle a `join_queue` intent.
    pub async fn join(&self, client_id: &str, invite_token: Option<String>) {
        let mut st = self.inner.lock().await;
        let st = &mut *st;
        let Some(client) = st.clients.get(client_id) else {
            return;
        };
        let source = client.source_address.clone();
        let state = client.state;

        // Reconnect takeover: the session holder dropped and this join
        // matches its invite and source address within the grace window.
        let is_reconnect = match &st.active {
            Some(active) => {
                active.awaiting_reconnect
                    && active.invite_token == invite_token
                    && active.source_address == source
            }
            None => false,
        };
        if is_reconnect {
            self.reconnect_takeover(st, client_id, invite_token);
            return;
        }

        if state != ClientState::Connected {
            if let Some(client) = st.clients.get(client_id) {
                send_frame(client, json!({"type": "error", "message": "Already in queue"}));
            }
            return;
        }

        if let Some(token) = invite_token.as_deref() {
            let rejoin = rejoin_match(st, token, &source);
            match invites::validate(&self.store, &self.metrics, token, rejoin, true).await {
                Verdict::Valid { record, rejoin } => {
                    debug!(
                        "Invite accepted for {client_id} (use {}/{}, rejoin={rejoin})",
                        record.use_count, record.max_uses
                    );
                }
                Verdict::Rejected(reason) => {
                    if let Some(client) = st.clients.get(client_id) {
                        send_frame(
                            client,
                            json!({
                                "type": "invite_invalid",
                                "reason": reason.as_str(),
                                "message": reason.message(),
                            }),
                        );
                    }
                    return;
                }
            }
        }

        if st.active.is_none() {
            // Slot free (and therefore queue empty): admit directly.
            let token = self.minter.mint(client_id);
            st.pending_tokens.insert(
                token.clone(),
                PendingEntry {
                    client_id: client_id.to_string(),
                    invite_token: invite_token.clone(),
                    source_address: source,
                    created_at: Utc::now(),
                },
            );
            if let Some(client) = st.clients.get_mut(client_id) {
                client.joined_at = Some(Instant::now());
                client.invite_token = invite_token;
                client.pending_token = Some(token);
            }
            let _ = self.try_start_session(st, client_id).await;
        } else {
            if st.queue.len() >= st.queue.max_size() {
                if let Some(client) = st.clients.get(client_id) {
                    send_frame(
                        client,
                        json!({
                            "type": "queue_full",
                            "message": "The queue is full, please try again later",
                        }),
                    );
                }
                return;
            }
            let token = self.minter.mint(client_id);
            st.pending_tokens.insert(
                token.clone(),
                PendingEntry {
                    client_id: client_id.to_string(),
                    invite_token: invite_token.clone(),
                    source_address: source,
                    created_at: Utc::now(),
                },
            );
            if let Some(client) = st.clients.get_mut(client_id) {
                client.state = ClientState::Queued;
                client.joined_at = Some(Instant::now());
                client.invite_token = invite_token;
                client.pending_token = Some(token.clone());
                send_frame(client, json!({"type": "session_token", "session_token": token}));
            }
            if let Err(rejection) = st.queue.push(client_id.to_string()) {
                warn!("Queue push refused for client {client_id}: {rejection:?}");
                return;
            }
            self.metrics.set_queue_size(st.queue.len());
            self.broadcast_positions(st);
            if let Some(position) = st.queue.position(client_id) {
                info!("Client {client_id} queued at position {position}");
            }
        }
    }

    /// Take over the awaiting-reconnect session for `client_id`. Runs
    /// entirely inside the coordinator critical section, so a competing join
    /// waits on the lock and then no longer sees `awaiting_reconnect`.
    fn reconnect_takeover(
        &self,
        st: &mut CoordState,
        client_id: &str,
        invite_token: Option<String>,
    ) {
        // A queued connection can reconnect too; it gives up its queue spot
        // and its own pending token in favor of the session token.
        let was_queued = st.queue.remove(client_id);
        if let Some(stale) = st
            .clients
            .get_mut(client_id)
            .and_then(|c| c.pending_token.take())
        {
            st.pending_tokens.remove(&stale);
        }

        let handoff = st.active.as_mut().map(|active| {
            active.client_id = client_id.to_string();
            active.awaiting_reconnect = false;
            let downtime_ms = active
                .disconnected_at
                .take()
                .map_or(0, |t| t.elapsed().as_millis());
            (active.session_token.clone(), active.expires_at, downtime_ms)
        });
        if let Some((token, expires_at, downtime_ms)) = handoff {
            if let Some(client) = st.clients.get_mut(client_id) {
                client.state = ClientState::Active;
                client.joined_at = None;
                client.invite_token = invite_token;
                client.pending_token = Some(token.clone());
                send_frame(client, json!({"type": "session_token", "session_token": token}));
                send_frame(
                    client,
                    json!({
                        "type": "session_starting",
                        "terminal_url": TERMINAL_URL,
                        "expires_at": expires_at.to_rfc3339(),
                        "session_token": token,
                        "reconnected": true,
                    }),
                );
            }
            info!("Client {client_id} reconnected to the active session after {downtime_ms}ms");
        }

        if was_queued {
            self.metrics.set_queue_size(st.queue.len());
            self.broadcast_positions(st);
        }
    }

    /// Handle a `leave_queue` intent. A no-op (and no frame) for connections
    /// that are not queued.
    pub async fn leave(&self, client_id: &str) {
        let mut st = self.inner.lock().await;
        let st = &mut *st;
        match st.clients.get(client_id) {
            Some(client) if client.state == ClientState::Queued => {}
            _ => return,
        }
        st.queue.remove(client_id);
        let token = match st.clients.get_mut(client_id) {
            Some(client) => {
                client.state = ClientState::Connected;
                client.joined_at = None;
                client.invite_token = None;
                client.pending_token.take()
            }
            None => None,
        };
        if let Some(token) = token {
            st.pending_tokens.remove(&token);
        }
        if let Some(client) = st.clients.get(client_id) {
            send_frame(client, json!({"type": "left_queue"}));
        }
        self.metrics.set_queue_size(st.queue.len());
        self.broadcast_positions(st);
        info!("Client {client_id} left the queue");
    }

    /// Handle a closed connection.
    pub async fn disconnect(&self, client_id: &str) {
        let mut st = self.inner.lock().await;
        let st = &mut *st;
        let Some(client) = st.clients.remove(client_id) else {
            return;
        };
        match client.state {
            ClientState::Queued => {
                st.queue.remove(client_id);
                if let Some(token) = client.pending_token {
                    if let Some(entry) = st.pending_tokens.remove(&token) {
                        debug!(
                            "Dropped pending token for {client_id} (issued {}s ago)",
                            (Utc::now() - entry.created_at).num_seconds()
                        );
                    }
                }
                self.metrics.set_queue_size(st.queue.len());
                self.broadcast_positions(st);
                info!("Queued client {client_id} disconnected, removed from queue");
            }
            ClientState::Active => {
                let grace = Duration::from_millis(self.config.session.disconnect_grace_ms);
                if let Some(active) = st.active.as_mut() {
                    if active.client_id == client_id {
                        active.awaiting_reconnect = true;
                        active.disconnected_at = Some(Instant::now());
                        active.grace_epoch += 1;
                        let session_id = active.session_id.clone();
                        let epoch = active.grace_epoch;
                        let coord = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            coord.fire_grace_expiry(&session_id, epoch).await;
                        });
                        info!(
                            "Session holder disconnected; holding session for {}ms",
                            grace.as_millis()
                        );
                    }
                }
                // The session token stays registered for the grace window so
                // a matching reconnect keeps the same cookie working.
            }
            ClientState::Connected => {
                if let Some(token) = client.pending_token {
                    st.pending_tokens.remove(&token);
                }
            }
        }
    }

    /// End the active session (if any) with reason `shutdown`.
    pub async fn shutdown(&self) {
        let mut st = self.inner.lock().await;
        self.end_session_locked(&mut st, EndReason::Shutdown).await;
    }

    /// Auth sub-request: classify a bearer token against the live maps,
    /// evicting stale session-token entries.
    pub async fn check_session_token(&self, token: &str) -> TokenCheck {
        let mut st = self.inner.lock().await;
        if let Some(session_id) = st.session_tokens.get(token).cloned() {
            let current = matches!(&st.active, Some(a) if a.session_id == session_id);
            if current {
                return TokenCheck::Session(session_id);
            }
            st.session_tokens.remove(token);
            return TokenCheck::Unknown;
        }
        if let Some(pending) = st.pending_tokens.get(token) {
            return TokenCheck::Pending(pending.client_id.clone());
        }
        TokenCheck::Unknown
    }

    /// Read-only rejoin-eligibility check for the HTTP invite sub-request.
    pub async fn invite_rejoin_match(&self, token: &str, source: &str) -> bool {
        let st = self.inner.lock().await;
        rejoin_match(&st, token, source)
    }

    pub async fn status(&self) -> StatusSnapshot {
        let st = self.inner.lock().await;
        let queue_size = st.queue.len();
        let session_active = st.active.is_some();
        let wait_minutes = (queue_size as u64 + u64::from(session_active))
            * self.config.session.average_session_minutes;
        StatusSnapshot {
            queue_size,
            session_active,
            estimated_wait: format!("{wait_minutes} minutes"),
        }
    }

    // ─── Session lifecycle ───────────────────────────────────────────────

    /// Start a session for `client_id`, who must hold a pending token.
    ///
    /// On failure the client is reverted to `connected`, its pending token is
    /// discarded, the credential file is released, and an `error` frame is
    /// sent; the slot is left free for the caller to advance the queue.
    #[instrument(name = "session.start", skip_all)]
    async fn try_start_session(&self, st: &mut CoordState, client_id: &str) -> Result<(), ()> {
        let (source_address, user_agent, invite_token, joined_at, pending_token) = {
            let Some(client) = st.clients.get(client_id) else {
                return Err(());
            };
            (
                client.source_address.clone(),
                client.user_agent.clone(),
                client.invite_token.clone(),
                client.joined_at,
                client.pending_token.clone(),
            )
        };
        let Some(pending_token) = pending_token else {
            warn!("Client {client_id} promoted without a pending token");
            return Err(());
        };

        let env_path = PathBuf::from(&self.config.session.env_host_path);
        let env_file = match EnvFileGuard::write(&env_path, &self.collect_credentials()) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Credential file setup failed: {e}");
                self.fail_join(st, client_id, &pending_token, "Failed to start terminal session");
                return Err(());
            }
        };

        let spawn_started = Instant::now();
        let mut process = match self.spawner.spawn(env_file.path()).await {
            Ok(process) => process,
            Err(e) => {
                warn!("Terminal spawn failed: {e}");
                drop(env_file);
                self.fail_join(st, client_id, &pending_token, "Failed to start terminal session");
                return Err(());
            }
        };
        self.metrics
            .observe_spawn(spawn_started.elapsed().as_secs_f64());

        let session_id = Uuid::new_v4().to_string();
        let started_at = Instant::now();
        let started_at_utc = Utc::now();
        let expires_at = started_at_utc
            + chrono::Duration::minutes(self.config.session.timeout_minutes as i64);
        let queue_wait_ms = joined_at.map_or(0, |j| j.elapsed().as_millis() as u64);
        self.metrics.observe_queue_wait(queue_wait_ms as f64 / 1000.0);

        // Transfer the pending token: same string, now a session token.
        st.pending_tokens.remove(&pending_token);
        st.session_tokens
            .insert(pending_token.clone(), session_id.clone());

        let exit_rx = process.take_exit();
        let record = SessionRecord {
            session_id: session_id.clone(),
            started_at: started_at_utc,
            expires_at,
            invite_token: invite_token.clone(),
            source_address: source_address.clone(),
            user_agent: user_agent.clone(),
            queue_wait_ms,
        };

        st.active = Some(ActiveSession {
            session_id: session_id.clone(),
            client_id: client_id.to_string(),
            session_token: pending_token.clone(),
            invite_token,
            source_address,
            user_agent,
            started_at,
            started_at_utc,
            expires_at,
            queue_wait_ms,
            process,
            env_file: Some(env_file),
            awaiting_reconnect: false,
            disconnected_at: None,
            grace_epoch: 0,
            errors: Vec::new(),
        });
        self.metrics.set_session_active(true);

        if let Err(e) = self
            .store
            .persist_session(
                client_id,
                &record,
                self.config.session_timeout().as_secs() as i64,
            )
            .await
        {
            debug!("Session persistence skipped: {e}");
        }

        self.arm_session_timers(&session_id);
        if let Some(exit_rx) = exit_rx {
            let coord = self.clone();
            let sid = session_id.clone();
            tokio::spawn(async move {
                if let Ok(code) = exit_rx.await {
                    coord.handle_container_exit(&sid, code).await;
                }
            });
        }

        if let Some(client) = st.clients.get_mut(client_id) {
            client.state = ClientState::Active;
            send_frame(
                client,
                json!({"type": "session_token", "session_token": pending_token}),
            );
            send_frame(
                client,
                json!({
                    "type": "session_starting",
                    "terminal_url": TERMINAL_URL,
                    "expires_at": expires_at.to_rfc3339(),
                    "session_token": pending_token,
                }),
            );
        }
        self.metrics.session_started();
        info!("Session {session_id} started for client {client_id} (waited {queue_wait_ms}ms)");
        Ok(())
    }

    /// Revert a client after a failed session start.
    fn fail_join(&self, st: &mut CoordState, client_id: &str, pending_token: &str, message: &str) {
        st.pending_tokens.remove(pending_token);
        if let Some(client) = st.clients.get_mut(client_id) {
            client.state = ClientState::Connected;
            client.joined_at = None;
            client.invite_token = None;
            client.pending_token = None;
            send_frame(client, json!({"type": "error", "message": message}));
        }
    }

    /// End the active session and advance the queue. No-op when the slot is
    /// already empty.
    #[instrument(name = "session.end", skip_all, fields(reason = reason.as_str()))]
    async fn end_session_locked(&self, st: &mut CoordState, reason: EndReason) {
        let Some(session) = st.active.take() else {
            return;
        };
        let ActiveSession {
            session_id,
            client_id,
            session_token,
            invite_token,
            source_address,
            user_agent,
            started_at,
            started_at_utc,
            queue_wait_ms,
            process,
            mut env_file,
            errors,
            ..
        } = session;

        let duration = started_at.elapsed();
        info!(
            "Session {session_id} ended after {:.0}s ({})",
            duration.as_secs_f64(),
            reason.as_str()
        );
        self.metrics.session_ended(reason.as_str(), duration.as_secs_f64());
        self.metrics.set_session_active(false);

        // SIGTERM now; escalate to SIGKILL if the process lingers. The armed
        // hard-kill timer no-ops once the slot is cleared.
        process.terminate();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_ESCALATION).await;
            process.kill();
        });

        if let Some(guard) = env_file.as_mut() {
            guard.release();
        }
        st.session_tokens.remove(&session_token);

        if let Some(invite) = invite_token {
            let entry = SessionAudit {
                session_id: session_id.clone(),
                client_id: client_id.clone(),
                started_at: started_at_utc,
                ended_at: Utc::now(),
                end_reason: reason,
                queue_wait_ms,
                source_address,
                user_agent,
                errors,
            };
            invites::record_session_audit(
                &self.store,
                &invite,
                entry,
                self.config.session.audit_retention_days,
            )
            .await;
        }

        if let Some(client) = st.clients.get_mut(&client_id) {
            client.state = ClientState::Connected;
            client.joined_at = None;
            client.invite_token = None;
            client.pending_token = None;
            send_frame(
                client,
                json!({
                    "type": "session_ended",
                    "reason": reason.as_str(),
                    "clear_session_cookie": true,
                }),
            );
        }

        if let Err(e) = self.store.delete_session(&client_id).await {
            debug!("Session persistence delete skipped: {e}");
        }

        let fut: Pin<Box<dyn Future<Output = ()> + Send + '_>> = Box::pin(self.promote_loop(st));
        fut.await;
    }

    /// Fill the freed slot from the queue head, discarding departed clients.
    async fn promote_loop(&self, st: &mut CoordState) {
        while st.active.is_none() && !st.queue.is_empty() {
            let Some(next) = st.queue.pop_front() else {
                break;
            };
            if !st.clients.contains_key(&next) {
                debug!("Discarding departed client {next} at queue head");
                continue;
            }
            let fut: Pin<Box<dyn Future<Output = Result<(), ()>> + Send + '_>> =
                Box::pin(self.try_start_session(st, &next));
            let _ = fut.await;
        }
        self.metrics.set_queue_size(st.queue.len());
        self.broadcast_positions(st);
    }

    /// Send every queued client its current position and estimated wait.
    fn broadcast_positions(&self, st: &CoordState) {
        let queue_size = st.queue.len();
        for (index, client_id) in st.queue.iter().enumerate() {
            let position = index + 1;
            if let Some(client) = st.clients.get(client_id) {
                let wait = position as u64 * self.config.session.average_session_minutes;
                send_frame(
                    client,
                    json!({
                        "type": "queue_position",
                        "position": position,
                        "queue_size": queue_size,
                        "estimated_wait": format!("{wait} minutes"),
                    }),
                );
            }
        }
    }

    /// Values copied into the workload credential file.
    fn collect_credentials(&self) -> Vec<(String, String)> {
        let mut lines = Vec::new();
        for key in &self.config.workload.credential_env_keys {
            match std::env::var(key) {
                Ok(value) => lines.push((key.clone(), value)),
                Err(_) => warn!("Workload credential {key} not set in environment"),
            }
        }
        lines
    }

    // ─── Timers ──────────────────────────────────────────────────────────

    fn arm_session_timers(&self, session_id: &str) {
        let timeout_minutes = self.config.session.timeout_minutes;

        let warn_after =
            Duration::from_secs(timeout_minutes.saturating_sub(WARNING_LEAD_MINUTES) * 60);
        let coord = self.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(warn_after).await;
            coord.fire_warning(&sid).await;
        });

        let timeout_after = Duration::from_secs(timeout_minutes * 60);
        let coord = self.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout_after).await;
            coord.fire_timeout(&sid).await;
        });

        let hard_after = Duration::from_secs((timeout_minutes + HARD_KILL_LAG_MINUTES) * 60);
        let coord = self.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(hard_after).await;
            coord.fire_hard_kill(&sid).await;
        });
    }

    async fn fire_warning(&self, session_id: &str) {
        let st = self.inner.lock().await;
        let Some(active) = &st.active else { return };
        if active.session_id != session_id {
            return;
        }
        if let Some(client) = st.clients.get(&active.client_id) {
            send_frame(
                client,
                json!({
                    "type": "session_warning",
                    "minutes_remaining": WARNING_LEAD_MINUTES,
                }),
            );
        }
    }

    async fn fire_timeout(&self, session_id: &str) {
        let mut st = self.inner.lock().await;
        let current = matches!(&st.active, Some(a) if a.session_id == session_id);
        if current {
            let fut: Pin<Box<dyn Future<Output = ()> + Send + '_>> =
                Box::pin(self.end_session_locked(&mut st, EndReason::Timeout));
            fut.await;
        }
    }

    async fn fire_hard_kill(&self, session_id: &str) {
        let st = self.inner.lock().await;
        if let Some(active) = &st.active {
            if active.session_id == session_id {
                warn!("Session {session_id} still alive past hard timeout, force-killing");
                active.process.kill();
            }
        }
    }

    async fn fire_grace_expiry(&self, session_id: &str, epoch: u64) {
        let mut st = self.inner.lock().await;
        let expired = matches!(
            &st.active,
            Some(a) if a.session_id == session_id && a.awaiting_reconnect && a.grace_epoch == epoch
        );
        if expired {
            info!("Reconnect grace expired for session {session_id}");
            let fut: Pin<Box<dyn Future<Output = ()> + Send + '_>> =
                Box::pin(self.end_session_locked(&mut st, EndReason::Disconnected));
            fut.await;
        }
    }

    async fn handle_container_exit(&self, session_id: &str, code: Option<i32>) {
        let mut st = self.inner.lock().await;
        let current = matches!(&st.active, Some(a) if a.session_id == session_id);
        if !current {
            return;
        }
        if let Some(active) = st.active.as_mut() {
            match code {
                Some(0) | None => {}
                Some(code) => active
                    .errors
                    .push(format!("terminal process exited with code {code}")),
            }
        }
        let fut: Pin<Box<dyn Future<Output = ()> + Send + '_>> =
            Box::pin(self.end_session_locked(&mut st, EndReason::ContainerExit));
        fut.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::NullSpawner;

    fn test_config(max_queue: usize, grace_ms: u64) -> Config {
        let mut config: Config = toml::from_str("").unwrap();
        config.session.max_queue_size = max_queue;
        config.session.disconnect_grace_ms = grace_ms;
        config.session.env_host_path = std::env::temp_dir()
            .join(format!("demogate-coord-{}.env", Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        config
    }

    fn coordinator(config: Config) -> (Coordinator, Arc<NullSpawner>) {
        let spawner = Arc::new(NullSpawner::new());
        let coord = Coordinator::new(
            Arc::new(config),
            KvStore::disabled(),
            spawner.clone(),
            GateMetrics::new(),
        );
        (coord, spawner)
    }

    async fn connect(coord: &Coordinator, source: &str) -> (String, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(64);
        let id = coord
            .register(tx, source.to_string(), Some("test-agent".to_string()))
            .await;
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Value>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn types_of(frames: &[Value]) -> Vec<&str> {
        frames
            .iter()
            .map(|f| f["type"].as_str().unwrap_or("?"))
            .collect()
    }

    fn find<'a>(frames: &'a [Value], frame_type: &str) -> Option<&'a Value> {
        frames.iter().find(|f| f["type"] == frame_type)
    }

    async fn settle() {
        // Let detached watcher/timer tasks run.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn empty_queue_admission_issues_token_then_starting() {
        let (coord, _spawner) = coordinator(test_config(10, 10000));
        let (c1, mut rx1) = connect(&coord, "10.0.0.7").await;

        coord.join(&c1, None).await;
        let frames = drain(&mut rx1);
        assert_eq!(
            types_of(&frames),
            vec!["status", "session_token", "session_starting"]
        );

        let status = find(&frames, "status").unwrap();
        assert_eq!(status["queue_size"], 0);
        assert_eq!(status["session_active"], false);

        // Pending-token round trip: the token frame and session_starting
        // carry the same string.
        let token = find(&frames, "session_token").unwrap()["session_token"]
            .as_str()
            .unwrap()
            .to_string();
        let starting = find(&frames, "session_starting").unwrap();
        assert_eq!(starting["session_token"], token.as_str());
        assert_eq!(starting["terminal_url"], "/terminal");
        assert!(starting["expires_at"].as_str().is_some());

        let snapshot = coord.status().await;
        assert!(snapshot.session_active);
        assert_eq!(snapshot.queue_size, 0);
        assert!(matches!(
            coord.check_session_token(&token).await,
            TokenCheck::Session(_)
        ));
    }

    #[tokio::test]
    async fn second_client_queues_and_promotes_on_exit() {
        let (coord, spawner) = coordinator(test_config(10, 10000));
        let (c1, mut rx1) = connect(&coord, "10.0.0.7").await;
        let (c2, mut rx2) = connect(&coord, "10.0.0.8").await;

        coord.join(&c1, None).await;
        coord.join(&c2, None).await;

        let frames2 = drain(&mut rx2);
        assert_eq!(
            types_of(&frames2),
            vec!["status", "session_token", "queue_position"]
        );
        let position = find(&frames2, "queue_position").unwrap();
        assert_eq!(position["position"], 1);
        assert_eq!(position["queue_size"], 1);
        assert_eq!(position["estimated_wait"], "45 minutes");

        // Holder's container exits; C2 is promoted.
        drain(&mut rx1);
        assert!(spawner.trigger_exit());
        settle().await;

        let ended = drain(&mut rx1);
        let ended_frame = find(&ended, "session_ended").unwrap();
        assert_eq!(ended_frame["reason"], "container_exit");
        assert_eq!(ended_frame["clear_session_cookie"], true);

        let promoted = drain(&mut rx2);
        assert!(find(&promoted, "session_starting").is_some());

        let snapshot = coord.status().await;
        assert!(snapshot.session_active);
        assert_eq!(snapshot.queue_size, 0);
    }

    #[tokio::test]
    async fn queue_full_rejects_without_mutation() {
        let (coord, _spawner) = coordinator(test_config(1, 10000));
        let (c1, _rx1) = connect(&coord, "10.0.0.1").await;
        let (c2, _rx2) = connect(&coord, "10.0.0.2").await;
        let (c3, mut rx3) = connect(&coord, "10.0.0.3").await;

        coord.join(&c1, None).await;
        coord.join(&c2, None).await;
        coord.join(&c3, None).await;

        let frames3 = drain(&mut rx3);
        assert!(find(&frames3, "queue_full").is_some());
        assert!(find(&frames3, "session_token").is_none());

        let snapshot = coord.status().await;
        assert_eq!(snapshot.queue_size, 1);
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_across_promotions() {
        let (coord, spawner) = coordinator(test_config(10, 10000));
        let (c1, _rx1) = connect(&coord, "10.0.0.1").await;
        let (c2, mut rx2) = connect(&coord, "10.0.0.2").await;
        let (c3, mut rx3) = connect(&coord, "10.0.0.3").await;

        coord.join(&c1, None).await;
        coord.join(&c2, None).await;
        coord.join(&c3, None).await;

        assert!(spawner.trigger_exit());
        settle().await;
        // C2 (earlier arrival) must hold the slot, C3 still queued at 1.
        assert!(find(&drain(&mut rx2), "session_starting").is_some());
        let frames3 = drain(&mut rx3);
        let position = frames3
            .iter()
            .filter(|f| f["type"] == "queue_position")
            .next_back()
            .unwrap();
        assert_eq!(position["position"], 1);

        assert!(spawner.trigger_exit());
        settle().await;
        assert!(find(&drain(&mut rx3), "session_starting").is_some());
    }

    #[tokio::test]
    async fn repeated_join_is_rejected_and_queue_stays_unique() {
        let (coord, _spawner) = coordinator(test_config(10, 10000));
        let (c1, _rx1) = connect(&coord, "10.0.0.1").await;
        let (c2, mut rx2) = connect(&coord, "10.0.0.2").await;

        coord.join(&c1, None).await;
        coord.join(&c2, None).await;
        drain(&mut rx2);

        coord.join(&c2, None).await;
        let frames = drain(&mut rx2);
        assert_eq!(types_of(&frames), vec!["error"]);
        assert_eq!(coord.status().await.queue_size, 1);
    }

    #[tokio::test]
    async fn leave_queue_is_idempotent_and_silent_when_not_queued() {
        let (coord, _spawner) = coordinator(test_config(10, 10000));
        let (c1, _rx1) = connect(&coord, "10.0.0.1").await;
        let (c2, mut rx2) = connect(&coord, "10.0.0.2").await;

        coord.join(&c1, None).await;
        coord.join(&c2, None).await;
        drain(&mut rx2);

        coord.leave(&c2).await;
        let frames = drain(&mut rx2);
        assert!(find(&frames, "left_queue").is_some());
        assert_eq!(coord.status().await.queue_size, 0);

        // Second leave: no frame at all.
        coord.leave(&c2).await;
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn queued_disconnect_removes_entry_and_rebroadcasts() {
        let (coord, _spawner) = coordinator(test_config(10, 10000));
        let (c1, _rx1) = connect(&coord, "10.0.0.1").await;
        let (c2, mut rx2) = connect(&coord, "10.0.0.2").await;
        let (c3, mut rx3) = connect(&coord, "10.0.0.3").await;

        coord.join(&c1, None).await;
        coord.join(&c2, None).await;
        coord.join(&c3, None).await;
        let token2 = find(&drain(&mut rx2), "session_token").unwrap()["session_token"]
            .as_str()
            .unwrap()
            .to_string();
        drain(&mut rx3);

        coord.disconnect(&c2).await;
        let frames3 = drain(&mut rx3);
        let position = find(&frames3, "queue_position").unwrap();
        assert_eq!(position["position"], 1);
        assert_eq!(position["queue_size"], 1);

        // The departed client's pending token is gone immediately.
        assert_eq!(coord.check_session_token(&token2).await, TokenCheck::Unknown);
    }

    #[tokio::test]
    async fn reconnect_within_grace_keeps_session_identity() {
        let (coord, _spawner) = coordinator(test_config(10, 5000));
        let (c1, mut rx1) = connect(&coord, "10.0.0.7").await;
        coord.join(&c1, None).await;
        let frames = drain(&mut rx1);
        let token = find(&frames, "session_token").unwrap()["session_token"]
            .as_str()
            .unwrap()
            .to_string();
        let expires = find(&frames, "session_starting").unwrap()["expires_at"]
            .as_str()
            .unwrap()
            .to_string();
        let session_id = match coord.check_session_token(&token).await {
            TokenCheck::Session(id) => id,
            other => panic!("expected session token, got {other:?}"),
        };

        coord.disconnect(&c1).await;

        // Same source address, no invite: recognized as a reconnect.
        let (c2, mut rx2) = connect(&coord, "10.0.0.7").await;
        coord.join(&c2, None).await;
        let frames2 = drain(&mut rx2);
        assert_eq!(
            types_of(&frames2),
            vec!["status", "session_token", "session_starting"]
        );
        assert_eq!(
            find(&frames2, "session_token").unwrap()["session_token"],
            token.as_str()
        );
        let starting = find(&frames2, "session_starting").unwrap();
        assert_eq!(starting["reconnected"], true);
        assert_eq!(starting["expires_at"], expires.as_str());
        assert_eq!(
            coord.check_session_token(&token).await,
            TokenCheck::Session(session_id)
        );
    }

    #[tokio::test]
    async fn queued_connection_reconnecting_gives_up_its_queue_spot() {
        let (coord, _spawner) = coordinator(test_config(10, 5000));
        let (c1, _rx1) = connect(&coord, "10.0.0.7").await;
        let (c2, mut rx2) = connect(&coord, "10.0.0.7").await;
        coord.join(&c1, None).await;
        coord.join(&c2, None).await;
        let old_pending = find(&drain(&mut rx2), "session_token").unwrap()["session_token"]
            .as_str()
            .unwrap()
            .to_string();

        // Holder drops; the queued tab from the same source re-joins and
        // takes the session over instead of waiting.
        coord.disconnect(&c1).await;
        coord.join(&c2, None).await;
        let frames = drain(&mut rx2);
        assert_eq!(
            find(&frames, "session_starting").unwrap()["reconnected"],
            true
        );

        let snapshot = coord.status().await;
        assert!(snapshot.session_active);
        assert_eq!(snapshot.queue_size, 0);
        // Its queue-era pending token died with the queue spot.
        assert_eq!(
            coord.check_session_token(&old_pending).await,
            TokenCheck::Unknown
        );
    }

    #[tokio::test]
    async fn grace_expiry_ends_session_and_evicts_token() {
        let (coord, _spawner) = coordinator(test_config(10, 50));
        let (c1, mut rx1) = connect(&coord, "10.0.0.7").await;
        coord.join(&c1, None).await;
        let token = find(&drain(&mut rx1), "session_token").unwrap()["session_token"]
            .as_str()
            .unwrap()
            .to_string();

        coord.disconnect(&c1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!coord.status().await.session_active);
        assert_eq!(coord.check_session_token(&token).await, TokenCheck::Unknown);
    }

    #[tokio::test]
    async fn mismatched_source_queues_instead_of_reconnecting() {
        let (coord, _spawner) = coordinator(test_config(10, 5000));
        let (c1, _rx1) = connect(&coord, "10.0.0.7").await;
        coord.join(&c1, None).await;
        coord.disconnect(&c1).await;

        let (c2, mut rx2) = connect(&coord, "10.0.0.99").await;
        coord.join(&c2, None).await;
        let frames = drain(&mut rx2);
        // Session still held for the original source; the stranger queues.
        assert!(find(&frames, "queue_position").is_some());
        assert!(find(&frames, "session_starting").is_none());
    }

    #[tokio::test]
    async fn pending_token_validates_until_promotion() {
        let (coord, spawner) = coordinator(test_config(10, 10000));
        let (c1, _rx1) = connect(&coord, "10.0.0.1").await;
        let (c2, mut rx2) = connect(&coord, "10.0.0.2").await;
        coord.join(&c1, None).await;
        coord.join(&c2, None).await;
        let token = find(&drain(&mut rx2), "session_token").unwrap()["session_token"]
            .as_str()
            .unwrap()
            .to_string();

        assert_eq!(
            coord.check_session_token(&token).await,
            TokenCheck::Pending(c2.clone())
        );

        assert!(spawner.trigger_exit());
        settle().await;
        // Same string, now a session token.
        assert!(matches!(
            coord.check_session_token(&token).await,
            TokenCheck::Session(_)
        ));
        assert_eq!(
            coord.check_session_token("bogus-token").await,
            TokenCheck::Unknown
        );
    }

    #[tokio::test]
    async fn spawn_failure_reverts_client_and_frees_slot() {
        let (coord, spawner) = coordinator(test_config(10, 10000));
        let (c1, mut rx1) = connect(&coord, "10.0.0.1").await;

        spawner.fail_next();
        coord.join(&c1, None).await;
        let frames = drain(&mut rx1);
        assert_eq!(types_of(&frames), vec!["status", "error"]);
        assert!(!coord.status().await.session_active);

        // The client can try again once the spawner recovers.
        coord.join(&c1, None).await;
        assert!(find(&drain(&mut rx1), "session_starting").is_some());
    }

    #[tokio::test]
    async fn promotion_skips_departed_clients_until_queue_is_dry() {
        let (coord, spawner) = coordinator(test_config(10, 10000));
        let (c1, _rx1) = connect(&coord, "10.0.0.1").await;
        let (c2, _rx2) = connect(&coord, "10.0.0.2").await;
        coord.join(&c1, None).await;
        coord.join(&c2, None).await;

        coord.disconnect(&c2).await;
        assert!(spawner.trigger_exit());
        settle().await;

        // Queue had only a departed client; the slot must be empty.
        let snapshot = coord.status().await;
        assert!(!snapshot.session_active);
        assert_eq!(snapshot.queue_size, 0);
    }

    #[tokio::test]
    async fn shutdown_ends_active_session() {
        let (coord, _spawner) = coordinator(test_config(10, 10000));
        let (c1, mut rx1) = connect(&coord, "10.0.0.1").await;
        coord.join(&c1, None).await;
        drain(&mut rx1);

        coord.shutdown().await;
        let frames = drain(&mut rx1);
        assert_eq!(find(&frames, "session_ended").unwrap()["reason"], "shutdown");
        assert!(!coord.status().await.session_active);
    }

    #[tokio::test]
    async fn status_estimates_wait_for_a_prospective_joiner() {
        let (coord, _spawner) = coordinator(test_config(10, 10000));
        let (c1, _rx1) = connect(&coord, "10.0.0.1").await;
        let (c2, _rx2) = connect(&coord, "10.0.0.2").await;

        assert_eq!(coord.status().await.estimated_wait, "0 minutes");
        coord.join(&c1, None).await;
        assert_eq!(coord.status().await.estimated_wait, "45 minutes");
        coord.join(&c2, None).await;
        assert_eq!(coord.status().await.estimated_wait, "90 minutes");
    }
}

