//! Invite validation and end-of-session audit.
//!
//! Invites live in the external key-value store as JSON under
//! `invite:<token>`; they are created out of band, never by this service.
//! Validation is a fixed decision ladder (see [`decide`]) with one special
//! case: an exhausted invite still validates as a **rejoin** when the
//! requester matches the active session or a pending-token entry for the same
//! invite — that keeps the landing page and a reconnect working for the
//! invite's original holder.
//!
//! The audit trail is append-only: every ended session that carried an invite
//! writes a summary entry back onto the invite record, bumping `useCount` and
//! flipping `status` to `used` when the invite is exhausted. Audit failures
//! are logged and swallowed; they never block a session from ending.

pub mod store;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info_span, warn, Instrument};

use crate::coordinator::session::EndReason;
use crate::metrics::GateMetrics;
use store::{KvStore, StoreError, MIN_TTL_SECS};

/// Invite record stored at `invite:<token>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRecord {
    pub expires_at: DateTime<Utc>,
    pub max_uses: u32,
    #[serde(default)]
    pub use_count: u32,
    pub status: InviteStatus,
    #[serde(default)]
    pub sessions: Vec<SessionAudit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Active,
    Used,
    Revoked,
    Expired,
}

/// One end-of-session audit entry, appended to the invite's `sessions` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAudit {
    pub session_id: String,
    pub client_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: EndReason,
    pub queue_wait_ms: u64,
    pub source_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Why an invite was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Token failed the syntax check; no store lookup was performed.
    Invalid,
    NotFound,
    Revoked,
    Used,
    Expired,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::NotFound => "not_found",
            Self::Revoked => "revoked",
            Self::Used => "used",
            Self::Expired => "expired",
        }
    }

    /// Human-readable message carried on `invite_invalid` frames and the
    /// HTTP 401 body.
    pub fn message(self) -> &'static str {
        match self {
            Self::Invalid => "Invite token is malformed",
            Self::NotFound => "Invite token not recognized",
            Self::Revoked => "Invite has been revoked",
            Self::Used => "Invite has already been used",
            Self::Expired => "Invite has expired",
        }
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone)]
pub enum Verdict {
    Valid {
        record: InviteRecord,
        rejoin: bool,
    },
    Rejected(RejectReason),
}

impl Verdict {
    /// Label recorded on the `demo_invites_validated_total` counter.
    pub fn metric_status(&self) -> &'static str {
        match self {
            Self::Valid { rejoin: true, .. } => "rejoin",
            Self::Valid { rejoin: false, .. } => "valid",
            Self::Rejected(reason) => reason.as_str(),
        }
    }
}

/// Token syntax: 4–64 characters from `[A-Za-z0-9_-]`. Anything else is
/// rejected before a store lookup.
pub fn token_syntax_ok(token: &str) -> bool {
    (4..=64).contains(&token.len())
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Pure decision ladder over a fetched record. `rejoin_match` is whether the
/// requester's source address matches the active session or a pending-token
/// entry carrying this invite.
fn decide(record: &InviteRecord, now: DateTime<Utc>, rejoin_match: bool) -> Verdict {
    if record.status == InviteStatus::Revoked {
        return Verdict::Rejected(RejectReason::Revoked);
    }
    if record.status == InviteStatus::Used || record.use_count >= record.max_uses {
        if rejoin_match {
            return Verdict::Valid {
                record: record.clone(),
                rejoin: true,
            };
        }
        return Verdict::Rejected(RejectReason::Used);
    }
    if record.expires_at < now {
        return Verdict::Rejected(RejectReason::Expired);
    }
    Verdict::Valid {
        record: record.clone(),
        rejoin: false,
    }
}

/// Validate `token` against the store.
///
/// `rejoin_match` is computed by the caller from coordinator state before the
/// lookup. When `persist_expiry` is set, a newly-expired record is written
/// back with `status: expired` under its existing TTL (the read-only HTTP
/// sub-request path passes `false`).
///
/// Store failures fail closed as `not_found`. Every decision increments the
/// validation counter.
pub async fn validate(
    store: &KvStore,
    metrics: &GateMetrics,
    token: &str,
    rejoin_match: bool,
    persist_expiry: bool,
) -> Verdict {
    let verdict = async {
        if !token_syntax_ok(token) {
            return Verdict::Rejected(RejectReason::Invalid);
        }

        let record = match store.get_invite(token).await {
            Ok(Some(record)) => record,
            Ok(None) => return Verdict::Rejected(RejectReason::NotFound),
            Err(e) => {
                // Fail closed: a store outage must not admit unknown tokens.
                if !matches!(e, StoreError::Unavailable) {
                    warn!("Invite lookup failed for token: {e}");
                }
                return Verdict::Rejected(RejectReason::NotFound);
            }
        };

        let verdict = decide(&record, Utc::now(), rejoin_match);

        if persist_expiry && matches!(verdict, Verdict::Rejected(RejectReason::Expired)) {
            let mut expired = record;
            expired.status = InviteStatus::Expired;
            let ttl = store
                .invite_ttl(token)
                .await
                .ok()
                .filter(|t| *t > 0)
                .unwrap_or(MIN_TTL_SECS);
            if let Err(e) = store.put_invite(token, &expired, ttl).await {
                warn!("Failed to persist expired status for invite: {e}");
            }
        }

        verdict
    }
    .instrument(info_span!("invite.validate"))
    .await;

    metrics.invite_validated(verdict.metric_status());
    verdict
}

/// Apply one audit entry to a record: append, bump `useCount`, flip `status`
/// to `used` when exhausted.
fn apply_audit(record: &mut InviteRecord, entry: SessionAudit) {
    record.sessions.push(entry);
    record.use_count += 1;
    if record.use_count >= record.max_uses {
        record.status = InviteStatus::Used;
    }
}

/// TTL for an audited record: keep it until `expiresAt + retention`, floored
/// at one day.
fn audit_ttl_secs(record: &InviteRecord, now: DateTime<Utc>, retention_days: i64) -> i64 {
    let keep_until = record.expires_at + Duration::days(retention_days);
    (keep_until - now).num_seconds().max(MIN_TTL_SECS)
}

/// Write the end-of-session audit entry for `token`.
///
/// Read-modify-write against the store; any failure is logged and swallowed
/// so the session-end path never blocks on the store.
pub async fn record_session_audit(
    store: &KvStore,
    token: &str,
    entry: SessionAudit,
    retention_days: i64,
) {
    let mut record = match store.get_invite(token).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!("Audit skipped: invite record vanished");
            return;
        }
        Err(e) => {
            warn!("Audit skipped: invite read failed: {e}");
            return;
        }
    };

    apply_audit(&mut record, entry);
    let ttl = audit_ttl_secs(&record, Utc::now(), retention_days);
    if let Err(e) = store.put_invite(token, &record, ttl).await {
        warn!("Audit write failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: InviteStatus, use_count: u32, max_uses: u32) -> InviteRecord {
        InviteRecord {
            expires_at: Utc::now() + Duration::hours(1),
            max_uses,
            use_count,
            status,
            sessions: Vec::new(),
        }
    }

    fn audit_entry() -> SessionAudit {
        SessionAudit {
            session_id: "s1".into(),
            client_id: "c1".into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            end_reason: EndReason::Timeout,
            queue_wait_ms: 0,
            source_address: "10.0.0.7".into(),
            user_agent: None,
            errors: Vec::new(),
        }
    }

    #[test]
    fn syntax_bounds() {
        assert!(token_syntax_ok("abcd"));
        assert!(token_syntax_ok("A-Z_09"));
        assert!(token_syntax_ok(&"x".repeat(64)));
        assert!(!token_syntax_ok("abc")); // too short
        assert!(!token_syntax_ok(&"x".repeat(65))); // too long
        assert!(!token_syntax_ok("has space"));
        assert!(!token_syntax_ok("semi;colon"));
        assert!(!token_syntax_ok(""));
    }

    #[test]
    fn active_invite_is_valid() {
        let verdict = decide(&record(InviteStatus::Active, 0, 1), Utc::now(), false);
        assert!(matches!(verdict, Verdict::Valid { rejoin: false, .. }));
        assert_eq!(verdict.metric_status(), "valid");
    }

    #[test]
    fn revoked_wins_over_everything() {
        // Revoked even beats a rejoin match.
        let verdict = decide(&record(InviteStatus::Revoked, 1, 1), Utc::now(), true);
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::Revoked)));
    }

    #[test]
    fn used_rejected_without_rejoin_match() {
        let verdict = decide(&record(InviteStatus::Used, 1, 1), Utc::now(), false);
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::Used)));
    }

    #[test]
    fn exhausted_count_rejects_even_when_status_active() {
        // End-of-session write sets status=used, but count alone must gate.
        let verdict = decide(&record(InviteStatus::Active, 1, 1), Utc::now(), false);
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::Used)));
    }

    #[test]
    fn used_validates_as_rejoin_on_match() {
        let verdict = decide(&record(InviteStatus::Used, 1, 1), Utc::now(), true);
        assert!(matches!(verdict, Verdict::Valid { rejoin: true, .. }));
        assert_eq!(verdict.metric_status(), "rejoin");
    }

    #[test]
    fn expired_rejected() {
        let mut rec = record(InviteStatus::Active, 0, 1);
        rec.expires_at = Utc::now() - Duration::minutes(1);
        let verdict = decide(&rec, Utc::now(), false);
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::Expired)));
    }

    #[test]
    fn audit_appends_and_flips_status() {
        let mut rec = record(InviteStatus::Active, 0, 1);
        apply_audit(&mut rec, audit_entry());
        assert_eq!(rec.use_count, 1);
        assert_eq!(rec.status, InviteStatus::Used);
        assert_eq!(rec.sessions.len(), 1);
        assert_eq!(rec.sessions[0].end_reason, EndReason::Timeout);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["sessions"][0]["endReason"], "timeout");
    }

    #[test]
    fn audit_leaves_status_active_below_max() {
        let mut rec = record(InviteStatus::Active, 0, 3);
        apply_audit(&mut rec, audit_entry());
        assert_eq!(rec.use_count, 1);
        assert_eq!(rec.status, InviteStatus::Active);
    }

    #[test]
    fn audit_ttl_floors_at_one_day() {
        let mut rec = record(InviteStatus::Used, 1, 1);
        rec.expires_at = Utc::now() - Duration::days(90);
        assert_eq!(audit_ttl_secs(&rec, Utc::now(), 30), MIN_TTL_SECS);

        rec.expires_at = Utc::now();
        let ttl = audit_ttl_secs(&rec, Utc::now(), 30);
        // ~30 days out
        assert!(ttl > 29 * 86_400 && ttl <= 30 * 86_400);
    }

    #[test]
    fn record_round_trips_camel_case() {
        let rec = record(InviteStatus::Active, 0, 1);
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("expiresAt").is_some());
        assert!(json.get("maxUses").is_some());
        assert!(json.get("useCount").is_some());
        assert_eq!(json.get("status").unwrap(), "active");

        let parsed: InviteRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.max_uses, 1);
    }

    #[test]
    fn record_tolerates_minimal_seed() {
        // Seeders write records without sessions/useCount; both default.
        let parsed: InviteRecord = serde_json::from_str(
            r#"{"expiresAt":"2030-01-01T00:00:00Z","maxUses":1,"status":"active"}"#,
        )
        .unwrap();
        assert_eq!(parsed.use_count, 0);
        assert!(parsed.sessions.is_empty());
    }

    #[tokio::test]
    async fn validate_fails_closed_without_store() {
        let store = KvStore::disabled();
        let metrics = GateMetrics::new();
        let verdict = validate(&store, &metrics, "T1-valid", false, true).await;
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::NotFound)));
    }

    #[tokio::test]
    async fn validate_rejects_bad_syntax_before_lookup() {
        let store = KvStore::disabled();
        let metrics = GateMetrics::new();
        let verdict = validate(&store, &metrics, "bad token!", false, true).await;
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::Invalid)));
    }
}
