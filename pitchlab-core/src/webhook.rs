//! Voice-provider webhook ingress.
//!
//! The provider posts a conversation record when a call ends. The raw body is
//! authenticated with HMAC-SHA256 before parsing; with no secret configured
//! the payload is still accepted but flagged as degraded trust. Ingestion is
//! idempotent per conversation id and finishes by attempting correlation.

use crate::correlate::{ConversationCorrelator, CorrelationOutcome};
use crate::error::{Error, Result};
use crate::store::SessionStore;
use crate::types::ConversationRecord;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of signature verification for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Signature present and valid
    Verified,
    /// No secret configured; payload accepted unauthenticated
    DegradedTrust,
}

/// Wire shape of a provider delivery.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub conversation_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transcript: Option<serde_json::Value>,
    #[serde(default)]
    pub analysis: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl WebhookPayload {
    pub fn into_record(self) -> ConversationRecord {
        ConversationRecord {
            conversation_id: self.conversation_id,
            agent_id: self.agent_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            transcript: self.transcript,
            analysis: self.analysis,
            metadata: self.metadata.unwrap_or_else(|| serde_json::json!({})),
        }
    }
}

/// Verify an HMAC-SHA256 hex signature over the raw request body.
///
/// Accepts the digest with or without a `sha256=` prefix. Comparison is
/// constant time. `None` secret means verification is skipped and the
/// degraded status returned.
pub fn verify_signature(
    secret: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<SignatureStatus> {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => {
            tracing::warn!("No webhook secret configured, accepting unauthenticated delivery");
            return Ok(SignatureStatus::DegradedTrust);
        }
    };

    let signature = signature
        .ok_or_else(|| Error::SignatureInvalid("missing signature header".to_string()))?;
    let hex_digest = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = hex::decode(hex_digest.trim())
        .map_err(|_| Error::SignatureInvalid("signature is not valid hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| Error::SignatureInvalid("signature mismatch".to_string()))?;

    Ok(SignatureStatus::Verified)
}

/// Result of ingesting one delivery.
#[derive(Debug)]
pub struct IngestOutcome {
    pub conversation_id: String,
    pub signature: SignatureStatus,
    pub correlation: CorrelationOutcome,
}

/// Handles provider deliveries end to end.
pub struct WebhookHandler<'a> {
    store: &'a dyn SessionStore,
    secret: Option<String>,
}

impl<'a> WebhookHandler<'a> {
    pub fn new(store: &'a dyn SessionStore, secret: Option<String>) -> Self {
        Self { store, secret }
    }

    /// Verify, parse, persist, and correlate one raw delivery.
    pub fn ingest(&self, body: &[u8], signature: Option<&str>) -> Result<IngestOutcome> {
        let status = verify_signature(self.secret.as_deref(), body, signature)?;

        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidInput(format!("malformed webhook payload: {e}")))?;
        if payload.conversation_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "webhook payload missing conversation_id".to_string(),
            ));
        }

        let record = payload.into_record();
        self.store.upsert_conversation(&record)?;

        let correlator = ConversationCorrelator::new(self.store);
        let correlation = correlator.correlate_and_link(&record)?;

        tracing::info!(
            conversation_id = %record.conversation_id,
            agent_id = %record.agent_id,
            verified = status == SignatureStatus::Verified,
            matched = correlation.matched(),
            linked = correlation.linked,
            "Webhook delivery ingested"
        );

        Ok(IngestOutcome {
            conversation_id: record.conversation_id,
            signature: status,
            correlation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::{StoredSession, Transcript};
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_verifies_with_and_without_prefix() {
        let body = br#"{"conversation_id":"c1","agent_id":"a1"}"#;
        let sig = sign("topsecret", body);

        assert_eq!(
            verify_signature(Some("topsecret"), body, Some(&sig)).unwrap(),
            SignatureStatus::Verified
        );
        let prefixed = format!("sha256={sig}");
        assert_eq!(
            verify_signature(Some("topsecret"), body, Some(&prefixed)).unwrap(),
            SignatureStatus::Verified
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let body = b"payload";
        let sig = sign("other-secret", body);
        let err = verify_signature(Some("topsecret"), body, Some(&sig)).unwrap_err();
        assert!(matches!(err, Error::SignatureInvalid(_)));

        let err = verify_signature(Some("topsecret"), body, None).unwrap_err();
        assert!(matches!(err, Error::SignatureInvalid(_)));

        let err = verify_signature(Some("topsecret"), body, Some("not hex!")).unwrap_err();
        assert!(matches!(err, Error::SignatureInvalid(_)));
    }

    #[test]
    fn missing_secret_degrades_trust() {
        assert_eq!(
            verify_signature(None, b"body", None).unwrap(),
            SignatureStatus::DegradedTrust
        );
        assert_eq!(
            verify_signature(Some(""), b"body", Some("sig")).unwrap(),
            SignatureStatus::DegradedTrust
        );
    }

    fn seed_session(db: &Database, id: &str, agent: &str, started_at: DateTime<Utc>) {
        let session = StoredSession {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            agent_id: Some(agent.to_string()),
            started_at,
            ended_at: None,
            duration_secs: 300,
            transcript: Transcript::default(),
            scores: None,
            summary: None,
            feedback: None,
            line_ratings: BTreeMap::new(),
            rated_batches: 0,
            total_batches: None,
            conversation_id: None,
            analytics: None,
            metadata: serde_json::json!({}),
        };
        db.upsert_session(&session).unwrap();
    }

    #[test]
    fn ingest_persists_and_links() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let start = Utc::now();
        seed_session(&db, "s1", "agent-1", start);

        let body = serde_json::json!({
            "conversation_id": "conv-9",
            "agent_id": "agent-1",
            "started_at": (start + Duration::seconds(15)).to_rfc3339(),
        })
        .to_string();
        let sig = sign("hushhush", body.as_bytes());

        let handler = WebhookHandler::new(&db, Some("hushhush".to_string()));
        let outcome = handler.ingest(body.as_bytes(), Some(&sig)).unwrap();

        assert_eq!(outcome.signature, SignatureStatus::Verified);
        assert!(outcome.correlation.linked);
        assert!(db.get_conversation("conv-9").unwrap().is_some());
        let session = db.load_session("s1").unwrap().unwrap();
        assert_eq!(session.conversation_id.as_deref(), Some("conv-9"));
    }

    #[test]
    fn ingest_is_idempotent_per_conversation() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();

        let body = serde_json::json!({
            "conversation_id": "conv-9",
            "agent_id": "agent-1",
        })
        .to_string();

        let handler = WebhookHandler::new(&db, None);
        handler.ingest(body.as_bytes(), None).unwrap();
        handler.ingest(body.as_bytes(), None).unwrap();

        assert!(db.get_conversation("conv-9").unwrap().is_some());
    }

    #[test]
    fn malformed_body_is_invalid_input() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let handler = WebhookHandler::new(&db, None);

        let err = handler.ingest(b"not json", None).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = handler
            .ingest(br#"{"conversation_id":"  ","agent_id":"a"}"#, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
