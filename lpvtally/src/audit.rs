//! Append-only, hash-linked, signed audit events.
//!
//! Every event's `audit_hash` covers its id, aggregate, type, canonical payload, version,
//! timestamp and the `audit_hash` of the event before it. The signature is over the audit hash.
//! An event is trusted only when all three of linkage, hash and signature check out.

use crate::*;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error};
use num_enum::TryFromPrimitive;
use serde_cbor::Value as CborValue;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kind of election fact an event records
#[derive(Serialize, Deserialize, TryFromPrimitive, Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EventType {
    TallySessionInitialized = 1,
    BallotsDecrypted = 2,
    CeremonyTimedOut = 3,
    RoundComputed = 4,
    CandidateEliminated = 5,
    TallyCompleted = 6,
    ResultsVerified = 7,
    ResultsPublished = 8,
    SessionDisputed = 9,
    BallotCast = 10,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            EventType::TallySessionInitialized => "TallySessionInitialized",
            EventType::BallotsDecrypted => "BallotsDecrypted",
            EventType::CeremonyTimedOut => "CeremonyTimedOut",
            EventType::RoundComputed => "RoundComputed",
            EventType::CandidateEliminated => "CandidateEliminated",
            EventType::TallyCompleted => "TallyCompleted",
            EventType::ResultsVerified => "ResultsVerified",
            EventType::ResultsPublished => "ResultsPublished",
            EventType::SessionDisputed => "SessionDisputed",
            EventType::BallotCast => "BallotCast",
        };
        write!(f, "{}", name)
    }
}

/// A sealed audit event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub event_type: EventType,
    pub payload: Value,

    /// 1-based position in the stream
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub audit_hash: String,

    /// Hex signature over `audit_hash`
    pub signature: String,
}

/// Key-sorted CBOR form of a JSON payload, so equal payloads hash equally whatever their key order
fn canonical_payload(value: &Value) -> CborValue {
    match value {
        Value::Null => CborValue::Null,
        Value::Bool(b) => CborValue::Bool(*b),
        Value::Number(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => CborValue::Integer(u as i128),
            (None, Some(i)) => CborValue::Integer(i as i128),
            _ => CborValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => CborValue::Text(s.clone()),
        Value::Array(items) => CborValue::Array(items.iter().map(canonical_payload).collect()),
        Value::Object(fields) => CborValue::Map(
            fields
                .iter()
                .map(|(k, v)| (CborValue::Text(k.clone()), canonical_payload(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
    }
}

impl AuditEvent {
    /// Recompute the audit hash from the event's content
    pub fn compute_hash(&self) -> Result<String, Error> {
        let payload = serde_cbor::to_vec(&canonical_payload(&self.payload))?;
        Ok(HashBuilder::new("lpvtally.audit-event")
            .field(self.event_id.as_bytes())
            .field(&self.aggregate_id)
            .number(self.event_type as u64)
            .field(payload)
            .number(self.version)
            .field(self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .field(&self.previous_hash)
            .finish_hex())
    }
}

/// Check a single event. Any failure rejects the whole event.
pub fn verify_integrity<V: SignatureVerifier + ?Sized>(
    event: &AuditEvent,
    expected_previous_hash: &str,
    verifier: &V,
) -> Result<(), IntegrityFailure> {
    if event.previous_hash != expected_previous_hash {
        return Err(IntegrityFailure::BrokenLink);
    }

    match event.compute_hash() {
        Ok(hash) if hash == event.audit_hash => {}
        _ => return Err(IntegrityFailure::HashMismatch),
    }

    if !verifier.verify_hex(event.audit_hash.as_bytes(), &event.signature) {
        return Err(IntegrityFailure::BadSignature);
    }

    Ok(())
}

/// Walk a whole stream from genesis, stopping at the first event that fails
pub fn verify_events<V: SignatureVerifier + ?Sized>(
    stream: &str,
    events: &[AuditEvent],
    verifier: &V,
) -> Result<(), IntegrityError> {
    let mut previous = GENESIS_HASH.to_owned();
    for (i, event) in events.iter().enumerate() {
        let expected_version = i as u64 + 1;
        let failure = if event.version != expected_version {
            Some(IntegrityFailure::VersionGap {
                expected: expected_version,
                found: event.version,
            })
        } else if event.aggregate_id != stream {
            Some(IntegrityFailure::WrongAggregate(event.aggregate_id.clone()))
        } else {
            verify_integrity(event, &previous, verifier).err()
        };

        if let Some(failure) = failure {
            let err = IntegrityError {
                stream: stream.to_owned(),
                version: expected_version,
                failure,
            };
            error!("audit chain rejected: {}", err);
            return Err(err);
        }
        previous = event.audit_hash.clone();
    }
    Ok(())
}

/// Builds, signs and appends events to an [`EventStore`]
pub struct AuditChain<S: EventStore, G: AuditSigner> {
    store: S,
    signer: G,
    clock: Clock,
}

impl<S: EventStore, G: AuditSigner> AuditChain<S, G> {
    pub fn new(store: S, signer: G) -> Self {
        AuditChain {
            store,
            signer,
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn signer(&self) -> &G {
        &self.signer
    }

    /// Append `events` after `expected_version`.
    ///
    /// Fails with [`Error::ConcurrencyConflict`] when the stream has moved on.
    pub fn append(
        &self,
        stream: &str,
        expected_version: u64,
        events: Vec<(EventType, Value)>,
    ) -> Result<AppendResult, Error> {
        let head = self.store.metadata(stream)?;
        if head.version != expected_version {
            return Err(Error::ConcurrencyConflict {
                stream: stream.to_owned(),
                expected: expected_version,
                actual: head.version,
            });
        }

        let mut previous_hash = head.head_hash;
        let mut sealed = Vec::with_capacity(events.len());
        for (i, (event_type, payload)) in events.into_iter().enumerate() {
            let mut event = AuditEvent {
                event_id: Uuid::new_v4(),
                aggregate_id: stream.to_owned(),
                event_type,
                payload,
                version: expected_version + i as u64 + 1,
                timestamp: self.clock.now(),
                previous_hash,
                audit_hash: String::new(),
                signature: String::new(),
            };
            event.audit_hash = event.compute_hash()?;
            event.signature = self.signer.sign_hex(event.audit_hash.as_bytes());
            previous_hash = event.audit_hash.clone();

            debug!("{} v{}: {}", stream, event.version, event.event_type);
            sealed.push(event);
        }

        self.store.append(stream, expected_version, sealed)
    }

    /// Append at the current head, re-reading and retrying on conflict
    pub fn append_with_retry(
        &self,
        stream: &str,
        events: Vec<(EventType, Value)>,
        policy: &RetryPolicy,
    ) -> Result<AppendResult, Error> {
        policy.run(stream, |_| {
            let version = self.store.metadata(stream)?.version;
            self.append(stream, version, events.clone())
        })
    }

    pub fn read(&self, stream: &str, from_version: u64) -> Result<Vec<AuditEvent>, Error> {
        self.store.read(stream, from_version)
    }

    pub fn seal(&self, stream: &str) -> Result<(), Error> {
        self.store.seal(stream)
    }

    pub fn version(&self, stream: &str) -> Result<u64, Error> {
        Ok(self.store.metadata(stream)?.version)
    }

    /// Verify every event in `stream` against `verifier`
    pub fn verify_stream<V: SignatureVerifier + ?Sized>(
        &self,
        stream: &str,
        verifier: &V,
    ) -> Result<(), Error> {
        let events = self.store.read(stream, 0)?;
        verify_events(stream, &events, verifier)?;
        Ok(())
    }
}
