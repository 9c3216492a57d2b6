//! The tally session state machine.
//!
//! `initializing → in_progress → completed → verified → published`, with `disputed` reachable from
//! any non-terminal state. Every transition is recorded in the session's audit stream. Decrypted
//! ballots exist only in session memory and are never serialized.

use crate::*;
use chrono::{DateTime, Utc};
use ed25519_dalek::PublicKey;
use log::{error, info, warn};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::mpsc::Receiver;
use uuid::Uuid;

/// Distinct authorizers a session needs before it may start
pub const MIN_AUTHORIZERS: usize = 2;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    InProgress,
    Completed,
    Verified,
    Published,
    Disputed,
}

impl SessionStatus {
    /// The only forward state reachable from this one
    pub fn next(self) -> Option<SessionStatus> {
        match self {
            SessionStatus::Initializing => Some(SessionStatus::InProgress),
            SessionStatus::InProgress => Some(SessionStatus::Completed),
            SessionStatus::Completed => Some(SessionStatus::Verified),
            SessionStatus::Verified => Some(SessionStatus::Published),
            SessionStatus::Published | SessionStatus::Disputed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Verified => "verified",
            SessionStatus::Published => "published",
            SessionStatus::Disputed => "disputed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Preliminary,
    Official,
    Recount,
    Audit,
}

/// Why a session was disputed: the first failing step and, where known, the round or audit
/// event at fault
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DisputeRecord {
    pub step: String,
    pub round: Option<u32>,
    pub event_version: Option<u64>,
    pub reason: String,
    pub disputed_at: DateTime<Utc>,
}

/// Collaborators a session runs against
pub struct TallyContext<S: EventStore, G: AuditSigner> {
    pub chain: AuditChain<S, G>,
    pub engine: CountingEngine,
    pub retry: RetryPolicy,
    pub ceremony_attempts: u32,
}

impl<S: EventStore, G: AuditSigner> TallyContext<S, G> {
    pub fn new(chain: AuditChain<S, G>, config: &Config) -> Self {
        TallyContext {
            chain,
            engine: config.engine(),
            retry: config.retry_policy(),
            ceremony_attempts: config.ceremony_attempts,
        }
    }

    pub fn with_engine(mut self, engine: CountingEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Verifier for events this context signed
    pub fn audit_verifier(&self) -> Result<PublicKey, Error> {
        Ok(PublicKey::from_bytes(&self.chain.signer().public_key())?)
    }
}

/// A tally of one constituency
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TallySession {
    pub id: Uuid,
    pub election_id: String,
    pub constituency_id: String,
    pub session_type: SessionType,
    pub authorizers: Vec<String>,
    pub candidates: Vec<Candidate>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Version of the last event this session appended
    pub version: u64,

    pub ceremony_timeouts: u32,
    pub result: Option<TallyResult>,
    pub publication: Option<PublicationRecord>,
    pub dispute: Option<DisputeRecord>,

    #[serde(skip)]
    ballots: Vec<Ballot>,
}

/// Round at fault for errors that name one
fn fault_round(err: &Error) -> Option<u32> {
    match err {
        Error::MathematicalVerification { round, .. } => Some(*round),
        Error::ResultMismatch(mismatch) => mismatch.round(),
        _ => None,
    }
}

fn fault_version(err: &Error) -> Option<u64> {
    match err {
        Error::Integrity(e) => Some(e.version),
        _ => None,
    }
}

impl TallySession {
    pub fn new(
        election_id: &str,
        constituency_id: &str,
        session_type: SessionType,
        authorizers: Vec<String>,
        candidates: Vec<Candidate>,
    ) -> Self {
        let now = Utc::now();
        TallySession {
            id: Uuid::new_v4(),
            election_id: election_id.to_owned(),
            constituency_id: constituency_id.to_owned(),
            session_type,
            authorizers,
            candidates,
            status: SessionStatus::Initializing,
            created_at: now,
            updated_at: now,
            version: 0,
            ceremony_timeouts: 0,
            result: None,
            publication: None,
            dispute: None,
            ballots: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> String {
        format!("session-{}", self.id)
    }

    /// Number of decrypted ballots held in memory
    pub fn ballot_count(&self) -> usize {
        self.ballots.len()
    }

    fn distinct_authorizers(&self) -> usize {
        self.authorizers
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Refuse anything but the single legal step to `to`
    fn expect_transition(&self, to: SessionStatus) -> Result<(), Error> {
        if self.status.next() == Some(to) {
            Ok(())
        } else {
            Err(Error::IllegalTransition {
                from: self.status,
                to,
            })
        }
    }

    /// Refuse work unless the session is sitting in `status`
    fn expect_status(&self, status: SessionStatus) -> Result<(), Error> {
        if self.status == status {
            Ok(())
        } else {
            Err(Error::IllegalTransition {
                from: self.status,
                to: status,
            })
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        info!(
            "session {} ({}): {} -> {}",
            self.id, self.constituency_id, self.status, status
        );
        self.status = status;
        self.updated_at = Utc::now();
    }

    fn record<S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
        events: Vec<(EventType, Value)>,
    ) -> Result<(), Error> {
        let appended = ctx
            .chain
            .append_with_retry(&self.stream_id(), events, &ctx.retry)?;
        self.version = appended.new_version;
        Ok(())
    }

    /// Dispute the session if `result` is a fatal error, then pass it through
    fn guard<T, S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
        step: &str,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.status.is_terminal() {
                let (round, version) = (fault_round(e), fault_version(e));
                self.mark_disputed(ctx, step, round, version, e.to_string());
            }
        }
        result
    }

    fn mark_disputed<S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
        step: &str,
        round: Option<u32>,
        event_version: Option<u64>,
        reason: String,
    ) {
        error!("session {} disputed at {}: {}", self.id, step, reason);
        let event_version = event_version.or(Some(self.version));

        let payload = json!({
            "session_id": self.id,
            "step": step,
            "round": round,
            "event_version": event_version,
            "reason": reason,
        });
        // The dispute stands even when the stream itself can no longer be written
        if let Err(e) = self.record(ctx, vec![(EventType::SessionDisputed, payload)]) {
            error!("session {}: could not record dispute: {}", self.id, e);
        }

        self.dispute = Some(DisputeRecord {
            step: step.to_owned(),
            round,
            event_version,
            reason,
            disputed_at: Utc::now(),
        });
        if let Some(result) = self.result.as_mut() {
            result.status = ResultStatus::Disputed;
        }
        self.set_status(SessionStatus::Disputed);
    }

    /// Start the session. Needs at least two distinct authorizers.
    pub fn initialize<S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
    ) -> Result<(), Error> {
        self.expect_transition(SessionStatus::InProgress)?;

        let found = self.distinct_authorizers();
        if found < MIN_AUTHORIZERS {
            warn!(
                "session {}: {} distinct authorizer(s), {} required",
                self.id, found, MIN_AUTHORIZERS
            );
            return Err(Error::InsufficientAuthorization {
                required: MIN_AUTHORIZERS,
                found,
            });
        }
        validate_candidates(&self.candidates)?;

        let payload = json!({
            "session_id": self.id,
            "election_id": self.election_id,
            "constituency_id": self.constituency_id,
            "session_type": self.session_type,
            "authorizers": self.authorizers,
            "candidates": self.candidates.iter().map(|c| &c.id).collect::<Vec<_>>(),
        });
        self.record(ctx, vec![(EventType::TallySessionInitialized, payload)])?;
        self.set_status(SessionStatus::InProgress);
        Ok(())
    }

    fn load_ballots<S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
        ballots: Vec<Ballot>,
        source: Value,
    ) -> Result<usize, Error> {
        self.expect_status(SessionStatus::InProgress)?;
        if !self.ballots.is_empty() {
            return Err(Error::IllegalTransition {
                from: self.status,
                to: SessionStatus::InProgress,
            });
        }

        let count = ballots.len();
        let payload = json!({
            "session_id": self.id,
            "ballots": count,
            "source": source,
        });
        self.record(ctx, vec![(EventType::BallotsDecrypted, payload)])?;
        self.ballots = ballots;
        Ok(count)
    }

    /// Take decrypted ballots straight from the casting boundary
    pub fn accept_ballots<S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
        ballots: Vec<Ballot>,
    ) -> Result<usize, Error> {
        self.load_ballots(ctx, ballots, json!("inbound"))
    }

    /// Run one attempt at the decryption ceremony and decrypt `secure_ballots` in memory.
    ///
    /// A timeout leaves the session in progress so the ceremony can be retried, until the
    /// configured number of attempts have timed out and the session is disputed.
    pub fn run_ceremony<S, G, D>(
        &mut self,
        ctx: &TallyContext<S, G>,
        ceremony: &DecryptionCeremony,
        shares: &Receiver<KeyShare>,
        decryptor: &D,
        secure_ballots: &[SecureBallot],
    ) -> Result<usize, Error>
    where
        S: EventStore,
        G: AuditSigner,
        D: ThresholdDecryptor + ?Sized,
    {
        self.expect_status(SessionStatus::InProgress)?;

        let (capability, trustees) = match ceremony.run(shares, decryptor) {
            Ok(out) => out,
            Err(Error::CeremonyTimeout {
                collected,
                required,
            }) => {
                self.ceremony_timeouts += 1;
                let payload = json!({
                    "session_id": self.id,
                    "attempt": self.ceremony_timeouts,
                    "collected": collected,
                    "required": required,
                });
                self.record(ctx, vec![(EventType::CeremonyTimedOut, payload)])?;

                if self.ceremony_timeouts >= ctx.ceremony_attempts {
                    self.mark_disputed(
                        ctx,
                        "decryption_ceremony",
                        None,
                        None,
                        format!(
                            "{} ceremony attempts timed out, last with {} of {} shares",
                            self.ceremony_timeouts, collected, required
                        ),
                    );
                }
                return Err(Error::CeremonyTimeout {
                    collected,
                    required,
                });
            }
            Err(e) => return Err(e),
        };

        let decrypted = match capability.decrypt_all(secure_ballots) {
            Ok(ballots) => ballots,
            Err(e) => {
                self.mark_disputed(ctx, "decryption", None, None, e.to_string());
                return Err(e);
            }
        };

        self.load_ballots(ctx, decrypted, json!({ "trustees": trustees }))
    }

    /// Count the loaded ballots. A count that fails its own verification disputes the session.
    ///
    /// Unlike [`CountingEngine::count`], which counts an empty set deterministically, a session
    /// with no ballots is refused with `NoBallots`: an empty ceremony output means decryption
    /// or casting went wrong, not that the constituency cast nothing.
    pub fn complete<S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
    ) -> Result<&TallyResult, Error> {
        self.expect_transition(SessionStatus::Completed)?;
        if self.ballots.is_empty() {
            return Err(Error::NoBallots(self.id));
        }

        let counted = ctx
            .engine
            .count(&self.constituency_id, &self.ballots, &self.candidates);
        let result = self.guard(ctx, "count", counted)?;

        let mut events = Vec::with_capacity(result.rounds.len() * 2 + 1);
        for round in &result.rounds {
            events.push((
                EventType::RoundComputed,
                json!({
                    "round": round.round_number,
                    "candidate_counts": round.candidate_counts,
                    "total_active_votes": round.total_active_votes,
                    "majority_required": round.majority_required,
                    "exhausted_votes": round.exhausted_votes,
                    "proof": round.proof,
                    "audit_hash": round.audit_hash,
                }),
            ));
            if let Some(eliminated) = &round.eliminated_candidate {
                events.push((
                    EventType::CandidateEliminated,
                    json!({
                        "round": round.round_number,
                        "candidate_id": eliminated,
                        "reason": round.elimination_reason,
                        "redistributed_votes": round.redistributed_votes,
                    }),
                ));
            }
        }
        events.push((
            EventType::TallyCompleted,
            json!({
                "session_id": self.id,
                "result_id": result.result_id,
                "winner": result.winner_id(),
                "rounds": result.rounds.len(),
                "total_ballots": result.total_ballots,
                "valid_ballots": result.valid_ballots,
                "exhausted_ballots": result.exhausted_ballots,
                "merkle_root": result.merkle_root,
            }),
        ));

        let recorded = self.record(ctx, events);
        self.guard(ctx, "count", recorded)?;

        self.candidates = result.candidates.clone();
        self.set_status(SessionStatus::Completed);
        let result: &TallyResult = self.result.insert(result);
        Ok(result)
    }

    /// The counted result, which only a session restored from a snapshot can be missing
    fn result_ref(&self) -> Result<&TallyResult, Error> {
        self.result.as_ref().ok_or(Error::NoBallots(self.id))
    }

    /// Independently recount and check the result and the audit stream. Any mismatch disputes
    /// the session.
    pub fn verify<S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
    ) -> Result<VerificationReport, Error> {
        self.expect_transition(SessionStatus::Verified)?;
        if self.ballots.is_empty() {
            return Err(Error::NoBallots(self.id));
        }
        let result = self.result_ref()?.clone();

        let report = verify_election_results(&ctx.engine, &self.ballots, &self.candidates, &result);
        if let Some(mismatch) = report.mismatch.clone() {
            let err = Error::ResultMismatch(mismatch);
            return self.guard(ctx, "verify", Err(err));
        }

        let verifier = ctx.audit_verifier()?;
        let stream = ctx.chain.verify_stream(&self.stream_id(), &verifier);
        self.guard(ctx, "audit_chain", stream)?;

        let payload = json!({
            "session_id": self.id,
            "result_id": result.result_id,
            "verified": true,
            "merkle_root": result.merkle_root,
        });
        let recorded = self.record(ctx, vec![(EventType::ResultsVerified, payload)]);
        self.guard(ctx, "verify", recorded)?;

        if let Some(result) = self.result.as_mut() {
            result.status = ResultStatus::Certified;
        }
        self.set_status(SessionStatus::Verified);
        Ok(report)
    }

    /// Publish a verified result to the bulletin board, seal the audit stream and snapshot the
    /// session.
    pub fn publish<S, G, B, V>(
        &mut self,
        ctx: &TallyContext<S, G>,
        board: &B,
        authority: &V,
        digital_signature: String,
        witness_signatures: Vec<WitnessSignature>,
    ) -> Result<PublicationRecord, Error>
    where
        S: EventStore,
        G: AuditSigner,
        B: BulletinBoard + ?Sized,
        V: SignatureVerifier + ?Sized,
    {
        self.expect_transition(SessionStatus::Published)?;
        let result = self.result_ref()?;

        let record = PublicationRecord::new(result, digital_signature, witness_signatures);
        record.verify(result, authority)?;

        ctx.retry
            .run("bulletin board", |_| board.publish_result(record.clone()))?;

        let payload = json!({
            "session_id": self.id,
            "publication": record,
        });
        let recorded = self.record(ctx, vec![(EventType::ResultsPublished, payload)]);
        self.guard(ctx, "publish", recorded)?;

        let stream = self.stream_id();
        let sealed = ctx.chain.seal(&stream);
        self.guard(ctx, "publish", sealed)?;

        if let Some(result) = self.result.as_mut() {
            result.status = ResultStatus::Final;
        }
        self.publication = Some(record.clone());
        self.set_status(SessionStatus::Published);

        let snapshot = Snapshot {
            aggregate_id: stream,
            version: self.version,
            state: serde_json::to_value(&*self)?,
            taken_at: Utc::now(),
        };
        ctx.chain.store().save_snapshot(snapshot)?;

        Ok(record)
    }

    /// Dispute the session by hand, e.g. on an external integrity report
    pub fn dispute<S: EventStore, G: AuditSigner>(
        &mut self,
        ctx: &TallyContext<S, G>,
        step: &str,
        round: Option<u32>,
        reason: &str,
    ) -> Result<(), Error> {
        if self.status.is_terminal() {
            return Err(Error::IllegalTransition {
                from: self.status,
                to: SessionStatus::Disputed,
            });
        }
        self.mark_disputed(ctx, step, round, None, reason.to_owned());
        Ok(())
    }
}
