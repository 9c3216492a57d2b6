use crate::*;
use thiserror::Error;

/// How an error must be handled by the caller
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Aborts the operation and disputes the session. Never retried.
    Fatal,
    /// May be retried (re-read and retry, retry the ceremony, or back off).
    Retryable,
    /// Input was rejected before any work was done.
    Validation,
}

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("lpvtally: signature error: {0}")]
    SignatureError(#[from] ed25519_dalek::SignatureError),

    #[error("lpvtally: ecies error: {0}")]
    EciesError(#[from] ecies_ed25519::Error),

    #[error("lpvtally: CBOR error: {0}")]
    CBORSerialization(#[from] serde_cbor::Error),

    #[error("lpvtally: JSON error: {0}")]
    JSONSerialization(#[from] serde_json::Error),

    #[error("lpvtally: invalid hexidecimal: {0}")]
    BadHex(#[from] hex::FromHexError),

    #[error("lpvtally: configuration error: {0}")]
    Config(String),

    #[error("lpvtally: no candidates to count")]
    NoCandidates,

    #[error("lpvtally: candidate {0} is listed more than once")]
    DuplicateCandidate(String),

    #[error("lpvtally: refusing to count: {} malformed ballot(s), first: {}", .0.len(), first_rejection(.0))]
    InvalidBallots(Vec<BallotRejection>),

    #[error("lpvtally: mathematical verification failed in round {round}: {reason}")]
    MathematicalVerification { round: u32, reason: String },

    #[error("lpvtally: round limit of {0} exceeded, candidate or ballot data is malformed")]
    RoundLimitExceeded(u32),

    #[error("lpvtally: audit chain integrity failure: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("lpvtally: result verification failed: {0}")]
    ResultMismatch(Mismatch),

    #[error("lpvtally: illegal session transition from {from} to {to}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("lpvtally: stream {0} is sealed")]
    StreamSealed(String),

    #[error("lpvtally: event store failure: {0}")]
    Storage(String),

    #[error("lpvtally: insufficient authorization: need {required} distinct authorizers, found {found}")]
    InsufficientAuthorization { required: usize, found: usize },

    #[error("lpvtally: publication rejected: {0}")]
    InvalidPublication(String),

    #[error("lpvtally: concurrency conflict on stream {stream}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        stream: String,
        expected: u64,
        actual: u64,
    },

    #[error("lpvtally: decryption ceremony timed out with {collected} of {required} shares")]
    CeremonyTimeout { collected: usize, required: usize },

    #[error("lpvtally: external service failure: {0}")]
    ExternalService(String),

    #[error("lpvtally: key share rejected: {0}")]
    InvalidKeyShare(String),

    #[error("lpvtally: secret recovery failed")]
    SecretRecoveryFailed,

    #[error("lpvtally: invalid threshold {threshold} for {trustees} trustees")]
    InvalidThreshold { threshold: u8, trustees: usize },

    #[error("lpvtally: ballot {0} is already on the bulletin board")]
    DuplicateBulletinEntry(String),

    #[error("lpvtally: receipt invalid: {0}")]
    Receipt(#[from] ReceiptError),

    #[error("lpvtally: no decrypted ballots loaded in session {0}")]
    NoBallots(uuid::Uuid),
}

fn first_rejection(rejections: &[BallotRejection]) -> String {
    rejections
        .first()
        .map(|r| r.to_string())
        .unwrap_or_default()
}

impl Error {
    /// Classify this error according to how it must be handled
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ConcurrencyConflict { .. }
            | Error::CeremonyTimeout { .. }
            | Error::ExternalService(_) => ErrorClass::Retryable,

            Error::MathematicalVerification { .. }
            | Error::RoundLimitExceeded(_)
            | Error::Integrity(_)
            | Error::ResultMismatch(_)
            | Error::IllegalTransition { .. }
            | Error::StreamSealed(_)
            | Error::Storage(_) => ErrorClass::Fatal,

            _ => ErrorClass::Validation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

/// Ballot validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("ballot has no preferences")]
    EmptyBallot,

    #[error("rank {0} is outside 1..={}", MAX_RANK)]
    RankOutOfRange(u8),

    #[error("rank {0} is used more than once")]
    DuplicateRank(u8),

    #[error("candidate {0} is ranked more than once")]
    RepeatedCandidate(String),

    #[error("unknown candidate {0}")]
    UnknownCandidate(String),

    #[error("ballot belongs to constituency {found}, expected {expected}")]
    ConstituencyMismatch { expected: String, found: String },

    #[error("ballot id is not unique")]
    DuplicateBallotId,
}

/// A single rejected ballot
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("ballot {ballot_id}: {reason}")]
pub struct BallotRejection {
    pub ballot_id: String,
    pub reason: ValidationError,
}

/// What was wrong with an audit event
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum IntegrityFailure {
    #[error("previous hash does not link to the prior event")]
    BrokenLink,

    #[error("audit hash does not match event content")]
    HashMismatch,

    #[error("signature does not verify")]
    BadSignature,

    #[error("expected version {expected}, found {found}")]
    VersionGap { expected: u64, found: u64 },

    #[error("event belongs to aggregate {0}")]
    WrongAggregate(String),
}

/// An audit event that failed verification
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("stream {stream} version {version}: {failure}")]
pub struct IntegrityError {
    pub stream: String,
    pub version: u64,
    pub failure: IntegrityFailure,
}

/// Receipt verification errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiptError {
    #[error("receipt signature does not verify")]
    Signature,

    #[error("public commitment does not match commitment and receipt id")]
    PublicCommitment,

    #[error("ballot {0} is not on the bulletin board")]
    NotOnBoard(String),

    #[error("bulletin board entry for ballot {0} does not match the receipt")]
    BoardMismatch(String),

    #[error("encrypted ballot does not match its commitment")]
    Commitment,
}
