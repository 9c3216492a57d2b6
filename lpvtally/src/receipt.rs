use crate::*;
use chrono::{DateTime, SecondsFormat, Utc};
use ecies_ed25519::PublicKey as EciesPublicKey;
use indexmap::IndexMap;
use rand::RngCore;
use std::sync::RwLock;
use uuid::Uuid;

/// An encrypted ballot as cast. Only its commitment is ever made public.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SecureBallot {
    pub ballot_id: String,
    pub constituency_id: String,

    #[serde(with = "hex_serde")]
    pub encrypted_payload: Vec<u8>,

    /// H(encrypted_payload)
    pub commitment: String,
}

impl SecureBallot {
    /// Encrypt a ballot to the election public key
    pub fn seal(ballot: &Ballot, election_public: &EciesPublicKey) -> Result<Self, Error> {
        let plaintext = serde_cbor::to_vec(ballot)?;
        let mut csprng = rand::rngs::OsRng {};
        let encrypted_payload = ecies_ed25519::encrypt(election_public, &plaintext, &mut csprng)?;

        Ok(SecureBallot {
            ballot_id: ballot.id.clone(),
            constituency_id: ballot.constituency_id.clone(),
            commitment: sha256_hex(&encrypted_payload),
            encrypted_payload,
        })
    }

    pub fn verify_commitment(&self) -> bool {
        sha256_hex(&self.encrypted_payload) == self.commitment
    }
}

/// H(commitment ‖ receipt_id)
pub fn public_commitment(commitment: &str, receipt_id: &Uuid) -> String {
    HashBuilder::new("lpvtally.public-commitment")
        .field(commitment)
        .field(receipt_id.as_bytes())
        .finish_hex()
}

fn code_hash(verification_code: &str) -> String {
    HashBuilder::new("lpvtally.verification-code")
        .field(verification_code)
        .finish_hex()
}

/// The voter's proof of casting. Issued once and never altered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub ballot_id: String,
    pub constituency_id: String,
    pub commitment: String,
    pub public_commitment: String,

    /// Voter-held secret for looking the ballot up on the bulletin board
    pub verification_code: String,

    pub issued_at: DateTime<Utc>,

    /// Casting authority's signature over everything above
    pub signature: String,
}

impl Receipt {
    fn signing_bytes(&self) -> [u8; 32] {
        HashBuilder::new("lpvtally.receipt")
            .field(self.receipt_id.as_bytes())
            .field(&self.ballot_id)
            .field(&self.constituency_id)
            .field(&self.commitment)
            .field(&self.public_commitment)
            .field(&self.verification_code)
            .field(self.issued_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .finish()
    }
}

/// A public bulletin board record. Holds no plaintext and no verification code.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BulletinEntry {
    pub ballot_id: String,
    pub constituency_id: String,
    pub commitment: String,
    pub public_commitment: String,
    pub code_hash: String,
    pub posted_at: DateTime<Utc>,
}

/// Append-only public ledger of ballot commitments and published results
pub trait BulletinBoard: Send + Sync {
    /// Fails with [`Error::DuplicateBulletinEntry`] if the ballot is already posted
    fn post(&self, entry: BulletinEntry) -> Result<(), Error>;

    fn get(&self, ballot_id: &str) -> Result<Option<BulletinEntry>, Error>;

    /// Look up an entry by the voter's verification code
    fn find_by_code(&self, verification_code: &str) -> Result<Option<BulletinEntry>, Error>;

    fn publish_result(&self, record: PublicationRecord) -> Result<(), Error>;

    fn results(&self, constituency_id: &str) -> Result<Vec<PublicationRecord>, Error>;
}

/// An in-memory bulletin board
#[derive(Default)]
pub struct MemBulletinBoard {
    entries: RwLock<IndexMap<String, BulletinEntry>>,
    results: RwLock<IndexMap<String, PublicationRecord>>,
}

fn unavailable<T>(_: T) -> Error {
    Error::ExternalService("bulletin board unavailable".to_owned())
}

impl MemBulletinBoard {
    pub fn new() -> Self {
        MemBulletinBoard::default()
    }

    /// Every entry, in posting order
    pub fn entries(&self) -> Result<Vec<BulletinEntry>, Error> {
        Ok(self
            .entries
            .read()
            .map_err(unavailable)?
            .values()
            .cloned()
            .collect())
    }
}

impl BulletinBoard for MemBulletinBoard {
    fn post(&self, entry: BulletinEntry) -> Result<(), Error> {
        let mut entries = self.entries.write().map_err(unavailable)?;
        if entries.contains_key(&entry.ballot_id) {
            return Err(Error::DuplicateBulletinEntry(entry.ballot_id));
        }
        entries.insert(entry.ballot_id.clone(), entry);
        Ok(())
    }

    fn get(&self, ballot_id: &str) -> Result<Option<BulletinEntry>, Error> {
        Ok(self
            .entries
            .read()
            .map_err(unavailable)?
            .get(ballot_id)
            .cloned())
    }

    fn find_by_code(&self, verification_code: &str) -> Result<Option<BulletinEntry>, Error> {
        let hash = code_hash(verification_code);
        Ok(self
            .entries
            .read()
            .map_err(unavailable)?
            .values()
            .find(|e| e.code_hash == hash)
            .cloned())
    }

    fn publish_result(&self, record: PublicationRecord) -> Result<(), Error> {
        let mut results = self.results.write().map_err(unavailable)?;
        if results.contains_key(&record.result_id) {
            return Err(Error::DuplicateBulletinEntry(record.result_id));
        }
        results.insert(record.result_id.clone(), record);
        Ok(())
    }

    fn results(&self, constituency_id: &str) -> Result<Vec<PublicationRecord>, Error> {
        Ok(self
            .results
            .read()
            .map_err(unavailable)?
            .values()
            .filter(|r| r.constituency_id == constituency_id)
            .cloned()
            .collect())
    }
}

/// Audit stream holding a ballot's `BallotCast` event
pub fn ballot_stream_id(ballot_id: &str) -> String {
    format!("ballot-{}", ballot_id)
}

/// Encrypt a ballot, post its commitment, record `BallotCast` and issue a signed receipt.
///
/// The audit event carries only the public commitment.
pub fn cast_ballot<G, B, S, A>(
    ballot: &Ballot,
    election_public: &EciesPublicKey,
    authority: &G,
    board: &B,
    audit: &AuditChain<S, A>,
    retry: &RetryPolicy,
) -> Result<(SecureBallot, Receipt), Error>
where
    G: AuditSigner + ?Sized,
    B: BulletinBoard + ?Sized,
    S: EventStore,
    A: AuditSigner,
{
    let secure = SecureBallot::seal(ballot, election_public)?;

    let mut code = [0u8; 8];
    rand::rngs::OsRng {}.fill_bytes(&mut code);

    let receipt_id = Uuid::new_v4();
    let mut receipt = Receipt {
        receipt_id,
        ballot_id: ballot.id.clone(),
        constituency_id: ballot.constituency_id.clone(),
        commitment: secure.commitment.clone(),
        public_commitment: public_commitment(&secure.commitment, &receipt_id),
        verification_code: hex::encode(code),
        issued_at: Utc::now(),
        signature: String::new(),
    };
    receipt.signature = authority.sign_hex(&receipt.signing_bytes());

    board.post(BulletinEntry {
        ballot_id: receipt.ballot_id.clone(),
        constituency_id: receipt.constituency_id.clone(),
        commitment: receipt.commitment.clone(),
        public_commitment: receipt.public_commitment.clone(),
        code_hash: code_hash(&receipt.verification_code),
        posted_at: receipt.issued_at,
    })?;

    audit.append_with_retry(
        &ballot_stream_id(&receipt.ballot_id),
        vec![(
            EventType::BallotCast,
            serde_json::json!({ "public_commitment": receipt.public_commitment }),
        )],
        retry,
    )?;

    Ok((secure, receipt))
}

/// Check a receipt's signature, its commitments, and that the board holds the same entry
pub fn verify_receipt<V: SignatureVerifier + ?Sized, B: BulletinBoard + ?Sized>(
    receipt: &Receipt,
    authority: &V,
    board: &B,
) -> Result<(), Error> {
    if !authority.verify_hex(&receipt.signing_bytes(), &receipt.signature) {
        return Err(ReceiptError::Signature.into());
    }

    if public_commitment(&receipt.commitment, &receipt.receipt_id) != receipt.public_commitment {
        return Err(ReceiptError::PublicCommitment.into());
    }

    let entry = board
        .get(&receipt.ballot_id)?
        .ok_or_else(|| ReceiptError::NotOnBoard(receipt.ballot_id.clone()))?;

    if entry.commitment != receipt.commitment
        || entry.public_commitment != receipt.public_commitment
        || entry.code_hash != code_hash(&receipt.verification_code)
    {
        return Err(ReceiptError::BoardMismatch(receipt.ballot_id.clone()).into());
    }

    Ok(())
}
