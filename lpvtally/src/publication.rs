use crate::*;
use ed25519_dalek::PublicKey;
use std::collections::HashSet;

/// Digest of a result that the authority and every witness sign
pub fn result_digest(result: &TallyResult) -> [u8; 32] {
    HashBuilder::new("lpvtally.result")
        .field(&result.result_id)
        .field(&result.constituency_id)
        .field(&result.merkle_root)
        .optional(result.winner_id())
        .number(result.rounds.len() as u64)
        .number(result.total_ballots)
        .number(result.valid_ballots)
        .number(result.exhausted_ballots)
        .finish()
}

/// An independent observer's signature over a result
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WitnessSignature {
    pub witness_id: String,

    #[serde(with = "EdPublicKeyHex")]
    pub public_key: PublicKey,

    pub signature: String,
}

impl WitnessSignature {
    pub fn sign(witness_id: &str, signer: &Ed25519Signer, result: &TallyResult) -> Self {
        WitnessSignature {
            witness_id: witness_id.to_owned(),
            public_key: signer.public(),
            signature: signer.sign_hex(&result_digest(result)),
        }
    }

    pub fn verify(&self, digest: &[u8]) -> bool {
        self.public_key.verify_hex(digest, &self.signature)
    }
}

/// What goes to the bulletin board. Contains no secrets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicationRecord {
    pub result_id: String,
    pub constituency_id: String,
    pub merkle_root: String,

    /// Hex of [`result_digest`]
    pub public_commitment: String,

    /// Authority signature over the result digest
    pub digital_signature: String,
    pub witness_signatures: Vec<WitnessSignature>,
}

impl PublicationRecord {
    pub fn new(
        result: &TallyResult,
        digital_signature: String,
        witness_signatures: Vec<WitnessSignature>,
    ) -> Self {
        PublicationRecord {
            result_id: result.result_id.clone(),
            constituency_id: result.constituency_id.clone(),
            merkle_root: result.merkle_root.clone(),
            public_commitment: hex::encode(result_digest(result)),
            digital_signature,
            witness_signatures,
        }
    }

    /// Check the record describes `result` and carries a valid authority signature and at
    /// least one valid witness signature
    pub fn verify<V: SignatureVerifier + ?Sized>(
        &self,
        result: &TallyResult,
        authority: &V,
    ) -> Result<(), Error> {
        let invalid = |reason: String| -> Result<(), Error> { Err(Error::InvalidPublication(reason)) };

        if self.result_id != result.result_id
            || self.constituency_id != result.constituency_id
            || self.merkle_root != result.merkle_root
        {
            return invalid("record does not describe this result".to_owned());
        }

        let digest = result_digest(result);
        if self.public_commitment != hex::encode(digest) {
            return invalid("public commitment does not match result".to_owned());
        }

        if !authority.verify_hex(&digest, &self.digital_signature) {
            return invalid("authority signature does not verify".to_owned());
        }

        if self.witness_signatures.is_empty() {
            return invalid("no witness signatures".to_owned());
        }

        let mut seen = HashSet::new();
        for witness in &self.witness_signatures {
            if !seen.insert(witness.witness_id.as_str()) {
                return invalid(format!("witness {} signed twice", witness.witness_id));
            }
            if !witness.verify(&digest) {
                return invalid(format!(
                    "witness {} signature does not verify",
                    witness.witness_id
                ));
            }
        }

        Ok(())
    }
}
