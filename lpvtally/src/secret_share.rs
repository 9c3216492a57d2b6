use crate::*;
use ecies_ed25519::PublicKey as EciesPublicKey;
use ecies_ed25519::SecretKey as EciesSecretKey;
use ed25519_dalek::ExpandedSecretKey;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use ed25519_dalek::Signature;
use ed25519_dalek::Verifier;
use sharks::{Share, Sharks};
use std::convert::TryFrom;
use uuid::Uuid;

/// A key-holder taking part in the decryption ceremony
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Trustee {
    pub id: Uuid,

    #[serde(with = "EdPublicKeyHex")]
    pub public_key: PublicKey,
}

impl Trustee {
    pub fn new() -> (Self, SecretKey) {
        let (secret, public) = generate_keypair();

        let trustee = Trustee {
            id: Uuid::new_v4(),
            public_key: public,
        };
        (trustee, secret)
    }
}

pub fn deal_secret_shares(
    threshold: u8,
    num_trustees: usize,
    secret: &[u8],
) -> Result<Vec<Vec<u8>>, Error> {
    if threshold == 0 || num_trustees < threshold as usize || num_trustees > 255 {
        return Err(Error::InvalidThreshold {
            threshold,
            trustees: num_trustees,
        });
    }

    let sharks = Sharks(threshold);
    let dealer = sharks.dealer(secret);

    let mut all_shares = Vec::with_capacity(num_trustees);
    for s in dealer.take(num_trustees) {
        all_shares.push(Vec::from(&s));
    }

    Ok(all_shares)
}

pub fn recover_secret_shares(threshold: u8, shares: &[Vec<u8>]) -> Result<Vec<u8>, Error> {
    let shares: Vec<Share> = shares
        .iter()
        .map(|s| Share::try_from(s.as_slice()))
        .collect::<Result<_, _>>()
        .map_err(|e| Error::InvalidKeyShare(e.to_string()))?;

    let sharks = Sharks(threshold);

    let secret = sharks
        .recover(&shares)
        .map_err(|_| Error::SecretRecoveryFailed)?;

    Ok(secret)
}

/// A trustee's signed submission to the decryption ceremony
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyShare {
    pub trustee_id: Uuid,

    #[serde(with = "hex_serde")]
    pub share: Vec<u8>,

    #[serde(with = "EdSignatureHex")]
    pub signature: Signature,
}

impl KeyShare {
    fn signing_bytes(trustee_id: &Uuid, share: &[u8]) -> [u8; 32] {
        HashBuilder::new("lpvtally.key-share")
            .field(trustee_id.as_bytes())
            .field(share)
            .finish()
    }

    /// Sign `share` as trustee `trustee_id`
    pub fn sign(trustee_id: Uuid, share: Vec<u8>, secret: &SecretKey) -> Self {
        let public = PublicKey::from(secret);
        let expanded: ExpandedSecretKey = secret.into();
        let signature = expanded.sign(&KeyShare::signing_bytes(&trustee_id, &share), &public);

        KeyShare {
            trustee_id,
            share,
            signature,
        }
    }

    pub fn verify(&self, trustee: &Trustee) -> bool {
        self.trustee_id == trustee.id
            && trustee
                .public_key
                .verify(
                    &KeyShare::signing_bytes(&self.trustee_id, &self.share),
                    &self.signature,
                )
                .is_ok()
    }
}

/// The election's ECIES keypair. Ballots are encrypted to its public key, and its secret is
/// split among the trustees and then dropped.
pub struct ElectionKeypair {
    secret: EciesSecretKey,
    public: EciesPublicKey,
}

/// One trustee's portion of the election secret, before signing
#[derive(Debug, Clone)]
pub struct DealtShare {
    pub trustee_id: Uuid,
    pub share: Vec<u8>,
}

impl ElectionKeypair {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng {};
        let (secret, public) = ecies_ed25519::generate_keypair(&mut csprng);
        ElectionKeypair { secret, public }
    }

    pub fn public(&self) -> EciesPublicKey {
        self.public
    }

    /// Split the secret `threshold`-of-n across `trustees`, consuming the keypair
    pub fn deal(self, threshold: u8, trustees: &[Trustee]) -> Result<Vec<DealtShare>, Error> {
        let shares = deal_secret_shares(threshold, trustees.len(), self.secret.as_bytes())?;
        Ok(trustees
            .iter()
            .zip(shares.into_iter())
            .map(|(t, share)| DealtShare {
                trustee_id: t.id,
                share,
            })
            .collect())
    }
}

/// Rebuilds a decryption capability from trustee shares
pub trait ThresholdDecryptor {
    fn threshold(&self) -> u8;

    fn reconstruct(&self, shares: &[KeyShare]) -> Result<DecryptionCapability, Error>;
}

/// Shamir reconstruction of an ECIES secret key
#[derive(Debug, Clone)]
pub struct ShamirDecryptor {
    threshold: u8,
    election_public: EciesPublicKey,
}

impl ShamirDecryptor {
    pub fn new(threshold: u8, election_public: EciesPublicKey) -> Self {
        ShamirDecryptor {
            threshold,
            election_public,
        }
    }
}

impl ThresholdDecryptor for ShamirDecryptor {
    fn threshold(&self) -> u8 {
        self.threshold
    }

    fn reconstruct(&self, shares: &[KeyShare]) -> Result<DecryptionCapability, Error> {
        if shares.len() < self.threshold as usize {
            return Err(Error::SecretRecoveryFailed);
        }

        let raw: Vec<Vec<u8>> = shares.iter().map(|s| s.share.clone()).collect();
        let secret = recover_secret_shares(self.threshold, &raw)?;
        let secret =
            EciesSecretKey::from_bytes(&secret).map_err(|_| Error::SecretRecoveryFailed)?;

        // Shares that combine to the wrong key are indistinguishable from corrupt ones
        if EciesPublicKey::from_secret(&secret).as_bytes() != self.election_public.as_bytes() {
            return Err(Error::SecretRecoveryFailed);
        }

        Ok(DecryptionCapability { secret })
    }
}

/// Reconstructed election secret. Lives only in memory for the length of a tally.
pub struct DecryptionCapability {
    secret: EciesSecretKey,
}

impl DecryptionCapability {
    pub fn decrypt(&self, ballot: &SecureBallot) -> Result<Ballot, Error> {
        if !ballot.verify_commitment() {
            return Err(ReceiptError::Commitment.into());
        }

        let plaintext = ecies_ed25519::decrypt(&self.secret, &ballot.encrypted_payload)?;
        let decrypted: Ballot = serde_cbor::from_slice(&plaintext)?;

        if decrypted.id != ballot.ballot_id || decrypted.constituency_id != ballot.constituency_id {
            return Err(ReceiptError::Commitment.into());
        }
        Ok(decrypted)
    }

    pub fn decrypt_all(&self, ballots: &[SecureBallot]) -> Result<Vec<Ballot>, Error> {
        ballots.iter().map(|b| self.decrypt(b)).collect()
    }
}

impl std::fmt::Debug for DecryptionCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("DecryptionCapability(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trustees(n: usize) -> Vec<(Trustee, SecretKey)> {
        (0..n).map(|_| Trustee::new()).collect()
    }

    fn signed_shares(
        keypair: ElectionKeypair,
        threshold: u8,
        trustees: &[(Trustee, SecretKey)],
    ) -> Vec<KeyShare> {
        let public: Vec<Trustee> = trustees.iter().map(|(t, _)| t.clone()).collect();
        keypair
            .deal(threshold, &public)
            .unwrap()
            .into_iter()
            .zip(trustees.iter())
            .map(|(dealt, (t, secret))| KeyShare::sign(t.id, dealt.share, secret))
            .collect()
    }

    #[test]
    fn shamir_round_trip() {
        let secret = b"election secret key bytes 32 len";
        let shares = deal_secret_shares(3, 5, secret).unwrap();
        assert_eq!(shares.len(), 5);

        let recovered = recover_secret_shares(3, &shares[1..4]).unwrap();
        assert_eq!(recovered, secret.to_vec());

        assert!(recover_secret_shares(3, &shares[0..2]).is_err());
    }

    #[test]
    fn bad_thresholds_rejected() {
        assert!(matches!(
            deal_secret_shares(4, 3, b"s"),
            Err(Error::InvalidThreshold { .. })
        ));
        assert!(matches!(
            deal_secret_shares(0, 3, b"s"),
            Err(Error::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn key_share_signatures() {
        let (trustee, secret) = Trustee::new();
        let (other, _) = Trustee::new();
        let share = KeyShare::sign(trustee.id, vec![1, 2, 3], &secret);
        assert!(share.verify(&trustee));
        assert!(!share.verify(&other));

        // Submitted over the wire as hex
        let json = serde_json::to_string(&share).unwrap();
        assert!(json.contains(&hex::encode(share.signature.to_bytes().as_ref())));
        let received: KeyShare = serde_json::from_str(&json).unwrap();
        assert!(received.verify(&trustee));

        let mut tampered = share.clone();
        tampered.share[0] = 9;
        assert!(!tampered.verify(&trustee));
    }

    #[test]
    fn threshold_reconstructs_decryption() {
        let holders = trustees(3);
        let keypair = ElectionKeypair::generate();
        let public = keypair.public();

        let ballot = Ballot::ranked("b-1", "north", &["A", "B"]);
        let secure = SecureBallot::seal(&ballot, &public).unwrap();

        let shares = signed_shares(keypair, 2, &holders);
        let decryptor = ShamirDecryptor::new(2, public);

        let capability = decryptor.reconstruct(&shares[1..]).unwrap();
        assert_eq!(capability.decrypt(&secure).unwrap(), ballot);

        // One share alone reveals nothing
        assert!(decryptor.reconstruct(&shares[..1]).is_err());
    }

    #[test]
    fn shares_for_another_key_are_rejected() {
        let holders = trustees(2);
        let shares = signed_shares(ElectionKeypair::generate(), 2, &holders);
        let decryptor = ShamirDecryptor::new(2, ElectionKeypair::generate().public());
        assert!(matches!(
            decryptor.reconstruct(&shares),
            Err(Error::SecretRecoveryFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_commitment() {
        let holders = trustees(2);
        let keypair = ElectionKeypair::generate();
        let public = keypair.public();
        let mut secure =
            SecureBallot::seal(&Ballot::ranked("b-1", "north", &["A"]), &public).unwrap();
        secure.encrypted_payload[40] ^= 1;

        let capability = ShamirDecryptor::new(2, public)
            .reconstruct(&signed_shares(keypair, 2, &holders))
            .unwrap();
        assert!(matches!(
            capability.decrypt(&secure),
            Err(Error::Receipt(ReceiptError::Commitment))
        ));
    }
}
