use crate::*;
use ed25519_dalek::ExpandedSecretKey;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use ed25519_dalek::Signature;
use std::convert::TryFrom;

/// Signs audit hashes, receipts and publication digests
pub trait AuditSigner: Send + Sync {
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Raw public key bytes, so verifiers can be built from the published key
    fn public_key(&self) -> Vec<u8>;

    fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.sign(message))
    }
}

/// Checks signatures produced by an [`AuditSigner`]
pub trait SignatureVerifier {
    fn verify_bytes(&self, message: &[u8], signature: &[u8]) -> bool;

    fn verify_hex(&self, message: &[u8], signature: &str) -> bool {
        match hex::decode(signature) {
            Ok(sig) => self.verify_bytes(message, &sig),
            Err(_) => false,
        }
    }
}

impl SignatureVerifier for PublicKey {
    fn verify_bytes(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::try_from(signature) {
            Ok(sig) => ed25519_dalek::Verifier::verify(self, message, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// ed25519 signer holding a secret key
pub struct Ed25519Signer {
    secret: SecretKey,
    public: PublicKey,
}

impl Ed25519Signer {
    pub fn new(secret: SecretKey) -> Self {
        let public = PublicKey::from(&secret);
        Ed25519Signer { secret, public }
    }

    /// A fresh, ephemeral signing key
    pub fn generate() -> Self {
        let (secret, _) = generate_keypair();
        Ed25519Signer::new(secret)
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self, Error> {
        let bytes = hex::decode(secret.trim())?;
        let secret = SecretKey::from_bytes(&bytes)?;
        Ok(Ed25519Signer::new(secret))
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.as_bytes())
    }
}

impl AuditSigner for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> Vec<u8> {
        let expanded: ExpandedSecretKey = (&self.secret).into();
        expanded.sign(message, &self.public).to_bytes().to_vec()
    }

    fn public_key(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Ed25519Signer({})", hex::encode(self.public.as_bytes()))
    }
}

/// Parse a hex-encoded ed25519 public key
pub fn public_key_from_hex(public: &str) -> Result<PublicKey, Error> {
    let bytes = hex::decode(public.trim())?;
    Ok(PublicKey::from_bytes(&bytes)?)
}
