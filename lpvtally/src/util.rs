use digest::Digest;
use ed25519_dalek::Keypair;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use sha2::Sha256;

/// Hash used as the `previous_hash` of the first event in a stream
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let mut csprng = rand::rngs::OsRng {};
    let Keypair { public, secret } = Keypair::generate(&mut csprng);
    (secret, public)
}

/// Hex-encoded SHA-256 of a byte string
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Incremental, domain-separated SHA-256 over a sequence of fields.
///
/// Every field is length-prefixed, so `("ab", "c")` and `("a", "bc")` hash differently.
pub struct HashBuilder {
    hasher: Sha256,
}

impl HashBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = HashBuilder {
            hasher: Sha256::new(),
        };
        builder.push(domain.as_bytes());
        builder
    }

    fn push(&mut self, bytes: &[u8]) {
        self.hasher.update(&(bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
    }

    pub fn field<T: AsRef<[u8]>>(mut self, bytes: T) -> Self {
        self.push(bytes.as_ref());
        self
    }

    pub fn number(mut self, n: u64) -> Self {
        self.push(&n.to_be_bytes());
        self
    }

    /// Optional fields hash a presence marker so `None` and `Some("")` differ
    pub fn optional<T: AsRef<[u8]>>(mut self, value: Option<T>) -> Self {
        match value {
            Some(v) => {
                self.push(&[1]);
                self.push(v.as_ref());
            }
            None => self.push(&[0]),
        }
        self
    }

    pub fn finish(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.hasher.finalize());
        out
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.finish())
    }
}
