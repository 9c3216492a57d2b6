// Hex adapters for use in `#[serde(with = "...")]`. Byte buffers use `hex_serde` directly.
use ed25519_dalek::PublicKey;
use ed25519_dalek::Signature;
use std::borrow::Cow;
use std::convert::TryFrom;

pub use hex_buffer_serde::Hex;

// a single-purpose type for use in `#[serde(with)]`
pub enum EdPublicKeyHex {}

impl Hex<PublicKey> for EdPublicKeyHex {
    type Error = String;

    fn create_bytes(public_key: &PublicKey) -> Cow<[u8]> {
        public_key.as_ref().into()
    }

    fn from_bytes(bytes: &[u8]) -> Result<PublicKey, String> {
        PublicKey::from_bytes(bytes).map_err(|e| format!("{}", e))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum EdSignatureHex {}

impl Hex<Signature> for EdSignatureHex {
    type Error = String;

    fn create_bytes(sig: &Signature) -> Cow<[u8]> {
        Cow::from(sig.to_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Signature, String> {
        Signature::try_from(bytes).map_err(|e| format!("{}", e))
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use ed25519_dalek::Signer;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "hex_serde")]
        bytes: Vec<u8>,
        #[serde(with = "EdPublicKeyHex")]
        key: ed25519_dalek::PublicKey,
        #[serde(with = "EdSignatureHex")]
        sig: ed25519_dalek::Signature,
    }

    #[test]
    fn hex_fields_survive_json() {
        let (secret, public) = generate_keypair();
        let keypair = ed25519_dalek::Keypair { secret, public };
        let sig = keypair.sign(b"ballot");

        let holder = Holder {
            bytes: vec![0xde, 0xad],
            key: public,
            sig,
        };
        let json = serde_json::to_string(&holder).unwrap();
        assert!(json.contains("\"dead\""));

        let back: Holder = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes, holder.bytes);
        assert_eq!(back.key, public);
        assert_eq!(back.sig, sig);
    }

    #[test]
    fn bad_hex_rejected() {
        let json = r#"{"bytes":"zz","key":"00","sig":"00"}"#;
        assert!(serde_json::from_str::<Holder>(json).is_err());
    }
}
