use crate::CliError;
use lpvtally::{AuditSigner, Ed25519Signer};

/// Print a fresh audit keypair. The secret goes in `LPV_SIGNING_KEY`.
pub fn command_keygen(_matches: &clap::ArgMatches) -> Result<i32, CliError> {
    let signer = Ed25519Signer::generate();

    println!("secret-key: {}", signer.secret_hex());
    println!("public-key: {}", hex::encode(signer.public_key()));
    Ok(0)
}
