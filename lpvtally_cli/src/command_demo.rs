use crate::input::{write_fixture, write_output};
use crate::{expand, CliError};
use lpvtally::*;
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;

const CONSTITUENCY: &str = "demo";

/// Cast generated ballots, run a 2-of-3 ceremony, count, verify and publish
pub fn command_demo(matches: &clap::ArgMatches) -> Result<i32, CliError> {
    // Unwrap is OK, there's a default
    let voters: usize = matches
        .value_of("voters")
        .unwrap()
        .parse()
        .map_err(|_| CliError::Format("--voters must be a positive number".to_owned()))?;
    if voters == 0 {
        return Err(CliError::Format("--voters must be a positive number".to_owned()));
    }

    let config = Config::from_env()?;
    let ctx = TallyContext::new(
        AuditChain::new(Arc::new(MemEventStore::new()), config.signer()?),
        &config,
    );
    let authority = Ed25519Signer::generate();
    let board = MemBulletinBoard::new();

    // 3 trustees, any 2 can decrypt. Trustee 3 never shows up.
    let (trustee_1, trustee_1_secret) = Trustee::new();
    let (trustee_2, trustee_2_secret) = Trustee::new();
    let (trustee_3, _) = Trustee::new();
    let trustees = vec![trustee_1, trustee_2, trustee_3];

    let election_key = ElectionKeypair::generate();
    let election_public = election_key.public();
    let dealt = election_key.deal(2, &trustees)?;

    let candidates = vec![
        Candidate::new("A", "Avery"),
        Candidate::new("B", "Blake"),
        Candidate::new("C", "Casey"),
        Candidate::new("D", "Devon"),
    ];
    let mut ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();

    let mut rng = rand::thread_rng();
    let mut ballots = Vec::with_capacity(voters);
    let mut secure_ballots = Vec::with_capacity(voters);
    for i in 0..voters {
        ids.shuffle(&mut rng);
        let ranked = rng.gen_range(1, ids.len() + 1);
        let mut ballot = Ballot::ranked(&format!("voter-{}", i), CONSTITUENCY, &ids[..ranked]);
        ballot.signature = authority.sign_hex(ballot.id.as_bytes());

        let (secure, _) = cast_ballot(
            &ballot,
            &election_public,
            &authority,
            &board,
            &ctx.chain,
            &ctx.retry,
        )?;

        ballots.push(ballot);
        secure_ballots.push(secure);
    }

    let mut session = TallySession::new(
        "demo-election",
        CONSTITUENCY,
        SessionType::Preliminary,
        vec!["returning-officer".into(), "observer".into()],
        candidates.clone(),
    );
    session.initialize(&ctx)?;

    let (tx, rx) = channel();
    for (share, secret) in dealt
        .into_iter()
        .zip(vec![trustee_1_secret, trustee_2_secret])
    {
        // The receiver is still held here, so sending can't fail
        let _ = tx.send(KeyShare::sign(share.trustee_id, share.share, &secret));
    }

    let ceremony = DecryptionCeremony::new(trustees, 2, config.ceremony_timeout)?;
    let decryptor = ShamirDecryptor::new(2, election_public);
    session.run_ceremony(&ctx, &ceremony, &rx, &decryptor, &secure_ballots)?;

    let result = session.complete(&ctx)?.clone();
    let report = session.verify(&ctx)?;
    if !report.verified {
        if let Some(mismatch) = report.mismatch {
            println!("FAILED: {}", mismatch);
        }
        return Ok(255);
    }

    let witness = Ed25519Signer::generate();
    let record = session.publish(
        &ctx,
        &board,
        &authority.public(),
        authority.sign_hex(&result_digest(&result)),
        vec![WitnessSignature::sign("demo-witness", &witness, &result)],
    )?;

    if let Some(dir) = matches.value_of("fixtures") {
        let dir = PathBuf::from(expand(dir));

        // Session stream first, then one stream per cast ballot
        let session_stream = session.stream_id();
        let mut events = ctx.chain.read(&session_stream, 0)?;
        for stream in ctx.chain.store().streams()? {
            if stream != session_stream {
                events.extend(ctx.chain.read(&stream, 0)?);
            }
        }

        write_fixture(&dir, "ballots.json", &ballots)?;
        write_fixture(&dir, "candidates.json", &candidates)?;
        write_fixture(&dir, "result.json", &result)?;
        write_fixture(&dir, "events.json", &events)?;
        std::fs::write(
            dir.join("audit-key.txt"),
            hex::encode(ctx.chain.signer().public_key()),
        )
        .map_err(|e| CliError::IO(e.to_string()))?;
    }

    write_output(&record, None)?;
    Ok(0)
}
