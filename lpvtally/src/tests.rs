use super::*;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn end_to_end_tally() {
    log4rs_test_utils::test_logging::init_logging_once_for(["lpvtally"], None, None);

    // Casting authority, audit signer and the bulletin board
    let authority = Ed25519Signer::generate();
    let board = MemBulletinBoard::new();
    let config = Config {
        backoff_base: Duration::from_millis(0),
        ..Config::default()
    };
    let chain = AuditChain::new(Arc::new(MemEventStore::new()), config.signer().unwrap());
    let ctx = TallyContext::new(chain, &config);

    // Create 3 trustees, any 2 of whom can decrypt
    let (trustee_1, trustee_1_secret) = Trustee::new();
    let (trustee_2, trustee_2_secret) = Trustee::new();
    let (trustee_3, _) = Trustee::new();
    let trustees = vec![trustee_1.clone(), trustee_2.clone(), trustee_3];

    // Election key is dealt to the trustees and the secret half is dropped
    let election_key = ElectionKeypair::generate();
    let election_public = election_key.public();
    let mut dealt = election_key.deal(2, &trustees).unwrap();
    dealt.truncate(2);

    let candidates = vec![
        Candidate::new("A", "Avery"),
        Candidate::new("B", "Blake"),
        Candidate::new("C", "Casey"),
    ];

    // Voters cast: A:40, B:35, C:25 first preferences
    let rankings: [(usize, &[&str]); 5] = [
        (30, &["A", "B", "C"]),
        (10, &["A", "C"]),
        (35, &["B", "A"]),
        (15, &["C", "A", "B"]),
        (10, &["C", "B"]),
    ];
    let mut secure_ballots = Vec::new();
    let mut receipts = Vec::new();
    for (n, ranking) in rankings.iter() {
        for _ in 0..*n {
            let ballot = Ballot::ranked(&format!("v{}", receipts.len()), "north", ranking);
            let (secure, receipt) = cast_ballot(
                &ballot,
                &election_public,
                &authority,
                &board,
                &ctx.chain,
                &ctx.retry,
            )
            .unwrap();

            secure_ballots.push(secure);
            receipts.push(receipt);
        }
    }

    // Any voter can check their receipt against the board
    verify_receipt(&receipts[17], &authority.public(), &board).unwrap();
    let cast_events = ctx
        .chain
        .read(&ballot_stream_id(&receipts[17].ballot_id), 0)
        .unwrap();
    assert_eq!(cast_events.len(), 1);
    assert_eq!(cast_events[0].event_type, EventType::BallotCast);

    // Open the session with two authorizers
    let mut session = TallySession::new(
        "general-2026",
        "north",
        SessionType::Official,
        vec!["returning-officer".into(), "party-agent".into()],
        candidates,
    );
    session.initialize(&ctx).unwrap();

    // Trustees hand in their shares from their own threads
    let (tx, rx) = channel();
    let secrets = vec![trustee_1_secret, trustee_2_secret];
    let senders: Vec<_> = dealt
        .into_iter()
        .zip(secrets.into_iter())
        .map(|(share, secret)| {
            let tx = tx.clone();
            thread::spawn(move || {
                tx.send(KeyShare::sign(share.trustee_id, share.share, &secret))
                    .unwrap();
            })
        })
        .collect();

    let ceremony = DecryptionCeremony::new(trustees, 2, config.ceremony_timeout).unwrap();
    let decryptor = ShamirDecryptor::new(2, election_public);
    let decrypted = session
        .run_ceremony(&ctx, &ceremony, &rx, &decryptor, &secure_ballots)
        .unwrap();
    assert_eq!(decrypted, 100);
    for sender in senders {
        sender.join().unwrap();
    }

    // C is eliminated first; their ballots split 15 to A and 10 to B
    let result = session.complete(&ctx).unwrap().clone();
    assert_eq!(result.elimination_order(), vec!["C"]);
    assert_eq!(result.winner_id(), Some("A"));
    assert_eq!(result.final_tally["A"], 55);
    assert_eq!(result.final_tally["B"], 45);
    assert!(result.mathematically_verified);

    // Independent recount
    assert!(session.verify(&ctx).unwrap().verified);

    // Publish with the authority's signature and one witness
    let digest = result_digest(&result);
    let witness = Ed25519Signer::generate();
    let record = session
        .publish(
            &ctx,
            &board,
            &authority.public(),
            authority.sign_hex(&digest),
            vec![WitnessSignature::sign("observer-1", &witness, &result)],
        )
        .unwrap();
    assert_eq!(record.result_id, result.result_id);
    assert_eq!(session.status, SessionStatus::Published);

    // An outside auditor replays the exported stream against the published audit key
    let exported = serde_json::to_vec(&ctx.chain.read(&session.stream_id(), 0).unwrap()).unwrap();
    let events: Vec<AuditEvent> = serde_json::from_slice(&exported).unwrap();
    let audit_key = public_key_from_hex(&hex::encode(ctx.chain.signer().public_key())).unwrap();
    verify_events(&session.stream_id(), &events, &audit_key).unwrap();

    // The published root is recomputable from the rounds alone
    assert_eq!(merkle_root(&result.rounds), record.merkle_root);

    // Nothing more can be appended once published
    let err = ctx
        .chain
        .append(
            &session.stream_id(),
            session.version,
            vec![(EventType::SessionDisputed, serde_json::json!({}))],
        )
        .unwrap_err();
    assert!(matches!(err, Error::StreamSealed(_)));
}

#[test]
fn parallel_sessions_share_one_store() {
    let store = Arc::new(MemEventStore::new());
    let signer_key = Ed25519Signer::generate().secret_hex();

    let handles: Vec<_> = ["north", "south", "east", "west"]
        .iter()
        .map(|constituency| {
            let store = store.clone();
            let key = signer_key.clone();
            let constituency = constituency.to_string();
            thread::spawn(move || {
                let signer = Ed25519Signer::from_secret_hex(&key).unwrap();
                let config = Config::default();
                let ctx = TallyContext::new(AuditChain::new(store, signer), &config);

                let candidates = vec![Candidate::new("X", "X"), Candidate::new("Y", "Y")];
                let ballots: Vec<Ballot> = (0..21)
                    .map(|i| {
                        let choice = if i % 3 == 0 { "Y" } else { "X" };
                        Ballot::ranked(&format!("{}-{}", constituency, i), &constituency, &[choice])
                    })
                    .collect();

                let mut session = TallySession::new(
                    "general-2026",
                    &constituency,
                    SessionType::Preliminary,
                    vec!["a".into(), "b".into()],
                    candidates,
                );
                session.initialize(&ctx).unwrap();
                session.accept_ballots(&ctx, ballots).unwrap();
                let winner = session.complete(&ctx).unwrap().winner_id().map(str::to_owned);
                session.verify(&ctx).unwrap();
                (session.stream_id(), winner)
            })
        })
        .collect();

    let verifier = Ed25519Signer::from_secret_hex(&signer_key).unwrap().public();
    for handle in handles {
        let (stream, winner) = handle.join().unwrap();
        assert_eq!(winner.as_deref(), Some("X"));
        let events = store.read(&stream, 0).unwrap();
        verify_events(&stream, &events, &verifier).unwrap();
    }
    assert_eq!(store.streams().unwrap().len(), 4);
}
