use crate::input::read_input;
use crate::CliError;
use lpvtally::{public_key_from_hex, verify_events, AuditEvent, EventStore, MemEventStore};

/// Replay every stream in an export from genesis against the audit public key
pub fn command_audit(matches: &clap::ArgMatches) -> Result<i32, CliError> {
    // Unwraps are OK, both are required by clap
    let events: Vec<AuditEvent> = read_input(matches.value_of("EVENTS").unwrap())?;
    let verifier = public_key_from_hex(matches.value_of("public-key").unwrap())?;

    let total = events.len();
    let store = MemEventStore::from(events);
    let streams = store.streams()?;

    let mut failed = 0;
    for stream in &streams {
        let events = store.read(stream, 0)?;
        match verify_events(stream, &events, &verifier) {
            Ok(()) => println!("OK: {} ({} events)", stream, events.len()),
            Err(e) => {
                println!("FAILED: {}", e);
                failed += 1;
            }
        }
    }

    println!(
        "{} events in {} streams, {} failed",
        total,
        streams.len(),
        failed
    );
    Ok(if failed == 0 { 0 } else { 255 })
}
