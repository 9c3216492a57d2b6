use crate::input::read_input;
use crate::CliError;
use lpvtally::{verify_election_results, Ballot, Candidate, Config, TallyResult};

/// Recount and compare. Exits 255 on the first mismatch.
pub fn command_verify(matches: &clap::ArgMatches) -> Result<i32, CliError> {
    // Unwraps are OK, all three are required by clap
    let ballots: Vec<Ballot> = read_input(matches.value_of("BALLOTS").unwrap())?;
    let candidates: Vec<Candidate> = read_input(matches.value_of("CANDIDATES").unwrap())?;
    let result: TallyResult = read_input(matches.value_of("RESULT").unwrap())?;

    let engine = Config::from_env()?.engine();
    let report = verify_election_results(&engine, &ballots, &candidates, &result);

    match report.mismatch {
        None => {
            println!(
                "OK: result {} verified over {} rounds",
                result.result_id,
                result.rounds.len()
            );
            Ok(0)
        }
        Some(mismatch) => {
            println!("FAILED: {}", mismatch);
            Ok(255)
        }
    }
}
