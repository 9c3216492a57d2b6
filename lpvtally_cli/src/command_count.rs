use crate::input::{read_input, write_output};
use crate::CliError;
use lpvtally::{Ballot, Candidate, Config, Error};
use log::info;

pub fn command_count(matches: &clap::ArgMatches) -> Result<i32, CliError> {
    // Unwraps are OK, all three are required by clap
    let ballots: Vec<Ballot> = read_input(matches.value_of("BALLOTS").unwrap())?;
    let candidates: Vec<Candidate> = read_input(matches.value_of("CANDIDATES").unwrap())?;
    let constituency = matches.value_of("constituency").unwrap();

    let engine = Config::from_env()?.engine();
    let result = match engine.count(constituency, &ballots, &candidates) {
        Ok(result) => result,
        Err(Error::InvalidBallots(rejections)) => {
            for rejection in &rejections {
                eprintln!("rejected ballot {}: {}", rejection.ballot_id, rejection.reason);
            }
            return Err(CliError::Tally(Error::InvalidBallots(rejections)));
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        "{}: counted {} ballots in {} rounds",
        constituency,
        result.total_ballots,
        result.rounds.len()
    );

    write_output(&result, matches.value_of("output"))?;
    Ok(0)
}
