use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::LevelFilter;
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;
use std::fmt;

mod command_audit;
mod command_count;
mod command_demo;
mod command_keygen;
mod command_verify;
mod input;

const PROGRAM_NAME: &str = "lpvtally";

const ABOUT_TEXT: &str = "Count, verify and audit Limited Preferential Voting tallies.

EXIT CODES:
     0: Success.
   255: Ran successfully, but verification failed.
 Other: Error.";

const LOG_CONFIG: &str = "log4rs.yaml";

#[derive(TryFromPrimitive, PartialEq, Eq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum Verbosity {
    Silent = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Verbosity {
    fn from_occurrences(n: u64) -> Self {
        // Warn by default, each -v adds a level
        let level = (n + Verbosity::Warn as u64).min(Verbosity::Trace as u64) as u8;
        Verbosity::try_from(level).unwrap_or(Verbosity::Trace)
    }

    fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Silent => LevelFilter::Off,
            Verbosity::Error => LevelFilter::Error,
            Verbosity::Warn => LevelFilter::Warn,
            Verbosity::Info => LevelFilter::Info,
            Verbosity::Debug => LevelFilter::Debug,
            Verbosity::Trace => LevelFilter::Trace,
        }
    }
}

/// Errors that stop a command before it can give an answer
#[derive(Debug)]
pub enum CliError {
    IO(String),
    Format(String),
    Tally(lpvtally::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CliError::IO(msg) => write!(f, "IO error: {}", msg),
            CliError::Format(msg) => write!(f, "invalid input: {}", msg),
            CliError::Tally(e) => write!(f, "{}", e),
        }
    }
}

impl From<lpvtally::Error> for CliError {
    fn from(e: lpvtally::Error) -> Self {
        CliError::Tally(e)
    }
}

/// Expand `~` and environment variables in a path argument
pub fn expand(path: &str) -> String {
    match shellexpand::full(path) {
        Ok(expanded) => expanded.into_owned(),
        Err(_) => path.to_owned(),
    }
}

fn cli() -> App<'static, 'static> {
    App::new(PROGRAM_NAME)
        .version(env!("CARGO_PKG_VERSION"))
        .about(ABOUT_TEXT)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Sets the level of verbosity. Ignored when log4rs.yaml is in the working directory"),
        )
        .subcommand(
            SubCommand::with_name("count")
                .about("Count a constituency and print the result")
                .arg(
                    Arg::with_name("BALLOTS")
                        .index(1)
                        .required(true)
                        .help("Decrypted ballots in JSON or CBOR format"),
                )
                .arg(
                    Arg::with_name("CANDIDATES")
                        .index(2)
                        .required(true)
                        .help("Candidate list in JSON or CBOR format"),
                )
                .arg(
                    Arg::with_name("constituency")
                        .long("constituency")
                        .takes_value(true)
                        .required(true)
                        .help("Constituency being counted"),
                )
                .arg(
                    Arg::with_name("output")
                        .long("output")
                        .short("o")
                        .takes_value(true)
                        .help("Write the result here instead of stdout"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Independently recount and check a stored result")
                .arg(Arg::with_name("BALLOTS").index(1).required(true))
                .arg(Arg::with_name("CANDIDATES").index(2).required(true))
                .arg(
                    Arg::with_name("RESULT")
                        .index(3)
                        .required(true)
                        .help("Result produced by `count`"),
                ),
        )
        .subcommand(
            SubCommand::with_name("audit")
                .about("Verify an exported audit event stream")
                .arg(
                    Arg::with_name("EVENTS")
                        .index(1)
                        .required(true)
                        .help("Exported events in JSON or CBOR format"),
                )
                .arg(
                    Arg::with_name("public-key")
                        .long("public-key")
                        .takes_value(true)
                        .required(true)
                        .help("Hex ed25519 public key of the audit signer"),
                ),
        )
        .subcommand(
            SubCommand::with_name("keygen").about("Generate an audit signing keypair"),
        )
        .subcommand(
            SubCommand::with_name("demo")
                .about("Run a full session on generated ballots and print the publication record")
                .arg(
                    Arg::with_name("voters")
                        .long("voters")
                        .takes_value(true)
                        .default_value("200"),
                )
                .arg(
                    Arg::with_name("fixtures")
                        .long("fixtures")
                        .takes_value(true)
                        .help("Directory to write ballots, candidates, result and events to"),
                ),
        )
}

fn init_logging(verbosity: Verbosity) {
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    if std::path::Path::new(LOG_CONFIG).exists() {
        match log4rs::init_file(LOG_CONFIG, Default::default()) {
            Ok(()) => return,
            Err(e) => eprintln!("{}: ignoring {}: {}", PROGRAM_NAME, LOG_CONFIG, e),
        }
    }

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{h({l})} {t} - {m}{n}")))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(
            Root::builder()
                .appender("stderr")
                .build(verbosity.level_filter()),
        );

    match config {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                eprintln!("{}: unable to initialise logging: {}", PROGRAM_NAME, e);
            }
        }
        Err(e) => eprintln!("{}: invalid logging config: {}", PROGRAM_NAME, e),
    }
}

fn run(matches: &ArgMatches) -> i32 {
    let outcome = match matches.subcommand() {
        ("count", Some(m)) => command_count::command_count(m),
        ("verify", Some(m)) => command_verify::command_verify(m),
        ("audit", Some(m)) => command_audit::command_audit(m),
        ("keygen", Some(m)) => command_keygen::command_keygen(m),
        ("demo", Some(m)) => command_demo::command_demo(m),
        _ => Err(CliError::Format("unknown command".to_owned())),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}: {}", PROGRAM_NAME, matches.subcommand_name().unwrap_or(""), e);
            1
        }
    }
}

fn main() {
    let matches = cli().get_matches();
    init_logging(Verbosity::from_occurrences(matches.occurrences_of("v")));
    std::process::exit(run(&matches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpvtally::*;
    use std::fs;
    use std::path::Path;

    fn args(line: &[&str]) -> ArgMatches<'static> {
        let mut full = vec![PROGRAM_NAME];
        full.extend_from_slice(line);
        cli().get_matches_from_safe(full).unwrap()
    }

    fn path(dir: &Path, name: &str) -> String {
        dir.join(name).to_string_lossy().into_owned()
    }

    /// Ballots and candidates for a three-way race B wins after C is eliminated
    fn write_fixtures(dir: &Path) {
        let candidates = vec![
            Candidate::new("A", "Avery"),
            Candidate::new("B", "Blake"),
            Candidate::new("C", "Casey"),
        ];
        let mut ballots = Vec::new();
        let rankings: [(usize, &[&str]); 4] = [
            (40, &["A"]),
            (35, &["B", "A"]),
            (20, &["C", "B"]),
            (5, &["C", "A"]),
        ];
        for (n, ranking) in rankings.iter() {
            for _ in 0..*n {
                let id = format!("b{}", ballots.len());
                ballots.push(Ballot::ranked(&id, "north", ranking));
            }
        }
        fs::write(
            dir.join("ballots.json"),
            serde_json::to_vec(&ballots).unwrap(),
        )
        .unwrap();
        fs::write(
            dir.join("candidates.cbor"),
            serde_cbor::to_vec(&candidates).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(Verbosity::from_occurrences(0), Verbosity::Warn);
        assert_eq!(Verbosity::from_occurrences(1), Verbosity::Info);
        assert_eq!(Verbosity::from_occurrences(9), Verbosity::Trace);
        assert_eq!(Verbosity::Silent.level_filter(), LevelFilter::Off);
    }

    #[test]
    fn count_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        write_fixtures(dir.path());
        let ballots = path(dir.path(), "ballots.json");
        let candidates = path(dir.path(), "candidates.cbor");
        let result = path(dir.path(), "result.json");

        let code = run(&args(&[
            "count",
            &ballots,
            &candidates,
            "--constituency",
            "north",
            "-o",
            &result,
        ]));
        assert_eq!(code, 0);

        let counted: TallyResult = serde_json::from_slice(&fs::read(&result).unwrap()).unwrap();
        assert_eq!(counted.winner_id(), Some("B"));

        assert_eq!(run(&args(&["verify", &ballots, &candidates, &result])), 0);

        // Flip a vote in the first round
        let mut tampered = counted;
        *tampered.rounds[0].candidate_counts.get_mut("A").unwrap() -= 1;
        fs::write(&result, serde_json::to_vec(&tampered).unwrap()).unwrap();
        assert_eq!(run(&args(&["verify", &ballots, &candidates, &result])), 255);
    }

    #[test]
    fn unreadable_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_fixtures(dir.path());
        let candidates = path(dir.path(), "candidates.cbor");

        let missing = path(dir.path(), "nope.json");
        assert_eq!(
            run(&args(&["count", &missing, &candidates, "--constituency", "north"])),
            1
        );

        let garbage = path(dir.path(), "garbage.json");
        fs::write(&garbage, b"{ not json").unwrap();
        assert_eq!(
            run(&args(&["count", &garbage, &candidates, "--constituency", "north"])),
            1
        );

        // Ballots for the wrong constituency are refused, not skipped
        let ballots = path(dir.path(), "ballots.json");
        assert_eq!(
            run(&args(&["count", &ballots, &candidates, "--constituency", "south"])),
            1
        );
    }

    #[test]
    fn demo_output_audits_clean() {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = dir.path().to_string_lossy().into_owned();
        assert_eq!(
            run(&args(&["demo", "--voters", "60", "--fixtures", &fixtures])),
            0
        );

        let key = fs::read_to_string(dir.path().join("audit-key.txt")).unwrap();
        let events = path(dir.path(), "events.json");
        assert_eq!(
            run(&args(&["audit", &events, "--public-key", key.trim()])),
            0
        );
        assert_eq!(
            run(&args(&[
                "verify",
                &path(dir.path(), "ballots.json"),
                &path(dir.path(), "candidates.json"),
                &path(dir.path(), "result.json"),
            ])),
            0
        );

        // Drop one event from the middle of the stream
        let mut exported: Vec<AuditEvent> =
            serde_json::from_slice(&fs::read(&events).unwrap()).unwrap();
        exported.remove(1);
        fs::write(&events, serde_json::to_vec(&exported).unwrap()).unwrap();
        assert_eq!(
            run(&args(&["audit", &events, "--public-key", key.trim()])),
            255
        );

        // A key that signed nothing
        let stranger = hex::encode(Ed25519Signer::generate().public_key());
        assert_eq!(run(&args(&["audit", &events, "--public-key", &stranger])), 255);
        assert_eq!(run(&args(&["audit", &events, "--public-key", "xyz"])), 1);
    }

    #[test]
    fn help_explains_log_config() {
        let mut help = Vec::new();
        cli().write_long_help(&mut help).unwrap();
        let help = String::from_utf8(help).unwrap();
        assert!(help.contains(LOG_CONFIG));
    }

    #[test]
    fn bad_cli_usage() {
        let command_line = [PROGRAM_NAME, "count", "only-one-file"];
        cli().get_matches_from_safe(&command_line).unwrap_err();

        let command_line = [PROGRAM_NAME, "audit", "events.json"];
        cli().get_matches_from_safe(&command_line).unwrap_err();

        let command_line = [PROGRAM_NAME];
        cli().get_matches_from_safe(&command_line).unwrap_err();
    }
}
