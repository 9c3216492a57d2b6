//! The LPV counting engine.
//!
//! A count is a pure function of the ballot set and candidate list. Each round tallies every
//! active ballot's current preference; a candidate holding `floor(valid / 2) + 1` votes wins,
//! otherwise the lowest candidate is eliminated and their ballots move on to the next active
//! preference. Ties for lowest are broken by original first-preference votes and then by the
//! smallest candidate id, so the same input always eliminates in the same order.

use crate::*;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info, trace};
use std::collections::HashMap;

/// Rounds allowed before a count is abandoned as malformed
pub const DEFAULT_MAX_ROUNDS: u32 = 50;

/// Source of round timestamps
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(t) => *t,
        }
    }
}

/// Counts LPV elections. Holds no state between counts.
#[derive(Debug, Clone)]
pub struct CountingEngine {
    max_rounds: u32,
    clock: Clock,
}

impl Default for CountingEngine {
    fn default() -> Self {
        CountingEngine::new(DEFAULT_MAX_ROUNDS)
    }
}

impl CountingEngine {
    pub fn new(max_rounds: u32) -> Self {
        CountingEngine {
            max_rounds,
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Count a constituency.
    ///
    /// The ballot set is validated first; a single malformed ballot refuses the whole count.
    /// The returned result has passed [`verify_mathematics`].
    pub fn count(
        &self,
        constituency_id: &str,
        ballots: &[Ballot],
        candidates: &[Candidate],
    ) -> Result<TallyResult, Error> {
        validate_candidates(candidates)?;
        validate_ballots(constituency_id, ballots, candidates)?;

        let mut state = CountState::new(ballots, candidates);
        let mut rounds: Vec<Round> = Vec::new();
        let mut previous_hash = GENESIS_HASH.to_owned();

        let winner = loop {
            if let Some(last) = state.sole_active() {
                break last;
            }

            let round_number = rounds.len() as u32 + 1;
            if round_number > self.max_rounds {
                return Err(Error::RoundLimitExceeded(self.max_rounds));
            }

            let counts = state.tally();
            let exhausted = state.exhausted();
            let valid: u64 = counts.iter().map(|(_, n)| n).sum();
            let majority = valid / 2 + 1;

            let (leader, leader_votes) = state.leader(&counts);

            let mut round = Round {
                round_number,
                candidate_counts: state.count_map(&counts),
                total_active_votes: valid,
                majority_required: majority,
                exhausted_votes: exhausted,
                eliminated_candidate: None,
                elimination_reason: String::new(),
                redistributed_votes: 0,
                timestamp: self.clock.now(),
                proof: String::new(),
                audit_hash: String::new(),
            };

            let found_winner = if leader_votes >= majority {
                info!(
                    "{}: round {}: {} wins with {} of {} votes",
                    constituency_id, round_number, state.candidates[leader].id, leader_votes, valid
                );
                round.elimination_reason = format!("Winner found with {} votes", leader_votes);
                true
            } else {
                let (loser, tie_break) = state.lowest(&counts);
                let loser_votes = counts
                    .iter()
                    .find(|(i, _)| *i == loser)
                    .map(|(_, n)| *n)
                    .unwrap_or(0);
                let loser_id = state.candidates[loser].id.clone();

                debug!(
                    "{}: round {}: eliminating {} with {} votes",
                    constituency_id, round_number, loser_id, loser_votes
                );

                round.elimination_reason = match tie_break {
                    TieBreak::None => {
                        format!("Eliminated {} with {} votes (lowest)", loser_id, loser_votes)
                    }
                    TieBreak::FirstPreferences => format!(
                        "Eliminated {} with {} votes (tie broken on first preferences)",
                        loser_id, loser_votes
                    ),
                    TieBreak::CandidateId => format!(
                        "Eliminated {} with {} votes (tie broken on candidate id)",
                        loser_id, loser_votes
                    ),
                };
                round.eliminated_candidate = Some(loser_id);
                round.redistributed_votes = loser_votes;

                state.eliminate(loser, round_number);
                false
            };

            round.proof = generate_round_proof(&round, ballots);
            round.audit_hash = round.chain_hash(&previous_hash);
            previous_hash = round.audit_hash.clone();
            rounds.push(round);

            if found_winner {
                break leader;
            }
        };

        let final_tally = match rounds.last() {
            Some(round) => round.candidate_counts.clone(),
            None => {
                let counts = state.tally();
                state.count_map(&counts)
            }
        };

        let total_ballots = ballots.len() as u64;
        verify_mathematics(total_ballots, &rounds)?;

        let merkle_root = merkle_root(&rounds);
        let result = TallyResult {
            result_id: TallyResult::build_id(constituency_id, &merkle_root),
            constituency_id: constituency_id.to_owned(),
            winner: Some(state.candidates[winner].clone()),
            exhausted_ballots: state.exhausted(),
            candidates: state.candidates,
            rounds,
            total_ballots,
            valid_ballots: total_ballots,
            final_tally,
            merkle_root,
            mathematically_verified: true,
            status: ResultStatus::Preliminary,
        };

        Ok(result)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TieBreak {
    None,
    FirstPreferences,
    CandidateId,
}

/// Working state of a single count, indexed by candidate position
struct CountState {
    candidates: Vec<Candidate>,

    /// Each ballot's preferences as candidate indexes, in rank order
    preferences: Vec<Vec<usize>>,

    /// Position of each ballot's current preference, `None` once exhausted
    cursor: Vec<Option<usize>>,

    /// Original first-preference votes, the first tie-break
    first_preferences: Vec<u64>,
}

impl CountState {
    fn new(ballots: &[Ballot], candidates: &[Candidate]) -> Self {
        let candidates: Vec<Candidate> = candidates
            .iter()
            .map(|c| Candidate {
                active: true,
                eliminated_in_round: None,
                ..c.clone()
            })
            .collect();

        let index: HashMap<&str, usize> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        // Ballots were validated, so every candidate id resolves
        let preferences: Vec<Vec<usize>> = ballots
            .iter()
            .map(|b| {
                b.ordered_preferences()
                    .iter()
                    .filter_map(|p| index.get(p.candidate_id.as_str()).copied())
                    .collect()
            })
            .collect();

        let mut first_preferences = vec![0u64; candidates.len()];
        for prefs in &preferences {
            if let Some(first) = prefs.first() {
                first_preferences[*first] += 1;
            }
        }

        let cursor = preferences
            .iter()
            .map(|p| if p.is_empty() { None } else { Some(0) })
            .collect();

        CountState {
            candidates,
            preferences,
            cursor,
            first_preferences,
        }
    }

    fn current(&self, ballot: usize) -> Option<usize> {
        self.cursor[ballot].map(|pos| self.preferences[ballot][pos])
    }

    fn active(&self) -> impl Iterator<Item = usize> + '_ {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.active)
            .map(|(i, _)| i)
    }

    fn sole_active(&self) -> Option<usize> {
        let mut active = self.active();
        match (active.next(), active.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    /// Current-preference votes for every active candidate, in candidate order
    fn tally(&self) -> Vec<(usize, u64)> {
        let mut votes = vec![0u64; self.candidates.len()];
        for ballot in 0..self.preferences.len() {
            if let Some(c) = self.current(ballot) {
                votes[c] += 1;
            }
        }
        self.active().map(|i| (i, votes[i])).collect()
    }

    fn count_map(&self, counts: &[(usize, u64)]) -> IndexMap<String, u64> {
        counts
            .iter()
            .map(|(i, n)| (self.candidates[*i].id.clone(), *n))
            .collect()
    }

    fn exhausted(&self) -> u64 {
        self.cursor.iter().filter(|c| c.is_none()).count() as u64
    }

    fn leader(&self, counts: &[(usize, u64)]) -> (usize, u64) {
        // Two candidates can never both hold a majority, so ties here never decide a winner
        counts
            .iter()
            .copied()
            .fold(None, |best: Option<(usize, u64)>, (i, n)| match best {
                Some((_, b)) if b >= n => best,
                _ => Some((i, n)),
            })
            .unwrap_or((0, 0))
    }

    /// Pick the candidate to eliminate: fewest votes, then fewest original first
    /// preferences, then smallest id
    fn lowest(&self, counts: &[(usize, u64)]) -> (usize, TieBreak) {
        let min = counts.iter().map(|(_, n)| *n).min().unwrap_or(0);
        let mut tied: Vec<usize> = counts
            .iter()
            .filter(|(_, n)| *n == min)
            .map(|(i, _)| *i)
            .collect();

        if tied.len() == 1 {
            return (tied[0], TieBreak::None);
        }

        let min_first = tied
            .iter()
            .map(|i| self.first_preferences[*i])
            .min()
            .unwrap_or(0);
        tied.retain(|i| self.first_preferences[*i] == min_first);

        if tied.len() == 1 {
            return (tied[0], TieBreak::FirstPreferences);
        }

        tied.sort_by(|a, b| self.candidates[*a].id.cmp(&self.candidates[*b].id));
        (tied[0], TieBreak::CandidateId)
    }

    /// Remove a candidate and move each of their ballots to its next active preference
    fn eliminate(&mut self, candidate: usize, round_number: u32) {
        self.candidates[candidate].eliminate(round_number);

        for ballot in 0..self.preferences.len() {
            if self.current(ballot) != Some(candidate) {
                continue;
            }
            let prefs = &self.preferences[ballot];
            let start = self.cursor[ballot].map(|p| p + 1).unwrap_or(prefs.len());
            let next = (start..prefs.len()).find(|pos| self.candidates[prefs[*pos]].active);
            self.cursor[ballot] = next;

            match next {
                Some(pos) => trace!(
                    "ballot #{} moves to {}",
                    ballot,
                    self.candidates[prefs[pos]].id
                ),
                None => trace!("ballot #{} exhausted", ballot),
            }
        }
    }
}

/// Arithmetic checks every count must pass before it is returned.
///
/// - rounds are numbered 1..n and each round's counts sum to its active total
/// - active totals never exceed `initial_ballots` less the ballots exhausted so far, and never grow
/// - an eliminated candidate held the minimum count of their round, no one in that round held a
///   majority, and they never appear again
/// - only the final round may declare a winner, and that winner held a majority
pub fn verify_mathematics(initial_ballots: u64, rounds: &[Round]) -> Result<(), Error> {
    let fail = |round: u32, reason: String| Error::MathematicalVerification { round, reason };

    let mut previous_total = initial_ballots;
    let mut previous_exhausted = 0u64;
    let mut eliminated: Vec<&str> = Vec::new();

    for (i, round) in rounds.iter().enumerate() {
        let n = round.round_number;
        if n as usize != i + 1 {
            return Err(fail(n, format!("expected round number {}", i + 1)));
        }

        let sum: u64 = round.candidate_counts.values().sum();
        if sum != round.total_active_votes {
            return Err(fail(
                n,
                format!(
                    "counts sum to {} but active total is {}",
                    sum, round.total_active_votes
                ),
            ));
        }

        if round.exhausted_votes < previous_exhausted || round.exhausted_votes > initial_ballots {
            return Err(fail(n, "exhausted ballots went backwards".to_owned()));
        }
        if round.total_active_votes > initial_ballots - round.exhausted_votes {
            return Err(fail(
                n,
                format!(
                    "{} active votes exceeds {} ballots less {} exhausted",
                    round.total_active_votes, initial_ballots, round.exhausted_votes
                ),
            ));
        }
        if round.total_active_votes > previous_total {
            return Err(fail(n, "active votes increased".to_owned()));
        }

        if let Some(gone) = eliminated
            .iter()
            .find(|c| round.candidate_counts.contains_key(**c))
        {
            return Err(fail(n, format!("eliminated candidate {} was counted", gone)));
        }

        if round.majority_required != round.total_active_votes / 2 + 1 {
            return Err(fail(n, "wrong majority threshold".to_owned()));
        }
        let top = round.candidate_counts.values().copied().max().unwrap_or(0);

        match &round.eliminated_candidate {
            Some(candidate) => {
                let votes = match round.candidate_counts.get(candidate) {
                    Some(v) => *v,
                    None => {
                        return Err(fail(n, format!("eliminated {} was not active", candidate)))
                    }
                };
                if Some(votes) != round.minimum_count() {
                    return Err(fail(
                        n,
                        format!("eliminated {} did not hold the minimum count", candidate),
                    ));
                }
                if top >= round.majority_required {
                    return Err(fail(n, "eliminated despite a majority".to_owned()));
                }
                if round.redistributed_votes != votes {
                    return Err(fail(n, "redistributed votes do not match".to_owned()));
                }
                eliminated.push(candidate);
            }
            None => {
                if i + 1 != rounds.len() {
                    return Err(fail(n, "winner declared before the final round".to_owned()));
                }
                if top < round.majority_required {
                    return Err(fail(n, "winner declared without a majority".to_owned()));
                }
            }
        }

        previous_total = round.total_active_votes;
        previous_exhausted = round.exhausted_votes;
    }

    Ok(())
}
