use crate::*;
use std::collections::HashSet;

/// Voters may rank at most this many candidates
pub const MAX_RANK: u8 = 3;

/// One ranked choice on a ballot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Preference {
    pub rank: u8,
    pub candidate_id: String,
}

impl Preference {
    pub fn new(rank: u8, candidate_id: &str) -> Self {
        Preference {
            rank,
            candidate_id: candidate_id.to_owned(),
        }
    }
}

/// A decrypted ballot. Immutable once cast.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    pub id: String,
    pub preferences: Vec<Preference>,
    pub constituency_id: String,

    /// Opaque signature carried from casting; bound into every round proof.
    #[serde(default)]
    pub signature: String,
}

impl Ballot {
    /// Build a ballot ranking `candidate_ids` in the given order
    pub fn ranked(id: &str, constituency_id: &str, candidate_ids: &[&str]) -> Self {
        let preferences = candidate_ids
            .iter()
            .enumerate()
            .map(|(i, c)| Preference::new(i as u8 + 1, c))
            .collect();

        Ballot {
            id: id.to_owned(),
            preferences,
            constituency_id: constituency_id.to_owned(),
            signature: String::new(),
        }
    }

    /// Preferences ordered by rank, most preferred first
    pub fn ordered_preferences(&self) -> Vec<&Preference> {
        let mut prefs: Vec<&Preference> = self.preferences.iter().collect();
        prefs.sort_by_key(|p| p.rank);
        prefs
    }

    /// The rank-1 choice, counted for tie-breaks over the original ballot set
    pub fn first_preference(&self) -> Option<&str> {
        self.preferences
            .iter()
            .min_by_key(|p| p.rank)
            .map(|p| p.candidate_id.as_str())
    }

    /// Check a single ballot against the known candidate ids
    pub fn validate(
        &self,
        constituency_id: &str,
        candidates: &HashSet<&str>,
    ) -> Result<(), ValidationError> {
        if self.constituency_id != constituency_id {
            return Err(ValidationError::ConstituencyMismatch {
                expected: constituency_id.to_owned(),
                found: self.constituency_id.clone(),
            });
        }

        if self.preferences.is_empty() {
            return Err(ValidationError::EmptyBallot);
        }

        let mut ranks = HashSet::with_capacity(self.preferences.len());
        let mut ranked = HashSet::with_capacity(self.preferences.len());
        for pref in &self.preferences {
            if pref.rank < 1 || pref.rank > MAX_RANK {
                return Err(ValidationError::RankOutOfRange(pref.rank));
            }
            if !ranks.insert(pref.rank) {
                return Err(ValidationError::DuplicateRank(pref.rank));
            }
            if !candidates.contains(pref.candidate_id.as_str()) {
                return Err(ValidationError::UnknownCandidate(pref.candidate_id.clone()));
            }
            if !ranked.insert(pref.candidate_id.as_str()) {
                return Err(ValidationError::RepeatedCandidate(pref.candidate_id.clone()));
            }
        }

        Ok(())
    }
}

/// Validate a whole ballot set before counting.
///
/// Every malformed ballot is reported; none are skipped.
pub fn validate_ballots(
    constituency_id: &str,
    ballots: &[Ballot],
    candidates: &[Candidate],
) -> Result<(), Error> {
    let known: HashSet<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
    let mut ids = HashSet::with_capacity(ballots.len());
    let mut rejections = Vec::new();

    for ballot in ballots {
        if !ids.insert(ballot.id.as_str()) {
            rejections.push(BallotRejection {
                ballot_id: ballot.id.clone(),
                reason: ValidationError::DuplicateBallotId,
            });
            continue;
        }
        if let Err(reason) = ballot.validate(constituency_id, &known) {
            rejections.push(BallotRejection {
                ballot_id: ballot.id.clone(),
                reason,
            });
        }
    }

    if rejections.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidBallots(rejections))
    }
}
