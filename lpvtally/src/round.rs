use crate::*;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;

/// One counting round. Never mutated once the count has returned.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Round {
    /// 1-based
    pub round_number: u32,

    /// Votes held by each candidate still active in this round, in candidate-list order
    pub candidate_counts: IndexMap<String, u64>,

    pub total_active_votes: u64,
    pub majority_required: u64,

    /// Ballots already exhausted when this round began
    pub exhausted_votes: u64,

    /// Set only when no candidate reached a majority
    pub eliminated_candidate: Option<String>,
    pub elimination_reason: String,
    pub redistributed_votes: u64,

    pub timestamp: DateTime<Utc>,
    pub proof: String,
    pub audit_hash: String,
}

impl Round {
    /// Candidate counts ordered by candidate id, for hashing
    pub fn sorted_counts(&self) -> Vec<(&str, u64)> {
        let mut counts: Vec<(&str, u64)> = self
            .candidate_counts
            .iter()
            .map(|(id, n)| (id.as_str(), *n))
            .collect();
        counts.sort();
        counts
    }

    /// Lowest count held by any candidate in this round
    pub fn minimum_count(&self) -> Option<u64> {
        self.candidate_counts.values().copied().min()
    }

    /// Hash over every recorded field except `audit_hash`
    pub fn content_hash(&self) -> [u8; 32] {
        let mut h = HashBuilder::new("lpvtally.round")
            .number(self.round_number as u64)
            .number(self.candidate_counts.len() as u64);
        for (id, count) in self.sorted_counts() {
            h = h.field(id).number(count);
        }
        h.number(self.total_active_votes)
            .number(self.majority_required)
            .number(self.exhausted_votes)
            .optional(self.eliminated_candidate.as_ref())
            .field(&self.elimination_reason)
            .number(self.redistributed_votes)
            .field(self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .field(&self.proof)
            .finish()
    }

    /// Link this round to the audit hash of the round before it
    pub fn chain_hash(&self, previous_hash: &str) -> String {
        HashBuilder::new("lpvtally.round-chain")
            .field(previous_hash)
            .field(self.content_hash())
            .finish_hex()
    }
}

/// Check that each round's `audit_hash` links to its predecessor
pub fn verify_round_chain(rounds: &[Round]) -> Result<(), u32> {
    let mut previous = GENESIS_HASH.to_owned();
    for round in rounds {
        if round.chain_hash(&previous) != round.audit_hash {
            return Err(round.round_number);
        }
        previous = round.audit_hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_round() -> Round {
        let mut counts = IndexMap::new();
        counts.insert("B".to_owned(), 35);
        counts.insert("A".to_owned(), 40);
        counts.insert("C".to_owned(), 25);
        Round {
            round_number: 1,
            candidate_counts: counts,
            total_active_votes: 100,
            majority_required: 51,
            exhausted_votes: 0,
            eliminated_candidate: Some("C".into()),
            elimination_reason: "Eliminated C with 25 votes (lowest)".into(),
            redistributed_votes: 25,
            timestamp: Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
            proof: "p".into(),
            audit_hash: String::new(),
        }
    }

    #[test]
    fn sorted_counts_ignore_insertion_order() {
        let round = sample_round();
        let ids: Vec<&str> = round.sorted_counts().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(round.minimum_count(), Some(25));
    }

    #[test]
    fn content_hash_covers_counts() {
        let round = sample_round();
        let mut tampered = round.clone();
        *tampered.candidate_counts.get_mut("A").unwrap() += 1;
        assert_ne!(round.content_hash(), tampered.content_hash());

        let mut reordered = round.clone();
        reordered.candidate_counts.sort_keys();
        assert_eq!(round.content_hash(), reordered.content_hash());
    }

    #[test]
    fn round_chain_detects_tampering() {
        let mut first = sample_round();
        first.audit_hash = first.chain_hash(GENESIS_HASH);
        let mut second = sample_round();
        second.round_number = 2;
        second.audit_hash = second.chain_hash(&first.audit_hash);

        let mut rounds = vec![first, second];
        verify_round_chain(&rounds).unwrap();

        rounds[0].redistributed_votes = 24;
        assert_eq!(verify_round_chain(&rounds), Err(1));
    }
}
