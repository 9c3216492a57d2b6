use crate::*;
use indexmap::IndexMap;

/// Lifecycle of a tally result
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Preliminary,
    Certified,
    Final,
    Disputed,
}

/// The sealed outcome of a count in one constituency
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TallyResult {
    /// Derived from the constituency and merkle root, so identical counts share an id
    pub result_id: String,
    pub constituency_id: String,

    pub winner: Option<Candidate>,
    pub rounds: Vec<Round>,

    /// Candidates as they stand after the count, with elimination rounds filled in
    pub candidates: Vec<Candidate>,

    pub total_ballots: u64,
    pub valid_ballots: u64,
    pub exhausted_ballots: u64,
    pub final_tally: IndexMap<String, u64>,

    pub merkle_root: String,
    pub mathematically_verified: bool,
    pub status: ResultStatus,
}

impl TallyResult {
    pub fn build_id(constituency_id: &str, merkle_root: &str) -> String {
        let digest = HashBuilder::new("lpvtally.result-id")
            .field(constituency_id)
            .field(merkle_root)
            .finish();
        hex::encode(&digest[0..16])
    }

    pub fn winner_id(&self) -> Option<&str> {
        self.winner.as_ref().map(|c| c.id.as_str())
    }

    /// Candidate ids in the order they were eliminated
    pub fn elimination_order(&self) -> Vec<&str> {
        self.rounds
            .iter()
            .filter_map(|r| r.eliminated_candidate.as_deref())
            .collect()
    }

    pub fn get_round(&self, round_number: u32) -> Option<&Round> {
        self.rounds.iter().find(|r| r.round_number == round_number)
    }
}
