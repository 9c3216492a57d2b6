use crate::*;
use std::collections::HashSet;

/// A candidate standing in a constituency.
///
/// Only `active` and `eliminated_in_round` change, and only inside a count.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub name: String,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eliminated_in_round: Option<u32>,
}

fn default_active() -> bool {
    true
}

impl Candidate {
    pub fn new(id: &str, name: &str) -> Self {
        Candidate {
            id: id.to_owned(),
            name: name.to_owned(),
            active: true,
            eliminated_in_round: None,
        }
    }

    pub(crate) fn eliminate(&mut self, round: u32) {
        self.active = false;
        self.eliminated_in_round = Some(round);
    }
}

/// Make sure a candidate list can be counted
pub fn validate_candidates(candidates: &[Candidate]) -> Result<(), Error> {
    if candidates.is_empty() {
        return Err(Error::NoCandidates);
    }

    let mut seen = HashSet::with_capacity(candidates.len());
    for candidate in candidates {
        if !seen.insert(candidate.id.as_str()) {
            return Err(Error::DuplicateCandidate(candidate.id.clone()));
        }
    }

    Ok(())
}
