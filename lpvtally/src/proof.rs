use crate::*;
use log::{info, warn};
use std::collections::BTreeSet;
use std::fmt;

/// Hash binding a round's outcome to the exact ballot set it was counted from.
///
/// Covers the round number, the per-candidate counts (ordered by id), the eliminated candidate
/// and every ballot signature (ordered by ballot id).
pub fn generate_round_proof(round: &Round, ballots: &[Ballot]) -> String {
    let mut h = HashBuilder::new("lpvtally.round-proof")
        .number(round.round_number as u64)
        .number(round.candidate_counts.len() as u64);
    for (id, count) in round.sorted_counts() {
        h = h.field(id).number(count);
    }
    h = h.optional(round.eliminated_candidate.as_ref());

    let mut signed: Vec<(&str, &str)> = ballots
        .iter()
        .map(|b| (b.id.as_str(), b.signature.as_str()))
        .collect();
    signed.sort();
    h = h.number(signed.len() as u64);
    for (id, signature) in signed {
        h = h.field(id).field(signature);
    }

    h.finish_hex()
}

/// Recompute a round's proof and compare it with the stored value
pub fn verify_round_proof(round: &Round, ballots: &[Ballot]) -> bool {
    generate_round_proof(round, ballots) == round.proof
}

/// One step of a Merkle inclusion path
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MerkleStep {
    pub sibling: String,
    pub sibling_on_left: bool,
}

/// A Merkle tree over a round sequence.
///
/// Leaves are the rounds' content hashes. Odd levels duplicate their last node.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

fn merkle_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    HashBuilder::new("lpvtally.merkle-node")
        .field(left)
        .field(right)
        .finish()
}

fn empty_root() -> [u8; 32] {
    HashBuilder::new("lpvtally.merkle-empty").finish()
}

impl MerkleTree {
    pub fn from_rounds(rounds: &[Round]) -> Self {
        let leaves: Vec<[u8; 32]> = rounds.iter().map(|r| r.content_hash()).collect();
        MerkleTree::from_leaves(leaves)
    }

    pub fn from_leaves(leaves: Vec<[u8; 32]>) -> Self {
        let mut levels = vec![leaves];
        while levels.last().map(|l| l.len() > 1).unwrap_or(false) {
            let level = &levels[levels.len() - 1];
            let next: Vec<[u8; 32]> = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => merkle_node(left, right),
                    [last] => merkle_node(last, last),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }
        MerkleTree { levels }
    }

    pub fn root(&self) -> String {
        let root = self
            .levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or_else(empty_root);
        hex::encode(root)
    }

    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sibling path from leaf `index` up to the root
    pub fn proof(&self, index: usize) -> Option<Vec<MerkleStep>> {
        if index >= self.len() {
            return None;
        }

        let mut steps = Vec::new();
        let mut i = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if i % 2 == 0 {
                level.get(i + 1).unwrap_or(&level[i])
            } else {
                &level[i - 1]
            };
            steps.push(MerkleStep {
                sibling: hex::encode(sibling),
                sibling_on_left: i % 2 == 1,
            });
            i /= 2;
        }
        Some(steps)
    }
}

/// Merkle root over a round sequence, recomputable from the rounds alone
pub fn merkle_root(rounds: &[Round]) -> String {
    MerkleTree::from_rounds(rounds).root()
}

/// Check that `round` sits at the position described by `path` under `root`
pub fn verify_inclusion(round: &Round, path: &[MerkleStep], root: &str) -> bool {
    let mut node = round.content_hash();
    for step in path {
        let sibling = match hex::decode(&step.sibling) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut s = [0u8; 32];
                s.copy_from_slice(&bytes);
                s
            }
            _ => return false,
        };
        node = if step.sibling_on_left {
            merkle_node(&sibling, &node)
        } else {
            merkle_node(&node, &sibling)
        };
    }
    hex::encode(node) == root
}

/// The first point at which a stored result disagrees with an independent recount
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    Constituency {
        expected: String,
        found: String,
    },
    RecountFailed {
        reason: String,
    },
    CandidateCount {
        round: u32,
        candidate: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
    ActiveTotal {
        round: u32,
        expected: u64,
        found: u64,
    },
    Elimination {
        round: u32,
        expected: Option<String>,
        found: Option<String>,
    },
    RoundCount {
        expected: usize,
        found: usize,
    },
    Winner {
        expected: Option<String>,
        found: Option<String>,
    },
    RoundProof {
        round: u32,
    },
    RoundChain {
        round: u32,
    },
    MerkleRoot {
        expected: String,
        found: String,
    },
}

impl Mismatch {
    /// The round at fault, when the mismatch is tied to one
    pub fn round(&self) -> Option<u32> {
        match self {
            Mismatch::CandidateCount { round, .. }
            | Mismatch::ActiveTotal { round, .. }
            | Mismatch::Elimination { round, .. }
            | Mismatch::RoundProof { round }
            | Mismatch::RoundChain { round } => Some(*round),
            _ => None,
        }
    }
}

fn or_none<T: fmt::Display>(v: &Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "none".to_owned(),
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mismatch::Constituency { expected, found } => {
                write!(f, "constituency is {}, expected {}", found, expected)
            }
            Mismatch::RecountFailed { reason } => write!(f, "recount failed: {}", reason),
            Mismatch::CandidateCount {
                round,
                candidate,
                expected,
                found,
            } => write!(
                f,
                "round {}: candidate {} has {} votes, recount gives {}",
                round,
                candidate,
                or_none(found),
                or_none(expected)
            ),
            Mismatch::ActiveTotal {
                round,
                expected,
                found,
            } => write!(
                f,
                "round {}: active total is {}, recount gives {}",
                round, found, expected
            ),
            Mismatch::Elimination {
                round,
                expected,
                found,
            } => write!(
                f,
                "round {}: eliminated {}, recount eliminates {}",
                round,
                or_none(found),
                or_none(expected)
            ),
            Mismatch::RoundCount { expected, found } => {
                write!(f, "{} rounds recorded, recount gives {}", found, expected)
            }
            Mismatch::Winner { expected, found } => write!(
                f,
                "winner is {}, recount gives {}",
                or_none(found),
                or_none(expected)
            ),
            Mismatch::RoundProof { round } => write!(f, "round {}: proof does not verify", round),
            Mismatch::RoundChain { round } => {
                write!(f, "round {}: audit hash does not link", round)
            }
            Mismatch::MerkleRoot { expected, found } => {
                write!(f, "merkle root is {}, rounds give {}", found, expected)
            }
        }
    }
}

/// Outcome of [`verify_election_results`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub verified: bool,
    pub mismatch: Option<Mismatch>,
}

impl VerificationReport {
    fn ok() -> Self {
        VerificationReport {
            verified: true,
            mismatch: None,
        }
    }

    fn failed(mismatch: Mismatch) -> Self {
        warn!("result verification failed: {}", mismatch);
        VerificationReport {
            verified: false,
            mismatch: Some(mismatch),
        }
    }

    /// Convert to a `Result`, for callers that treat any mismatch as fatal
    pub fn into_result(self) -> Result<(), Error> {
        match self.mismatch {
            Some(mismatch) => Err(Error::ResultMismatch(mismatch)),
            None => Ok(()),
        }
    }
}

/// Compare one stored round against its recount
fn compare_round(expected: &Round, found: &Round) -> Option<Mismatch> {
    let round = found.round_number;

    let candidates: BTreeSet<&str> = expected
        .candidate_counts
        .keys()
        .chain(found.candidate_counts.keys())
        .map(|k| k.as_str())
        .collect();
    for candidate in candidates {
        let e = expected.candidate_counts.get(candidate).copied();
        let f = found.candidate_counts.get(candidate).copied();
        if e != f {
            return Some(Mismatch::CandidateCount {
                round,
                candidate: candidate.to_owned(),
                expected: e,
                found: f,
            });
        }
    }

    if expected.total_active_votes != found.total_active_votes {
        return Some(Mismatch::ActiveTotal {
            round,
            expected: expected.total_active_votes,
            found: found.total_active_votes,
        });
    }

    if expected.eliminated_candidate != found.eliminated_candidate {
        return Some(Mismatch::Elimination {
            round,
            expected: expected.eliminated_candidate.clone(),
            found: found.eliminated_candidate.clone(),
        });
    }

    None
}

/// Independently re-derive a result and check it bit-for-bit.
///
/// Checks the result belongs to the ballots' constituency and re-runs the count, then compares
/// every round's candidate counts, totals and elimination, the round count and the winner. Then
/// each stored round proof, the round chain and the merkle root are recomputed from the stored
/// data. The first disagreement is reported.
pub fn verify_election_results(
    engine: &CountingEngine,
    ballots: &[Ballot],
    candidates: &[Candidate],
    result: &TallyResult,
) -> VerificationReport {
    if let Some(ballot) = ballots
        .iter()
        .find(|b| b.constituency_id != result.constituency_id)
    {
        return VerificationReport::failed(Mismatch::Constituency {
            expected: ballot.constituency_id.clone(),
            found: result.constituency_id.clone(),
        });
    }

    let recount = match engine.count(&result.constituency_id, ballots, candidates) {
        Ok(recount) => recount,
        Err(e) => {
            return VerificationReport::failed(Mismatch::RecountFailed {
                reason: e.to_string(),
            })
        }
    };

    for (expected, found) in recount.rounds.iter().zip(result.rounds.iter()) {
        if let Some(mismatch) = compare_round(expected, found) {
            return VerificationReport::failed(mismatch);
        }
    }

    if recount.rounds.len() != result.rounds.len() {
        return VerificationReport::failed(Mismatch::RoundCount {
            expected: recount.rounds.len(),
            found: result.rounds.len(),
        });
    }

    if recount.winner_id() != result.winner_id() {
        return VerificationReport::failed(Mismatch::Winner {
            expected: recount.winner_id().map(str::to_owned),
            found: result.winner_id().map(str::to_owned),
        });
    }

    for round in &result.rounds {
        if !verify_round_proof(round, ballots) {
            return VerificationReport::failed(Mismatch::RoundProof {
                round: round.round_number,
            });
        }
    }

    if let Err(round) = verify_round_chain(&result.rounds) {
        return VerificationReport::failed(Mismatch::RoundChain { round });
    }

    let root = merkle_root(&result.rounds);
    if root != result.merkle_root {
        return VerificationReport::failed(Mismatch::MerkleRoot {
            expected: root,
            found: result.merkle_root.clone(),
        });
    }

    info!(
        "{}: result {} verified over {} rounds",
        result.constituency_id,
        result.result_id,
        result.rounds.len()
    );
    VerificationReport::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn engine() -> CountingEngine {
        CountingEngine::default().with_clock(Clock::Fixed(
            Utc.with_ymd_and_hms(2026, 5, 1, 18, 0, 0).unwrap(),
        ))
    }

    fn candidates() -> Vec<Candidate> {
        ["A", "B", "C", "D"]
            .iter()
            .map(|id| Candidate::new(id, id))
            .collect()
    }

    fn ballots() -> Vec<Ballot> {
        let rankings: [(usize, &[&str]); 5] = [
            (9, &["A", "B"]),
            (7, &["B", "C"]),
            (6, &["C", "B", "A"]),
            (3, &["D", "C"]),
            (2, &["D"]),
        ];
        let mut ballots = Vec::new();
        for (n, ranking) in rankings.iter() {
            for _ in 0..*n {
                let id = format!("b{}", ballots.len());
                let mut ballot = Ballot::ranked(&id, "north", ranking);
                ballot.signature = sha256_hex(id.as_bytes());
                ballots.push(ballot);
            }
        }
        ballots
    }

    fn counted() -> (Vec<Ballot>, TallyResult) {
        let ballots = ballots();
        let result = engine().count("north", &ballots, &candidates()).unwrap();
        (ballots, result)
    }

    #[test]
    fn untampered_result_verifies() {
        let (ballots, result) = counted();
        assert!(result.rounds.len() >= 3);
        let report = verify_election_results(&engine(), &ballots, &candidates(), &result);
        assert_eq!(report, VerificationReport::ok());
        report.into_result().unwrap();
    }

    #[test]
    fn verification_ignores_recount_timestamps() {
        let (ballots, result) = counted();
        let report =
            verify_election_results(&CountingEngine::default(), &ballots, &candidates(), &result);
        assert!(report.verified);
    }

    #[test]
    fn flipped_vote_names_its_round() {
        let (ballots, result) = counted();
        for i in 0..result.rounds.len() {
            let mut tampered = result.clone();
            let round = &mut tampered.rounds[i];
            let first = round.candidate_counts.keys().next().unwrap().clone();
            *round.candidate_counts.get_mut(&first).unwrap() += 1;

            let report = verify_election_results(&engine(), &ballots, &candidates(), &tampered);
            assert!(!report.verified);
            let mismatch = report.mismatch.unwrap();
            assert_eq!(mismatch.round(), Some(i as u32 + 1));
            assert!(matches!(mismatch, Mismatch::CandidateCount { .. }));
        }
    }

    #[test]
    fn changed_winner_is_reported() {
        let (ballots, mut result) = counted();
        result.winner = Some(Candidate::new("D", "D"));
        let report = verify_election_results(&engine(), &ballots, &candidates(), &result);
        assert!(matches!(report.mismatch, Some(Mismatch::Winner { .. })));
    }

    #[test]
    fn dropped_round_is_reported() {
        let (ballots, mut result) = counted();
        result.rounds.pop();
        let report = verify_election_results(&engine(), &ballots, &candidates(), &result);
        assert!(matches!(report.mismatch, Some(Mismatch::RoundCount { .. })));
    }

    #[test]
    fn swapped_ballot_signature_breaks_proofs() {
        let (mut ballots, result) = counted();
        ballots[0].signature = "forged".into();
        let report = verify_election_results(&engine(), &ballots, &candidates(), &result);
        assert_eq!(report.mismatch, Some(Mismatch::RoundProof { round: 1 }));
    }

    #[test]
    fn tampered_reason_breaks_merkle_root_or_chain() {
        let (ballots, mut result) = counted();
        result.rounds[1].elimination_reason = "by decree".into();
        let report = verify_election_results(&engine(), &ballots, &candidates(), &result);
        assert_eq!(report.mismatch, Some(Mismatch::RoundChain { round: 2 }));

        // Relink the chain so only the merkle root still disagrees
        for i in 1..result.rounds.len() {
            let previous = result.rounds[i - 1].audit_hash.clone();
            result.rounds[i].audit_hash = result.rounds[i].chain_hash(&previous);
        }
        let report = verify_election_results(&engine(), &ballots, &candidates(), &result);
        assert!(matches!(report.mismatch, Some(Mismatch::MerkleRoot { .. })));
    }

    #[test]
    fn relabelled_constituency_is_reported() {
        let (ballots, mut result) = counted();
        result.constituency_id = "south".into();
        let report = verify_election_results(&engine(), &ballots, &candidates(), &result);
        assert_eq!(
            report.mismatch,
            Some(Mismatch::Constituency {
                expected: "north".into(),
                found: "south".into(),
            })
        );
    }

    #[test]
    fn malformed_ballots_fail_recount() {
        let (mut ballots, result) = counted();
        ballots[3].preferences.clear();
        let report = verify_election_results(&engine(), &ballots, &candidates(), &result);
        assert!(matches!(report.mismatch, Some(Mismatch::RecountFailed { .. })));
    }

    #[test]
    fn merkle_tree_shapes() {
        assert_eq!(MerkleTree::from_leaves(vec![]).root(), hex::encode(empty_root()));

        let leaf = [7u8; 32];
        assert_eq!(MerkleTree::from_leaves(vec![leaf]).root(), hex::encode(leaf));

        // Odd level duplicates its last node
        let (a, b, c) = ([1u8; 32], [2u8; 32], [3u8; 32]);
        let expected = merkle_node(&merkle_node(&a, &b), &merkle_node(&c, &c));
        assert_eq!(
            MerkleTree::from_leaves(vec![a, b, c]).root(),
            hex::encode(expected)
        );
    }

    #[test]
    fn inclusion_proofs_verify() {
        let (_, result) = counted();
        let tree = MerkleTree::from_rounds(&result.rounds);
        assert_eq!(tree.root(), result.merkle_root);

        for (i, round) in result.rounds.iter().enumerate() {
            let path = tree.proof(i).unwrap();
            assert!(verify_inclusion(round, &path, &result.merkle_root));
        }
        assert!(tree.proof(result.rounds.len()).is_none());

        let mut forged = result.rounds[0].clone();
        forged.redistributed_votes += 1;
        let path = tree.proof(0).unwrap();
        assert!(!verify_inclusion(&forged, &path, &result.merkle_root));
    }

    proptest! {
        #[test]
        fn prop_merkle_root_tracks_every_round(index in 0usize..8, delta in 1u64..1000) {
            let (_, result) = counted();
            let index = index % result.rounds.len();
            let mut rounds = result.rounds.clone();
            prop_assert_eq!(merkle_root(&rounds), result.merkle_root.clone());

            let mut changed = rounds[index].clone();
            changed.total_active_votes += delta;
            rounds[index] = changed;
            prop_assert_ne!(merkle_root(&rounds), result.merkle_root.clone());
        }
    }
}
