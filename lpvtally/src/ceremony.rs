use crate::*;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The human-in-the-loop step where trustees hand over key shares.
///
/// Blocks until `threshold` valid shares have arrived or the timeout elapses. Shares from unknown
/// trustees, with bad signatures, or repeated by the same trustee are discarded.
#[derive(Debug, Clone)]
pub struct DecryptionCeremony {
    trustees: Vec<Trustee>,
    threshold: u8,
    timeout: Duration,
}

impl DecryptionCeremony {
    pub fn new(trustees: Vec<Trustee>, threshold: u8, timeout: Duration) -> Result<Self, Error> {
        if threshold == 0 || trustees.len() < threshold as usize {
            return Err(Error::InvalidThreshold {
                threshold,
                trustees: trustees.len(),
            });
        }
        Ok(DecryptionCeremony {
            trustees,
            threshold,
            timeout,
        })
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn trustees(&self) -> &[Trustee] {
        &self.trustees
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn check(&self, share: &KeyShare, collected: &HashMap<Uuid, KeyShare>) -> Result<(), Error> {
        let trustee = self
            .trustees
            .iter()
            .find(|t| t.id == share.trustee_id)
            .ok_or_else(|| {
                Error::InvalidKeyShare(format!("unknown trustee {}", share.trustee_id))
            })?;

        if collected.contains_key(&trustee.id) {
            return Err(Error::InvalidKeyShare(format!(
                "trustee {} already submitted",
                trustee.id
            )));
        }

        if !share.verify(trustee) {
            return Err(Error::InvalidKeyShare(format!(
                "bad signature from trustee {}",
                trustee.id
            )));
        }

        Ok(())
    }

    /// Collect shares until the threshold is met
    pub fn collect(&self, shares: &Receiver<KeyShare>) -> Result<Vec<KeyShare>, Error> {
        let deadline = Instant::now().checked_add(self.timeout);
        let required = self.threshold as usize;
        let mut collected: HashMap<Uuid, KeyShare> = HashMap::new();

        while collected.len() < required {
            let received = match deadline {
                Some(deadline) => {
                    shares.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                // Deadline past what an Instant can hold: wait until every sender is gone
                None => shares.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let share = match received {
                Ok(share) => share,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    warn!(
                        "decryption ceremony ended with {} of {} shares",
                        collected.len(),
                        required
                    );
                    return Err(Error::CeremonyTimeout {
                        collected: collected.len(),
                        required,
                    });
                }
            };

            match self.check(&share, &collected) {
                Ok(()) => {
                    info!(
                        "accepted key share from trustee {} ({} of {})",
                        share.trustee_id,
                        collected.len() + 1,
                        required
                    );
                    collected.insert(share.trustee_id, share);
                }
                Err(e) => warn!("{}", e),
            }
        }

        // Order by trustee list so reconstruction input is stable
        Ok(self
            .trustees
            .iter()
            .filter_map(|t| collected.remove(&t.id))
            .collect())
    }

    /// Collect shares and rebuild the decryption capability
    pub fn run<D: ThresholdDecryptor + ?Sized>(
        &self,
        shares: &Receiver<KeyShare>,
        decryptor: &D,
    ) -> Result<(DecryptionCapability, Vec<Uuid>), Error> {
        let shares = self.collect(shares)?;
        let capability = decryptor.reconstruct(&shares)?;
        Ok((capability, shares.iter().map(|s| s.trustee_id).collect()))
    }
}
