use std::sync::{Arc, Mutex};

use signer::Leader;
use signer::sign_state::SignStateConsensus;
use types::errors::SignerError;

/// Shared election cell: which cosigner id currently leads, if any.
/// Validators are identified by id only; the cell never holds a reference
/// into a validator.
#[derive(Default)]
pub struct ElectionCell {
    elected: Mutex<Option<u8>>,
}

impl ElectionCell {
    pub fn set(&self, id: Option<u8>) {
        *self.elected.lock().unwrap() = id;
    }

    fn get(&self) -> Option<u8> {
        *self.elected.lock().unwrap()
    }
}

pub struct MockLeader {
    id: u8,
    election: Arc<ElectionCell>,
    pub shared: Mutex<Vec<(String, SignStateConsensus)>>,
}

impl MockLeader {
    pub fn new(id: u8, election: Arc<ElectionCell>) -> Self {
        Self {
            id,
            election,
            shared: Mutex::new(Vec::new()),
        }
    }

    /// A leader handle that always leads, for single-validator tests.
    pub fn fixed(id: u8) -> Self {
        let election = Arc::new(ElectionCell::default());
        election.set(Some(id));
        Self::new(id, election)
    }
}

impl Leader for MockLeader {
    fn is_leader(&self) -> bool {
        self.election.get() == Some(self.id)
    }

    fn share_signed(&self, chain_id: &str, entry: &SignStateConsensus) -> Result<(), SignerError> {
        self.shared
            .lock()
            .unwrap()
            .push((chain_id.to_string(), entry.clone()));
        Ok(())
    }
}
