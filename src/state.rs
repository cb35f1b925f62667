use crate::proposal::ProposalNumber;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, io, path::Path};
use tokio::{fs, fs::File, io::AsyncWriteExt};

// The durable record for a single consensus instance (one key). Both fields
// must be written before an acceptor's Prepare/Accept reply is sent, or a
// crash can silently forget a promise and violate safety.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeyState {
    pub promised: Option<ProposalNumber>,
    pub accepted: Option<(ProposalNumber, Vec<u8>)>,
}

// The state of the whole program: one `KeyState` per consensus instance, plus
// the local round counter used to mint this agent's next proposal number.
// [tag:keyed_acceptor_state] multiple independent keys share one acceptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct State {
    pub next_round: u64,
    pub keys: HashMap<Vec<u8>, KeyState>,
}

// Return the state in which the program starts.
pub fn initial() -> State {
    State {
        next_round: 0,
        keys: HashMap::new(),
    }
}

// Write the state to a file, fsyncing before returning so a crash right after
// this call can't lose the promise or acceptance that was just durably
// intended.
pub async fn write(state: &State, path: &Path) -> io::Result<()> {
    // The `unwrap` is safe because serialization of this type never fails.
    let payload = bincode::serialize(state).unwrap();

    // The `unwrap` is safe due to [ref:data_file_path_has_parent].
    let parent = path.parent().unwrap();
    fs::create_dir_all(parent).await?;

    let mut file = File::create(path).await?;
    file.write_all(&payload).await?;
    file.sync_all().await
}

// Read the state from a file.
pub async fn read(path: &Path) -> io::Result<State> {
    let data = fs::read(path).await?;
    bincode::deserialize(&data)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}
