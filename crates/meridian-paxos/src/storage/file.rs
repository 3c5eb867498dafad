//! File-backed state log.
//!
//! Each round lives in its own file named by its zero-padded sequence
//! number, so file name order is sequence order:
//!
//! ```text
//! <dir>/
//! ├── 00000000000000000001
//! ├── 00000000000000000002
//! └── 00000000000000000003
//! ```
//!
//! Writes go to a `.tmp` sibling first and are renamed into place after
//! a sync, so a crash leaves either the old round or the new one, never
//! a torn file.

use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::PaxosStateLog;
use crate::{PaxosError, PaxosResult, SequenceNumber};

const TMP_SUFFIX: &str = ".tmp";

/// A [`PaxosStateLog`] with one file per round.
#[derive(Debug)]
pub struct FileStateLog<T> {
    dir: PathBuf,
    _state: PhantomData<fn() -> T>,
}

impl<T> FileStateLog<T> {
    /// Opens a log in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// `Io` when the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> PaxosResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _state: PhantomData,
        })
    }

    fn round_path(&self, seq: SequenceNumber) -> PathBuf {
        self.dir.join(format!("{seq:020}"))
    }

    /// Sequences present on disk, unordered. Temp files and foreign
    /// names are skipped with a warning.
    fn list_sequences(&self) -> PaxosResult<Vec<SequenceNumber>> {
        let mut sequences = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            match name.parse::<SequenceNumber>() {
                Ok(seq) => sequences.push(seq),
                Err(_) => {
                    warn!(file = name, "ignoring unrecognized file in paxos log directory");
                }
            }
        }
        Ok(sequences)
    }
}

impl<T> PaxosStateLog<T> for FileStateLog<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn write_round(&self, seq: SequenceNumber, state: &T) -> PaxosResult<()> {
        let encoded =
            bincode::serialize(state).map_err(|e| PaxosError::serialization(e.to_string()))?;

        let path = self.round_path(seq);
        let tmp = self.dir.join(format!("{seq:020}{TMP_SUFFIX}"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_round(&self, seq: SequenceNumber) -> PaxosResult<Option<T>> {
        let path = self.round_path(seq);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = bincode::deserialize(&bytes).map_err(|e| {
            PaxosError::corruption(format!("round file {} unreadable: {e}", path.display()))
        })?;
        Ok(Some(state))
    }

    fn greatest_round(&self) -> PaxosResult<Option<SequenceNumber>> {
        Ok(self.list_sequences()?.into_iter().max())
    }

    fn read_rounds_since(&self, from: SequenceNumber) -> PaxosResult<Vec<(SequenceNumber, T)>> {
        let mut sequences = self.list_sequences()?;
        sequences.retain(|&seq| seq >= from);
        sequences.sort_unstable();

        let mut rounds = Vec::with_capacity(sequences.len());
        for seq in sequences {
            if let Some(state) = self.read_round(seq)? {
                rounds.push((seq, state));
            }
        }
        Ok(rounds)
    }
}
