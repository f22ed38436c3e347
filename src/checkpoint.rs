//! Generation checkpoints.
//!
//! The current format is an 8 byte magic, a little-endian `u16` format
//! version and a bincode body holding the generation counter and every
//! agent. Older runs pickled a `{'traders': [...], 'generation': g}` dict;
//! those files still load, as do JSON snapshots shaped either as that dict or
//! as a `[generation, [agents]]` pair.

use crate::agent::{Agent, SerializedAgent};
use crate::evolution::Population;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"EVOCKPT\0";
pub const CHECKPOINT_VERSION: u16 = 2;
const HEADER_LEN: usize = CHECKPOINT_MAGIC.len() + 2;
/// Opcode opening every pickle of protocol 2 and later.
const PICKLE_PROTO: u8 = 0x80;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed on `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    /// Unreadable payload, unknown layout or an agent that fails validation.
    #[error("Checkpoint `{path}` is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("Could not encode checkpoint: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

#[derive(Serialize, Deserialize, Debug)]
struct CheckpointBody {
    generation: u64,
    agents: Vec<SerializedAgent>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyCheckpoint {
    Keyed {
        generation: u64,
        traders: Vec<SerializedAgent>,
    },
    Positional(u64, Vec<SerializedAgent>),
}

/// A restored population together with the counter it was saved under.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub generation: usize,
    pub agents: Vec<Agent>,
}

/// Reads and writes the checkpoint file of one simulation directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Atomically replaces the checkpoint with `population` stored under
    /// `generation`. Wallets and trade histories are not part of the
    /// contract; callers reset wallets before saving.
    pub fn save(&self, generation: usize, population: &Population) -> Result<(), CheckpointError> {
        let body = CheckpointBody {
            generation: generation as u64,
            agents: population.agents().iter().map(Agent::serialize).collect(),
        };
        let encoded = bincode::serde::encode_to_vec(&body, bincode::config::standard())?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + encoded.len());
        bytes.extend_from_slice(CHECKPOINT_MAGIC);
        bytes.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&encoded);

        write_atomic(&self.path, &bytes).map_err(|source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(
            "Saved generation {} ({} agents) to {}",
            generation,
            body.agents.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let bytes = fs::read(&self.path).map_err(|source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        })?;
        let (generation, serialized) = self.decode(&bytes)?;
        if serialized.is_empty() {
            return Err(self.corrupt("checkpoint holds no agents"));
        }

        let agents = serialized
            .iter()
            .enumerate()
            .map(|(i, data)| {
                Agent::deserialize(data).map_err(|e| self.corrupt(&format!("agent {i}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let generation =
            usize::try_from(generation).map_err(|_| self.corrupt("generation counter overflows"))?;
        info!(
            "Loaded generation {} ({} agents) from {}",
            generation,
            agents.len(),
            self.path.display()
        );
        Ok(Checkpoint { generation, agents })
    }

    fn decode(&self, bytes: &[u8]) -> Result<(u64, Vec<SerializedAgent>), CheckpointError> {
        if let Some(rest) = bytes.strip_prefix(CHECKPOINT_MAGIC.as_slice()) {
            let (version, body) = rest
                .split_first_chunk::<2>()
                .ok_or_else(|| self.corrupt("truncated header"))?;
            let version = u16::from_le_bytes(*version);
            if version != CHECKPOINT_VERSION {
                return Err(self.corrupt(&format!("unsupported format version {version}")));
            }
            let (body, read): (CheckpointBody, usize) =
                bincode::serde::decode_from_slice(body, bincode::config::standard())
                    .map_err(|e| self.corrupt(&e.to_string()))?;
            if read != body_len(bytes) {
                return Err(self.corrupt("trailing bytes after checkpoint body"));
            }
            return Ok((body.generation, body.agents));
        }

        let (layout, legacy) = if bytes.first() == Some(&PICKLE_PROTO) {
            let legacy: LegacyCheckpoint =
                serde_pickle::from_slice(bytes, serde_pickle::DeOptions::new())
                    .map_err(|e| self.corrupt(&format!("unreadable pickle: {e}")))?;
            ("pickle", legacy)
        } else {
            let legacy = serde_json::from_slice::<LegacyCheckpoint>(bytes)
                .map_err(|_| self.corrupt("unrecognized checkpoint layout"))?;
            ("JSON", legacy)
        };
        warn!(
            "{} uses the legacy {} layout; it will be rewritten in the current format on the next save",
            self.path.display(),
            layout
        );
        Ok(match legacy {
            LegacyCheckpoint::Keyed {
                generation,
                traders,
            } => (generation, traders),
            LegacyCheckpoint::Positional(generation, traders) => (generation, traders),
        })
    }

    fn corrupt(&self, reason: &str) -> CheckpointError {
        CheckpointError::Corrupt {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

fn body_len(bytes: &[u8]) -> usize {
    bytes.len() - HEADER_LEN
}

/// Writes `bytes` next to `path`, syncs, then renames over `path`, so readers
/// only ever see the old or the new content.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)
}
