//! # Machine Ledger
//!
//! Append-only record of the clients served in the current indexing epoch,
//! one line per session:
//!
//! ```text
//! <base64 identifier>:<metrics blob>\n
//! ```
//!
//! A lookup rewinds and scans the file line by line. One mutex guards the
//! file and the set of admissions still waiting for their metrics, since the
//! scan and the append share one file handle. The ledger is truncated
//! whenever the index is rebuilt.
//!
//! Admission is two-phase: [`MachineLedger::admit`] reserves the identifier
//! and [`Admission::record`] writes the line once the metrics arrived. An
//! admission dropped without recording releases the reservation, so a client
//! whose session broke before the metrics step may retry.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info, instrument};

use crate::error::{constants, ProtocolError, Result};

/// Client identifier length in bytes
pub const IDENTIFIER_LEN: usize = 32;

/// One parsed ledger line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    pub identifier: String,
    pub metrics: String,
}

struct LedgerState {
    file: File,
    pending: HashSet<String>,
}

/// Served-client ledger backed by a flat file
pub struct MachineLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl MachineLedger {
    /// Open (or create) the ledger file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(LedgerState {
                file,
                pending: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the identifier was recorded in this epoch
    pub fn contains(&self, identifier: &[u8; IDENTIFIER_LEN]) -> Result<bool> {
        let encoded = STANDARD.encode(identifier);
        let mut state = self.lock()?;
        scan(&mut state.file, &encoded)
    }

    /// Reserve the identifier unless it was already served or is being served.
    ///
    /// Returns `None` for a duplicate.
    #[instrument(skip_all)]
    pub fn admit(self: &Arc<Self>, identifier: &[u8; IDENTIFIER_LEN]) -> Result<Option<Admission>> {
        let encoded = STANDARD.encode(identifier);
        let mut state = self.lock()?;
        if state.pending.contains(&encoded) || scan(&mut state.file, &encoded)? {
            debug!(identifier = %encoded, "Identifier already served in this epoch");
            return Ok(None);
        }
        state.pending.insert(encoded.clone());
        Ok(Some(Admission {
            ledger: Arc::clone(self),
            encoded,
            recorded: false,
        }))
    }

    /// Forget every served identifier (start of a new epoch)
    pub fn clear(&self) -> Result<()> {
        self.clear_with(|| Ok(()))
    }

    /// Run `swap` and truncate the ledger inside one critical section.
    ///
    /// No record can land between the two, so every line written after this
    /// returns belongs to the new epoch. If `swap` fails the ledger is left
    /// untouched.
    pub fn clear_with<T, F>(&self, swap: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let state = self.lock()?;
        let swapped = swap()?;
        state.file.set_len(0)?;
        state.file.sync_data()?;
        info!(path = %self.path.display(), "Machine ledger cleared");
        Ok(swapped)
    }

    /// All records of the current epoch
    pub fn records(&self) -> Result<Vec<MachineRecord>> {
        let mut state = self.lock()?;
        state.file.seek(SeekFrom::Start(0))?;
        let mut records = Vec::new();
        for line in BufReader::new(&mut state.file).lines() {
            let line = line?;
            if let Some((identifier, metrics)) = line.split_once(':') {
                records.push(MachineRecord {
                    identifier: identifier.to_string(),
                    metrics: metrics.to_string(),
                });
            }
        }
        Ok(records)
    }

    fn append(&self, encoded: &str, metrics: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        let line = format!("{encoded}:{}\n", escape(metrics));
        let written = state
            .file
            .write_all(line.as_bytes())
            .and_then(|_| state.file.flush());
        state.pending.remove(encoded);
        written?;
        Ok(())
    }

    fn release(&self, encoded: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.pending.remove(encoded);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
    }
}

impl std::fmt::Debug for MachineLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineLedger")
            .field("path", &self.path)
            .finish()
    }
}

/// Reservation for one accepted identifier
#[must_use = "an admission releases its reservation when dropped"]
pub struct Admission {
    ledger: Arc<MachineLedger>,
    encoded: String,
    recorded: bool,
}

impl Admission {
    /// Base64 form written to the ledger
    pub fn identifier(&self) -> &str {
        &self.encoded
    }

    /// Persist the identifier together with the client's metrics blob
    pub fn record(mut self, metrics: &[u8]) -> Result<()> {
        self.recorded = true;
        self.ledger.append(&self.encoded, metrics)
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.recorded {
            self.ledger.release(&self.encoded);
        }
    }
}

/// Rewind and look for a line recorded for `encoded`
fn scan(file: &mut File, encoded: &str) -> Result<bool> {
    file.seek(SeekFrom::Start(0))?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line
            .split_once(':')
            .is_some_and(|(identifier, _)| identifier == encoded)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Keep one record per line whatever the blob contains
fn escape(metrics: &[u8]) -> String {
    String::from_utf8_lossy(metrics)
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}
