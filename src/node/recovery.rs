//! The crash note.
//!
//! When a round fails, the failure notice is also written to a well-known
//! file before the node trips into `Error`. The next process reads the note
//! on startup, removes it, and logs what the previous incarnation died on,
//! so an operator restart never silently swallows the cause.

use std::{fs, io, path::Path};

use displaydoc::Display;
use thiserror::Error;

use crate::node::transport::RoundErrorMsg;

#[derive(Debug, Display, Error)]
/// An error produced while reading or writing the crash note.
pub enum RecoveryError {
    /// crash note io failed: {0}
    Io(#[from] io::Error),
    /// crash note encoding failed: {0}
    Encoding(#[from] bincode::Error),
}

/// Writes the note, replacing any previous one.
pub fn write(path: &Path, message: &RoundErrorMsg) -> Result<(), RecoveryError> {
    let encoded = bincode::serialize(message)?;
    fs::write(path, encoded)?;
    Ok(())
}

/// Reads and removes the note. `None` when no note exists.
pub fn take(path: &Path) -> Result<Option<RoundErrorMsg>, RecoveryError> {
    let encoded = match fs::read(path) {
        Ok(encoded) => encoded,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    fs::remove_file(path)?;
    Ok(Some(bincode::deserialize(&encoded)?))
}
