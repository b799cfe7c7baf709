use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use super::IoError;
use crate::types::Reconstruction;

/// Write any serializable value as pretty JSON.
pub fn write_json<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<(), IoError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Read a JSON file into a value.
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, IoError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

/// Write a reconstruction: one pose per camera, the calibrations and every track with
/// its point and observations.
pub fn write_reconstruction(path: impl AsRef<Path>, rec: &Reconstruction) -> Result<(), IoError> {
    write_json(path, rec)
}

/// Read a reconstruction written by [`write_reconstruction`].
pub fn read_reconstruction(path: impl AsRef<Path>) -> Result<Reconstruction, IoError> {
    read_json(path)
}
