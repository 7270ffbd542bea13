// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use sha2::Digest;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::{fs, io};
use tracing::trace;

pub(crate) fn init_path<P: AsRef<Path>>(path: P) -> Result<(), HostvisorError> {
    let path = path.as_ref();
    trace!("initialising {}", path.display());

    fs::create_dir_all(path).map_err(|source| HostvisorError::PathInitFailure {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn calculate_file_checksum<D: Digest, P: AsRef<Path>>(
    filepath: P,
) -> Result<Vec<u8>, io::Error> {
    let file = File::open(filepath)?;
    let mut reader = BufReader::new(file);

    let mut hasher = D::new();
    let mut buf = vec![0; 4096];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])
    }

    Ok(hasher.finalize().to_vec())
}

/// Writes `contents` to a sibling temporary file and renames it over `path`,
/// so readers never observe a half-written file.
pub(crate) fn write_atomically<P: AsRef<Path>>(path: P, contents: &[u8]) -> Result<(), io::Error> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Sha256;

    #[test]
    fn atomic_write_replaces_previous_contents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("nested").join("file.json");

        write_atomically(&target, b"first")?;
        write_atomically(&target, b"second")?;

        assert_eq!(fs::read(&target)?, b"second");
        // no leftover temporary files
        assert_eq!(fs::read_dir(dir.path().join("nested"))?.count(), 1);
        Ok(())
    }

    #[test]
    fn checksum_of_known_content() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("data");
        fs::write(&target, b"abc")?;

        let checksum = calculate_file_checksum::<Sha256, _>(&target)?;
        assert_eq!(
            hex::encode(checksum),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }
}
