// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use crate::helpers::write_atomically;
use crate::ports::ServiceEndpoints;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration handed to the backend through the `--config` argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfigFile {
    pub ports: ServiceEndpoints,
    pub directories: Directories,
    pub flags: Flags,
    pub instance: Instance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directories {
    pub resources: PathBuf,
    pub execution: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub allow_remote_in_mcp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub install_id: String,
    pub host_version: String,
    pub backend_version: String,
}

impl BackendConfigFile {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), HostvisorError> {
        let path = path.as_ref();
        let serialised = serde_json::to_vec_pretty(self)?;
        write_atomically(path, &serialised).map_err(|source| {
            HostvisorError::BackendConfigWriteFailure {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}
