// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fs::OpenOptions;
use std::io::{BufReader, Write};
use std::path::Path;
use std::{fmt, io};

use realm_types::{InstanceKey, RealmSpec};
use serde::{Deserialize, Serialize};

/// What a restarted operator needs to bring an instance back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub key: InstanceKey,
    pub namespace: String,
    pub spec: RealmSpec,
    /// The port of each replica, by replica index.
    pub ports: Vec<u16>,
}

#[derive(Debug)]
pub struct InstanceMetadataFile<P: AsRef<Path>> {
    path: P,
}

impl<P: AsRef<Path>> InstanceMetadataFile<P> {
    /// Attempts to open and write the specified instance metadata file.
    pub fn open(path: P, metadata: &InstanceMetadata) -> Result<InstanceMetadataFile<P>, Error> {
        let metadata = serde_json::to_string(metadata).map_err(Error::Malformed)?;
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&path)?;
        write!(file, "{metadata}")?;
        file.sync_all()?;
        Ok(InstanceMetadataFile { path })
    }

    /// Reads the contents of an instance metadata file.
    pub fn read(path: P) -> Result<InstanceMetadata, Error> {
        let file = OpenOptions::new().read(true).open(path)?;
        serde_json::from_reader(BufReader::new(file)).map_err(Error::Malformed)
    }

    pub fn path(&self) -> &Path {
        self.path.as_ref()
    }
}

#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(io::Error),
    /// The file did not hold instance metadata.
    Malformed(serde_json::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "unable to access instance metadata file: {}", e),
            Error::Malformed(e) => write!(f, "malformed instance metadata file: {}", e),
        }
    }
}

impl std::error::Error for Error {}
