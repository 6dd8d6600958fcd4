// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The route file through which clients find a realm's latest instance.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use realm_types::{InstanceKey, RealmId};
use serde::{Deserialize, Serialize};

use crate::write_atomically;

/// Where the traffic of a realm goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub instance: InstanceKey,
    pub addresses: Vec<String>,
}

/// A JSON file mapping realm ids to routes. Every update replaces the whole
/// file, so readers see either the old or the new route.
#[derive(Debug)]
pub struct RouteFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RouteFile {
    pub fn new(path: impl Into<PathBuf>) -> RouteFile {
        RouteFile {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> io::Result<BTreeMap<RealmId, Route>> {
        match std::fs::read(&self.path) {
            Ok(contents) => Ok(serde_json::from_slice(&contents)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    pub fn set(&self, realm_id: &RealmId, route: Route) -> io::Result<()> {
        self.update(|routes| {
            routes.insert(realm_id.clone(), route);
        })
    }

    pub fn remove(&self, realm_id: &RealmId) -> io::Result<()> {
        self.update(|routes| {
            routes.remove(realm_id);
        })
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<RealmId, Route>)) -> io::Result<()> {
        let _guard = self.lock.lock().expect("lock poisoned");
        let mut routes = self.read()?;
        f(&mut routes);
        write_atomically(&self.path, &serde_json::to_vec_pretty(&routes)?)
    }
}
