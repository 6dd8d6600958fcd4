// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use realm_orchestrator::StoreError;
use realm_types::RealmId;

/// An error raised while reconciling a realm.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A backend call failed. The notification is retried.
    #[error("backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
    /// The status store failed for a reason other than a write conflict.
    #[error("status store error: {0}")]
    Store(#[source] StoreError),
    /// Every attempt to write a realm's status lost a race with another
    /// writer. The controller can no longer tell what state the realm is in.
    #[error("gave up writing status for realm {realm_id} after {attempts} conflicting attempts")]
    StatusWriteExhausted { realm_id: RealmId, attempts: usize },
    /// State could not be reconstructed at startup.
    #[error("recovery failed: {0:#}")]
    Recovery(#[source] anyhow::Error),
}

impl Error {
    /// Whether the error must stop the controller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StatusWriteExhausted { .. } | Error::Recovery(_))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Error {
        Error::Store(e)
    }
}
