// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reconciliation of realm deployments.
//!
//! A [`Controller`] consumes [`Notification`]s from a single queue and moves
//! each realm's instances through their lifecycle: new instances are
//! provisioned and probed, the newest ready instance is promoted, and
//! superseded instances are torn down once they no longer serve sessions.
//!
//! [`Notification`]: realm_orchestrator::Notification

pub mod audit;
pub mod client;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod readiness;
pub mod recovery;
pub mod recycle;
pub mod store;
pub mod task;

pub use crate::controller::{Collaborators, Controller, ControllerConfig, Outcome};
pub use crate::error::Error;
