// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! ASIC backends for the pipeline manager.
//!
//! The only backend provided is a software model of the pipeline's table
//! memories.  It executes pushed instruction lists against in-memory tables,
//! keeps those tables across a warm device re-add so that a restarted
//! control plane can read them back, and can be configured to fail any
//! operation with a given probability.

pub mod chaos;
pub mod model;

pub use chaos::AsicConfig;
pub use chaos::Chaos;
pub use chaos::DeviceChaos;
pub use chaos::TableChaos;
pub use model::Handle;
