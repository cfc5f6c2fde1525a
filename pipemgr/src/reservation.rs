// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Exclusive per-table write reservations.
//!
//! A session reserves each table (or, for an asymmetric table, each pipe of
//! it) that it mutates.  The reservation is held for a single call, or for a
//! whole transaction or batch, and no other session may mutate the same
//! table and pipe scope until it is released.

use std::collections::BTreeMap;

use common::table::TblHdl;
use common::{DevId, PipeScope, SessHdl};

use crate::types::{PipeError, PipeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    dev: DevId,
    tbl: TblHdl,
    pipe: PipeScope,
}

#[derive(Debug, Default)]
pub struct Reservations {
    owners: BTreeMap<Slot, SessHdl>,
}

impl Reservations {
    pub fn new() -> Self {
        Reservations::default()
    }

    /// Reserve a table's pipe scope for a session.  Returns true if the
    /// reservation is new, false if the session already held it.
    pub fn acquire(
        &mut self,
        sess: SessHdl,
        dev: DevId,
        tbl: TblHdl,
        pipe: PipeScope,
    ) -> PipeResult<bool> {
        // A reservation of every pipe overlaps a reservation of any one
        // pipe.
        for (slot, owner) in self.owners.range(
            Slot {
                dev,
                tbl,
                pipe: PipeScope::All,
            }..=Slot {
                dev,
                tbl,
                pipe: PipeScope::Pipe(u8::MAX),
            },
        ) {
            let overlaps = slot.pipe == pipe
                || slot.pipe == PipeScope::All
                || pipe == PipeScope::All;
            if overlaps && *owner != sess {
                return Err(PipeError::TableLocked {
                    tbl,
                    pipe: slot.pipe,
                    owner: *owner,
                });
            }
        }
        Ok(self.owners.insert(Slot { dev, tbl, pipe }, sess).is_none())
    }

    /// Release everything held by a session, returning how many
    /// reservations were dropped.
    pub fn release_all(&mut self, sess: SessHdl) -> usize {
        let before = self.owners.len();
        self.owners.retain(|_, owner| *owner != sess);
        before - self.owners.len()
    }

    /// Returns true if any session holds a reservation on the device.
    pub fn device_held(&self, dev: DevId) -> bool {
        self.owners.keys().any(|slot| slot.dev == dev)
    }
}
