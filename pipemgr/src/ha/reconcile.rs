// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Turning a populated spec map into the move list that converges a table
//! instance with its replayed state.

use slog::{debug, warn, Logger};

use common::table::TableKind;
use common::PipeScope;

use super::spec_map::{Classification, SpecMap, Worklist};
use super::ResourceMismatch;
use crate::move_list::{EntryData, MoveList};
use crate::table::{TableOwner, TableRequest};
use crate::types::{PipeError, PipeResult};

/// What reconciling one table instance did.
#[derive(Debug, Default)]
pub struct Outcome {
    pub moves: MoveList,
    /// Entries remapped from a temporary handle to a replayed one
    pub remapped: usize,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub default_changed: bool,
    pub mismatches: Vec<ResourceMismatch>,
}

/// Drain a spec map into the owner.  The owner's state is brought in line
/// with the replayed entries, and the returned move list describes the
/// hardware changes needed to match it.
///
/// Every entry present on both sides is first renamed from its temporary
/// handle to its replayed handle.  The worklists are then drained in the
/// table's configured order.
pub fn reconcile(
    log: &Logger,
    owner: &mut dyn TableOwner,
    pipe: PipeScope,
    map: &SpecMap,
) -> PipeResult<Outcome> {
    let mut out = Outcome::default();
    let info = owner.info().clone();

    for list in [Worklist::FullMatch, Worklist::Modify] {
        for entry in map.list(list) {
            let (Some(hw), Some(replay)) = (&entry.hw, &entry.replay) else {
                return Err(PipeError::Other(format!(
                    "{list:?} entry lacks a side"
                )));
            };
            owner.update(pipe, hw.hdl, replay.hdl)?;
            out.remapped += 1;

            if entry.class == Classification::ResourceMismatch {
                let (EntryData::Mat(old), EntryData::Mat(new)) =
                    (&hw.data, &replay.data)
                else {
                    continue;
                };
                warn!(log, "direct resources differ from replay";
                    "table" => &info.name,
                    "pipe" => %pipe,
                    "hdl" => replay.hdl,
                    "hw" => ?old.spec.resources,
                    "replay" => ?new.spec.resources);
                out.mismatches.push(ResourceMismatch {
                    table: info.name.clone(),
                    pipe,
                    hdl: replay.hdl,
                    key: new.key.clone(),
                    hw: old.spec.resources.clone(),
                    replay: new.spec.resources.clone(),
                });
            }
        }
    }

    for list in &info.reconcile_order {
        for entry in map.list(*list) {
            let moves = match (list, &entry.hw, &entry.replay) {
                (Worklist::Delete, Some(hw), None) => {
                    out.deleted += 1;
                    owner.delete(pipe, hw.hdl)?
                }
                // One modify rewrites the whole action, function and
                // data together, so all three dirty classes share it.
                (Worklist::Modify, Some(_), Some(replay)) => {
                    out.modified += 1;
                    owner.modify(pipe, replay.hdl, replay.data.clone())?
                }
                (Worklist::Add, None, Some(replay)) => {
                    out.added += 1;
                    owner.place_with_handle(
                        pipe,
                        replay.hdl,
                        replay.data.clone(),
                    )?
                }
                _ => {
                    return Err(PipeError::Other(format!(
                        "{list:?} entry {:?} is on the wrong list",
                        entry.class
                    )))
                }
            };
            out.moves.append(moves)?;
        }
    }

    // The static default applies whenever the replay did not set one.
    let desired = map
        .replay_default()
        .cloned()
        .or_else(|| info.default_action.clone());
    if info.kind == TableKind::Match && desired.as_ref() != map.hw_default() {
        let req = match map.replay_default() {
            Some(action) => TableRequest::MatSetDefault {
                action: action.clone(),
            },
            None => TableRequest::MatClearDefault,
        };
        let produced = owner.produce(pipe, req)?;
        out.moves.append(produced.moves)?;
        out.default_changed = true;
    }

    debug!(log, "reconciled table";
        "table" => &info.name,
        "pipe" => %pipe,
        "remapped" => out.remapped,
        "added" => out.added,
        "modified" => out.modified,
        "deleted" => out.deleted,
        "moves" => out.moves.len());
    Ok(out)
}
