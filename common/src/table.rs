// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A handle identifying a single table compiled into the pipeline.
pub type TblHdl = u32;

#[derive(Error, Debug, Clone)]
pub enum TableError {
    #[error("No such table kind: {0}")]
    NoSuchKind(String),
}

/// The three families of tables the pipeline manager knows how to manage.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// A match-action table: keys select an action and its parameters.
    Match,
    /// An action-data table: indirectly referenced action parameters.
    ActionData,
    /// A selector table: groups of action-data members, one of which is
    /// chosen per packet.
    Selector,
}

// This is the name that will be displayed in the log and presented to the
// user.  It matches the short names used by the compiler's context output.
impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TableKind::Match => "mat",
                TableKind::ActionData => "adt",
                TableKind::Selector => "sel",
            }
        )
    }
}

impl TryFrom<&str> for TableKind {
    type Error = TableError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        let name = name.to_lowercase();
        match name.as_str() {
            "mat" | "match" => Ok(TableKind::Match),
            "adt" | "action_data" => Ok(TableKind::ActionData),
            "sel" | "selector" => Ok(TableKind::Selector),
            _ => Err(TableError::NoSuchKind(name)),
        }
    }
}
