// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

/// Clients describe table keys and actions using their own Rust types, e.g.:
///     struct RouteKey {
///         dst: Ipv4Addr,
///         vlan: u16,
///     }
///     enum RouteAction {
///         Forward { port: u16 },
///         Drop,
///     }
/// Those types mean nothing to the pipeline manager or to the ASIC.  Before a
/// request enters the table-management core it is converted into the
/// intermediate representation defined here, via the `MatchParse` and
/// `ActionParse` traits.  Every layer below the client API (move lists, the
/// instruction log, the reconciliation spec map, and the per-chip encoders)
/// only ever sees this representation.
///
/// Reconciliation after a restart needs to decide whether two keys read from
/// different sources are "the same".  The `normalized()` methods produce a
/// canonical byte string for that comparison: field order, integer width,
/// and don't-care bits under a mask do not affect the result.
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::convert::TryInto;
use std::net::Ipv4Addr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::AsicError;
use crate::AsicResult;
use crate::CounterData;

/// The intermediate representation of a single field in a Match key
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct MatchEntryField {
    pub name: String,
    pub value: MatchEntryValue,
}

/// The intermediate representation of a Match key
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct MatchData {
    pub fields: Vec<MatchEntryField>,
}

impl MatchData {
    pub fn field_by_name<'a>(
        &'a self,
        field: &str,
    ) -> AsicResult<&'a MatchEntryField> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .ok_or(AsicError::Internal(format!("no such field: {field}")))
    }

    /// Convenience constructor for an all-exact key.
    pub fn exact<I, S, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<ValueTypes>,
    {
        MatchData {
            fields: fields
                .into_iter()
                .map(|(name, v)| MatchEntryField {
                    name: name.into(),
                    value: MatchEntryValue::Value(v.into()),
                })
                .collect(),
        }
    }

    /// Return the canonical byte encoding of this key.
    pub fn normalized(&self) -> Vec<u8> {
        let mut sorted: Vec<&MatchEntryField> = self.fields.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = Vec::new();
        for field in sorted {
            push_chunk(&mut out, field.name.as_bytes());
            field.value.normalize_into(&mut out);
        }
        out
    }
}

/// The MatchParse trait defines the behavior needed to convert a high-level
/// Match field into our intermediate representation.
pub trait MatchParse {
    /// Return all the names and values of the key fields as strings
    fn key_values(&self) -> BTreeMap<String, String>;
    /// Convert the key Struct to a MatchData struct
    fn key_to_ir(&self) -> AsicResult<MatchData>;
    /// Convert a MatchData struct back into the original match key format
    fn ir_to_key(matchdata: &MatchData) -> AsicResult<Self>
    where
        Self: Sized;
}

/// The intermediate representation of a table Action, along with the arguments
/// for that Action.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct ActionData {
    pub action: String,
    pub args: Vec<ActionArg>,
}

impl ActionData {
    pub fn new(action: impl Into<String>) -> Self {
        ActionData {
            action: action.into(),
            args: Vec::new(),
        }
    }

    /// Builder-style helper for attaching an argument.
    pub fn arg(mut self, name: impl Into<String>, v: impl Into<ValueTypes>) -> Self {
        self.args.push(ActionArg {
            name: name.into(),
            value: v.into(),
        });
        self
    }

    pub fn arg_by_name<'a>(&'a self, arg: &str) -> AsicResult<&'a ActionArg> {
        self.args
            .iter()
            .find(|a| a.name == arg)
            .ok_or(AsicError::Internal(format!("no such argument: {arg}")))
    }

    /// Canonical encoding of the argument values alone, without the action
    /// name.  Two actions with equal parameter bytes differ at most in which
    /// action function consumes them.
    pub fn normalized_args(&self) -> Vec<u8> {
        let mut sorted: Vec<&ActionArg> = self.args.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = Vec::new();
        for arg in sorted {
            push_chunk(&mut out, arg.name.as_bytes());
            push_chunk(&mut out, &arg.value.trimmed_be_bytes());
        }
        out
    }

    /// Canonical encoding of the action function and its arguments.
    pub fn normalized(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_chunk(&mut out, self.action.as_bytes());
        out.extend(self.normalized_args());
        out
    }
}

/// The intermediate representation of a single argument to an Action
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct ActionArg {
    pub name: String,
    pub value: ValueTypes,
}

/// The ActionParse trait defines the behavior needed to convert a high-level
/// Action Enum into our intermediate representation.
pub trait ActionParse {
    /// Return the name of the action as a string
    fn action_name(&self) -> String;
    /// Return the names and values of the arguments to the action as a vector
    /// of strings
    fn action_args(&self) -> BTreeMap<String, String>;
    /// Convert an Action enum into the ActionData format
    fn action_to_ir(&self) -> AsicResult<ActionData>;
    /// Convert and ActionData struct back into the original Action enum
    fn ir_to_action(actiondata: &ActionData) -> AsicResult<Self>
    where
        Self: Sized;
}

/// The contents of a single field in a Match key
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MatchEntryValue {
    Value(ValueTypes),
    Lpm(MatchLpm),
    Range(MatchRange),
    Mask(MatchMask),
}

impl MatchEntryValue {
    fn normalize_into(&self, out: &mut Vec<u8>) {
        match self {
            MatchEntryValue::Value(v) => {
                out.push(b'v');
                push_chunk(out, &v.trimmed_be_bytes());
            }
            MatchEntryValue::Lpm(lpm) => {
                out.push(b'l');
                out.extend(lpm.len.to_be_bytes());
                push_chunk(out, &lpm.masked_prefix().trimmed_be_bytes());
            }
            MatchEntryValue::Range(r) => {
                out.push(b'r');
                out.extend(r.low.to_be_bytes());
                out.extend(r.high.to_be_bytes());
            }
            MatchEntryValue::Mask(m) => {
                // Bits outside the mask never take part in a lookup, so they
                // must not distinguish two otherwise-identical keys.
                out.push(b'm');
                out.extend((m.val & m.mask).to_be_bytes());
                out.extend(m.mask.to_be_bytes());
            }
        }
    }
}

// Every variable-length piece is length-prefixed so that adjacent pieces can
// never be confused with one another.
fn push_chunk(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend((bytes.len() as u32).to_be_bytes());
    out.extend(bytes);
}

// Build the code to extract an exact value from a MatchEntryValue
macro_rules! unwrap_value_entry {
    ($t:ident) => {
        impl TryFrom<&MatchEntryValue> for $t {
            type Error = String;

            fn try_from(m: &MatchEntryValue) -> Result<Self, Self::Error> {
                match m {
                    MatchEntryValue::Value(v) => {
                        v.try_into().map_err(|e| format!("{e:?}"))
                    }
                    x => Err(format!("Expected Value, found {x:?}")),
                }
            }
        }
    };
}

impl From<Ipv4Addr> for ValueTypes {
    fn from(v: Ipv4Addr) -> ValueTypes {
        ValueTypes::U64(u32::from(v) as u64)
    }
}

impl TryFrom<&ValueTypes> for Ipv4Addr {
    type Error = &'static str;

    fn try_from(v: &ValueTypes) -> Result<Self, Self::Error> {
        u32::try_from(v).map(Ipv4Addr::from)
    }
}

unwrap_value_entry!(Ipv4Addr);

impl From<Vec<u8>> for ValueTypes {
    fn from(v: Vec<u8>) -> ValueTypes {
        ValueTypes::Ptr(v)
    }
}

impl From<u128> for ValueTypes {
    fn from(v: u128) -> ValueTypes {
        ValueTypes::Ptr(v.to_be_bytes().to_vec())
    }
}

impl TryFrom<&ValueTypes> for u128 {
    type Error = &'static str;

    fn try_from(v: &ValueTypes) -> Result<Self, Self::Error> {
        let bytes = v.trimmed_be_bytes();
        if bytes.len() > 16 {
            return Err("value wider than 128 bits");
        }
        let mut buf = [0u8; 16];
        buf[16 - bytes.len()..].copy_from_slice(&bytes);
        Ok(u128::from_be_bytes(buf))
    }
}

impl From<u64> for ValueTypes {
    fn from(v: u64) -> ValueTypes {
        ValueTypes::U64(v)
    }
}

impl TryFrom<&ValueTypes> for u64 {
    type Error = &'static str;

    fn try_from(v: &ValueTypes) -> Result<Self, Self::Error> {
        match v {
            ValueTypes::U64(v) => Ok(*v),
            ValueTypes::Ptr(_) => {
                let wide = u128::try_from(v)?;
                u64::try_from(wide).map_err(|_| "value not 64 bits")
            }
        }
    }
}

unwrap_value_entry!(u64);

impl From<u32> for ValueTypes {
    fn from(v: u32) -> ValueTypes {
        ValueTypes::U64(v as u64)
    }
}

impl TryFrom<&ValueTypes> for u32 {
    type Error = &'static str;

    fn try_from(v: &ValueTypes) -> Result<Self, Self::Error> {
        let v = u64::try_from(v)?;
        u32::try_from(v).map_err(|_| "value not 32 bits")
    }
}

unwrap_value_entry!(u32);

impl From<u16> for ValueTypes {
    fn from(v: u16) -> ValueTypes {
        ValueTypes::U64(v as u64)
    }
}

impl TryFrom<&ValueTypes> for u16 {
    type Error = &'static str;

    fn try_from(v: &ValueTypes) -> Result<Self, Self::Error> {
        let v = u64::try_from(v)?;
        u16::try_from(v).map_err(|_| "value not 16 bits")
    }
}

unwrap_value_entry!(u16);

impl From<u8> for ValueTypes {
    fn from(v: u8) -> ValueTypes {
        ValueTypes::U64(v as u64)
    }
}

impl TryFrom<&ValueTypes> for u8 {
    type Error = &'static str;

    fn try_from(v: &ValueTypes) -> Result<Self, Self::Error> {
        let v = u64::try_from(v)?;
        u8::try_from(v).map_err(|_| "value not 8 bits")
    }
}

impl From<bool> for ValueTypes {
    fn from(v: bool) -> ValueTypes {
        ValueTypes::U64(match v {
            false => 0,
            true => 1,
        })
    }
}

#[derive(
    Debug, Hash, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ValueTypes {
    U64(u64),
    Ptr(Vec<u8>),
}

impl ValueTypes {
    /// The big-endian bytes of the value with leading zeroes removed, so a
    /// value has one encoding regardless of the width it was supplied with.
    pub fn trimmed_be_bytes(&self) -> Vec<u8> {
        let bytes = match self {
            ValueTypes::U64(v) => v.to_be_bytes().to_vec(),
            ValueTypes::Ptr(v) => v.clone(),
        };
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        bytes[first..].to_vec()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct MatchRange {
    pub low: u64,
    pub high: u64,
}

impl std::fmt::Display for MatchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

#[derive(
    Debug,
    Hash,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct MatchMask {
    pub val: u64,
    pub mask: u64,
}

impl std::fmt::Display for MatchMask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:x}/0x{:x}", self.val, self.mask)
    }
}

#[derive(
    Debug, Hash, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct MatchLpm {
    pub prefix: ValueTypes,
    pub len: u16,
}

impl MatchLpm {
    /// The prefix with every bit past `len` cleared.  A `U64` prefix is a
    /// 32-bit field unless its value or length needs all 64 bits.  A `Ptr`
    /// prefix is as wide as its bytes.
    pub fn masked_prefix(&self) -> ValueTypes {
        match &self.prefix {
            ValueTypes::U64(v) => {
                let width = if *v > u64::from(u32::MAX) || self.len > 32 {
                    64
                } else {
                    32
                };
                let host = width - u32::from(self.len).min(width);
                ValueTypes::U64(v & u64::MAX.checked_shl(host).unwrap_or(0))
            }
            ValueTypes::Ptr(bytes) => {
                let mut keep = usize::from(self.len);
                let masked = bytes
                    .iter()
                    .map(|b| {
                        let bits = keep.min(8);
                        keep -= bits;
                        b & (0xff00u16 >> bits) as u8
                    })
                    .collect();
                ValueTypes::Ptr(masked)
            }
        }
    }
}

/// Configuration of a direct meter.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct MeterSpec {
    pub cir_kbps: u64,
    pub pir_kbps: u64,
    pub cburst_kbits: u64,
    pub pburst_kbits: u64,
}

/// A resource bound directly to a single match entry.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DirectResource {
    Counter(CounterData),
    Meter(MeterSpec),
    Stateful(u64),
}

impl DirectResource {
    /// Compare the configuration of two resources.  Counter values are live
    /// state that changes with every packet, so two counters are always
    /// considered equivalent.
    pub fn same_config(&self, other: &DirectResource) -> bool {
        match (self, other) {
            (DirectResource::Counter(_), DirectResource::Counter(_)) => true,
            (DirectResource::Meter(a), DirectResource::Meter(b)) => a == b,
            (DirectResource::Stateful(a), DirectResource::Stateful(b)) => {
                a == b
            }
            _ => false,
        }
    }
}

/// Returns true if two resource sets carry the same resource kinds with the
/// same configuration, in any order.
pub fn resources_match(a: &[DirectResource], b: &[DirectResource]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut unused: Vec<&DirectResource> = b.iter().collect();
    for ra in a {
        match unused.iter().position(|rb| ra.same_config(rb)) {
            Some(idx) => {
                unused.swap_remove(idx);
            }
            None => return false,
        }
    }
    true
}
