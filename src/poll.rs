// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The datapoint poll cycle.
//!
//! A poll cycle is one traversal of the configured datapoint list. Each
//! item belongs to a cycle group whose divisor says how often the item
//! is actually read: 1 every cycle, N every Nth cycle, 0 only on the
//! very first pass, negative never. The cursor advances one item per
//! scheduler tick so command traffic can interleave.

use std::{collections::HashMap, sync::Arc};

use crate::{
    frame::Address,
    value::{ByteBitFilter, Format, Value, ValueSpec},
};

/// Identifier of a cycle group.
pub type CycleGroupKey = u32;

/// The cycle counter wraps at 12! so every divisor up to 12 realigns at
/// the wrap point.
pub(crate) const CYCLE_WRAP: u32 = 479_001_600;

/// The implicit every-cycle group.
pub const EVERY_CYCLE: CycleGroupKey = 1;

/// One pollable/readable/writable datapoint.
///
/// Constructed once when the list is (re)loaded and immutable during a
/// cycle; reloads swap the whole list at a cycle boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct DatapointSpec {
    /// Cycle group membership; [`EVERY_CYCLE`] unless stated otherwise.
    pub cycle_group: CycleGroupKey,
    /// Publish key.
    pub name: String,
    pub addr: Address,
    /// Bytes to read (1-255).
    pub len: u8,
    /// Decode description (scale/tag, optional bit filter, signedness).
    pub value: ValueSpec,
}

impl DatapointSpec {
    /// Normalizing constructor: the format descriptor may be a scale
    /// factor, a symbolic tag or a `b:` bit filter (in which case the
    /// datapoint decodes as raw hex of the filtered slice unless a
    /// scale is attached via [`DatapointSpec::with_scale`]).
    #[must_use]
    pub fn new(name: &str, addr: Address, len: u8, format: &str, signed: bool) -> Self {
        let (filter, fmt) = match ByteBitFilter::parse(format) {
            Ok(filter) => (Some(filter), Format::RawHex),
            Err(_) => (None, Format::parse(format)),
        };
        Self {
            cycle_group: EVERY_CYCLE,
            name: name.to_owned(),
            addr,
            len,
            value: ValueSpec {
                filter,
                format: fmt,
                signed,
            },
        }
    }

    /// Attaches a scale/format to a bit-filtered datapoint.
    #[must_use]
    pub fn with_scale(mut self, format: &str, signed: bool) -> Self {
        self.value.format = Format::parse(format);
        self.value.signed = signed;
        self
    }

    /// Assigns the datapoint to a cycle group.
    #[must_use]
    pub fn with_cycle_group(mut self, group: CycleGroupKey) -> Self {
        self.cycle_group = group;
        self
    }

    pub(crate) fn has_filter(&self) -> bool {
        self.value.filter.is_some()
    }
}

/// Cycle group table: group key to skip divisor. Mutable at runtime via
/// `setpollcycle`; unknown keys resolve to the implicit every-cycle
/// divisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleGroups(HashMap<CycleGroupKey, i32>);

impl CycleGroups {
    #[must_use]
    pub fn new(table: HashMap<CycleGroupKey, i32>) -> Self {
        Self(table)
    }

    /// Divisor of a group; absent groups poll every cycle.
    #[must_use]
    pub fn divisor(&self, group: CycleGroupKey) -> i32 {
        self.0.get(&group).copied().unwrap_or(1)
    }

    /// `setpollcycle` support.
    pub fn set(&mut self, group: CycleGroupKey, divisor: i32) {
        self.0.insert(group, divisor);
    }
}

/// Result of a poll list load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollDefinition {
    pub items: Vec<DatapointSpec>,
    pub groups: CycleGroups,
    /// Seconds between cycles, if the list source overrides it.
    pub interval_override: Option<f64>,
}

/// The poll cursor and value buffer.
///
/// Pointer invariant: `0..len` while items of the current cycle are
/// pending, `len` exactly when the cycle just completed (end-of-cycle
/// bookkeeping runs once there) and `len + 1` while parked between
/// cycles.
#[derive(Debug)]
pub struct PollCycle {
    items: Arc<[DatapointSpec]>,
    groups: CycleGroups,
    pointer: usize,
    cycle: u32,
    buffer: Vec<Option<Value>>,
}

impl Default for PollCycle {
    fn default() -> Self {
        Self::new(PollDefinition::default())
    }
}

impl PollCycle {
    #[must_use]
    pub fn new(def: PollDefinition) -> Self {
        let items: Arc<[DatapointSpec]> = def.items.into();
        let buffer = vec![None; items.len()];
        Self {
            items,
            groups: def.groups,
            pointer: 0,
            cycle: 0,
            buffer,
        }
    }

    /// Replaces the whole list atomically; only legal at a cycle
    /// boundary, which the scheduler guarantees.
    pub fn install(&mut self, def: PollDefinition) {
        let items: Arc<[DatapointSpec]> = def.items.into();
        if self.buffer.len() != items.len() {
            self.buffer = vec![None; items.len()];
        }
        self.items = items;
        self.groups = def.groups;
        self.restart_cycle();
    }

    #[must_use]
    pub fn items(&self) -> &[DatapointSpec] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn pointer(&self) -> usize {
        self.pointer
    }

    #[must_use]
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Last decoded values, index-aligned with the item list.
    #[must_use]
    pub fn buffer(&self) -> &[Option<Value>] {
        &self.buffer
    }

    /// Whether the item at `index` is due in the current cycle.
    #[must_use]
    pub fn is_due(&self, index: usize) -> bool {
        let divisor = self.groups.divisor(self.items[index].cycle_group);
        if divisor == 0 {
            self.cycle == 0
        } else if divisor < 0 {
            false
        } else {
            self.cycle % divisor as u32 == 0
        }
    }

    pub fn store(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.buffer.get_mut(index) {
            *slot = Some(value);
        }
    }

    pub fn advance(&mut self) {
        self.pointer += 1;
    }

    /// End-of-cycle bookkeeping: wraps the cycle counter and parks the
    /// pointer past the end until the next cycle starts.
    pub fn finish_cycle(&mut self) {
        self.cycle += 1;
        if self.cycle == CYCLE_WRAP {
            self.cycle = 0;
        }
        self.pointer = self.len() + 1;
    }

    /// Starts the next cycle from the first item.
    pub fn reset_pointer(&mut self) {
        self.pointer = 0;
    }

    /// `forcepoll`: restart from item 0 including first-pass-only items.
    pub fn restart_cycle(&mut self) {
        self.pointer = 0;
        self.cycle = 0;
    }

    /// `setpollcycle` support.
    pub fn set_divisor(&mut self, group: CycleGroupKey, divisor: i32) {
        self.groups.set(group, divisor);
    }

    #[must_use]
    pub fn divisor_of(&self, index: usize) -> i32 {
        self.groups.divisor(self.items[index].cycle_group)
    }

    /// Addresses of the columns a CSV row should carry: everything but
    /// first-pass-only items.
    #[must_use]
    pub fn csv_columns(&self) -> Vec<Address> {
        self.items
            .iter()
            .filter(|item| self.groups.divisor(item.cycle_group) != 0)
            .map(|item| item.addr)
            .collect()
    }

    /// The buffered values belonging to [`PollCycle::csv_columns`].
    #[must_use]
    pub fn csv_row(&self) -> Vec<Option<Value>> {
        self.items
            .iter()
            .zip(&self.buffer)
            .filter(|(item, _)| self.groups.divisor(item.cycle_group) != 0)
            .map(|(_, value)| value.clone())
            .collect()
    }
}
