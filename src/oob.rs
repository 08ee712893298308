//! # Out-of-Bounds Buffer
//!
//! Bounded staging area for particles whose indexed property falls outside
//! the currently accepted global range. Entries keep insertion order and
//! remember the epoch of the write call that parked them; the `left` side
//! holds properties below the accepted range, the `right` side properties at
//! or above it. Before any range is known everything lands in `left`. Each
//! side is individually bounded, and a side filling up is the renegotiation
//! trigger.

use crate::error::ShuffleError;
use crate::record::ParticleRecord;
use anyhow::Result;

/// Which half of the buffer an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobSide {
    Left,
    Right,
}

/// A parked particle plus the epoch its write call carried. The epoch rides
/// along so a later flush can tag the frame exactly as the original write
/// would have.
#[derive(Debug, Clone, PartialEq)]
pub struct OobEntry {
    pub record: ParticleRecord,
    pub epoch: u32,
}

/// Bounded out-of-bounds store for one rank.
#[derive(Debug)]
pub struct OobBuffer {
    /// Entries in insertion order, both sides interleaved.
    items: Vec<OobEntry>,
    /// Accepted global envelope `[min, max)`, once boundaries exist.
    range: Option<(f32, f32)>,
    left_count: usize,
    right_count: usize,
    side_max: usize,
}

impl OobBuffer {
    /// Create a buffer with the given per-side capacity.
    pub fn new(side_max: usize) -> Self {
        Self {
            items: Vec::with_capacity(side_max),
            range: None,
            left_count: 0,
            right_count: 0,
            side_max,
        }
    }

    /// Install the accepted global envelope and re-bucket existing entries.
    pub fn set_range(&mut self, min: f32, max: f32) {
        self.range = Some((min, max));
        self.recount();
    }

    /// The accepted envelope, if one has been installed.
    pub fn range(&self) -> Option<(f32, f32)> {
        self.range
    }

    /// Which side a property would land on. Everything below the accepted
    /// range (or any property at all, before a range exists) is `left`.
    pub fn side_of(&self, prop: f32) -> OobSide {
        match self.range {
            Some((_, max)) if prop >= max => OobSide::Right,
            _ => OobSide::Left,
        }
    }

    /// Whether a property lies outside the accepted range (or no range is
    /// known yet, in which case everything is out of bounds).
    pub fn out_of_bounds(&self, prop: f32) -> bool {
        match self.range {
            Some((min, max)) => prop < min || prop >= max,
            None => true,
        }
    }

    /// Append an out-of-range particle. Fails if the property actually lies
    /// inside the accepted range (the caller should route it instead) or if
    /// the target side is at capacity.
    pub fn insert(&mut self, record: ParticleRecord, epoch: u32) -> Result<()> {
        if !self.out_of_bounds(record.prop) {
            return Err(ShuffleError::OobFull(format!(
                "property {} is inside the accepted range, route it instead",
                record.prop
            ))
            .into());
        }
        self.push_checked(OobEntry { record, epoch })
    }

    /// Append a particle regardless of range membership. Used while a
    /// renegotiation has frozen routing and in-range writes park here too.
    pub fn park(&mut self, record: ParticleRecord, epoch: u32) -> Result<()> {
        self.push_checked(OobEntry { record, epoch })
    }

    fn push_checked(&mut self, entry: OobEntry) -> Result<()> {
        let side = self.side_of(entry.record.prop);
        if self.side_len(side) >= self.side_max {
            return Err(ShuffleError::OobFull(format!(
                "{side:?} side at capacity {}",
                self.side_max
            ))
            .into());
        }
        match side {
            OobSide::Left => self.left_count += 1,
            OobSide::Right => self.right_count += 1,
        }
        self.items.push(entry);
        Ok(())
    }

    /// Entries on one side.
    pub fn side_len(&self, side: OobSide) -> usize {
        match side {
            OobSide::Left => self.left_count,
            OobSide::Right => self.right_count,
        }
    }

    /// Whether a side has reached capacity.
    pub fn side_full(&self, side: OobSide) -> bool {
        self.side_len(side) >= self.side_max
    }

    /// Whether either side has reached capacity.
    pub fn any_side_full(&self) -> bool {
        self.side_full(OobSide::Left) || self.side_full(OobSide::Right)
    }

    /// Total buffered entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Split the buffered properties by the accepted range, each half sorted
    /// ascending. Input to the pivot sampler.
    pub fn partitioned_props(&self) -> (Vec<f32>, Vec<f32>) {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for item in &self.items {
            match self.side_of(item.record.prop) {
                OobSide::Left => left.push(item.record.prop),
                OobSide::Right => right.push(item.record.prop),
            }
        }
        left.sort_by(f32::total_cmp);
        right.sort_by(f32::total_cmp);
        (left, right)
    }

    /// All buffered properties, unsorted.
    pub fn props(&self) -> Vec<f32> {
        self.items.iter().map(|item| item.record.prop).collect()
    }

    /// Drain entries in insertion order, preserving the ones the callback
    /// hands back. `flush` returns `Some(entry)` to keep an entry buffered
    /// (its property still falls outside the new envelope) or `None` once it
    /// has been routed. The preserved entries are compacted to the front and
    /// the preserved length is returned; on error the unflushed tail stays
    /// buffered.
    pub fn flush_retaining<F>(&mut self, mut flush: F) -> Result<usize>
    where
        F: FnMut(OobEntry) -> Result<Option<OobEntry>>,
    {
        let drained = std::mem::take(&mut self.items);
        let mut iter = drained.into_iter();
        let mut failure = None;
        for entry in iter.by_ref() {
            match flush(entry) {
                Ok(Some(keep)) => self.items.push(keep),
                Ok(None) => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        self.items.extend(iter);
        self.recount();
        match failure {
            Some(err) => Err(err),
            None => Ok(self.items.len()),
        }
    }

    fn recount(&mut self) {
        self.left_count = 0;
        self.right_count = 0;
        for i in 0..self.items.len() {
            match self.side_of(self.items[i].record.prop) {
                OobSide::Left => self.left_count += 1,
                OobSide::Right => self.right_count += 1,
            }
        }
    }
}
