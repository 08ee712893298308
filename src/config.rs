//! # Shuffle Configuration
//!
//! Run-fixed knobs for the range shuffler. A config is either built directly
//! and validated at engine construction, or parsed from the enumerated
//! string-option table; unrecognised option names are rejected outright so a
//! typo never silently falls back to a default.

use crate::error::ShuffleError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The data frame can never exceed this, including tag and separator.
pub const MAX_FRAME_SIZE: usize = 255;

/// Default per-side out-of-bounds capacity.
pub const DEFAULT_OOB_MAX: usize = 512;

/// Default pivot count (K).
pub const DEFAULT_PIVOT_COUNT: usize = 64;

/// Configuration for a shuffle run. Fixed for the lifetime of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleConfig {
    /// Per-side out-of-bounds buffer capacity.
    pub oob_max: usize,
    /// Number of equi-count pivot bins (K) each rank summarises its local
    /// distribution into.
    pub pivot_count: usize,
    /// Fixed id length in bytes (1..=255).
    pub id_size: usize,
    /// Fixed payload length in bytes.
    pub payload_size: usize,
    /// Trailing padding carried by every data frame.
    pub extra_size: usize,
    /// Route via the transport even when the destination is this rank.
    pub force_rpc: bool,
    /// Optional count-based renegotiation trigger, in writes since the last
    /// round. Also ends the `INIT` warm-up when set.
    pub reneg_interval: Option<u64>,
    /// Number of low bits masked off the routed rank to concentrate writes
    /// on a subset of receivers. Zero disables masking.
    pub receiver_radix: u32,
    /// Byte offset of the three little-endian `f32` momentum components the
    /// indexed property is derived from.
    pub prop_offset: usize,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            oob_max: DEFAULT_OOB_MAX,
            pivot_count: DEFAULT_PIVOT_COUNT,
            id_size: 8,
            payload_size: 40,
            extra_size: 0,
            force_rpc: false,
            reneg_interval: None,
            receiver_radix: 0,
            prop_offset: 20,
        }
    }
}

impl ShuffleConfig {
    /// Parse the enumerated option table. Every key must be one of the
    /// recognised names; anything else is a configuration error.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self> {
        let mut cfg = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "OOB_Max" => cfg.oob_max = parse_num(key, value)?,
                "Pivot_Count" => cfg.pivot_count = parse_num(key, value)?,
                "Id_Size" => cfg.id_size = parse_num(key, value)?,
                "Payload_Size" => cfg.payload_size = parse_num(key, value)?,
                "Extra_Size" => cfg.extra_size = parse_num(key, value)?,
                "Force_Rpc" => cfg.force_rpc = parse_flag(value),
                "Reneg_Interval" => cfg.reneg_interval = Some(parse_num(key, value)?),
                "Receiver_Radix" => cfg.receiver_radix = parse_num(key, value)?,
                other => {
                    return Err(
                        ShuffleError::config(format!("unrecognised option `{other}`")).into(),
                    )
                }
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the run-fixed invariants. Called by the engine at init; any
    /// violation is fatal before a single record moves.
    pub fn validate(&self) -> Result<()> {
        if self.id_size == 0 {
            return Err(ShuffleError::config("Id_Size must be at least 1").into());
        }
        if self.id_size + self.payload_size >= MAX_FRAME_SIZE {
            return Err(ShuffleError::config(format!(
                "Id_Size + Payload_Size must stay under {MAX_FRAME_SIZE} bytes, got {}",
                self.id_size + self.payload_size
            ))
            .into());
        }
        if self.data_frame_size() > MAX_FRAME_SIZE {
            return Err(ShuffleError::config(format!(
                "data frame of {} bytes exceeds the {MAX_FRAME_SIZE}-byte limit",
                self.data_frame_size()
            ))
            .into());
        }
        if self.pivot_count < 2 {
            return Err(ShuffleError::config("Pivot_Count must be at least 2").into());
        }
        if self.oob_max == 0 {
            return Err(ShuffleError::config("OOB_Max must be at least 1").into());
        }
        if self.receiver_radix >= 31 {
            return Err(ShuffleError::config("Receiver_Radix out of range").into());
        }
        if self.prop_offset + 12 > self.payload_size {
            return Err(ShuffleError::config(format!(
                "momentum components at offset {} do not fit a {}-byte payload",
                self.prop_offset, self.payload_size
            ))
            .into());
        }
        Ok(())
    }

    /// Size of an encoded data frame under this layout: tag, id, separator,
    /// payload, padding.
    pub fn data_frame_size(&self) -> usize {
        1 + self.id_size + 1 + self.payload_size + self.extra_size
    }

    /// Set the per-side OOB capacity.
    pub fn with_oob_max(mut self, oob_max: usize) -> Self {
        self.oob_max = oob_max;
        self
    }

    /// Set the pivot count (K).
    pub fn with_pivot_count(mut self, pivot_count: usize) -> Self {
        self.pivot_count = pivot_count;
        self
    }

    /// Set the record layout.
    pub fn with_layout(mut self, id_size: usize, payload_size: usize, extra_size: usize) -> Self {
        self.id_size = id_size;
        self.payload_size = payload_size;
        self.extra_size = extra_size;
        self
    }

    /// Enable or disable self-routing through the transport.
    pub fn with_force_rpc(mut self, force_rpc: bool) -> Self {
        self.force_rpc = force_rpc;
        self
    }

    /// Enable the count-based renegotiation trigger.
    pub fn with_reneg_interval(mut self, interval: u64) -> Self {
        self.reneg_interval = Some(interval);
        self
    }

    /// Set the receiver radix mask width.
    pub fn with_receiver_radix(mut self, radix: u32) -> Self {
        self.receiver_radix = radix;
        self
    }

    /// Set the momentum-component offset inside the payload.
    pub fn with_prop_offset(mut self, offset: usize) -> Self {
        self.prop_offset = offset;
        self
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        ShuffleError::config(format!("option `{key}` has invalid value `{value}`")).into()
    })
}

/// Empty and `0` mean unset, anything else set, mirroring how the reference
/// deployment reads its environment toggles.
fn parse_flag(value: &str) -> bool {
    !(value.is_empty() || value.starts_with('0'))
}
