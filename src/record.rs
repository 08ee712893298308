//! # Particle Records
//!
//! The shuffler treats a particle as an opaque `(id, payload)` pair plus one
//! scalar derived from the payload: the indexed property used for range
//! partitioning. In the reference workload the property is the Euclidean
//! norm of three momentum components sitting at a fixed byte offset.

use crate::config::ShuffleConfig;
use crate::error::ShuffleError;
use anyhow::Result;

/// A particle staged inside the shuffler: run-fixed id and payload, plus the
/// extracted indexed property.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleRecord {
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
    pub prop: f32,
}

impl ParticleRecord {
    /// Build a record from caller bytes, validating the run-fixed layout and
    /// extracting the indexed property.
    pub fn from_parts(cfg: &ShuffleConfig, id: &[u8], payload: &[u8]) -> Result<Self> {
        if id.len() != cfg.id_size {
            return Err(ShuffleError::Record(format!(
                "id is {} bytes, run is fixed at {}",
                id.len(),
                cfg.id_size
            ))
            .into());
        }
        if payload.len() != cfg.payload_size {
            return Err(ShuffleError::Record(format!(
                "payload is {} bytes, run is fixed at {}",
                payload.len(),
                cfg.payload_size
            ))
            .into());
        }
        let prop = extract_prop(payload, cfg.prop_offset)?;
        Ok(Self {
            id: id.to_vec(),
            payload: payload.to_vec(),
            prop,
        })
    }
}

/// Derive the indexed property from a payload: the Euclidean norm of the
/// three consecutive little-endian `f32` momentum components at `offset`.
pub fn extract_prop(payload: &[u8], offset: usize) -> Result<f32> {
    if offset + 12 > payload.len() {
        return Err(ShuffleError::Record(format!(
            "payload of {} bytes has no momentum components at offset {offset}",
            payload.len()
        ))
        .into());
    }
    let ux = read_f32_le(payload, offset);
    let uy = read_f32_le(payload, offset + 4);
    let uz = read_f32_le(payload, offset + 8);
    let prop = (ux * ux + uy * uy + uz * uz).sqrt();
    if !prop.is_finite() {
        return Err(ShuffleError::Record(format!(
            "indexed property is not finite ({ux}, {uy}, {uz})"
        ))
        .into());
    }
    Ok(prop)
}

fn read_f32_le(buf: &[u8], at: usize) -> f32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    f32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A payload whose extracted property equals `prop`: momentum (prop, 0, 0).
    fn payload_with_prop(cfg: &ShuffleConfig, prop: f32) -> Vec<u8> {
        let mut payload = vec![0u8; cfg.payload_size];
        payload[cfg.prop_offset..cfg.prop_offset + 4].copy_from_slice(&prop.to_le_bytes());
        payload
    }

    #[test]
    fn extracts_euclidean_norm() {
        let mut payload = vec![0u8; 40];
        payload[20..24].copy_from_slice(&3.0f32.to_le_bytes());
        payload[24..28].copy_from_slice(&4.0f32.to_le_bytes());
        let prop = extract_prop(&payload, 20).unwrap();
        assert!((prop - 5.0).abs() < 1e-6);
    }

    #[test]
    fn single_component_round_trips() {
        let cfg = ShuffleConfig::default();
        let payload = payload_with_prop(&cfg, 0.625);
        assert_eq!(extract_prop(&payload, cfg.prop_offset).unwrap(), 0.625);
    }

    #[test]
    fn rejects_non_finite_property() {
        let cfg = ShuffleConfig::default();
        let payload = payload_with_prop(&cfg, f32::INFINITY);
        assert!(extract_prop(&payload, cfg.prop_offset).is_err());
    }

    #[test]
    fn rejects_wrong_id_length() {
        let cfg = ShuffleConfig::default();
        let payload = payload_with_prop(&cfg, 1.0);
        let err = ParticleRecord::from_parts(&cfg, b"short", &payload).unwrap_err();
        assert!(err.to_string().contains("id is 5 bytes"));
    }

    #[test]
    fn rejects_wrong_payload_length() {
        let cfg = ShuffleConfig::default();
        assert!(ParticleRecord::from_parts(&cfg, b"particle", &[0u8; 12]).is_err());
    }
}
