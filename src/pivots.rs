//! # Pivot Sampler
//!
//! Summarises a rank's locally observed property distribution as K+1 ordered
//! pivots: observed min, observed max, and K−1 interior values splitting the
//! sorted sample set into equi-count bins. The accompanying bin width feeds
//! the coordinator's weighted merge; a width of zero marks the vector as
//! low-confidence (too few or degenerate samples).

/// A rank-local distribution summary: `pivots.len() == K + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotVector {
    pub pivots: Vec<f32>,
    /// Local bin width, `(max - min) / K`. Zero when the sample set was too
    /// small to fill the bins or spans a single point.
    pub width: f32,
}

impl PivotVector {
    /// Whether the merge should down-weight this vector.
    pub fn is_low_confidence(&self) -> bool {
        self.width == 0.0
    }
}

/// Compute the K+1 pivot summary of a sample set. Returns `None` for an
/// empty set; the rank then reports zero pivots and the coordinator
/// substitutes an envelope for it.
pub fn compute_pivots(mut samples: Vec<f32>, k: usize) -> Option<PivotVector> {
    debug_assert!(k >= 2);
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f32::total_cmp);
    let m = samples.len();
    let max = samples[m - 1];

    let mut pivots = Vec::with_capacity(k + 1);
    if m < k + 1 {
        // too sparse for equi-count bins: the samples themselves, padded
        // with the maximum, at zero confidence
        pivots.extend_from_slice(&samples);
        pivots.resize(k + 1, max);
        return Some(PivotVector { pivots, width: 0.0 });
    }

    for i in 0..=k {
        let at = (i * m / k).min(m - 1);
        pivots.push(samples[at]);
    }
    let width = (pivots[k] - pivots[0]) / k as f32;
    Some(PivotVector { pivots, width })
}
