//! Same-class masks and masked reductions over cost rows.
//!
//! `min_match` and `min_non_match` are minima over a subset of each cost
//! row. Reductions here visit only the selected indices, so the result
//! never depends on the magnitude of the excluded entries.

use crate::Label;

/// `mask[i][j] = classes[j] == labels[i]`, stored row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassMask {
    cols: usize,
    same: Vec<bool>,
}

impl ClassMask {
    /// Build the mask for a batch against the centroid classes.
    pub fn new(labels: &[Label], classes: &[Label]) -> Self {
        let mut same = Vec::with_capacity(labels.len() * classes.len());
        for &label in labels {
            same.extend(classes.iter().map(|&c| c == label));
        }
        Self {
            cols: classes.len(),
            same,
        }
    }

    /// Mask row for example `i`.
    #[inline]
    pub fn row(&self, i: usize) -> &[bool] {
        &self.same[i * self.cols..(i + 1) * self.cols]
    }

    /// `true` if example `i` has at least one centroid of another class.
    pub fn has_other(&self, i: usize) -> bool {
        self.row(i).iter().any(|&s| !s)
    }
}

/// Index and value of the smallest `costs[j]` with `mask[j] == select`.
///
/// Lowest index wins ties. `None` when no index is selected.
pub fn masked_argmin(costs: &[f32], mask: &[bool], select: bool) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (j, (&c, &m)) in costs.iter().zip(mask).enumerate() {
        if m != select {
            continue;
        }
        match best {
            Some((_, b)) if c >= b => {}
            _ => best = Some((j, c)),
        }
    }
    best
}

/// Index of the smallest cost over the whole row, lowest index on ties.
pub fn argmin(costs: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (j, &c) in costs.iter().enumerate() {
        match best {
            Some((_, b)) if c >= b => {}
            _ => best = Some((j, c)),
        }
    }
    best.map(|(j, _)| j)
}
