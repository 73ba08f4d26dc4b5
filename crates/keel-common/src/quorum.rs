//! ---
//! keel_section: "01-core-functionality"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Shared primitives and utilities for the rebind runtime."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Predicate deciding whether enough items are healthy out of a total.
///
/// Used at the end of a rebind to decide whether dangling references are the
/// normal residue of deleted objects or a sign the persisted store is corrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QuorumCheck {
    /// Every item must be healthy.
    All,
    /// At least one healthy item, unless there are no items at all.
    AtLeastOneUnlessEmpty,
    /// A minimum healthy fraction in `[0, 1]`.
    Fraction { min: f64 },
    /// Piecewise-linear `(total, required healthy)` points, ascending by total.
    ///
    /// Below the first point the first requirement applies; beyond the last
    /// point the last point's healthy ratio is applied proportionally.
    LinearRange { points: Vec<[f64; 2]> },
}

impl Default for QuorumCheck {
    fn default() -> Self {
        QuorumCheck::LinearRange {
            points: vec![[0.0, -1.0], [10.0, 5.0], [100.0, 90.0], [200.0, 190.0]],
        }
    }
}

impl QuorumCheck {
    pub fn validate(&self) -> Result<()> {
        match self {
            QuorumCheck::Fraction { min } if !(0.0..=1.0).contains(min) => {
                Err(anyhow!("quorum fraction {} must lie within [0, 1]", min))
            }
            QuorumCheck::LinearRange { points } => {
                if points.is_empty() {
                    return Err(anyhow!("linear-range quorum requires at least one point"));
                }
                if points.windows(2).any(|pair| pair[1][0] <= pair[0][0]) {
                    return Err(anyhow!(
                        "linear-range quorum points must be strictly ascending by total"
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Whether `healthy` out of `total` satisfies the predicate.
    pub fn is_quorate(&self, healthy: usize, total: usize) -> bool {
        match self {
            QuorumCheck::All => healthy >= total,
            QuorumCheck::AtLeastOneUnlessEmpty => total == 0 || healthy > 0,
            QuorumCheck::Fraction { min } => {
                total == 0 || (healthy as f64) / (total as f64) >= *min
            }
            QuorumCheck::LinearRange { points } => {
                healthy as f64 >= required_healthy(points, total as f64)
            }
        }
    }
}

fn required_healthy(points: &[[f64; 2]], total: f64) -> f64 {
    let Some(first) = points.first() else {
        return 0.0;
    };
    if total <= first[0] {
        return first[1];
    }
    for pair in points.windows(2) {
        let [x0, y0] = pair[0];
        let [x1, y1] = pair[1];
        if total <= x1 {
            return y0 + (total - x0) * (y1 - y0) / (x1 - x0);
        }
    }
    match points.last() {
        Some([x, y]) if *x > 0.0 => total * (y / x),
        Some([_, y]) => *y,
        None => 0.0,
    }
}
