// =============================================================================
// Gram–Schmidt Orthogonalizer — cross-sectional factor residualization
// =============================================================================
//
// Factors are vectors across the scanned universe (one component per
// symbol). Residualization removes, from each factor, its projection onto
// every factor before it in the fixed order:
//
//     momentum_core  →  technical  →  volume  →  quality
//
// momentum_core is PROTECTED: it is the first basis vector and is never a
// target of residualization. The invariant is verified at runtime in two
// ways — the requested order is validated before any arithmetic, and the
// momentum values are compared bitwise afterwards. Either failure refuses
// the run with PROTECTED_FACTOR_VIOLATION.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::types::ReasonCode;

/// Identifiers of the orthogonalizable factors, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorId {
    MomentumCore,
    Technical,
    Volume,
    Quality,
}

/// The fixed residualization order. momentum_core leads and never recurs.
pub const FACTOR_ORDER: [FactorId; 4] = [
    FactorId::MomentumCore,
    FactorId::Technical,
    FactorId::Volume,
    FactorId::Quality,
];

/// Raw factor columns across the universe. `values(id)[i]` belongs to
/// symbol `i`.
#[derive(Debug, Clone)]
pub struct FactorMatrix {
    pub momentum_core: Vec<f64>,
    pub technical: Vec<f64>,
    pub volume: Vec<f64>,
    pub quality: Vec<f64>,
}

impl FactorMatrix {
    fn column(&self, id: FactorId) -> &[f64] {
        match id {
            FactorId::MomentumCore => &self.momentum_core,
            FactorId::Technical => &self.technical,
            FactorId::Volume => &self.volume,
            FactorId::Quality => &self.quality,
        }
    }

    fn len(&self) -> usize {
        self.momentum_core.len()
    }

    fn columns_consistent(&self) -> bool {
        let n = self.len();
        self.technical.len() == n && self.volume.len() == n && self.quality.len() == n
    }
}

/// Residualized factor columns, same shape as the input matrix.
#[derive(Debug, Clone)]
pub struct ResidualMatrix {
    pub momentum_core: Vec<f64>,
    pub technical_residual: Vec<f64>,
    pub volume_residual: Vec<f64>,
    pub quality_residual: Vec<f64>,
}

/// Orthogonalize `matrix` in `order`. The order must begin with
/// [`FactorId::MomentumCore`] and must not repeat it; anything else refuses
/// the run.
pub fn orthogonalize(matrix: &FactorMatrix, order: &[FactorId]) -> Result<ResidualMatrix, ReasonCode> {
    verify_order(order)?;

    if !matrix.columns_consistent() {
        error!("factor matrix columns have inconsistent lengths");
        return Err(ReasonCode::ProtectedFactorViolation);
    }

    let momentum_before = matrix.momentum_core.clone();

    // Basis vectors accumulated so far, one per processed factor.
    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(order.len());
    let mut residuals: Vec<(FactorId, Vec<f64>)> = Vec::with_capacity(order.len());

    for &id in order {
        let mut column = matrix.column(id).to_vec();
        for b in &basis {
            subtract_projection(&mut column, b);
        }
        basis.push(column.clone());
        residuals.push((id, column));
    }

    let take = |target: FactorId, residuals: &[(FactorId, Vec<f64>)]| {
        residuals
            .iter()
            .find(|(id, _)| *id == target)
            .map(|(_, v)| v.clone())
            .ok_or(ReasonCode::ProtectedFactorViolation)
    };

    let momentum_core = take(FactorId::MomentumCore, &residuals)?;

    // The protected factor must be bitwise untouched by the pass above.
    let untouched = momentum_core.len() == momentum_before.len()
        && momentum_core
            .iter()
            .zip(momentum_before.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits());
    if !untouched {
        error!("momentum_core was modified during orthogonalization — refusing run");
        return Err(ReasonCode::ProtectedFactorViolation);
    }

    Ok(ResidualMatrix {
        momentum_core,
        technical_residual: take(FactorId::Technical, &residuals)?,
        volume_residual: take(FactorId::Volume, &residuals)?,
        quality_residual: take(FactorId::Quality, &residuals)?,
    })
}

/// The protected factor leads the order and never recurs.
fn verify_order(order: &[FactorId]) -> Result<(), ReasonCode> {
    match order.first() {
        Some(FactorId::MomentumCore) => {}
        _ => {
            error!("residualization order does not start with momentum_core");
            return Err(ReasonCode::ProtectedFactorViolation);
        }
    }
    if order[1..].contains(&FactorId::MomentumCore) {
        error!("momentum_core appears as a residualization target");
        return Err(ReasonCode::ProtectedFactorViolation);
    }
    Ok(())
}

/// v -= proj_b(v). A near-zero basis vector contributes nothing.
fn subtract_projection(v: &mut [f64], b: &[f64]) {
    let bb: f64 = b.iter().map(|x| x * x).sum();
    if bb < 1e-12 {
        return;
    }
    let vb: f64 = v.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let scale = vb / bb;
    for (vi, bi) in v.iter_mut().zip(b.iter()) {
        *vi -= scale * bi;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    fn matrix() -> FactorMatrix {
        FactorMatrix {
            momentum_core: vec![60.0, 40.0, 80.0, 20.0],
            technical: vec![55.0, 45.0, 70.0, 30.0],
            volume: vec![50.0, 50.0, 65.0, 35.0],
            quality: vec![45.0, 55.0, 60.0, 40.0],
        }
    }

    #[test]
    fn momentum_is_bitwise_unchanged() {
        let m = matrix();
        let before = m.momentum_core.clone();
        let r = orthogonalize(&m, &FACTOR_ORDER).unwrap();
        for (a, b) in r.momentum_core.iter().zip(before.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn residuals_are_orthogonal_to_momentum() {
        let m = matrix();
        let r = orthogonalize(&m, &FACTOR_ORDER).unwrap();
        assert!(dot(&r.technical_residual, &r.momentum_core).abs() < 1e-6);
        assert!(dot(&r.volume_residual, &r.momentum_core).abs() < 1e-6);
        assert!(dot(&r.quality_residual, &r.momentum_core).abs() < 1e-6);
    }

    #[test]
    fn residuals_are_mutually_orthogonal() {
        let m = matrix();
        let r = orthogonalize(&m, &FACTOR_ORDER).unwrap();
        assert!(dot(&r.volume_residual, &r.technical_residual).abs() < 1e-6);
        assert!(dot(&r.quality_residual, &r.technical_residual).abs() < 1e-6);
        assert!(dot(&r.quality_residual, &r.volume_residual).abs() < 1e-6);
    }

    #[test]
    fn order_not_starting_with_momentum_is_refused() {
        let m = matrix();
        let bad = [
            FactorId::Technical,
            FactorId::MomentumCore,
            FactorId::Volume,
            FactorId::Quality,
        ];
        assert_eq!(
            orthogonalize(&m, &bad).unwrap_err(),
            ReasonCode::ProtectedFactorViolation
        );
    }

    #[test]
    fn momentum_as_target_is_refused() {
        let m = matrix();
        let bad = [
            FactorId::MomentumCore,
            FactorId::Technical,
            FactorId::MomentumCore,
        ];
        assert_eq!(
            orthogonalize(&m, &bad).unwrap_err(),
            ReasonCode::ProtectedFactorViolation
        );
    }

    #[test]
    fn inconsistent_columns_are_refused() {
        let mut m = matrix();
        m.volume.pop();
        assert_eq!(
            orthogonalize(&m, &FACTOR_ORDER).unwrap_err(),
            ReasonCode::ProtectedFactorViolation
        );
    }

    #[test]
    fn collinear_factor_residualizes_to_zero() {
        let mut m = matrix();
        // technical is exactly 0.5 * momentum: its residual must vanish.
        m.technical = m.momentum_core.iter().map(|v| v * 0.5).collect();
        let r = orthogonalize(&m, &FACTOR_ORDER).unwrap();
        for v in &r.technical_residual {
            assert!(v.abs() < 1e-9);
        }
    }
}
