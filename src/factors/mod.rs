// =============================================================================
// Factor Pipeline — per-symbol raw factors, universe-level residualization
// =============================================================================
//
// Raw factors are computed independently per symbol, then residualized
// cross-sectionally: each factor column (one value per symbol) has its
// projection onto every earlier factor removed. The pipeline refuses to run
// when the protected-momentum invariant cannot be verified.
//
// Factor scales are all 0–100. Missing raw inputs degrade to the neutral 50
// (catalyst and social degrade to 0 — absence of a catalyst or buzz is a
// real zero, not an unknown).
// =============================================================================

pub mod momentum;
pub mod orthogonal;
pub mod quality;
pub mod social;
pub mod technical;
pub mod volume;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::calculate_bollinger;
use crate::regime::Regime;
use crate::types::{Bar, ReasonCode};

pub use momentum::{momentum_core, MomentumCore, TimeframeReturns};
pub use orthogonal::{orthogonalize, FactorId, FactorMatrix, ResidualMatrix, FACTOR_ORDER};
pub use quality::{QualityInputs, VenueFunding};
pub use social::{social_score, SocialInputs};

/// Neutral value for an unavailable raw factor.
const NEUTRAL: f64 = 50.0;

/// Bollinger width (percent) at or above which the catalyst compression
/// score reaches zero.
const CATALYST_WIDTH_CEILING: f64 = 8.0;

/// Everything the pipeline needs for one symbol.
#[derive(Debug, Clone, Default)]
pub struct SymbolFactorInputs {
    pub symbol: String,
    pub returns: TimeframeReturns,
    /// 1h bars, oldest first (volume factor).
    pub bars_1h: Vec<Bar>,
    /// 4h bars, oldest first (technical factor, catalyst, fatigue RSI).
    pub bars_4h: Vec<Bar>,
    pub quality: QualityInputs,
    pub social: SocialInputs,
}

/// The orthogonalized factor set for one symbol. momentum_core is protected
/// and bitwise-identical to its pre-orthogonalization value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorVector {
    pub momentum_core: f64,
    pub technical_residual: f64,
    pub volume_residual: f64,
    pub quality_residual: f64,
    /// Volatility-compression score; not residualized.
    pub catalyst: f64,
    /// Bounded sentiment; never in the weighted sum.
    pub social: f64,
}

impl FactorVector {
    /// The value the scorer multiplies by the regime weight for `name`.
    pub fn weighted_value(&self, name: &str) -> Option<f64> {
        match name {
            "momentum_core" => Some(self.momentum_core),
            "technical" => Some(self.technical_residual),
            "volume" => Some(self.volume_residual),
            "quality" => Some(self.quality_residual),
            "catalyst" => Some(self.catalyst),
            _ => None,
        }
    }
}

/// Pipeline output for one symbol: the vector plus the momentum detail the
/// guards consume.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolFactors {
    pub symbol: String,
    pub vector: FactorVector,
    pub momentum: MomentumCore,
    /// RSI over 4h bars, for the fatigue guard.
    pub rsi_4h: Option<f64>,
}

/// Compute and residualize factors for the whole universe.
///
/// Fails with `PROTECTED_FACTOR_VIOLATION` when the orthogonalizer cannot
/// verify the protected-momentum invariant; this is fatal to the run.
pub fn compute_universe(
    inputs: &[SymbolFactorInputs],
    regime: Regime,
) -> Result<Vec<SymbolFactors>, ReasonCode> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let mut momentum_detail = Vec::with_capacity(inputs.len());
    let mut matrix = FactorMatrix {
        momentum_core: Vec::with_capacity(inputs.len()),
        technical: Vec::with_capacity(inputs.len()),
        volume: Vec::with_capacity(inputs.len()),
        quality: Vec::with_capacity(inputs.len()),
    };
    let mut catalysts = Vec::with_capacity(inputs.len());
    let mut socials = Vec::with_capacity(inputs.len());

    for input in inputs {
        let core = momentum_core(&input.returns, regime);
        matrix.momentum_core.push(core.score);
        momentum_detail.push(core);

        let technical = technical::technical_raw(&input.bars_4h).unwrap_or(NEUTRAL);
        matrix.technical.push(technical);

        let volume = volume::volume_raw(&input.bars_1h).unwrap_or(NEUTRAL);
        matrix.volume.push(volume);

        matrix.quality.push(quality::quality_raw(&input.quality));

        catalysts.push(catalyst_raw(&input.bars_4h));
        socials.push(social_score(&input.social));

        debug!(
            symbol = %input.symbol,
            momentum = format!("{:.1}", core.score),
            technical = format!("{technical:.1}"),
            "raw factors computed"
        );
    }

    let residuals = orthogonalize(&matrix, &FACTOR_ORDER)?;

    let vectors = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| SymbolFactors {
            symbol: input.symbol.clone(),
            vector: FactorVector {
                momentum_core: residuals.momentum_core[i],
                technical_residual: residuals.technical_residual[i],
                volume_residual: residuals.volume_residual[i],
                quality_residual: residuals.quality_residual[i],
                catalyst: catalysts[i],
                social: socials[i],
            },
            momentum: momentum_detail[i],
            rsi_4h: crate::indicators::latest_rsi(
                &input.bars_4h.iter().map(|b| b.close).collect::<Vec<_>>(),
                14,
            ),
        })
        .collect();

    Ok(vectors)
}

/// Volatility-compression score in [0, 100]: tight Bollinger bands load the
/// spring, wide bands mean the move already happened.
fn catalyst_raw(bars_4h: &[Bar]) -> f64 {
    let closes: Vec<f64> = bars_4h.iter().map(|b| b.close).collect();
    match calculate_bollinger(&closes, 20, 2.0) {
        Some(bb) => (1.0 - (bb.width / CATALYST_WIDTH_CEILING).clamp(0.0, 1.0)) * 100.0,
        None => 0.0,
    }
}
