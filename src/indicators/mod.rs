// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure functions over bar slices and close-price slices. Every function
// returns `Option`/empty-vec on insufficient or non-finite input — callers
// decide how to degrade.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod roc;
pub mod rsi;

pub use atr::calculate_atr;
pub use bollinger::{calculate_bollinger, BollingerResult};
pub use ema::{calculate_ema, calculate_vwma};
pub use macd::{calculate_macd, MacdResult};
pub use roc::rate_of_change;
pub use rsi::latest_rsi;
