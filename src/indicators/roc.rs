// =============================================================================
// Rate of Change (ROC)
// =============================================================================
//
// ROC = (close_t - close_{t-n}) / close_{t-n}. The momentum factor composes
// these across timeframes.

/// Fractional rate of change over the trailing `lookback` closes.
///
/// Returns `None` on insufficient data or a non-positive base price.
pub fn rate_of_change(closes: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || closes.len() <= lookback {
        return None;
    }
    let newest = *closes.last()?;
    let base = closes[closes.len() - 1 - lookback];
    if base <= 0.0 {
        return None;
    }
    let roc = (newest - base) / base;
    roc.is_finite().then_some(roc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_change() {
        let closes = vec![100.0, 101.0, 102.0, 110.0];
        let roc = rate_of_change(&closes, 3).unwrap();
        assert!((roc - 0.10).abs() < 1e-12);
    }

    #[test]
    fn insufficient_data_is_none() {
        assert!(rate_of_change(&[100.0], 1).is_none());
        assert!(rate_of_change(&[100.0, 101.0], 0).is_none());
    }

    #[test]
    fn zero_base_is_none() {
        assert!(rate_of_change(&[0.0, 10.0], 1).is_none());
    }
}
