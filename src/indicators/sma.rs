// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================

use crate::types::Bar;

/// Simple moving average of close price over the last `period` bars.
///
/// Returns `None` when `period` is zero or there are fewer than `period`
/// bars available.
pub fn calculate_sma(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let window = &bars[bars.len() - period..];
    let sum: f64 = window.iter().map(|b| b.close).sum();
    let avg = sum / period as f64;
    if avg.is_finite() {
        Some(avg)
    } else {
        None
    }
}

/// Distance of the last close from its long-period SMA, expressed as a
/// percentage: `(close - sma) / sma * 100`.
pub fn sma_distance_pct(bars: &[Bar], period: usize) -> Option<f64> {
    let sma = calculate_sma(bars, period)?;
    if sma == 0.0 {
        return None;
    }
    let close = bars.last()?.close;
    Some((close - sma) / sma * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> Bar {
        Bar {
            timestamp: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn sma_period_zero() {
        let bars = vec![bar(1.0); 10];
        assert!(calculate_sma(&bars, 0).is_none());
    }

    #[test]
    fn sma_insufficient_data() {
        let bars = vec![bar(1.0); 5];
        assert!(calculate_sma(&bars, 10).is_none());
    }

    #[test]
    fn sma_flat_series() {
        let bars = vec![bar(100.0); 20];
        assert_eq!(calculate_sma(&bars, 10), Some(100.0));
    }

    #[test]
    fn sma_uses_most_recent_window() {
        let mut bars: Vec<Bar> = (0..10).map(|i| bar(i as f64)).collect();
        bars.push(bar(100.0));
        // period=3 window is the last three closes: 8, 9, 100
        let sma = calculate_sma(&bars, 3).unwrap();
        assert!((sma - 39.0).abs() < 1e-9);
    }

    #[test]
    fn sma_distance_positive_when_above() {
        let mut bars = vec![bar(100.0); 20];
        bars.push(bar(110.0));
        let dist = sma_distance_pct(&bars, 20).unwrap();
        assert!(dist > 0.0);
    }

    #[test]
    fn sma_distance_negative_when_below() {
        let mut bars = vec![bar(100.0); 20];
        bars.push(bar(90.0));
        let dist = sma_distance_pct(&bars, 20).unwrap();
        assert!(dist < 0.0);
    }
}
