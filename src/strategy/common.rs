use crate::model::Candle;

/// Highest high and lowest low over the `lookback` most recent completed days.
///
/// * `candles` - Daily candles, oldest first. The last one is the still-forming
///   day and is excluded.
/// * `lookback` - Number of completed days to scan.
///
/// Returns `None` when fewer than `lookback` completed days are available.
pub fn rolling_range(candles: &[Candle], lookback: usize) -> Option<(f64, f64)> {
    if lookback == 0 || candles.len() < lookback + 1 {
        return None;
    }
    let end = candles.len() - 1;
    let window = &candles[end - lookback..end];
    let high = window
        .iter()
        .map(|c| c.high)
        .fold(f64::NEG_INFINITY, f64::max);
    let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    Some((high, low))
}

/// Checks whether `price` has broken out of the `(high, low)` range.
///
/// Returns `1` above the high, `-1` below the low, `0` inside.
pub fn breakout_direction(price: f64, high: f64, low: f64) -> i8 {
    if price > high {
        1
    } else if price < low {
        -1
    } else {
        0
    }
}


#[cfg(test)]
mod tests {
    use super::testing::daily_candles;
    use super::*;

    #[test]
    fn test_rolling_range_excludes_forming_day() {
        // The forming day spikes far outside the completed range.
        let candles = daily_candles(&[(105.0, 95.0), (110.0, 100.0), (108.0, 90.0), (200.0, 10.0)]);
        assert_eq!(rolling_range(&candles, 3), Some((110.0, 90.0)));
        // Only the two most recent completed days.
        assert_eq!(rolling_range(&candles, 2), Some((110.0, 90.0)));
        assert_eq!(rolling_range(&candles[..3], 1), Some((110.0, 100.0)));
    }

    #[test]
    fn test_rolling_range_needs_enough_history() {
        let candles = daily_candles(&[(105.0, 95.0), (110.0, 100.0), (108.0, 90.0)]);
        assert_eq!(rolling_range(&candles, 3), None);
        assert_eq!(rolling_range(&candles, 0), None);
        assert_eq!(rolling_range(&[], 1), None);
    }

    #[test]
    fn test_breakout_direction() {
        assert_eq!(breakout_direction(111.0, 110.0, 90.0), 1);
        assert_eq!(breakout_direction(89.0, 110.0, 90.0), -1);
        assert_eq!(breakout_direction(110.0, 110.0, 90.0), 0);
    }
}
