//! American odds arithmetic.
//!
//! Books quote signed American prices: positive is profit per $100
//! staked, negative is the stake needed to win $100. Everything the
//! engine compares (best price, averages, no-vig removal, arb sums) goes
//! through decimal odds or implied probability, so the conversions live
//! here in one place.

/// Convert an American price to decimal odds (stake included).
///
/// +150 → 2.50, -200 → 1.50.
pub fn american_to_decimal(american: i32) -> f64 {
    let a = american as f64;
    if american > 0 {
        a / 100.0 + 1.0
    } else {
        100.0 / a.abs() + 1.0
    }
}

/// Convert decimal odds back to the nearest American price.
///
/// Returns `None` for decimal odds at or below 1.0, which have no
/// American representation.
pub fn decimal_to_american(decimal: f64) -> Option<i32> {
    if !decimal.is_finite() || decimal <= 1.0 {
        return None;
    }
    let american = if decimal >= 2.0 {
        ((decimal - 1.0) * 100.0).round()
    } else {
        (-100.0 / (decimal - 1.0)).round()
    };
    Some(american as i32)
}

/// Implied probability of an American price, vig included.
pub fn implied_probability(american: i32) -> f64 {
    let a = american as f64;
    if american > 0 {
        100.0 / (a + 100.0)
    } else {
        a.abs() / (a.abs() + 100.0)
    }
}

/// Profit per unit staked: odds/100 for positive prices, 100/|odds| otherwise.
pub fn payout_multiplier(american: i32) -> f64 {
    let a = american as f64;
    if american > 0 {
        a / 100.0
    } else {
        100.0 / a.abs()
    }
}

/// Whether a raw upstream number is a usable American price.
///
/// American prices live outside the open interval (-100, 100); +100 and
/// -100 are both even money.
pub fn is_valid_american(raw: f64) -> bool {
    raw.is_finite() && raw.fract() == 0.0 && raw.abs() >= 100.0 && raw.abs() <= 1_000_000.0
}

/// Average several American prices in decimal space and convert the
/// mean back to American. `None` when `prices` is empty.
pub fn average_american(prices: &[i32]) -> Option<i32> {
    let decimal = average_decimal(prices)?;
    decimal_to_american(decimal)
}

/// Mean decimal odds of several American prices.
pub fn average_decimal(prices: &[i32]) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    let sum: f64 = prices.iter().map(|p| american_to_decimal(*p)).sum();
    Some(sum / prices.len() as f64)
}

/// Round to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
