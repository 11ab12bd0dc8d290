use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;

/// Money precision persisted to DB / metadata.
pub const BILLING_STORAGE_PRECISION: u32 = 8;
/// Money precision for UI display.
pub const BILLING_DISPLAY_PRECISION: u32 = 6;

/// Convert loosely-typed values to `Decimal`. Floats go through their string
/// form to avoid binary artifacts.
pub fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(|f| Decimal::try_from(f).ok())
            }
        }
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

/// Quantize to storage precision, half-up.
pub fn quantize_cost(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(BILLING_STORAGE_PRECISION, RoundingStrategy::MidpointAwayFromZero)
}

pub fn quantize_display(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(BILLING_DISPLAY_PRECISION, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn to_decimal_handles_ints_floats_strings() {
        assert_eq!(to_decimal(&json!(10)), Some(Decimal::from(10)));
        assert_eq!(to_decimal(&json!("3.5")), Some("3.5".parse().unwrap()));
        assert!(to_decimal(&json!(0.1)).is_some());
        assert_eq!(to_decimal(&json!(null)), None);
        assert_eq!(to_decimal(&json!(true)), None);
    }

    #[test]
    fn quantize_rounds_half_up_at_8_places() {
        let value: Decimal = "0.000000015".parse().unwrap();
        assert_eq!(quantize_cost(value).to_string(), "0.00000002");
        let value: Decimal = "0.000000014".parse().unwrap();
        assert_eq!(quantize_cost(value).to_string(), "0.00000001");
    }
}
