//! Static per-model pricing (USD per token).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Look up (input, output) cost per token for a known model.
pub fn model_cost(model: &str) -> Option<(Decimal, Decimal)> {
    let cost = match model {
        "llama-3.3-70b-versatile" => (dec!(0.00000059), dec!(0.00000079)),
        "llama-3.1-8b-instant" => (dec!(0.00000005), dec!(0.00000008)),
        "gpt-4o-mini" => (dec!(0.00000015), dec!(0.0000006)),
        "gpt-4o" => (dec!(0.0000025), dec!(0.00001)),
        _ => return None,
    };
    Some(cost)
}

/// Cost for any model, zero when unknown.
pub fn model_cost_or_zero(model: &str) -> (Decimal, Decimal) {
    model_cost(model).unwrap_or((Decimal::ZERO, Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_has_cost() {
        let (input, output) = model_cost("llama-3.3-70b-versatile").unwrap();
        assert!(input > Decimal::ZERO);
        assert!(output > input);
    }

    #[test]
    fn unknown_model_is_free() {
        assert!(model_cost("local-model").is_none());
        assert_eq!(
            model_cost_or_zero("local-model"),
            (Decimal::ZERO, Decimal::ZERO)
        );
    }
}
