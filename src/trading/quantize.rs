use rust_decimal::{Decimal, RoundingStrategy};

use crate::exchange::LotRules;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum QuantizeError {
    #[error("quantity {qty} is below the minimum order size {min}")]
    BelowMinQty { qty: Decimal, min: Decimal },
    #[error("order value {value} is below the minimum notional {min}")]
    BelowMinNotional { value: Decimal, min: Decimal },
    #[error("symbol reports a zero lot step")]
    ZeroStep,
}

/// Rounds `qty` down to a whole multiple of `step`.
pub fn floor_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    let steps = (qty / step).round_dp_with_strategy(0, RoundingStrategy::ToZero);
    (steps * step).normalize()
}

/// Applies the venue's lot rules to a market order quantity.
pub fn quantize(qty: Decimal, price: Decimal, rules: &LotRules) -> Result<Decimal, QuantizeError> {
    if rules.step <= Decimal::ZERO {
        return Err(QuantizeError::ZeroStep);
    }
    let mut q = floor_to_step(qty.max(Decimal::ZERO), rules.step);
    if let Some(max) = rules.max_qty {
        if q > max {
            q = floor_to_step(max, rules.step);
        }
    }
    if q.is_zero() || q < rules.min_qty {
        return Err(QuantizeError::BelowMinQty {
            qty: q,
            min: rules.min_qty.max(rules.step),
        });
    }
    let value = q * price;
    if value < rules.min_notional {
        return Err(QuantizeError::BelowMinNotional {
            value,
            min: rules.min_notional,
        });
    }
    Ok(q)
}

impl LotRules {
    /// Smallest quote amount an order can carry at `price`.
    pub fn min_order_value(&self, price: Decimal) -> Decimal {
        self.min_notional.max(self.min_qty * price)
    }
}
