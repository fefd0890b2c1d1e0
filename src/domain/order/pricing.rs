use rust_decimal::{Decimal, RoundingStrategy};

use super::errors::OrderError;
use super::value_objects::{OrderLine, PaymentMethod, PriceBreakdown};

// ============================================================================
// Pricing Policy - order totals
// ============================================================================
//
// itemsPrice    = sum(quantity * unitPrice)
// shippingPrice = 0 when itemsPrice > free threshold, flat rate otherwise
// taxPrice      = itemsPrice * taxRate
// totalPrice    = itemsPrice + shippingPrice + taxPrice
//
// Every component is rounded to cents (half away from zero) before summing,
// so the stored total always equals the sum of the stored components.
//
// ============================================================================

const MONEY_DECIMAL_PLACES: u32 = 2;

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone)]
pub struct PricingPolicy {
    pub free_shipping_threshold: Decimal,
    pub flat_shipping_rate: Decimal,
    pub tax_rate: Decimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            free_shipping_threshold: Decimal::new(100, 0),
            flat_shipping_rate: Decimal::new(10, 0),
            tax_rate: Decimal::new(15, 2),
        }
    }
}

impl PricingPolicy {
    pub fn price(&self, lines: &[OrderLine]) -> PriceBreakdown {
        let items_price = round_money(lines.iter().map(OrderLine::line_total).sum());

        let shipping_price = if items_price > self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            round_money(self.flat_shipping_rate)
        };

        let tax_price = round_money(items_price * self.tax_rate);

        PriceBreakdown {
            items_price,
            shipping_price,
            tax_price,
            total_price: items_price + shipping_price + tax_price,
        }
    }
}

/// Which currency each payment path settles in.
///
/// Card charges are always made in the base currency whatever the shopper
/// asked for; invoices may settle in any currency on the allow-list.
#[derive(Debug, Clone)]
pub struct CurrencyPolicy {
    pub base_currency: String,
    pub invoice_currencies: Vec<String>,
}

impl Default for CurrencyPolicy {
    fn default() -> Self {
        Self {
            base_currency: "USD".to_string(),
            invoice_currencies: vec!["BTC".to_string()],
        }
    }
}

impl CurrencyPolicy {
    pub fn settlement_currency(
        &self,
        method: PaymentMethod,
        requested: Option<&str>,
    ) -> Result<String, OrderError> {
        match method {
            PaymentMethod::Card => Ok(self.base_currency.clone()),
            PaymentMethod::CryptoInvoice => {
                let requested = requested
                    .map(|c| c.trim().to_ascii_uppercase())
                    .filter(|c| !c.is_empty())
                    .or_else(|| self.invoice_currencies.first().cloned())
                    .unwrap_or_default();

                if self.invoice_currencies.iter().any(|c| *c == requested) {
                    Ok(requested)
                } else {
                    Err(OrderError::UnsupportedCurrency {
                        method,
                        currency: requested,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn line(quantity: i32, cents: i64) -> OrderLine {
        OrderLine {
            product_id: Uuid::new_v4(),
            quantity,
            unit_price: Decimal::new(cents, 2),
        }
    }

    #[test]
    fn test_small_cart_pays_shipping_and_tax() {
        let prices = PricingPolicy::default().price(&[line(2, 1000)]);

        assert_eq!(prices.items_price, Decimal::new(2000, 2));
        assert_eq!(prices.shipping_price, Decimal::new(1000, 2));
        assert_eq!(prices.tax_price, Decimal::new(300, 2));
        assert_eq!(prices.total_price, Decimal::new(3300, 2));
    }

    #[test]
    fn test_shipping_free_only_above_threshold() {
        let policy = PricingPolicy::default();

        let at_threshold = policy.price(&[line(1, 10000)]);
        let above_threshold = policy.price(&[line(1, 10001)]);

        assert_eq!(at_threshold.shipping_price, Decimal::new(10, 0));
        assert_eq!(above_threshold.shipping_price, Decimal::ZERO);
    }

    #[test]
    fn test_tax_rounds_half_away_from_zero() {
        // 0.15 * 0.10 = 0.015 -> 0.02
        let prices = PricingPolicy::default().price(&[line(1, 10)]);
        assert_eq!(prices.tax_price, Decimal::new(2, 2));
        assert_eq!(
            prices.total_price,
            prices.items_price + prices.shipping_price + prices.tax_price
        );
    }

    #[test]
    fn test_card_always_settles_in_base_currency() {
        let policy = CurrencyPolicy::default();
        let currency = policy
            .settlement_currency(PaymentMethod::Card, Some("EUR"))
            .unwrap();
        assert_eq!(currency, "USD");
    }

    #[test]
    fn test_invoice_currency_checked_against_allow_list() {
        let policy = CurrencyPolicy::default();

        assert_eq!(
            policy
                .settlement_currency(PaymentMethod::CryptoInvoice, Some("btc"))
                .unwrap(),
            "BTC"
        );
        assert_eq!(
            policy
                .settlement_currency(PaymentMethod::CryptoInvoice, None)
                .unwrap(),
            "BTC"
        );
        assert!(matches!(
            policy.settlement_currency(PaymentMethod::CryptoInvoice, Some("DOGE")),
            Err(OrderError::UnsupportedCurrency { .. })
        ));
    }
}
