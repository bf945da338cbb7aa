use camper_shared::Money;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::product::{Catalog, Coupon, CouponKind, InsurancePlan, InsurancePricing, LineItem};

/// Everything the calculator looks at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingInput {
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub coupon_ids: BTreeSet<String>,
    #[serde(default)]
    pub insurance_id: Option<String>,
}

/// Amount due with its breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceQuote {
    pub subtotal: Money,
    pub discount: Money,
    pub insurance_fee: Money,
    pub amount_due: Money,
    pub applied_coupons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("Invalid pricing input: {0}")]
    InvalidPricingInput(String),
}

fn invalid(msg: impl Into<String>) -> PricingError {
    PricingError::InvalidPricingInput(msg.into())
}

/// Derives the payable amount for an order. Pure: the same input against the
/// same catalog always yields the same quote.
#[derive(Debug, Clone)]
pub struct PricingCalculator {
    coupons: HashMap<String, Coupon>,
    insurance: HashMap<String, InsurancePlan>,
}

impl PricingCalculator {
    pub fn new(catalog: &Catalog) -> Self {
        Self {
            coupons: catalog.coupon_index(),
            insurance: catalog.insurance_index(),
        }
    }

    pub fn calculate(&self, input: &PricingInput) -> Result<PriceQuote, PricingError> {
        if input.items.is_empty() {
            return Err(invalid("order has no items"));
        }

        let mut subtotal = Money::ZERO;
        let mut total_quantity: i64 = 0;
        for item in &input.items {
            if item.quantity <= 0 {
                return Err(invalid(format!(
                    "quantity for {} must be positive, got {}",
                    item.product_id, item.quantity
                )));
            }
            if item.unit_price.is_negative() {
                return Err(invalid(format!("unit price for {} is negative", item.product_id)));
            }
            let line = item
                .unit_price
                .checked_mul(item.quantity)
                .ok_or_else(|| invalid("line amount overflow"))?;
            subtotal = subtotal.checked_add(line).ok_or_else(|| invalid("subtotal overflow"))?;
            total_quantity = total_quantity
                .checked_add(item.quantity)
                .ok_or_else(|| invalid("quantity overflow"))?;
        }

        // BTreeSet iteration gives a stable coupon order.
        let mut discount = Money::ZERO;
        let mut applied_coupons = Vec::with_capacity(input.coupon_ids.len());
        for coupon_id in &input.coupon_ids {
            let coupon = self
                .coupons
                .get(coupon_id)
                .ok_or_else(|| invalid(format!("unknown coupon {}", coupon_id)))?;
            if subtotal < coupon.min_subtotal {
                return Err(invalid(format!(
                    "coupon {} requires a subtotal of at least {}",
                    coupon_id, coupon.min_subtotal
                )));
            }
            let off = match &coupon.kind {
                CouponKind::Fixed { amount } => *amount,
                CouponKind::Percent { basis_points } => subtotal
                    .apply_basis_points(*basis_points)
                    .ok_or_else(|| invalid("discount overflow"))?,
            };
            discount = discount.checked_add(off).ok_or_else(|| invalid("discount overflow"))?;
            applied_coupons.push(coupon_id.clone());
        }

        let insurance_fee = match &input.insurance_id {
            None => Money::ZERO,
            Some(id) => {
                let plan = self
                    .insurance
                    .get(id)
                    .ok_or_else(|| invalid(format!("unknown insurance plan {}", id)))?;
                match &plan.pricing {
                    InsurancePricing::Flat { fee } => *fee,
                    InsurancePricing::PerUnit { fee } => fee
                        .checked_mul(total_quantity)
                        .ok_or_else(|| invalid("insurance fee overflow"))?,
                }
            }
        };

        let amount_due = subtotal
            .checked_sub(discount)
            .and_then(|m| m.checked_add(insurance_fee))
            .ok_or_else(|| invalid("total overflow"))?;
        if amount_due.is_negative() {
            return Err(invalid(format!(
                "discounts of {} exceed the payable amount",
                discount
            )));
        }

        Ok(PriceQuote {
            subtotal,
            discount,
            insurance_fee,
            amount_due,
            applied_coupons,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::default()
            .with_coupon(Coupon {
                id: "WELCOME50".to_string(),
                kind: CouponKind::Fixed { amount: Money::from_minor(5000) },
                min_subtotal: Money::ZERO,
            })
            .with_coupon(Coupon {
                id: "SUMMER10".to_string(),
                kind: CouponKind::Percent { basis_points: 1000 },
                min_subtotal: Money::from_minor(20000),
            })
            .with_insurance(InsurancePlan {
                id: "BASIC".to_string(),
                name: "Basic cover".to_string(),
                pricing: InsurancePricing::PerUnit { fee: Money::from_minor(3000) },
            })
            .with_insurance(InsurancePlan {
                id: "FLAT".to_string(),
                name: "Trip cover".to_string(),
                pricing: InsurancePricing::Flat { fee: Money::from_minor(1999) },
            })
    }

    fn input(items: Vec<LineItem>, coupons: &[&str], insurance: Option<&str>) -> PricingInput {
        PricingInput {
            items,
            coupon_ids: coupons.iter().map(|c| c.to_string()).collect(),
            insurance_id: insurance.map(str::to_string),
        }
    }

    #[test]
    fn test_full_breakdown() {
        let calc = PricingCalculator::new(&catalog());
        let quote = calc
            .calculate(&input(
                vec![LineItem::new("rv-c7", "C-class RV per day", Money::from_minor(88000), 3)],
                &["SUMMER10", "WELCOME50"],
                Some("BASIC"),
            ))
            .unwrap();

        assert_eq!(quote.subtotal, Money::from_minor(264000));
        // 5000 fixed + 10% of 264000
        assert_eq!(quote.discount, Money::from_minor(5000 + 26400));
        assert_eq!(quote.insurance_fee, Money::from_minor(9000));
        assert_eq!(quote.amount_due, Money::from_minor(264000 - 31400 + 9000));
        assert_eq!(quote.applied_coupons, vec!["SUMMER10".to_string(), "WELCOME50".to_string()]);
    }

    #[test]
    fn test_is_deterministic() {
        let calc = PricingCalculator::new(&catalog());
        let req = input(
            vec![
                LineItem::new("pitch", "Camp pitch", Money::from_minor(12345), 2),
                LineItem::new("firewood", "Firewood", Money::from_minor(1500), 1),
            ],
            &["SUMMER10"],
            Some("FLAT"),
        );
        assert_eq!(calc.calculate(&req).unwrap(), calc.calculate(&req).unwrap());
    }

    #[test]
    fn test_rejects_non_positive_quantity() {
        let calc = PricingCalculator::new(&catalog());
        let err = calc
            .calculate(&input(vec![LineItem::new("x", "x", Money::from_minor(100), 0)], &[], None))
            .unwrap_err();
        assert!(matches!(err, PricingError::InvalidPricingInput(_)));
    }

    #[test]
    fn test_rejects_unknown_references() {
        let calc = PricingCalculator::new(&catalog());
        let items = vec![LineItem::new("x", "x", Money::from_minor(100), 1)];

        assert!(calc.calculate(&input(items.clone(), &["NOPE"], None)).is_err());
        assert!(calc.calculate(&input(items, &[], Some("NOPE"))).is_err());
    }

    #[test]
    fn test_rejects_negative_total() {
        let calc = PricingCalculator::new(&catalog());
        let err = calc
            .calculate(&input(
                vec![LineItem::new("mug", "Camp mug", Money::from_minor(3000), 1)],
                &["WELCOME50"],
                None,
            ))
            .unwrap_err();
        assert!(err.to_string().contains("exceed"));
    }

    #[test]
    fn test_coupon_minimum_subtotal() {
        let calc = PricingCalculator::new(&catalog());
        let result = calc.calculate(&input(
            vec![LineItem::new("mug", "Camp mug", Money::from_minor(3000), 1)],
            &["SUMMER10"],
            None,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_priced_order() {
        let calc = PricingCalculator::new(&catalog());
        let quote = calc
            .calculate(&input(vec![LineItem::new("free", "Free tour", Money::ZERO, 1)], &[], None))
            .unwrap();
        assert_eq!(quote.amount_due, Money::ZERO);
    }
}
