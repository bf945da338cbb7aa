use camper_shared::Money;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A priced line on an order: a vehicle-day, a camp pitch night, a tour seat,
/// a mall product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub unit_price: Money,
    pub quantity: i64,
}

impl LineItem {
    pub fn new(product_id: impl Into<String>, name: impl Into<String>, unit_price: Money, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            name: name.into(),
            unit_price,
            quantity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponKind {
    /// Fixed amount off the subtotal.
    Fixed { amount: Money },
    /// Percentage of the subtotal, in basis points (1000 = 10%).
    Percent { basis_points: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coupon {
    pub id: String,
    pub kind: CouponKind,
    #[serde(default)]
    pub min_subtotal: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsurancePricing {
    Flat { fee: Money },
    /// Charged per unit of booked quantity (rental day, pitch night, seat).
    PerUnit { fee: Money },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InsurancePlan {
    pub id: String,
    pub name: String,
    pub pricing: InsurancePricing,
}

/// Coupons and insurance plans the pricing calculator may reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub coupons: Vec<Coupon>,
    #[serde(default)]
    pub insurance_plans: Vec<InsurancePlan>,
}

impl Catalog {
    pub fn with_coupon(mut self, coupon: Coupon) -> Self {
        self.coupons.push(coupon);
        self
    }

    pub fn with_insurance(mut self, plan: InsurancePlan) -> Self {
        self.insurance_plans.push(plan);
        self
    }

    pub(crate) fn coupon_index(&self) -> HashMap<String, Coupon> {
        self.coupons.iter().map(|c| (c.id.clone(), c.clone())).collect()
    }

    pub(crate) fn insurance_index(&self) -> HashMap<String, InsurancePlan> {
        self.insurance_plans.iter().map(|p| (p.id.clone(), p.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_deserialization() {
        let json = r#"
            {
                "coupons": [
                    { "id": "WELCOME50", "kind": { "type": "FIXED", "amount": 5000 } },
                    { "id": "SUMMER10", "kind": { "type": "PERCENT", "basis_points": 1000 }, "min_subtotal": 20000 }
                ],
                "insurance_plans": [
                    { "id": "BASIC", "name": "Basic cover", "pricing": { "type": "PER_UNIT", "fee": 3000 } }
                ]
            }
        "#;
        let catalog: Catalog = serde_json::from_str(json).expect("Failed to deserialize");
        assert_eq!(catalog.coupons.len(), 2);
        assert_eq!(catalog.coupons[0].min_subtotal, Money::ZERO);
        assert_eq!(
            catalog.insurance_plans[0].pricing,
            InsurancePricing::PerUnit { fee: Money::from_minor(3000) }
        );
    }
}
