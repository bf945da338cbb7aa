pub mod product;
pub mod pricing;

pub use product::{Catalog, Coupon, CouponKind, InsurancePlan, InsurancePricing, LineItem};
pub use pricing::{PriceQuote, PricingCalculator, PricingError, PricingInput};
