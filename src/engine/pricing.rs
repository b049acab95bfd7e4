use rust_decimal::Decimal;
use serde::Serialize;

use crate::model::{Pricing, Reservation};

/// Reservation value from its pricing inputs.
///
/// An enabled custom value wins outright. Otherwise each night costs the base price plus
/// the extra-guest fee once per guest beyond the first.
pub fn compute_value(pricing: &Pricing, nights: usize, guests: usize) -> Decimal {
    if pricing.use_custom_value
        && let Some(custom) = pricing.custom_value
    {
        return custom;
    }
    let nights = Decimal::from(nights);
    let extra_guests = Decimal::from(guests.saturating_sub(1));
    pricing.base_price * nights + pricing.extra_guest_fee * extra_guests * nights
}

/// Partial pricing update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PricingPatch {
    pub base_price: Option<Decimal>,
    pub custom_value: Option<Decimal>,
    pub use_custom_value: Option<bool>,
    pub extra_guest_fee: Option<Decimal>,
}

impl PricingPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn apply(&self, pricing: &Pricing) -> Pricing {
        Pricing {
            base_price: self.base_price.unwrap_or(pricing.base_price),
            custom_value: self.custom_value.or(pricing.custom_value),
            use_custom_value: self.use_custom_value.unwrap_or(pricing.use_custom_value),
            extra_guest_fee: self.extra_guest_fee.unwrap_or(pricing.extra_guest_fee),
        }
    }

    pub(crate) fn amounts(&self) -> impl Iterator<Item = (&'static str, Decimal)> {
        [
            ("base price", self.base_price),
            ("custom value", self.custom_value),
            ("extra guest fee", self.extra_guest_fee),
        ]
        .into_iter()
        .filter_map(|(name, v)| v.map(|v| (name, v)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueBreakdown {
    pub base_price: Decimal,
    pub nights: usize,
    pub guests: usize,
    pub extra_guests: usize,
    pub extra_guest_fee: Decimal,
    pub use_custom_value: bool,
    pub custom_value: Option<Decimal>,
    pub daily_total: Decimal,
    pub extra_fees: Decimal,
    pub total: Decimal,
    pub formula: String,
}

pub fn breakdown(r: &Reservation) -> ValueBreakdown {
    let p = &r.pricing;
    let nights = r.nights();
    let guests = r.guests.len();
    let extra_guests = guests.saturating_sub(1);
    let daily_total = p.base_price * Decimal::from(nights);
    let extra_fees = p.extra_guest_fee * Decimal::from(extra_guests) * Decimal::from(nights);
    let total = compute_value(p, nights, guests);
    let formula = if p.use_custom_value && p.custom_value.is_some() {
        format!("custom value {total}")
    } else {
        format!(
            "{} x {nights} + {} x {extra_guests} x {nights} = {total}",
            p.base_price, p.extra_guest_fee
        )
    };

    ValueBreakdown {
        base_price: p.base_price,
        nights,
        guests,
        extra_guests,
        extra_guest_fee: p.extra_guest_fee,
        use_custom_value: p.use_custom_value,
        custom_value: p.custom_value,
        daily_total,
        extra_fees,
        total,
        formula,
    }
}
