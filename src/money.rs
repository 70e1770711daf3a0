//! Money arithmetic: fee schedule, rounding, and the fixed HTG↔USD
//! estimation used for per-provider minimum-amount checks.

use once_cell::sync::Lazy;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

use crate::types::{Channel, Currency};

/// Fixed estimation used to express USD amounts in gourdes where a processor
/// only accepts HTG. Not a live FX rate.
pub static HTG_PER_USD: Lazy<Decimal> = Lazy::new(|| Decimal::from(140));

/// Smallest amount MonCash and NatCash accept, in gourdes.
pub static MIN_HTG: Lazy<Decimal> = Lazy::new(|| Decimal::from(10));

/// Smallest amount Stripe accepts, in US dollars.
pub static MIN_USD: Lazy<Decimal> = Lazy::new(|| Decimal::from_str("0.50").expect("valid decimal"));

/// Gateway fee rate per channel, snapshotted onto each payment at creation.
pub fn fee_rate(channel: Channel) -> Decimal {
    match channel {
        // 2.5%
        Channel::Moncash | Channel::Natcash => Decimal::new(25, 3),
        // 3.5%
        Channel::Stripe => Decimal::new(35, 3),
    }
}

/// Round a monetary value to 2 decimal places, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `fee = round(amount × rate, 2)`.
pub fn fee_amount(amount: Decimal, rate: Decimal) -> Decimal {
    round_money(amount * rate)
}

/// Express an amount in gourdes, applying the fixed estimation for USD.
pub fn to_htg(amount: Decimal, currency: Currency) -> Decimal {
    match currency {
        Currency::Htg => amount,
        Currency::Usd => round_money(amount * *HTG_PER_USD),
    }
}

/// The minimum the channel's processor accepts, expressed in `currency`.
pub fn channel_minimum(channel: Channel, currency: Currency) -> Decimal {
    match channel {
        Channel::Moncash | Channel::Natcash => match currency {
            Currency::Htg => *MIN_HTG,
            Currency::Usd => round_money(*MIN_HTG / *HTG_PER_USD),
        },
        Channel::Stripe => match currency {
            Currency::Usd => *MIN_USD,
            Currency::Htg => round_money(*MIN_USD * *HTG_PER_USD),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn fee_schedule() {
        assert_eq!(fee_rate(Channel::Moncash), dec("0.025"));
        assert_eq!(fee_rate(Channel::Natcash), dec("0.025"));
        assert_eq!(fee_rate(Channel::Stripe), dec("0.035"));
    }

    #[test]
    fn fee_of_100_htg_on_moncash_is_2_50() {
        let fee = fee_amount(dec("100.00"), fee_rate(Channel::Moncash));
        assert_eq!(fee, dec("2.50"));
        assert_eq!(dec("100.00") - fee, dec("97.50"));
    }

    #[test]
    fn fee_rounds_half_away_from_zero() {
        // 10.10 × 0.025 = 0.2525 → 0.25; 10.30 × 0.025 = 0.2575 → 0.26
        assert_eq!(fee_amount(dec("10.10"), dec("0.025")), dec("0.25"));
        assert_eq!(fee_amount(dec("10.30"), dec("0.025")), dec("0.26"));
    }

    #[test]
    fn usd_amounts_convert_at_the_fixed_rate() {
        assert_eq!(to_htg(dec("25.00"), Currency::Usd), dec("3500.00"));
        assert_eq!(to_htg(dec("25.00"), Currency::Htg), dec("25.00"));
    }

    #[test]
    fn minimums_are_expressed_in_the_payment_currency() {
        assert_eq!(channel_minimum(Channel::Moncash, Currency::Htg), dec("10"));
        // 10 HTG / 140 ≈ 0.07 USD
        assert_eq!(channel_minimum(Channel::Moncash, Currency::Usd), dec("0.07"));
        assert_eq!(channel_minimum(Channel::Stripe, Currency::Usd), dec("0.50"));
        assert_eq!(channel_minimum(Channel::Stripe, Currency::Htg), dec("70.00"));
    }
}
