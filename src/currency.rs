use crate::schema::CurrencyRate;
use log::debug;
use rust_decimal::Decimal;

/// A currency together with the multiplier that brings it into reporting terms.
#[derive(Debug, Clone, Copy)]
pub struct Conversion<'a> {
    pub currency: &'a str,
    pub exchange_rate: Decimal,
}

impl<'a> Conversion<'a> {
    pub fn new(currency: &'a str, exchange_rate: Decimal) -> Self {
        Self {
            currency,
            exchange_rate,
        }
    }
}

/// Value of a recorded amount in reporting currency: `amount * exchange_rate`.
pub fn reporting_value(amount: Decimal, exchange_rate: Decimal) -> Decimal {
    amount * exchange_rate
}

/// Converts `amount` from one currency into another.
///
/// Matching currencies (case-insensitive) return the amount unchanged; any
/// other pair applies the target's rate. Unknown currencies are not an error,
/// callers supply a rate of 1 when no conversion applies.
pub fn normalize(amount: Decimal, from: Conversion<'_>, to: Conversion<'_>) -> Decimal {
    if from.currency.eq_ignore_ascii_case(to.currency) {
        amount
    } else {
        amount * to.exchange_rate
    }
}

/// Looks up a currency's rate in a rate list, or zero when it is absent.
pub fn exchange_rate_for_currency(code: &str, rates: &[CurrencyRate]) -> Decimal {
    rates
        .iter()
        .find(|rate| rate.code.eq_ignore_ascii_case(code))
        .map(|rate| rate.rate)
        .unwrap_or(Decimal::ZERO)
}

/// Brings system-default amounts into an envelope's declared currency.
#[derive(Debug, Clone)]
pub struct CurrencyNormalizer {
    system_currency: String,
    target_currency: String,
    target_rate: Decimal,
}

impl CurrencyNormalizer {
    pub fn for_envelope(
        system_default: &CurrencyRate,
        envelope_currency: &str,
        envelope_rate: Decimal,
    ) -> Self {
        let normalizer = Self {
            system_currency: system_default.code.clone(),
            target_currency: envelope_currency.to_string(),
            target_rate: envelope_rate,
        };
        if normalizer.converts() {
            debug!(
                "Normalizing {} amounts into envelope currency {} at rate {}",
                normalizer.system_currency, normalizer.target_currency, normalizer.target_rate
            );
        }
        normalizer
    }

    /// Whether the envelope currency differs from the system default.
    pub fn converts(&self) -> bool {
        !self.system_currency.eq_ignore_ascii_case(&self.target_currency)
    }

    pub fn normalize(&self, amount: Decimal) -> Decimal {
        normalize(
            amount,
            Conversion::new(&self.system_currency, Decimal::ONE),
            Conversion::new(&self.target_currency, self.target_rate),
        )
    }
}
