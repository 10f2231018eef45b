use crate::currency::CurrencyNormalizer;
use crate::schema::{DisbursementRecord, FundingRecord, YearlyAllocation};
use crate::utils::{round_units, safe_div};
use crate::window::YearWindow;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Year-by-year release of a funder's pledge across the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeBreakdown {
    pub envelope_breakups: Vec<YearlyAllocation>,
    pub actual_funds: Decimal,
    pub expected_funds: Decimal,
}

impl EnvelopeBreakdown {
    pub fn year(&self, year: i32) -> Option<&YearlyAllocation> {
        self.envelope_breakups.iter().find(|b| b.year == year)
    }
}

/// How a year's expected figure was arrived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YearBasis {
    /// Disbursed in this year; expected backfilled for comparison.
    Disbursed,
    /// No disbursement yet; expected is the amortized share of the remainder.
    Forecast,
    /// Past year with nothing disbursed; not retroactively forecast.
    Lapsed,
}

// Internal struct to track state while walking the window
struct YearSlot {
    actual: Decimal,
    expected: Decimal,
    basis: YearBasis,
}

pub struct EnvelopeReconciler {
    window: YearWindow,
}

impl EnvelopeReconciler {
    pub fn new(window: YearWindow) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &YearWindow {
        &self.window
    }

    /// Sums normalized disbursements per calendar year, dropping years outside the window.
    pub fn actuals_by_year<'a>(
        &self,
        disbursements: impl IntoIterator<Item = &'a DisbursementRecord>,
        normalizer: &CurrencyNormalizer,
    ) -> BTreeMap<i32, Decimal> {
        let mut actuals: BTreeMap<i32, Decimal> = BTreeMap::new();
        for disbursement in disbursements {
            let year = disbursement.year();
            if !self.window.contains(year) {
                continue;
            }
            *actuals.entry(year).or_default() += normalizer.normalize(disbursement.reporting_value());
        }
        actuals
    }

    /// Merges per-year actuals with amortized expected amounts.
    pub fn reconcile(
        &self,
        project_value: Decimal,
        actuals: &BTreeMap<i32, Decimal>,
    ) -> EnvelopeBreakdown {
        let current_year = self.window.current_year();
        let mut grid: BTreeMap<i32, YearSlot> = BTreeMap::new();
        let mut cumulative_expected = Decimal::ZERO;

        for year in self.window.iter() {
            let expected = self.expected_for_year(project_value, cumulative_expected, year);

            let slot = match actuals.get(&year) {
                None => {
                    if year >= current_year {
                        YearSlot {
                            actual: Decimal::ZERO,
                            expected,
                            basis: YearBasis::Forecast,
                        }
                    } else {
                        YearSlot {
                            actual: Decimal::ZERO,
                            expected: Decimal::ZERO,
                            basis: YearBasis::Lapsed,
                        }
                    }
                }
                Some(&actual) => {
                    let mut slot = YearSlot {
                        actual,
                        expected: Decimal::ZERO,
                        basis: YearBasis::Disbursed,
                    };
                    if slot.expected.is_zero() && actual > Decimal::ZERO {
                        slot.expected = expected;
                    } else if actual.is_zero() && year < current_year {
                        slot.expected = Decimal::ZERO;
                        slot.basis = YearBasis::Lapsed;
                    }
                    slot
                }
            };

            debug!(
                "Envelope year {}: actual {}, expected {} ({:?}, {} years left)",
                year,
                slot.actual,
                slot.expected,
                slot.basis,
                self.window.years_left(year)
            );

            cumulative_expected += slot.expected;
            grid.insert(year, slot);
        }

        let envelope_breakups: Vec<YearlyAllocation> = grid
            .into_iter()
            .map(|(year, slot)| YearlyAllocation {
                year,
                amount: slot.actual,
                expected_amount: slot.expected,
                manual_amount: Decimal::ZERO,
            })
            .collect();

        let actual_funds = envelope_breakups.iter().map(|b| b.amount).sum();

        EnvelopeBreakdown {
            envelope_breakups,
            actual_funds,
            expected_funds: project_value,
        }
    }

    /// Amortized share of the not-yet-expected remainder for `year`.
    ///
    /// With one year left the remainder is halved rather than split by one; the
    /// final year then absorbs whatever is left.
    fn expected_for_year(
        &self,
        project_value: Decimal,
        cumulative_expected: Decimal,
        year: i32,
    ) -> Decimal {
        let remaining = project_value - cumulative_expected;
        match self.window.years_left(year) {
            0 => round_units(remaining),
            1 => round_units(remaining / Decimal::TWO),
            years_left if years_left > 1 => safe_div(remaining, Decimal::from(years_left))
                .map(round_units)
                .unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        }
    }
}

/// Total pledged by a funder, normalized into envelope currency.
pub fn pledged_value(funding: &[FundingRecord], normalizer: &CurrencyNormalizer) -> Decimal {
    let total: Decimal = funding.iter().map(FundingRecord::reporting_value).sum();
    normalizer.normalize(total)
}
