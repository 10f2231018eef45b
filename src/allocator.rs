use crate::error::{FundingError, Result};
use crate::overrides::ManualOverrides;
use crate::schema::{
    display_name, Dimension, DimensionValue, DimensionValueId, FundingRecord, PercentageSplit,
    ProjectId, SectorAllocation, YearlyAllocation,
};
use crate::utils::{percentage_of, round_units, safe_div, validate_percentage};
use log::{debug, warn};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Each project's fraction of a funder's pledge. Fractions sum to one when any
/// project is present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectShares {
    shares: BTreeMap<ProjectId, Decimal>,
}

impl ProjectShares {
    /// Shares proportional to `values`. A zero total splits evenly.
    pub fn from_values(values: impl IntoIterator<Item = (ProjectId, Decimal)>) -> Self {
        let mut totals: BTreeMap<ProjectId, Decimal> = BTreeMap::new();
        for (project_id, value) in values {
            *totals.entry(project_id).or_default() += value;
        }
        let total: Decimal = totals.values().copied().sum();
        let count = Decimal::from(totals.len());

        let shares = totals
            .into_iter()
            .map(|(project_id, value)| {
                let share = safe_div(value, total)
                    .or_else(|| safe_div(Decimal::ONE, count))
                    .unwrap_or(Decimal::ZERO);
                (project_id, share)
            })
            .collect();
        Self { shares }
    }

    pub fn from_funding(funding: &[FundingRecord]) -> Self {
        Self::from_values(funding.iter().map(|f| (f.project_id, f.reporting_value())))
    }

    /// Zero for projects the funder has no stake in.
    pub fn share(&self, project_id: ProjectId) -> Decimal {
        self.shares
            .get(&project_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

/// Rejects negative or over-100 percentages before any amounts are derived.
pub fn validate_splits(dimension: Dimension, splits: &[PercentageSplit]) -> Result<()> {
    for split in splits {
        validate_percentage(
            &format!(
                "{} {} on project {}",
                dimension.label(),
                split.dimension_value_id,
                split.project_id
            ),
            split.funds_percentage,
        )?;
    }
    Ok(())
}

/// Fans an envelope's yearly actual/expected amounts out across the values of
/// one dimension (sectors or locations).
pub struct DimensionAllocator<'a> {
    dimension: Dimension,
    overrides: &'a ManualOverrides,
    shares: &'a ProjectShares,
}

impl<'a> DimensionAllocator<'a> {
    pub fn new(
        dimension: Dimension,
        overrides: &'a ManualOverrides,
        shares: &'a ProjectShares,
    ) -> Self {
        Self {
            dimension,
            overrides,
            shares,
        }
    }

    /// Splits are per (project, value) pair. Each pair's percentage is scaled by
    /// its project's share of the pledge, so a value's total never exceeds the
    /// envelope.
    pub fn allocate(
        &self,
        envelope_breakups: &[YearlyAllocation],
        splits: &[PercentageSplit],
        values: &[DimensionValue],
    ) -> Result<Vec<SectorAllocation>> {
        validate_splits(self.dimension, splits)?;

        if !splits.is_empty() && splits.iter().all(|s| s.funds_percentage.is_zero()) {
            warn!(
                "All {} percentages are zero; returning a zero-filled breakdown",
                self.dimension.label()
            );
        }

        // value -> effective percentage of the whole envelope
        let mut weighted: BTreeMap<DimensionValueId, Decimal> = BTreeMap::new();
        for split in splits {
            *weighted.entry(split.dimension_value_id).or_default() +=
                split.funds_percentage * self.shares.share(split.project_id);
        }

        let mut allocations: Vec<SectorAllocation> = weighted
            .into_iter()
            .map(|(value_id, percentage)| {
                let yearly_allocation = envelope_breakups
                    .iter()
                    .map(|breakup| self.allocate_year(value_id, breakup, percentage))
                    .collect();

                SectorAllocation {
                    sector_id: value_id,
                    name: display_name(values, self.dimension, value_id),
                    percentage,
                    yearly_allocation,
                }
            })
            .collect();

        allocations.sort_by(|a, b| a.name.cmp(&b.name).then(a.sector_id.cmp(&b.sector_id)));
        Ok(allocations)
    }

    fn allocate_year(
        &self,
        value_id: DimensionValueId,
        breakup: &YearlyAllocation,
        percentage: Decimal,
    ) -> YearlyAllocation {
        let allocated = round_units(percentage_of(breakup.amount, percentage));
        let expected = round_units(percentage_of(breakup.expected_amount, percentage));

        let manual = match self.overrides.get(value_id, breakup.year) {
            // Wins even when the cell's expected amount is zero.
            Some(manual) => manual,
            None if expected.is_zero() => Decimal::ZERO,
            None if expected > allocated => expected - allocated,
            None => Decimal::ZERO,
        };

        debug!(
            "{} {} in {}: allocated {}, expected {}, manual {}",
            self.dimension.label(),
            value_id,
            breakup.year,
            allocated,
            expected,
            manual
        );

        YearlyAllocation {
            year: breakup.year,
            amount: allocated,
            expected_amount: expected,
            manual_amount: manual,
        }
    }
}

/// Checks that, per year, the allocated amounts add back up to the year's actual
/// scaled by the total effective percentage, allowing `tolerance_per_value` for
/// each value's rounding.
pub fn verify_allocation(
    envelope_breakups: &[YearlyAllocation],
    allocations: &[SectorAllocation],
    tolerance_per_value: Decimal,
) -> Result<()> {
    let total_percentage: Decimal = allocations.iter().map(|a| a.percentage).sum();
    let tolerance = tolerance_per_value * Decimal::from(allocations.len());

    for breakup in envelope_breakups {
        let allocated: Decimal = allocations
            .iter()
            .flat_map(|a| a.yearly_allocation.iter())
            .filter(|y| y.year == breakup.year)
            .map(|y| y.amount)
            .sum();
        let expected = percentage_of(breakup.amount, total_percentage);

        if (allocated - expected).abs() > tolerance {
            return Err(FundingError::AllocationMismatch {
                year: breakup.year,
                allocated,
                expected,
                tolerance,
            });
        }
    }

    Ok(())
}
