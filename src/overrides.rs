use crate::error::{FundingError, Result};
use crate::schema::DimensionValueId;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One administrator-supplied manual amount for a sector (or location) in a year.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ManualOverride {
    #[schemars(description = "Sector or location id the amount applies to.")]
    pub dimension_value_id: DimensionValueId,

    #[schemars(description = "Calendar year of the override.")]
    pub year: i32,

    #[schemars(
        with = "String",
        description = "Manual amount in envelope currency. Zero clears the override."
    )]
    pub amount: Decimal,
}

/// Manual amounts keyed by `(dimension_value_id, year)`.
///
/// Zero amounts are never stored: a zero override means "no override", so the
/// allocator falls back to the computed gap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<ManualOverride>", try_from = "Vec<ManualOverride>")]
pub struct ManualOverrides {
    amounts: BTreeMap<(DimensionValueId, i32), Decimal>,
}

impl ManualOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or clears one cell. Later inserts for the same cell replace earlier ones.
    pub fn insert(&mut self, dimension_value_id: DimensionValueId, year: i32, amount: Decimal) {
        if amount.is_zero() {
            self.amounts.remove(&(dimension_value_id, year));
        } else {
            self.amounts.insert((dimension_value_id, year), amount);
        }
    }

    pub fn get(&self, dimension_value_id: DimensionValueId, year: i32) -> Option<Decimal> {
        self.amounts.get(&(dimension_value_id, year)).copied()
    }

    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ManualOverride> + '_ {
        self.amounts
            .iter()
            .map(|(&(dimension_value_id, year), &amount)| ManualOverride {
                dimension_value_id,
                year,
                amount,
            })
    }

    /// Builds the map from a list of entries, rejecting negative amounts.
    pub fn from_entries(entries: impl IntoIterator<Item = ManualOverride>) -> Result<Self> {
        let mut overrides = Self::new();
        for entry in entries {
            if entry.amount.is_sign_negative() && !entry.amount.is_zero() {
                return Err(FundingError::invalid_input(
                    "sector_overrides",
                    format!(
                        "manual amount {} for value {} in {} is negative",
                        entry.amount, entry.dimension_value_id, entry.year
                    ),
                ));
            }
            overrides.insert(entry.dimension_value_id, entry.year, entry.amount);
        }
        Ok(overrides)
    }

    /// Parses the legacy serialized sector breakup blob that older envelope rows
    /// stored as opaque text. Only the manual amounts are retained; the computed
    /// amounts in the blob are stale by definition.
    pub fn from_legacy_json(blob: &str) -> Result<Self> {
        if blob.trim().is_empty() {
            return Ok(Self::new());
        }

        let breakups: Vec<LegacySectorBreakup> = serde_json::from_str(blob)?;
        let entries = breakups.into_iter().flat_map(|breakup| {
            let sector_id = breakup.sector_id;
            breakup
                .yearly_allocation
                .into_iter()
                .map(move |cell| ManualOverride {
                    dimension_value_id: sector_id,
                    year: cell.year,
                    amount: cell.manual_amount,
                })
        });

        Self::from_entries(entries)
    }
}

impl From<ManualOverrides> for Vec<ManualOverride> {
    fn from(overrides: ManualOverrides) -> Self {
        overrides.iter().collect()
    }
}

impl TryFrom<Vec<ManualOverride>> for ManualOverrides {
    type Error = FundingError;

    fn try_from(entries: Vec<ManualOverride>) -> Result<Self> {
        Self::from_entries(entries)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacySectorBreakup {
    #[serde(alias = "sectorId")]
    sector_id: DimensionValueId,
    #[serde(default, alias = "yearlyAllocation")]
    yearly_allocation: Vec<LegacyYearlyCell>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyYearlyCell {
    #[serde(alias = "year")]
    year: i32,
    #[serde(default, alias = "manualAmount")]
    manual_amount: Decimal,
}
