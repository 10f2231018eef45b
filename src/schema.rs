use crate::overrides::ManualOverrides;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type FunderId = i64;
pub type ProjectId = i64;
pub type OrganizationId = i64;
pub type DimensionValueId = i64;

/// The two independent axes a project's cost is split across.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "PascalCase")]
pub enum Dimension {
    Sector,
    Location,
}

impl Dimension {
    pub fn label(&self) -> &'static str {
        match self {
            Dimension::Sector => "sector",
            Dimension::Location => "location",
        }
    }
}

/// One funder's commitment to one project, in the funder's own currency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FundingRecord {
    pub funder_id: FunderId,
    pub project_id: ProjectId,
    pub amount: Decimal,
    pub exchange_rate: Decimal,
    pub currency: String,
    #[serde(default)]
    pub funding_type: Option<String>,
}

impl FundingRecord {
    pub fn reporting_value(&self) -> Decimal {
        crate::currency::reporting_value(self.amount, self.exchange_rate)
    }
}

/// One disbursed payment event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisbursementRecord {
    pub project_id: ProjectId,
    pub amount: Decimal,
    pub exchange_rate: Decimal,
    pub date: NaiveDate,
}

impl DisbursementRecord {
    pub fn reporting_value(&self) -> Decimal {
        crate::currency::reporting_value(self.amount, self.exchange_rate)
    }

    pub fn year(&self) -> i32 {
        self.date.year()
    }
}

/// Share of a project's cost attributed to one sector or location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PercentageSplit {
    pub project_id: ProjectId,
    pub dimension_value_id: DimensionValueId,
    pub funds_percentage: Decimal,
}

/// Display metadata for a sector or location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DimensionValue {
    pub id: DimensionValueId,
    pub name: String,
}

/// Name of `id` among `values`, or a placeholder when the catalog lacks it.
pub fn display_name(values: &[DimensionValue], dimension: Dimension, id: DimensionValueId) -> String {
    values
        .iter()
        .find(|v| v.id == id)
        .map(|v| v.name.clone())
        .unwrap_or_else(|| format!("Unnamed {} {}", dimension.label(), id))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub implementer_ids: Vec<OrganizationId>,
}

/// A currency code with its multiplier against the reporting currency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrencyRate {
    pub code: String,
    pub rate: Decimal,
}

/// The persisted per-funder envelope row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub funder_id: FunderId,
    pub currency: String,
    pub exchange_rate: Decimal,
    #[serde(default)]
    pub sector_overrides: ManualOverrides,
}

/// Actual, expected and manual amounts for one year.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct YearlyAllocation {
    pub year: i32,
    /// Actual (disbursed) amount.
    pub amount: Decimal,
    pub expected_amount: Decimal,
    pub manual_amount: Decimal,
}

impl YearlyAllocation {
    pub fn empty(year: i32) -> Self {
        Self {
            year,
            amount: Decimal::ZERO,
            expected_amount: Decimal::ZERO,
            manual_amount: Decimal::ZERO,
        }
    }
}

/// One sector's (or location's) share of an envelope, year by year.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectorAllocation {
    pub sector_id: DimensionValueId,
    pub name: String,
    pub percentage: Decimal,
    pub yearly_allocation: Vec<YearlyAllocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeProjection {
    pub funder_id: FunderId,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub envelope_breakups: Vec<YearlyAllocation>,
    pub actual_funds: Decimal,
    /// The full pledge total, not the sum of the yearly expected amounts.
    pub expected_funds: Decimal,
    pub sectors: Vec<SectorAllocation>,
}

/// Inclusive calendar-year range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl YearRange {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, year: i32) -> bool {
        (self.start..=self.end).contains(&year)
    }
}

/// Request payload for creating or replacing a funder's envelope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EnvelopeUpsert {
    #[schemars(description = "ISO currency code the envelope is expressed in (e.g. 'USD').")]
    pub currency: String,

    #[schemars(
        with = "String",
        description = "Multiplier from the system default currency into the envelope currency. Use 1 when they match."
    )]
    pub exchange_rate: Decimal,

    #[serde(default)]
    #[schemars(
        with = "Vec<crate::overrides::ManualOverride>",
        description = "Administrator-supplied manual amounts keyed by sector and year."
    )]
    pub sector_overrides: ManualOverrides,
}

impl EnvelopeUpsert {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(EnvelopeUpsert)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
