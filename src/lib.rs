//! # Funding Projection Engine
//!
//! Computes how a funder's pledged funding is expected to be released year by
//! year, how much has actually been disbursed, and how both break down across
//! sectors and locations. Also projects the planned monthly disbursement rate of
//! each project for portfolio reports.
//!
//! ## Core Concepts
//!
//! - **Envelope**: a funder's commitment, reconciled over a five year window
//!   (last year through three years ahead)
//! - **Expected amount**: the forecast release of the not-yet-expected remainder
//! - **Manual amount**: an administrator override that always wins over the computed gap
//! - **Allocation**: yearly amounts fanned out by per-project sector/location percentages
//! - **Planned disbursement**: remaining cost spread over the remaining calendar months
//!
//! All money is `rust_decimal::Decimal`, rounded to whole units half away from zero.
//!
//! ## Example
//!
//! ```rust,ignore
//! use funding_projection_engine::*;
//! use rust_decimal::Decimal;
//!
//! let store = MemoryStore::new()
//!     .with_default_currency("USD", Decimal::ONE)
//!     .with_funding(funding_records);
//!
//! let engine = FundingProjectionEngine::new(EngineSettings::default());
//! let envelopes = engine.envelopes(Repositories::from_store(&store));
//!
//! let projection = envelopes.compute_funder_envelope(funder_id)?;
//! for year in &projection.envelope_breakups {
//!     println!("{}: {} disbursed, {} expected", year.year, year.amount, year.expected_amount);
//! }
//! ```

pub mod allocator;
pub mod currency;
pub mod error;
pub mod overrides;
pub mod projector;
pub mod reconciler;
pub mod report;
pub mod repository;
pub mod schema;
pub mod service;
pub mod settings;
pub mod utils;
pub mod window;

pub use allocator::{validate_splits, verify_allocation, DimensionAllocator, ProjectShares};
pub use currency::{exchange_rate_for_currency, normalize, Conversion, CurrencyNormalizer};
pub use error::{FundingError, Result};
pub use overrides::{ManualOverride, ManualOverrides};
pub use projector::{DisbursementProjection, DisbursementProjector};
pub use reconciler::{pledged_value, EnvelopeBreakdown, EnvelopeReconciler};
pub use report::*;
pub use repository::{
    CurrencyRepository, EnvelopeRepository, MemoryStore, ProjectRepository, StoredEnvelope,
};
pub use schema::*;
pub use service::{EnvelopeService, ReportService, Repositories};
pub use settings::EngineSettings;
pub use utils::*;
pub use window::{Clock, FixedClock, SystemClock, YearWindow, WINDOW_WIDTH};

use log::info;

/// Owns validated settings and a clock, and hands out services bound to a set
/// of repositories.
pub struct FundingProjectionEngine {
    settings: EngineSettings,
    clock: Box<dyn Clock>,
}

impl FundingProjectionEngine {
    /// Uses the system clock. Settings are taken as given; see [`Self::try_new`].
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_clock(settings, Box::new(SystemClock))
    }

    pub fn try_new(settings: EngineSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self::new(settings))
    }

    pub fn with_clock(settings: EngineSettings, clock: Box<dyn Clock>) -> Self {
        info!(
            "Funding projection engine ready (fallback currency {}, {} upsert attempts)",
            settings.fallback_currency, settings.max_upsert_attempts
        );
        Self { settings, clock }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn envelopes<'a>(&'a self, repos: Repositories<'a>) -> EnvelopeService<'a> {
        EnvelopeService::new(repos, &self.settings, self.clock.as_ref())
    }

    pub fn reports<'a>(&'a self, repos: Repositories<'a>) -> ReportService<'a> {
        ReportService::new(repos, &self.settings, self.clock.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn engine() -> FundingProjectionEngine {
        FundingProjectionEngine::with_clock(
            EngineSettings::default(),
            Box::new(FixedClock(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())),
        )
    }

    #[test]
    fn test_invalid_settings_rejected_up_front() {
        let settings = EngineSettings {
            max_upsert_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            FundingProjectionEngine::try_new(settings),
            Err(FundingError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_services_share_engine_clock() {
        let store = MemoryStore::new().with_funding(vec![FundingRecord {
            funder_id: 3,
            project_id: 8,
            amount: dec!(1000),
            exchange_rate: Decimal::ONE,
            currency: "USD".to_string(),
            funding_type: None,
        }]);
        let engine = engine();
        let projection = engine
            .envelopes(Repositories::from_store(&store))
            .compute_funder_envelope(3)
            .unwrap();

        let years: Vec<i32> = projection
            .envelope_breakups
            .iter()
            .map(|b| b.year)
            .collect();
        assert_eq!(years, vec![2023, 2024, 2025, 2026, 2027]);
        // No default currency configured, so the fallback applies.
        assert_eq!(projection.currency, "USD");

        let report = engine
            .reports(Repositories::from_store(&store))
            .build_budget_report()
            .unwrap();
        assert_eq!(
            report.generated_on,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }
}
