use crate::allocator::{validate_splits, verify_allocation, DimensionAllocator, ProjectShares};
use crate::currency::{exchange_rate_for_currency, CurrencyNormalizer};
use crate::error::{FundingError, Result};
use crate::overrides::ManualOverrides;
use crate::reconciler::{pledged_value, EnvelopeReconciler};
use crate::report::{
    build_budget_report, build_dimension_report, BudgetReport, DimensionData,
    GroupedProjectReport, ProjectPortfolio, ReportCriteria,
};
use crate::repository::{CurrencyRepository, EnvelopeRepository, ProjectRepository};
use crate::schema::{
    CurrencyRate, Dimension, Envelope, EnvelopeProjection, EnvelopeUpsert, FunderId, ProjectId,
};
use crate::settings::EngineSettings;
use crate::utils::{format_thousands, validate_exchange_rate};
use crate::window::{Clock, YearWindow};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use std::collections::BTreeSet;

/// Borrowed handles to the collaborators a service reads from and writes to.
#[derive(Clone, Copy)]
pub struct Repositories<'a> {
    pub projects: &'a dyn ProjectRepository,
    pub envelopes: &'a dyn EnvelopeRepository,
    pub currencies: &'a dyn CurrencyRepository,
}

impl<'a> Repositories<'a> {
    /// Uses one store for all three contracts.
    pub fn from_store<S>(store: &'a S) -> Self
    where
        S: ProjectRepository + EnvelopeRepository + CurrencyRepository,
    {
        Self {
            projects: store,
            envelopes: store,
            currencies: store,
        }
    }

    fn system_currency(&self, settings: &EngineSettings) -> Result<CurrencyRate> {
        Ok(self
            .currencies
            .default_currency()?
            .unwrap_or_else(|| CurrencyRate {
                code: settings.fallback_currency.clone(),
                rate: Decimal::ONE,
            }))
    }
}

/// Computes and maintains per-funder funding envelopes.
pub struct EnvelopeService<'a> {
    repos: Repositories<'a>,
    settings: &'a EngineSettings,
    clock: &'a dyn Clock,
}

impl<'a> EnvelopeService<'a> {
    pub fn new(repos: Repositories<'a>, settings: &'a EngineSettings, clock: &'a dyn Clock) -> Self {
        Self {
            repos,
            settings,
            clock,
        }
    }

    /// Year-by-year actual/expected breakdown of a funder's pledge, split across
    /// the sectors of the projects it funds.
    pub fn compute_funder_envelope(&self, funder_id: FunderId) -> Result<EnvelopeProjection> {
        info!("Computing envelope for funder {}", funder_id);

        let funding = self.repos.projects.funding_by_funder(funder_id)?;
        let stored = self.repos.envelopes.get_by_funder(funder_id)?;
        if funding.is_empty() && stored.is_none() {
            return Err(FundingError::NotFound {
                entity: "funder",
                id: funder_id,
            });
        }

        let system = self.repos.system_currency(self.settings)?;
        let (currency, exchange_rate, overrides) = match stored {
            Some(stored) => (
                stored.envelope.currency,
                stored.envelope.exchange_rate,
                stored.envelope.sector_overrides,
            ),
            None => (system.code.clone(), system.rate, ManualOverrides::new()),
        };
        let normalizer = CurrencyNormalizer::for_envelope(&system, &currency, exchange_rate);

        let project_ids: Vec<ProjectId> = funding
            .iter()
            .map(|f| f.project_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let reconciler = EnvelopeReconciler::new(YearWindow::build(self.clock.today()));
        let disbursements = self.repos.projects.disbursements_for(&project_ids, None)?;
        let actuals = reconciler.actuals_by_year(&disbursements, &normalizer);
        let project_value = pledged_value(&funding, &normalizer);
        let breakdown = reconciler.reconcile(project_value, &actuals);

        let splits = self
            .repos
            .projects
            .splits_for(Dimension::Sector, &project_ids)?;
        let values = self.repos.projects.dimension_values(Dimension::Sector)?;
        let shares = ProjectShares::from_funding(&funding);
        let sectors = DimensionAllocator::new(Dimension::Sector, &overrides, &shares).allocate(
            &breakdown.envelope_breakups,
            &splits,
            &values,
        )?;

        if let Err(e) = verify_allocation(&breakdown.envelope_breakups, &sectors, Decimal::ONE) {
            warn!("Funder {}: {}", funder_id, e);
        }

        info!(
            "Funder {} envelope in {}: pledged {}, disbursed {} across {} projects and {} sectors",
            funder_id,
            currency,
            format_thousands(breakdown.expected_funds),
            format_thousands(breakdown.actual_funds),
            project_ids.len(),
            sectors.len()
        );

        Ok(EnvelopeProjection {
            funder_id,
            currency,
            exchange_rate,
            envelope_breakups: breakdown.envelope_breakups,
            actual_funds: breakdown.actual_funds,
            expected_funds: breakdown.expected_funds,
            sectors,
        })
    }

    /// Computes several funders in parallel on at most one worker per available
    /// core; results keep the input order.
    pub fn compute_funder_envelopes(
        &self,
        funder_ids: &[FunderId],
    ) -> Vec<Result<EnvelopeProjection>> {
        if funder_ids.is_empty() {
            return Vec::new();
        }
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let chunk_size = funder_ids.len().div_ceil(workers);
        debug!(
            "Computing {} envelopes on up to {} workers",
            funder_ids.len(),
            workers
        );

        let compute_chunk = |chunk: &[FunderId]| -> Vec<Result<EnvelopeProjection>> {
            chunk
                .iter()
                .map(|&funder_id| self.compute_funder_envelope(funder_id))
                .collect()
        };

        std::thread::scope(|scope| {
            let pending: Vec<_> = funder_ids
                .chunks(chunk_size)
                .map(|chunk| {
                    let spawned = std::thread::Builder::new()
                        .name("envelope-worker".to_string())
                        .spawn_scoped(scope, move || compute_chunk(chunk));
                    (chunk, spawned)
                })
                .collect();

            pending
                .into_iter()
                .flat_map(|(chunk, spawned)| match spawned {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        chunk
                            .iter()
                            .map(|&funder_id| {
                                Err(FundingError::Storage(format!(
                                    "envelope computation for funder {} panicked",
                                    funder_id
                                )))
                            })
                            .collect()
                    }),
                    Err(e) => {
                        warn!("Could not spawn envelope worker ({}); computing inline", e);
                        compute_chunk(chunk)
                    }
                })
                .collect()
        })
    }

    /// Creates or replaces the funder's envelope, retrying lost write races.
    pub fn upsert_envelope(&self, funder_id: FunderId, request: EnvelopeUpsert) -> Result<()> {
        let currency = request.currency.trim();
        if currency.is_empty() {
            return Err(FundingError::invalid_input(
                "currency",
                "currency code must not be empty",
            ));
        }
        validate_exchange_rate("exchange_rate", request.exchange_rate)?;
        let exchange_rate = if request.exchange_rate.is_zero() {
            self.resolve_exchange_rate(currency)?
        } else {
            request.exchange_rate
        };

        let envelope = Envelope {
            funder_id,
            currency: currency.to_string(),
            exchange_rate,
            sector_overrides: request.sector_overrides,
        };

        let attempts = self.settings.max_upsert_attempts.max(1);
        for attempt in 1..=attempts {
            let written = match self.repos.envelopes.get_by_funder(funder_id)? {
                None => self.repos.envelopes.insert(&envelope),
                Some(stored) => self.repos.envelopes.update(&envelope, stored.version),
            };

            match written {
                Ok(version) => {
                    info!(
                        "Saved envelope for funder {} ({} at {}, {} overrides) as version {}",
                        funder_id,
                        envelope.currency,
                        envelope.exchange_rate,
                        envelope.sector_overrides.len(),
                        version
                    );
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Envelope write for funder {} conflicted (attempt {}/{})",
                        funder_id, attempt, attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(FundingError::TransientStorageConflict { funder_id })
    }

    /// Rate for an upsert that left it at zero: 1 for the system currency,
    /// otherwise the configured rate list.
    fn resolve_exchange_rate(&self, currency: &str) -> Result<Decimal> {
        let system = self.repos.system_currency(self.settings)?;
        if system.code.eq_ignore_ascii_case(currency) {
            return Ok(Decimal::ONE);
        }

        let rate = exchange_rate_for_currency(currency, &self.repos.currencies.rates()?);
        if rate.is_zero() {
            return Err(FundingError::invalid_input(
                "exchange_rate",
                format!("no rate given and none configured for {}", currency),
            ));
        }
        debug!("Resolved {} exchange rate {} from rate list", currency, rate);
        Ok(rate)
    }

    pub fn delete_envelope(&self, funder_id: FunderId) -> Result<()> {
        if self.repos.envelopes.delete(funder_id)? {
            info!("Deleted envelope for funder {}", funder_id);
            Ok(())
        } else {
            Err(FundingError::NotFound {
                entity: "envelope",
                id: funder_id,
            })
        }
    }

    pub fn list_envelopes(&self) -> Result<Vec<Envelope>> {
        let envelopes = self.repos.envelopes.list()?;
        debug!("Listing {} stored envelopes", envelopes.len());
        Ok(envelopes)
    }
}

/// Builds project listings and budget outlooks from repository data.
pub struct ReportService<'a> {
    repos: Repositories<'a>,
    settings: &'a EngineSettings,
    clock: &'a dyn Clock,
}

impl<'a> ReportService<'a> {
    pub fn new(repos: Repositories<'a>, settings: &'a EngineSettings, clock: &'a dyn Clock) -> Self {
        Self {
            repos,
            settings,
            clock,
        }
    }

    pub fn build_sector_report(&self, criteria: &ReportCriteria) -> Result<GroupedProjectReport> {
        self.build_grouped_report(Dimension::Sector, criteria)
    }

    pub fn build_location_report(&self, criteria: &ReportCriteria) -> Result<GroupedProjectReport> {
        self.build_grouped_report(Dimension::Location, criteria)
    }

    pub fn build_budget_report(&self) -> Result<BudgetReport> {
        let portfolio = self.load_portfolio()?;
        let sectors = self.load_dimension(Dimension::Sector, &portfolio)?;
        let locations = self.load_dimension(Dimension::Location, &portfolio)?;
        Ok(build_budget_report(
            &portfolio,
            &sectors,
            &locations,
            self.clock.today(),
        ))
    }

    fn build_grouped_report(
        &self,
        dimension: Dimension,
        criteria: &ReportCriteria,
    ) -> Result<GroupedProjectReport> {
        if let Some(range) = criteria.effective_year_range(self.settings.minimum_report_year) {
            if range.start > range.end {
                return Err(FundingError::invalid_input(
                    "year_range",
                    format!("start {} is after end {}", range.start, range.end),
                ));
            }
        }

        let portfolio = self.load_portfolio()?;
        let data = self.load_dimension(dimension, &portfolio)?;
        Ok(build_dimension_report(
            dimension,
            criteria,
            &portfolio,
            &data,
            self.clock.today(),
            self.settings.minimum_report_year,
        ))
    }

    fn load_portfolio(&self) -> Result<ProjectPortfolio> {
        let projects = self.repos.projects.projects()?;
        let ids: Vec<ProjectId> = projects.iter().map(|p| p.id).collect();
        Ok(ProjectPortfolio {
            funding: self.repos.projects.funding_for_projects(&ids)?,
            disbursements: self.repos.projects.disbursements_for(&ids, None)?,
            organizations: self.repos.projects.organizations()?,
            projects,
        })
    }

    fn load_dimension(
        &self,
        dimension: Dimension,
        portfolio: &ProjectPortfolio,
    ) -> Result<DimensionData> {
        let ids: Vec<ProjectId> = portfolio.projects.iter().map(|p| p.id).collect();
        let splits = self.repos.projects.splits_for(dimension, &ids)?;
        validate_splits(dimension, &splits)?;
        Ok(DimensionData {
            splits,
            values: self.repos.projects.dimension_values(dimension)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryStore, StoredEnvelope};
    use crate::schema::{
        DimensionValue, DisbursementRecord, FundingRecord, PercentageSplit, Project,
    };
    use crate::window::FixedClock;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn clock() -> FixedClock {
        FixedClock(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap())
    }

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_default_currency("USD", Decimal::ONE)
            .with_funding(vec![FundingRecord {
                funder_id: 1,
                project_id: 10,
                amount: dec!(120000),
                exchange_rate: Decimal::ONE,
                currency: "USD".to_string(),
                funding_type: None,
            }])
            .with_disbursements(vec![DisbursementRecord {
                project_id: 10,
                amount: dec!(5000),
                exchange_rate: Decimal::ONE,
                date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            }])
            .with_splits(
                Dimension::Sector,
                vec![PercentageSplit {
                    project_id: 10,
                    dimension_value_id: 1,
                    funds_percentage: dec!(100),
                }],
            )
            .with_dimension_values(
                Dimension::Sector,
                vec![DimensionValue {
                    id: 1,
                    name: "Health".to_string(),
                }],
            )
    }

    /// Loses the first `failures` writes to a concurrent writer.
    struct RacingEnvelopes {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl RacingEnvelopes {
        fn lost_race(&self, funder_id: FunderId) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(FundingError::TransientStorageConflict { funder_id });
            }
            Ok(())
        }
    }

    impl EnvelopeRepository for RacingEnvelopes {
        fn get_by_funder(&self, funder_id: FunderId) -> Result<Option<StoredEnvelope>> {
            self.inner.get_by_funder(funder_id)
        }

        fn insert(&self, envelope: &Envelope) -> Result<u64> {
            self.lost_race(envelope.funder_id)?;
            self.inner.insert(envelope)
        }

        fn update(&self, envelope: &Envelope, expected_version: u64) -> Result<u64> {
            self.lost_race(envelope.funder_id)?;
            self.inner.update(envelope, expected_version)
        }

        fn delete(&self, funder_id: FunderId) -> Result<bool> {
            self.inner.delete(funder_id)
        }

        fn list(&self) -> Result<Vec<Envelope>> {
            self.inner.list()
        }
    }

    fn upsert(currency: &str) -> EnvelopeUpsert {
        EnvelopeUpsert {
            currency: currency.to_string(),
            exchange_rate: Decimal::ONE,
            sector_overrides: ManualOverrides::new(),
        }
    }

    #[test]
    fn test_unknown_funder_is_not_found() {
        let store = store();
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(Repositories::from_store(&store), &settings, &clock);

        let err = service.compute_funder_envelope(99).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_envelope_without_stored_row_uses_system_currency() {
        let store = store();
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(Repositories::from_store(&store), &settings, &clock);

        let projection = service.compute_funder_envelope(1).unwrap();
        assert_eq!(projection.currency, "USD");
        assert_eq!(projection.actual_funds, dec!(5000));
        assert_eq!(projection.expected_funds, dec!(120000));
        assert_eq!(projection.sectors.len(), 1);
        assert_eq!(projection.sectors[0].yearly_allocation[1].amount, dec!(5000));
    }

    #[test]
    fn test_stored_envelope_alone_is_enough() {
        let store = MemoryStore::new();
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(Repositories::from_store(&store), &settings, &clock);

        service.upsert_envelope(5, upsert("EUR")).unwrap();
        let projection = service.compute_funder_envelope(5).unwrap();
        assert_eq!(projection.currency, "EUR");
        assert_eq!(projection.expected_funds, Decimal::ZERO);
        assert!(projection.sectors.is_empty());
    }

    #[test]
    fn test_upsert_retries_lost_races() {
        let store = store();
        let racing = RacingEnvelopes {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(2),
        };
        let repos = Repositories {
            projects: &store,
            envelopes: &racing,
            currencies: &store,
        };
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(repos, &settings, &clock);

        service.upsert_envelope(1, upsert("EUR")).unwrap();
        assert_eq!(racing.list().unwrap()[0].currency, "EUR");
    }

    #[test]
    fn test_upsert_gives_up_after_attempt_cap() {
        let store = store();
        let racing = RacingEnvelopes {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(10),
        };
        let repos = Repositories {
            projects: &store,
            envelopes: &racing,
            currencies: &store,
        };
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(repos, &settings, &clock);

        let err = service.upsert_envelope(1, upsert("EUR")).unwrap_err();
        assert!(matches!(
            err,
            FundingError::TransientStorageConflict { funder_id: 1 }
        ));
        assert_eq!(racing.failures.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_upsert_validates_before_writing() {
        let store = store();
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(Repositories::from_store(&store), &settings, &clock);

        let mut request = upsert(" ");
        assert!(matches!(
            service.upsert_envelope(1, request.clone()),
            Err(FundingError::InvalidInput { .. })
        ));

        request.currency = "USD".to_string();
        request.exchange_rate = dec!(-1);
        assert!(matches!(
            service.upsert_envelope(1, request),
            Err(FundingError::InvalidInput { .. })
        ));
        assert!(service.list_envelopes().unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_envelope_is_not_found() {
        let store = store();
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(Repositories::from_store(&store), &settings, &clock);

        assert!(service.delete_envelope(1).unwrap_err().is_not_found());
        service.upsert_envelope(1, upsert("USD")).unwrap();
        service.delete_envelope(1).unwrap();
        assert!(service.list_envelopes().unwrap().is_empty());
    }

    #[test]
    fn test_parallel_compute_keeps_order() {
        let store = store();
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(Repositories::from_store(&store), &settings, &clock);

        let results = service.compute_funder_envelopes(&[1, 42, 1]);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_not_found());
        assert_eq!(
            results[0].as_ref().unwrap(),
            results[2].as_ref().unwrap()
        );
    }

    #[test]
    fn test_inverted_year_range_rejected() {
        let store = store();
        let settings = EngineSettings::default();
        let clock = clock();
        let service = ReportService::new(Repositories::from_store(&store), &settings, &clock);

        let criteria = ReportCriteria {
            year_range: Some(crate::schema::YearRange::new(2025, 2020)),
            ..Default::default()
        };
        assert!(matches!(
            service.build_sector_report(&criteria),
            Err(FundingError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_more_funders_than_workers() {
        let store = store();
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(Repositories::from_store(&store), &settings, &clock);

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let funder_ids: Vec<FunderId> = (0..(workers * 3 + 1) as i64)
            .map(|i| if i % 2 == 0 { 1 } else { 1000 + i })
            .collect();

        let results = service.compute_funder_envelopes(&funder_ids);
        assert_eq!(results.len(), funder_ids.len());
        for (result, funder_id) in results.iter().zip(&funder_ids) {
            match result {
                Ok(projection) => assert_eq!(projection.funder_id, *funder_id),
                Err(e) => {
                    assert!(e.is_not_found());
                    assert_ne!(*funder_id, 1);
                }
            }
        }
        assert!(service.compute_funder_envelopes(&[]).is_empty());
    }

    #[test]
    fn test_negative_split_rejected_in_reports() {
        let store = store()
            .with_projects(vec![Project {
                id: 10,
                title: "Clinic upgrades".to_string(),
                description: String::new(),
                start_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
                implementer_ids: vec![],
            }])
            .with_splits(
                Dimension::Sector,
                vec![PercentageSplit {
                    project_id: 10,
                    dimension_value_id: 2,
                    funds_percentage: dec!(-40),
                }],
            );
        let settings = EngineSettings::default();
        let clock = clock();
        let service = ReportService::new(Repositories::from_store(&store), &settings, &clock);

        assert!(matches!(
            service.build_sector_report(&ReportCriteria::default()),
            Err(FundingError::InvalidInput { .. })
        ));
        assert!(matches!(
            service.build_budget_report(),
            Err(FundingError::InvalidInput { .. })
        ));
        assert!(service
            .build_location_report(&ReportCriteria::default())
            .is_ok());
    }

    #[test]
    fn test_zero_rate_resolved_from_rate_list() {
        let store = store().with_rates(vec![CurrencyRate {
            code: "EUR".to_string(),
            rate: dec!(0.92),
        }]);
        let settings = EngineSettings::default();
        let clock = clock();
        let service = EnvelopeService::new(Repositories::from_store(&store), &settings, &clock);

        let mut request = upsert("eur");
        request.exchange_rate = Decimal::ZERO;
        service.upsert_envelope(1, request).unwrap();
        assert_eq!(service.list_envelopes().unwrap()[0].exchange_rate, dec!(0.92));

        let mut request = upsert("usd");
        request.exchange_rate = Decimal::ZERO;
        service.upsert_envelope(1, request).unwrap();
        assert_eq!(service.list_envelopes().unwrap()[0].exchange_rate, Decimal::ONE);

        let mut request = upsert("GBP");
        request.exchange_rate = Decimal::ZERO;
        assert!(matches!(
            service.upsert_envelope(1, request),
            Err(FundingError::InvalidInput { .. })
        ));
    }
}
