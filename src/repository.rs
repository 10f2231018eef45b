//! Read and write contracts the services depend on, plus an in-memory store.
//!
//! The traits are the seam to whatever persistence layer hosts the engine.
//! [`MemoryStore`] implements all three over a single lock so that every write
//! is atomic with respect to concurrent readers.

use crate::error::{FundingError, Result};
use crate::schema::{
    CurrencyRate, Dimension, DimensionValue, DisbursementRecord, Envelope, FunderId,
    FundingRecord, Organization, PercentageSplit, Project, ProjectId, YearRange,
};
use log::debug;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

/// Read access to the project aggregate: funding, spend, splits and catalogs.
pub trait ProjectRepository: Send + Sync {
    /// Funding commitments on one project, from every funder.
    fn funding_for(&self, project_id: ProjectId) -> Result<Vec<FundingRecord>>;

    /// Everything one funder has committed, across projects.
    fn funding_by_funder(&self, funder_id: FunderId) -> Result<Vec<FundingRecord>>;

    /// Disbursements of the given projects, optionally limited to a year range.
    fn disbursements_for(
        &self,
        project_ids: &[ProjectId],
        years: Option<YearRange>,
    ) -> Result<Vec<DisbursementRecord>>;

    fn splits_for(
        &self,
        dimension: Dimension,
        project_ids: &[ProjectId],
    ) -> Result<Vec<PercentageSplit>>;

    fn dimension_values(&self, dimension: Dimension) -> Result<Vec<DimensionValue>>;

    fn projects(&self) -> Result<Vec<Project>>;

    fn organizations(&self) -> Result<Vec<Organization>>;

    fn funding_for_projects(&self, project_ids: &[ProjectId]) -> Result<Vec<FundingRecord>> {
        let mut funding = Vec::new();
        for &project_id in project_ids {
            funding.extend(self.funding_for(project_id)?);
        }
        Ok(funding)
    }
}

/// A persisted envelope together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEnvelope {
    pub envelope: Envelope,
    pub version: u64,
}

/// Versioned envelope rows, at most one per funder.
pub trait EnvelopeRepository: Send + Sync {
    fn get_by_funder(&self, funder_id: FunderId) -> Result<Option<StoredEnvelope>>;

    /// Creates the funder's row. Fails with `TransientStorageConflict` if one exists.
    fn insert(&self, envelope: &Envelope) -> Result<u64>;

    /// Replaces the funder's row if it is still at `expected_version`.
    fn update(&self, envelope: &Envelope, expected_version: u64) -> Result<u64>;

    /// Removes the funder's row, returning whether one existed.
    fn delete(&self, funder_id: FunderId) -> Result<bool>;

    fn list(&self) -> Result<Vec<Envelope>>;
}

pub trait CurrencyRepository: Send + Sync {
    /// The system reporting currency, if one is configured.
    fn default_currency(&self) -> Result<Option<CurrencyRate>>;

    /// Known multipliers from the system currency into other currencies.
    fn rates(&self) -> Result<Vec<CurrencyRate>>;
}

#[derive(Debug, Default)]
struct StoreState {
    projects: Vec<Project>,
    organizations: Vec<Organization>,
    funding: Vec<FundingRecord>,
    disbursements: Vec<DisbursementRecord>,
    splits: BTreeMap<Dimension, Vec<PercentageSplit>>,
    dimension_values: BTreeMap<Dimension, Vec<DimensionValue>>,
    envelopes: BTreeMap<FunderId, StoredEnvelope>,
    default_currency: Option<CurrencyRate>,
    rates: Vec<CurrencyRate>,
}

/// In-memory implementation of every repository trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_currency(self, code: &str, rate: Decimal) -> Self {
        self.seed(|state| {
            state.default_currency = Some(CurrencyRate {
                code: code.to_string(),
                rate,
            })
        })
    }

    pub fn with_rates(self, rates: impl IntoIterator<Item = CurrencyRate>) -> Self {
        self.seed(|state| state.rates.extend(rates))
    }

    pub fn with_projects(self, projects: impl IntoIterator<Item = Project>) -> Self {
        self.seed(|state| state.projects.extend(projects))
    }

    pub fn with_organizations(self, organizations: impl IntoIterator<Item = Organization>) -> Self {
        self.seed(|state| state.organizations.extend(organizations))
    }

    pub fn with_funding(self, funding: impl IntoIterator<Item = FundingRecord>) -> Self {
        self.seed(|state| state.funding.extend(funding))
    }

    pub fn with_disbursements(
        self,
        disbursements: impl IntoIterator<Item = DisbursementRecord>,
    ) -> Self {
        self.seed(|state| state.disbursements.extend(disbursements))
    }

    pub fn with_splits(
        self,
        dimension: Dimension,
        splits: impl IntoIterator<Item = PercentageSplit>,
    ) -> Self {
        self.seed(|state| state.splits.entry(dimension).or_default().extend(splits))
    }

    pub fn with_dimension_values(
        self,
        dimension: Dimension,
        values: impl IntoIterator<Item = DimensionValue>,
    ) -> Self {
        self.seed(|state| {
            state
                .dimension_values
                .entry(dimension)
                .or_default()
                .extend(values)
        })
    }

    // Builders hold the store by value; no other thread can observe a poisoned state.
    fn seed(mut self, f: impl FnOnce(&mut StoreState)) -> Self {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(state);
        self
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T> {
        let state = self
            .state
            .read()
            .map_err(|_| FundingError::Storage("store lock poisoned".to_string()))?;
        Ok(f(&state))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .write()
            .map_err(|_| FundingError::Storage("store lock poisoned".to_string()))?;
        f(&mut state)
    }
}

fn id_set(project_ids: &[ProjectId]) -> BTreeSet<ProjectId> {
    project_ids.iter().copied().collect()
}

impl ProjectRepository for MemoryStore {
    fn funding_for(&self, project_id: ProjectId) -> Result<Vec<FundingRecord>> {
        self.read(|state| {
            state
                .funding
                .iter()
                .filter(|f| f.project_id == project_id)
                .cloned()
                .collect()
        })
    }

    fn funding_by_funder(&self, funder_id: FunderId) -> Result<Vec<FundingRecord>> {
        self.read(|state| {
            state
                .funding
                .iter()
                .filter(|f| f.funder_id == funder_id)
                .cloned()
                .collect()
        })
    }

    fn disbursements_for(
        &self,
        project_ids: &[ProjectId],
        years: Option<YearRange>,
    ) -> Result<Vec<DisbursementRecord>> {
        let ids = id_set(project_ids);
        self.read(|state| {
            state
                .disbursements
                .iter()
                .filter(|d| ids.contains(&d.project_id))
                .filter(|d| years.map_or(true, |range| range.contains(d.year())))
                .cloned()
                .collect()
        })
    }

    fn splits_for(
        &self,
        dimension: Dimension,
        project_ids: &[ProjectId],
    ) -> Result<Vec<PercentageSplit>> {
        let ids = id_set(project_ids);
        self.read(|state| {
            state
                .splits
                .get(&dimension)
                .map(|splits| {
                    splits
                        .iter()
                        .filter(|s| ids.contains(&s.project_id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn dimension_values(&self, dimension: Dimension) -> Result<Vec<DimensionValue>> {
        self.read(|state| {
            state
                .dimension_values
                .get(&dimension)
                .cloned()
                .unwrap_or_default()
        })
    }

    fn projects(&self) -> Result<Vec<Project>> {
        self.read(|state| state.projects.clone())
    }

    fn organizations(&self) -> Result<Vec<Organization>> {
        self.read(|state| state.organizations.clone())
    }
}

impl EnvelopeRepository for MemoryStore {
    fn get_by_funder(&self, funder_id: FunderId) -> Result<Option<StoredEnvelope>> {
        self.read(|state| state.envelopes.get(&funder_id).cloned())
    }

    fn insert(&self, envelope: &Envelope) -> Result<u64> {
        self.mutate(|state| {
            if state.envelopes.contains_key(&envelope.funder_id) {
                return Err(FundingError::TransientStorageConflict {
                    funder_id: envelope.funder_id,
                });
            }
            state.envelopes.insert(
                envelope.funder_id,
                StoredEnvelope {
                    envelope: envelope.clone(),
                    version: 1,
                },
            );
            debug!("Inserted envelope for funder {}", envelope.funder_id);
            Ok(1)
        })
    }

    fn update(&self, envelope: &Envelope, expected_version: u64) -> Result<u64> {
        self.mutate(|state| {
            let stored = state.envelopes.get_mut(&envelope.funder_id).ok_or(
                FundingError::TransientStorageConflict {
                    funder_id: envelope.funder_id,
                },
            )?;
            if stored.version != expected_version {
                return Err(FundingError::TransientStorageConflict {
                    funder_id: envelope.funder_id,
                });
            }
            stored.envelope = envelope.clone();
            stored.version += 1;
            debug!(
                "Updated envelope for funder {} to version {}",
                envelope.funder_id, stored.version
            );
            Ok(stored.version)
        })
    }

    fn delete(&self, funder_id: FunderId) -> Result<bool> {
        self.mutate(|state| Ok(state.envelopes.remove(&funder_id).is_some()))
    }

    fn list(&self) -> Result<Vec<Envelope>> {
        self.read(|state| {
            state
                .envelopes
                .values()
                .map(|stored| stored.envelope.clone())
                .collect()
        })
    }
}

impl CurrencyRepository for MemoryStore {
    fn default_currency(&self) -> Result<Option<CurrencyRate>> {
        self.read(|state| state.default_currency.clone())
    }

    fn rates(&self) -> Result<Vec<CurrencyRate>> {
        self.read(|state| state.rates.clone())
    }
}
