use crate::projector::DisbursementProjector;
use crate::schema::{
    display_name, Dimension, DimensionValue, DimensionValueId, DisbursementRecord, FundingRecord,
    Organization, OrganizationId, PercentageSplit, Project, ProjectId, YearRange,
};
use crate::utils::{format_thousands, percentage_of, round_units, safe_div};
use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Search filters for project listings grouped by sector or location.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReportCriteria {
    #[serde(default)]
    #[schemars(description = "Case-insensitive substring of the project title.")]
    pub title: Option<String>,

    #[serde(default)]
    #[schemars(
        description = "Keeps projects ending within these years and counts only disbursements dated within them. Ignored unless both bounds are plausible calendar years."
    )]
    pub year_range: Option<YearRange>,

    #[serde(default)]
    #[schemars(description = "Keeps projects funded or implemented by any of these organizations.")]
    pub organization_ids: Vec<OrganizationId>,

    #[serde(default)]
    #[schemars(description = "Restricts the report to these sectors or locations. Empty means all.")]
    pub dimension_value_ids: Vec<DimensionValueId>,
}

impl ReportCriteria {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ReportCriteria)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }

    /// The year filter, if both bounds are at or above `minimum_year`.
    pub fn effective_year_range(&self, minimum_year: i32) -> Option<YearRange> {
        self.year_range
            .filter(|range| range.start >= minimum_year && range.end >= minimum_year)
    }
}

/// Everything a report reads about projects, fetched before the report runs.
#[derive(Debug, Clone, Default)]
pub struct ProjectPortfolio {
    pub projects: Vec<Project>,
    pub funding: Vec<FundingRecord>,
    pub disbursements: Vec<DisbursementRecord>,
    pub organizations: Vec<Organization>,
}

/// Percentage splits of one dimension together with the value catalog.
#[derive(Debug, Clone, Default)]
pub struct DimensionData {
    pub splits: Vec<PercentageSplit>,
    pub values: Vec<DimensionValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectReportLine {
    pub project_id: ProjectId,
    pub title: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub funders: String,
    pub implementers: String,
    pub project_cost: Decimal,
    pub actual_disbursements: Decimal,
    pub planned_disbursements: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectGroup {
    pub dimension_value_id: DimensionValueId,
    pub name: String,
    pub total_funding: Decimal,
    pub total_disbursements: Decimal,
    pub projects: Vec<ProjectReportLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedProjectReport {
    pub dimension: Dimension,
    pub title: String,
    pub generated_on: NaiveDate,
    pub groups: Vec<ProjectGroup>,
    /// Sum of the already-rounded group totals.
    pub grand_total_funding: Decimal,
    pub grand_total_disbursements: Decimal,
}

fn report_title(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::Sector => "Projects by sector",
        Dimension::Location => "Projects by location",
    }
}

/// Projects matching the title, year and organization filters.
pub fn select_projects<'a>(
    portfolio: &'a ProjectPortfolio,
    criteria: &ReportCriteria,
    minimum_year: i32,
) -> Vec<&'a Project> {
    let title = criteria
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase);
    let year_range = criteria.effective_year_range(minimum_year);
    let organizations: BTreeSet<OrganizationId> =
        criteria.organization_ids.iter().copied().collect();

    portfolio
        .projects
        .iter()
        .filter(|p| {
            title
                .as_ref()
                .map_or(true, |t| p.title.to_lowercase().contains(t.as_str()))
        })
        .filter(|p| year_range.map_or(true, |range| range.contains(p.end_date.year())))
        .filter(|p| {
            organizations.is_empty()
                || p.implementer_ids.iter().any(|id| organizations.contains(id))
                || portfolio
                    .funding
                    .iter()
                    .any(|f| f.project_id == p.id && organizations.contains(&f.funder_id))
        })
        .collect()
}

/// Groups selected projects by dimension value, ordered by display name, with a
/// disbursement projection per project line.
pub fn build_dimension_report(
    dimension: Dimension,
    criteria: &ReportCriteria,
    portfolio: &ProjectPortfolio,
    data: &DimensionData,
    today: NaiveDate,
    minimum_year: i32,
) -> GroupedProjectReport {
    let selected: BTreeMap<ProjectId, &Project> = select_projects(portfolio, criteria, minimum_year)
        .into_iter()
        .map(|p| (p.id, p))
        .collect();
    let wanted_values: BTreeSet<DimensionValueId> =
        criteria.dimension_value_ids.iter().copied().collect();

    info!(
        "Building {} report for {} of {} projects",
        dimension.label(),
        selected.len(),
        portfolio.projects.len()
    );

    // value -> project -> percentage
    let mut memberships: BTreeMap<DimensionValueId, BTreeMap<ProjectId, Decimal>> = BTreeMap::new();
    for split in &data.splits {
        if !selected.contains_key(&split.project_id) {
            continue;
        }
        if !wanted_values.is_empty() && !wanted_values.contains(&split.dimension_value_id) {
            continue;
        }
        *memberships
            .entry(split.dimension_value_id)
            .or_default()
            .entry(split.project_id)
            .or_default() += split.funds_percentage;
    }

    let projector = DisbursementProjector::new(today)
        .with_year_filter(criteria.effective_year_range(minimum_year));

    let mut groups: Vec<ProjectGroup> = memberships
        .into_iter()
        .map(|(value_id, members)| {
            let mut projects: Vec<ProjectReportLine> = members
                .into_iter()
                .filter_map(|(project_id, percentage)| {
                    let project = selected.get(&project_id)?;
                    Some(report_line(project, percentage, portfolio, &projector))
                })
                .collect();
            projects.sort_by(|a, b| a.title.cmp(&b.title).then(a.project_id.cmp(&b.project_id)));

            let total_funding = round_units(projects.iter().map(|p| p.project_cost).sum());
            let total_disbursements =
                round_units(projects.iter().map(|p| p.actual_disbursements).sum());

            ProjectGroup {
                dimension_value_id: value_id,
                name: display_name(&data.values, dimension, value_id),
                total_funding,
                total_disbursements,
                projects,
            }
        })
        .collect();
    groups.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then(a.dimension_value_id.cmp(&b.dimension_value_id))
    });

    for group in &groups {
        debug!(
            "{} '{}': {} projects, funding {}, disbursed {}",
            dimension.label(),
            group.name,
            group.projects.len(),
            format_thousands(group.total_funding),
            format_thousands(group.total_disbursements)
        );
    }

    let grand_total_funding = groups.iter().map(|g| g.total_funding).sum();
    let grand_total_disbursements = groups.iter().map(|g| g.total_disbursements).sum();

    GroupedProjectReport {
        dimension,
        title: report_title(dimension).to_string(),
        generated_on: today,
        groups,
        grand_total_funding,
        grand_total_disbursements,
    }
}

fn report_line(
    project: &Project,
    percentage: Decimal,
    portfolio: &ProjectPortfolio,
    projector: &DisbursementProjector,
) -> ProjectReportLine {
    let projection = projector.project(
        project,
        &portfolio.funding,
        &portfolio.disbursements,
        percentage,
    );

    let funder_ids = portfolio
        .funding
        .iter()
        .filter(|f| f.project_id == project.id)
        .map(|f| f.funder_id);

    ProjectReportLine {
        project_id: project.id,
        title: project.title.clone(),
        start_date: project.start_date,
        end_date: project.end_date,
        funders: organization_names(funder_ids, &portfolio.organizations),
        implementers: organization_names(
            project.implementer_ids.iter().copied(),
            &portfolio.organizations,
        ),
        project_cost: projection.project_cost,
        actual_disbursements: projection.actual_disbursements,
        planned_disbursements: projection.planned_disbursements,
    }
}

/// Distinct organization names in first-seen order, comma separated.
fn organization_names(
    ids: impl Iterator<Item = OrganizationId>,
    organizations: &[Organization],
) -> String {
    let mut seen = BTreeSet::new();
    let names: Vec<&str> = ids
        .filter(|id| seen.insert(*id))
        .filter_map(|id| organizations.iter().find(|o| o.id == id))
        .map(|o| o.name.as_str())
        .collect();
    names.join(", ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingByType {
    pub funding_type: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionShare {
    pub name: String,
    pub disbursements: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedDisbursement {
    pub year: i32,
    pub disbursements: Decimal,
    pub sector_shares: Vec<DimensionShare>,
    pub location_shares: Vec<DimensionShare>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectBudget {
    pub project_id: ProjectId,
    pub title: String,
    pub previous_year: i32,
    pub project_value: Decimal,
    pub funding: Vec<FundingByType>,
    pub previous_year_disbursements: Decimal,
    /// Disbursed in the current year.
    pub actual_disbursements: Decimal,
    pub expected_disbursements: Vec<ExpectedDisbursement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub generated_on: NaiveDate,
    pub projects: Vec<ProjectBudget>,
}

const UNSPECIFIED_FUNDING_TYPE: &str = "Unspecified";

/// Per-project budget outlook for every project still running this year.
pub fn build_budget_report(
    portfolio: &ProjectPortfolio,
    sectors: &DimensionData,
    locations: &DimensionData,
    today: NaiveDate,
) -> BudgetReport {
    let current_year = today.year();
    let mut projects: Vec<&Project> = portfolio
        .projects
        .iter()
        .filter(|p| p.end_date.year() >= current_year)
        .collect();
    projects.sort_by_key(|p| p.id);

    info!(
        "Building budget report for {} active projects",
        projects.len()
    );

    let projects = projects
        .into_iter()
        .map(|project| project_budget(project, portfolio, sectors, locations, current_year))
        .collect();

    BudgetReport {
        generated_on: today,
        projects,
    }
}

fn project_budget(
    project: &Project,
    portfolio: &ProjectPortfolio,
    sectors: &DimensionData,
    locations: &DimensionData,
    current_year: i32,
) -> ProjectBudget {
    let previous_year = current_year - 1;
    let end_year = project.end_date.year();
    let years_left = end_year - current_year;

    let mut by_type: BTreeMap<String, Decimal> = BTreeMap::new();
    for funding in portfolio.funding.iter().filter(|f| f.project_id == project.id) {
        let key = funding
            .funding_type
            .clone()
            .unwrap_or_else(|| UNSPECIFIED_FUNDING_TYPE.to_string());
        *by_type.entry(key).or_default() += funding.reporting_value();
    }
    let funding: Vec<FundingByType> = by_type
        .into_iter()
        .map(|(funding_type, amount)| FundingByType {
            funding_type,
            amount,
        })
        .collect();
    let project_value = round_units(funding.iter().map(|f| f.amount).sum());

    let disbursements: Vec<&DisbursementRecord> = portfolio
        .disbursements
        .iter()
        .filter(|d| d.project_id == project.id)
        .collect();

    if disbursements.is_empty() {
        return ProjectBudget {
            project_id: project.id,
            title: project.title.clone(),
            previous_year,
            project_value,
            funding,
            previous_year_disbursements: Decimal::ZERO,
            actual_disbursements: Decimal::ZERO,
            expected_disbursements: Vec::new(),
        };
    }

    let disbursed_in = |year: i32| -> Decimal {
        round_units(
            disbursements
                .iter()
                .filter(|d| d.year() == year)
                .map(|d| d.reporting_value())
                .sum(),
        )
    };
    let previous_year_disbursements = disbursed_in(previous_year);
    let actual_disbursements = disbursed_in(current_year);

    // Constant across the project's remaining years.
    let yearly = if years_left > 0 {
        safe_div(project_value - actual_disbursements, Decimal::from(years_left))
            .map(round_units)
            .unwrap_or(Decimal::ZERO)
    } else {
        actual_disbursements
    };

    let mut expected_disbursements: Vec<ExpectedDisbursement> = (current_year..=end_year)
        .map(|year| ExpectedDisbursement {
            year,
            disbursements: yearly,
            sector_shares: shares(project.id, yearly, sectors, Dimension::Sector),
            location_shares: shares(project.id, yearly, locations, Dimension::Location),
        })
        .collect();
    let horizon = current_year + 3;
    expected_disbursements.extend(((end_year + 1)..=horizon).map(|year| ExpectedDisbursement {
        year,
        disbursements: Decimal::ZERO,
        sector_shares: Vec::new(),
        location_shares: Vec::new(),
    }));

    ProjectBudget {
        project_id: project.id,
        title: project.title.clone(),
        previous_year,
        project_value,
        funding,
        previous_year_disbursements,
        actual_disbursements,
        expected_disbursements,
    }
}

fn shares(
    project_id: ProjectId,
    amount: Decimal,
    data: &DimensionData,
    dimension: Dimension,
) -> Vec<DimensionShare> {
    data.splits
        .iter()
        .filter(|s| s.project_id == project_id)
        .map(|s| DimensionShare {
            name: display_name(&data.values, dimension, s.dimension_value_id),
            disbursements: round_units(percentage_of(amount, s.funds_percentage)),
        })
        .collect()
}
