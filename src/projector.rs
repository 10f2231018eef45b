use crate::schema::{DisbursementRecord, FundingRecord, Project, YearRange};
use crate::utils::{months_between, percentage_of, round_units, safe_div};
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cost, spend and monthly run-rate of one project within one sector or location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisbursementProjection {
    pub funding_total: Decimal,
    pub project_cost: Decimal,
    pub actual_disbursements: Decimal,
    pub planned_disbursements: Decimal,
    pub months_remaining: i32,
}

/// Projects planned monthly disbursement for a project over its remaining lifetime.
pub struct DisbursementProjector {
    today: NaiveDate,
    year_filter: Option<YearRange>,
}

impl DisbursementProjector {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            year_filter: None,
        }
    }

    /// Only disbursements dated within `range` count as actual spend.
    pub fn with_year_filter(mut self, range: Option<YearRange>) -> Self {
        self.year_filter = range;
        self
    }

    pub fn project(
        &self,
        project: &Project,
        funding: &[FundingRecord],
        disbursements: &[DisbursementRecord],
        percentage: Decimal,
    ) -> DisbursementProjection {
        let funding_total = round_units(
            funding
                .iter()
                .filter(|f| f.project_id == project.id)
                .map(FundingRecord::reporting_value)
                .sum(),
        );
        let project_cost = round_units(percentage_of(funding_total, percentage));

        let disbursed: Decimal = disbursements
            .iter()
            .filter(|d| d.project_id == project.id)
            .filter(|d| self.year_filter.map_or(true, |range| range.contains(d.year())))
            .map(DisbursementRecord::reporting_value)
            .sum();
        let actual_disbursements = round_units(percentage_of(disbursed, percentage));

        let months_remaining = months_between(self.today, project.end_date);
        let planned_disbursements = if months_remaining > 0 {
            safe_div(
                project_cost - actual_disbursements,
                Decimal::from(months_remaining),
            )
            .map(round_units)
            .unwrap_or(Decimal::ZERO)
            .max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        debug!(
            "Project {} at {}%: cost {}, disbursed {}, {} months left, planned {}/month",
            project.id,
            percentage,
            project_cost,
            actual_disbursements,
            months_remaining,
            planned_disbursements
        );

        DisbursementProjection {
            funding_total,
            project_cost,
            actual_disbursements,
            planned_disbursements,
            months_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn project(end: NaiveDate) -> Project {
        Project {
            id: 10,
            title: "Water supply".to_string(),
            description: String::new(),
            start_date: date(2022, 1, 1),
            end_date: end,
            implementer_ids: vec![],
        }
    }

    fn funding(amount: Decimal, rate: Decimal) -> FundingRecord {
        FundingRecord {
            funder_id: 1,
            project_id: 10,
            amount,
            exchange_rate: rate,
            currency: "USD".to_string(),
            funding_type: None,
        }
    }

    fn disbursement(y: i32, amount: Decimal) -> DisbursementRecord {
        DisbursementRecord {
            project_id: 10,
            amount,
            exchange_rate: Decimal::ONE,
            date: date(y, 3, 1),
        }
    }

    #[test]
    fn test_planned_rate_over_remaining_months() {
        let projector = DisbursementProjector::new(date(2024, 1, 15));
        let result = projector.project(
            &project(date(2024, 11, 30)),
            &[funding(dec!(100000), dec!(1)), funding(dec!(20000), dec!(1))],
            &[disbursement(2023, dec!(20000))],
            dec!(50),
        );

        assert_eq!(result.funding_total, dec!(120000));
        assert_eq!(result.project_cost, dec!(60000));
        assert_eq!(result.actual_disbursements, dec!(10000));
        assert_eq!(result.months_remaining, 10);
        assert_eq!(result.planned_disbursements, dec!(5000));
    }

    #[test]
    fn test_ended_project_plans_nothing() {
        let projector = DisbursementProjector::new(date(2024, 6, 1));
        let result = projector.project(
            &project(date(2023, 12, 31)),
            &[funding(dec!(1000), dec!(1))],
            &[],
            dec!(100),
        );

        assert!(result.months_remaining <= 0);
        assert_eq!(result.planned_disbursements, Decimal::ZERO);
    }

    #[test]
    fn test_same_month_end_plans_nothing() {
        let projector = DisbursementProjector::new(date(2024, 6, 1));
        let result = projector.project(&project(date(2024, 6, 30)), &[], &[], dec!(100));
        assert_eq!(result.months_remaining, 0);
        assert_eq!(result.planned_disbursements, Decimal::ZERO);
    }

    #[test]
    fn test_over_disbursed_project_clamps_to_zero() {
        let projector = DisbursementProjector::new(date(2024, 1, 1));
        let result = projector.project(
            &project(date(2025, 1, 1)),
            &[funding(dec!(1000), dec!(1))],
            &[disbursement(2023, dec!(5000))],
            dec!(100),
        );
        assert_eq!(result.actual_disbursements, dec!(5000));
        assert_eq!(result.planned_disbursements, Decimal::ZERO);
    }

    #[test]
    fn test_year_filter_limits_actuals() {
        let projector = DisbursementProjector::new(date(2024, 1, 1))
            .with_year_filter(Some(YearRange::new(2024, 2024)));
        let result = projector.project(
            &project(date(2025, 1, 1)),
            &[funding(dec!(1000), dec!(2.5))],
            &[disbursement(2023, dec!(300)), disbursement(2024, dec!(200))],
            dec!(40),
        );
        assert_eq!(result.funding_total, dec!(2500));
        assert_eq!(result.project_cost, dec!(1000));
        assert_eq!(result.actual_disbursements, dec!(80));
        // (1000 - 80) / 12 = 76.67
        assert_eq!(result.planned_disbursements, dec!(77));
    }
}
