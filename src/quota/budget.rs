//! Monthly budget projection.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Per-tenant budget inputs for one billing period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub monthly_budget: f64,
    #[serde(default)]
    pub current_spend: f64,
    #[serde(default)]
    pub days_elapsed: u32,
    #[serde(default = "default_days_in_period")]
    pub days_in_period: u32,
}

fn default_days_in_period() -> u32 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetHealth {
    OnTrack,
    OverBudget,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    pub status: BudgetHealth,
    pub current_spend: f64,
    pub projected_monthly: f64,
    pub days_remaining: u32,
}

impl BudgetPolicy {
    pub fn validate(&self, tenant: &str) -> Result<()> {
        if self.days_in_period == 0 {
            return Err(Error::config(format!(
                "tenant '{tenant}': days_in_period must be positive"
            )));
        }
        if self.monthly_budget < 0.0 || self.current_spend < 0.0 {
            return Err(Error::config(format!(
                "tenant '{tenant}': budget amounts must be non-negative"
            )));
        }
        Ok(())
    }

    /// Linear extrapolation of the current spend rate to the full period.
    ///
    /// With no elapsed days there is no rate to extrapolate; the projection
    /// is the current spend and the report stays on track unless the spend
    /// itself already exceeds the budget.
    pub fn project(&self) -> BudgetReport {
        let projected_monthly = if self.days_elapsed == 0 {
            self.current_spend
        } else {
            self.current_spend / f64::from(self.days_elapsed) * f64::from(self.days_in_period)
        };
        let status = if projected_monthly > self.monthly_budget {
            BudgetHealth::OverBudget
        } else {
            BudgetHealth::OnTrack
        };
        BudgetReport {
            status,
            current_spend: self.current_spend,
            projected_monthly,
            days_remaining: self.days_in_period.saturating_sub(self.days_elapsed),
        }
    }
}
