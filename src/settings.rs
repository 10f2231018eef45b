use crate::error::{FundingError, Result};
use serde::{Deserialize, Serialize};

/// Engine-wide knobs. Every field has a default so a partial JSON document
/// (or none at all) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Reporting currency used when the currency repository has no default.
    pub fallback_currency: String,
    /// Read-check-write attempts for an envelope upsert before giving up.
    pub max_upsert_attempts: u32,
    /// Report year filters below this bound are treated as "no filter".
    pub minimum_report_year: i32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fallback_currency: "USD".to_string(),
            max_upsert_attempts: 3,
            minimum_report_year: 1970,
        }
    }
}

impl EngineSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fallback_currency.trim().is_empty() {
            return Err(FundingError::InvalidSettings(
                "fallback_currency must not be empty".to_string(),
            ));
        }
        if self.max_upsert_attempts == 0 {
            return Err(FundingError::InvalidSettings(
                "max_upsert_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
