use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Upstream data providers the fetch layer knows how to budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// Quotes, fundamentals, earnings calendars.
    Finnhub,
    /// Macro series.
    Fred,
    /// Commitments of Traders positioning (Socrata API).
    Cftc,
    /// Options chains.
    Yahoo,
    /// Euro-area macro series.
    Ecb,
    /// Company facts.
    Sec,
}

impl SourceId {
    pub const ALL: [Self; 6] = [
        Self::Finnhub,
        Self::Fred,
        Self::Cftc,
        Self::Yahoo,
        Self::Ecb,
        Self::Sec,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Finnhub => "finnhub",
            Self::Fred => "fred",
            Self::Cftc => "cftc",
            Self::Yahoo => "yahoo",
            Self::Ecb => "ecb",
            Self::Sec => "sec",
        }
    }

    /// Production base URL used when configuration does not override it.
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::Finnhub => "https://finnhub.io/api/v1",
            Self::Fred => "https://api.stlouisfed.org/fred",
            Self::Cftc => "https://publicreporting.cftc.gov/resource",
            Self::Yahoo => "https://query2.finance.yahoo.com/v7/finance",
            Self::Ecb => "https://data-api.ecb.europa.eu/service/data",
            Self::Sec => "https://data.sec.gov/api/xbrl",
        }
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "finnhub" => Ok(Self::Finnhub),
            "fred" => Ok(Self::Fred),
            "cftc" => Ok(Self::Cftc),
            "yahoo" => Ok(Self::Yahoo),
            "ecb" => Ok(Self::Ecb),
            "sec" => Ok(Self::Sec),
            other => Err(ValidationError::InvalidSource {
                value: other.to_owned(),
            }),
        }
    }
}
