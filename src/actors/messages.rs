//! Message types shared between the actors and the HTTP surface

use std::str::FromStr;

/// Level of the dashboard's variable hierarchy target → filter → sub filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableTier {
    /// Open targets; also selected by an empty tier
    Target,
    Filter,
    SubFilter,
    /// Anything else, answered with an empty list
    Unknown,
}

impl VariableTier {
    pub fn parse(tier: &str) -> Self {
        match tier {
            "" | "target" => Self::Target,
            "filter" => Self::Filter,
            "sub_filter" => Self::SubFilter,
            _ => Self::Unknown,
        }
    }
}

impl FromStr for VariableTier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}
