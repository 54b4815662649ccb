//! Exchange patterns and their resolution.
//!
//! Every envelope carries the pattern its producer asked for. Outbound
//! connectors may declare their own pattern, which always wins:
//!
//! | requested          | connector declares | effective          |
//! |--------------------|--------------------|--------------------|
//! | `RequestResponse`  | none               | `RequestResponse`  |
//! | `RequestResponse`  | `OneWay`           | `OneWay`           |
//! | `OneWay`           | `RequestResponse`  | `RequestResponse`  |
//!
//! A one-way effective pattern only affects the return channel of a chain.
//! Processors still execute and connectors still dispatch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether a caller expects a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePattern {
    /// Fire-and-forget
    OneWay,
    /// The caller awaits a result
    #[default]
    RequestResponse,
}

impl ExchangePattern {
    /// Check if the pattern has a response leg
    #[must_use]
    pub const fn has_response(self) -> bool {
        matches!(self, Self::RequestResponse)
    }

    /// Canonical string form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneWay => "one_way",
            Self::RequestResponse => "request_response",
        }
    }
}

impl fmt::Display for ExchangePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown exchange pattern name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown exchange pattern: {0}")]
pub struct UnknownExchangePattern(pub String);

impl FromStr for ExchangePattern {
    type Err = UnknownExchangePattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "one_way" | "oneway" => Ok(Self::OneWay),
            "request_response" | "requestresponse" => Ok(Self::RequestResponse),
            _ => Err(UnknownExchangePattern(s.to_string())),
        }
    }
}

/// Resolve the effective exchange pattern for an outbound step.
///
/// An explicit pattern declared by the connector overrides the pattern the
/// envelope was sent with.
///
/// # Example
///
/// ```
/// use courier_core::exchange::{resolve, ExchangePattern};
///
/// assert_eq!(
///     resolve(ExchangePattern::RequestResponse, Some(ExchangePattern::OneWay)),
///     ExchangePattern::OneWay
/// );
/// assert_eq!(
///     resolve(ExchangePattern::OneWay, None),
///     ExchangePattern::OneWay
/// );
/// ```
#[must_use]
pub const fn resolve(requested: ExchangePattern, declared: Option<ExchangePattern>) -> ExchangePattern {
    match declared {
        Some(pattern) => pattern,
        None => requested,
    }
}
