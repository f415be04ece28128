//! Small enums shared by every layer of the harness.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Transport used to talk to the server under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interface {
    Stdio,
    Http,
}

impl Interface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
        }
    }
}

impl FromStr for Interface {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            other => Err(CoreError::UnknownValue {
                kind: "interface",
                value: other.to_string(),
            }),
        }
    }
}

/// Encoding of load bodies sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    Json,
    ApacheArrow,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::ApacheArrow => "apache-arrow",
        }
    }
}

impl FromStr for InputType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "apache-arrow" | "arrow" => Ok(Self::ApacheArrow),
            other => Err(CoreError::UnknownValue {
                kind: "input type",
                value: other.to_string(),
            }),
        }
    }
}

/// Encoding of a response body.
///
/// Anything the harness does not know how to normalize is kept as
/// [`OutputType::Other`] and compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputType {
    #[default]
    Json,
    Msgpack,
    Xml,
    ApacheArrow,
    Other(String),
}

impl OutputType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Json => "json",
            Self::Msgpack => "msgpack",
            Self::Xml => "xml",
            Self::ApacheArrow => "apache-arrow",
            Self::Other(name) => name,
        }
    }

    /// Parse a declared output type. Unknown names are kept, not rejected.
    pub fn from_name(name: &str) -> Self {
        match name {
            "json" => Self::Json,
            "msgpack" => Self::Msgpack,
            "xml" => Self::Xml,
            "apache-arrow" | "arrow" => Self::ApacheArrow,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the body is a structured `[status, body...]` document.
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Json | Self::Msgpack)
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a mid-test error turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// The error stays in the transcript and the test fails on comparison.
    #[default]
    Default,
    /// The error converts the whole test into an omission.
    Omit,
}

impl FromStr for OnError {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "omit" => Ok(Self::Omit),
            other => Err(CoreError::UnknownValue {
                kind: "on-error policy",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn interface_round_trips_through_str() {
        assert_eq!("stdio".parse::<Interface>().unwrap(), Interface::Stdio);
        assert_eq!("http".parse::<Interface>().unwrap().as_str(), "http");
        assert_matches!(
            "gqtp".parse::<Interface>(),
            Err(CoreError::UnknownValue { kind: "interface", .. })
        );
    }

    #[test]
    fn unknown_output_type_is_kept() {
        assert_eq!(OutputType::from_name("tsv"), OutputType::Other("tsv".into()));
        assert!(!OutputType::from_name("tsv").is_structured());
        assert!(OutputType::from_name("msgpack").is_structured());
    }

    #[test]
    fn arrow_aliases() {
        assert_eq!(OutputType::from_name("arrow"), OutputType::ApacheArrow);
        assert_eq!("arrow".parse::<InputType>().unwrap(), InputType::ApacheArrow);
    }

    #[test]
    fn on_error_policy() {
        assert_eq!("omit".parse::<OnError>().unwrap(), OnError::Omit);
        assert_eq!(OnError::default(), OnError::Default);
        assert!("ignore".parse::<OnError>().is_err());
    }
}
