//! GAL operation, source and scope enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GalError;

/// The operation a GAL request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalOp {
    Search,
    Sync,
    Autocomplete,
}

/// Which directory a search config talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalType {
    /// The server's own directory.
    #[default]
    #[serde(alias = "zimbra")]
    Internal,
    /// A customer directory configured on the domain.
    #[serde(alias = "ldap")]
    External,
}

/// Domain-level choice of directories backing the GAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalMode {
    #[default]
    #[serde(alias = "zimbra")]
    Internal,
    #[serde(alias = "ldap")]
    External,
    Both,
}

impl GalMode {
    /// Whether data sources of `gal_type` belong to this mode.
    pub fn includes(self, gal_type: GalType) -> bool {
        match self {
            GalMode::Both => true,
            GalMode::Internal => gal_type == GalType::Internal,
            GalMode::External => gal_type == GalType::External,
        }
    }
}

/// Entry kinds a search is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalSearchType {
    #[default]
    All,
    Account,
    Resource,
    Group,
}

impl fmt::Display for GalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GalOp::Search => "search",
            GalOp::Sync => "sync",
            GalOp::Autocomplete => "autocomplete",
        })
    }
}

impl fmt::Display for GalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GalType::Internal => "internal",
            GalType::External => "external",
        })
    }
}

impl fmt::Display for GalSearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GalSearchType::All => "all",
            GalSearchType::Account => "account",
            GalSearchType::Resource => "resource",
            GalSearchType::Group => "group",
        })
    }
}

impl FromStr for GalSearchType {
    type Err = GalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(GalSearchType::All),
            "account" => Ok(GalSearchType::Account),
            "resource" => Ok(GalSearchType::Resource),
            "group" => Ok(GalSearchType::Group),
            other => Err(GalError::InvalidRequest(format!(
                "unknown GAL search type '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_includes() {
        assert!(GalMode::Both.includes(GalType::External));
        assert!(GalMode::Internal.includes(GalType::Internal));
        assert!(!GalMode::Internal.includes(GalType::External));
    }

    #[test]
    fn test_legacy_names_deserialize() {
        let mode: GalMode = serde_json::from_str("\"ldap\"").expect("parse");
        assert_eq!(mode, GalMode::External);
        let ty: GalType = serde_json::from_str("\"zimbra\"").expect("parse");
        assert_eq!(ty, GalType::Internal);
    }

    #[test]
    fn test_search_type_from_str() {
        assert_eq!("Resource".parse::<GalSearchType>().unwrap(), GalSearchType::Resource);
        assert!("people".parse::<GalSearchType>().is_err());
    }
}
