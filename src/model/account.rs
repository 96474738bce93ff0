//! Accounts, their data sources, and auth tokens.

use serde::{Deserialize, Serialize};

use super::domain::ExternalGalSettings;
use super::gal::GalType;

/// Lifecycle status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Locked,
    Lockout,
    Maintenance,
    Pending,
    Closed,
}

impl AccountStatus {
    /// Lockout only blocks logins; the mailbox is still usable.
    pub fn is_active(self) -> bool {
        matches!(self, AccountStatus::Active | AccountStatus::Lockout)
    }
}

/// GAL feature switches on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalFeatures {
    pub gal: bool,
    pub autocomplete: bool,
    pub sync: bool,
    /// Serve autocomplete from the GAL sync account when one exists.
    pub sync_account_autocomplete: bool,
}

impl Default for GalFeatures {
    fn default() -> Self {
        Self {
            gal: true,
            autocomplete: true,
            sync: true,
            sync_account_autocomplete: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceType {
    #[default]
    Gal,
    Imap,
    Pop3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalStatus {
    #[default]
    Enabled,
    Disabled,
}

/// An external source imported into a mailbox folder. GAL data sources
/// fill a GAL sync account's contact folders from a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: DataSourceType,
    #[serde(default)]
    pub gal_type: GalType,
    pub folder_id: i32,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub gal_status: GalStatus,
    /// Set once the first import has finished.
    #[serde(default)]
    pub last_successful_sync: Option<String>,
    /// Directory settings overriding the domain's.
    #[serde(default)]
    pub ldap: ExternalGalSettings,
    #[serde(default)]
    pub attribute_map: Vec<String>,
    #[serde(default)]
    pub group_handler: Option<String>,
}

fn enabled() -> bool {
    true
}

impl DataSource {
    pub fn is_gal(&self) -> bool {
        self.kind == DataSourceType::Gal
    }

    /// Finished at least one import and is switched on.
    pub fn is_usable_gal_source(&self) -> bool {
        self.last_successful_sync.is_some()
            && self.gal_status == GalStatus::Enabled
            && self.enabled
    }
}

/// A user, resource or GAL sync account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// Name of the account's domain.
    pub domain: String,
    #[serde(default)]
    pub status: AccountStatus,
    /// Server hosting the account's mailbox.
    #[serde(default)]
    pub mail_host: String,
    #[serde(default)]
    pub features: GalFeatures,
    #[serde(default)]
    pub data_sources: Vec<DataSource>,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            domain: domain.into(),
            status: AccountStatus::Active,
            mail_host: String::new(),
            features: GalFeatures::default(),
            data_sources: Vec::new(),
        }
    }

    pub fn gal_data_sources(&self) -> impl Iterator<Item = &DataSource> {
        self.data_sources.iter().filter(|ds| ds.is_gal())
    }
}

/// Identity of the authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub account_id: String,
    #[serde(default)]
    pub admin: bool,
}

impl AuthToken {
    pub fn user(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            admin: false,
        }
    }

    pub fn admin(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            admin: true,
        }
    }
}
