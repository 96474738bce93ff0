//! Domain-level GAL settings.

use serde::{Deserialize, Serialize};

use super::gal::GalMode;

/// Directory bind mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMech {
    /// Anonymous bind.
    #[default]
    None,
    /// Simple bind with a DN and password.
    Simple,
    /// Kerberos v5 with a principal and keytab.
    Kerberos5,
}

/// Connection and query settings for one external directory operation.
/// Every field is optional so that a layer can override only what it sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalGalSettings {
    pub url: Vec<String>,
    pub search_base: Option<String>,
    /// Filter literal, or the name of a known filter definition.
    pub filter: Option<String>,
    pub start_tls: Option<bool>,
    pub auth_mech: Option<AuthMech>,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub kerberos_principal: Option<String>,
    pub kerberos_keytab: Option<String>,
    /// `strftime` format of the directory's timestamp attributes, when it
    /// does not speak generalized time.
    pub timestamp_format: Option<String>,
    pub page_size: Option<u32>,
}

impl ExternalGalSettings {
    /// Fill unset fields from `fallback`.
    pub fn or(&self, fallback: &ExternalGalSettings) -> ExternalGalSettings {
        ExternalGalSettings {
            url: if self.url.is_empty() {
                fallback.url.clone()
            } else {
                self.url.clone()
            },
            search_base: self.search_base.clone().or_else(|| fallback.search_base.clone()),
            filter: self.filter.clone().or_else(|| fallback.filter.clone()),
            start_tls: self.start_tls.or(fallback.start_tls),
            auth_mech: self.auth_mech.or(fallback.auth_mech),
            bind_dn: self.bind_dn.clone().or_else(|| fallback.bind_dn.clone()),
            bind_password: self
                .bind_password
                .clone()
                .or_else(|| fallback.bind_password.clone()),
            kerberos_principal: self
                .kerberos_principal
                .clone()
                .or_else(|| fallback.kerberos_principal.clone()),
            kerberos_keytab: self
                .kerberos_keytab
                .clone()
                .or_else(|| fallback.kerberos_keytab.clone()),
            timestamp_format: self
                .timestamp_format
                .clone()
                .or_else(|| fallback.timestamp_format.clone()),
            page_size: self.page_size.or(fallback.page_size),
        }
    }

    /// URL, filter and the credentials the auth mechanism needs are all set.
    pub fn is_complete(&self) -> bool {
        if self.url.is_empty() || self.filter.is_none() {
            return false;
        }
        match self.auth_mech.unwrap_or_default() {
            AuthMech::None => true,
            AuthMech::Simple => self.bind_dn.is_some() && self.bind_password.is_some(),
            AuthMech::Kerberos5 => {
                self.kerberos_principal.is_some() && self.kerberos_keytab.is_some()
            }
        }
    }
}

/// External directory settings of a domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalGalConfig {
    pub search: ExternalGalSettings,
    pub sync: ExternalGalSettings,
    pub autocomplete_filter: Option<String>,
    /// `and` or `or`: split multi-word search keys into one clause per word.
    pub tokenize_search_key: Option<String>,
    pub tokenize_autocomplete_key: Option<String>,
}

/// A mail domain and its GAL configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub gal_mode: GalMode,
    /// GAL sync accounts, in preference order.
    #[serde(default)]
    pub gal_account_ids: Vec<String>,
    /// Concurrent sync clients allowed (0 = unlimited).
    #[serde(default = "default_sync_clients")]
    pub sync_max_concurrent_clients: u32,
    /// Upper bound on entries per sync response (0 = none).
    #[serde(default)]
    pub sync_size_limit: u32,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default)]
    pub ldap_gal_sync_disabled: bool,
    #[serde(default)]
    pub always_include_local_calendar_resources: bool,
    #[serde(default)]
    pub gal_definition_last_modified: Option<String>,
    /// `DOMAIN`, `SUBDOMAINS`, `ROOT`, or an explicit DN.
    #[serde(default)]
    pub internal_search_base: Option<String>,
    #[serde(default)]
    pub external: ExternalGalConfig,
    /// Attribute mapping rules (`ldapAttr[,ldapAttr]=field[,field]`).
    #[serde(default)]
    pub attribute_map: Vec<String>,
    #[serde(default)]
    pub group_handler: Option<String>,
}

fn default_sync_clients() -> u32 {
    2
}

fn default_max_results() -> u32 {
    100
}

impl Domain {
    /// Minimal domain with default GAL settings.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            gal_mode: GalMode::default(),
            gal_account_ids: Vec::new(),
            sync_max_concurrent_clients: default_sync_clients(),
            sync_size_limit: 0,
            max_results: default_max_results(),
            ldap_gal_sync_disabled: false,
            always_include_local_calendar_resources: false,
            gal_definition_last_modified: None,
            internal_search_base: None,
            external: ExternalGalConfig::default(),
            attribute_map: Vec::new(),
            group_handler: None,
        }
    }

    /// `example.com` → `dc=example,dc=com`.
    pub fn dn(&self) -> String {
        self.name
            .split('.')
            .filter(|p| !p.is_empty())
            .map(|p| format!("dc={p}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}
