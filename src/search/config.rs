//! Per-operation search configuration.
//!
//! A [`GalSearchConfig`] says where one directory operation goes and how:
//! connection settings, search base, filter template, page size and the
//! attribute mapping applied to the entries that come back. It is resolved
//! one of three ways:
//!
//! 1. [`GalSearchConfig::internal`]: the server's own directory, using one
//!    of the canned templates keyed by operation and search type.
//! 2. [`GalSearchConfig::external`]: the domain's external directory.
//! 3. [`GalSearchConfig::for_data_source`]: a GAL data source of a sync
//!    account, layered over the domain's settings.

use tracing::debug;

use crate::error::{GalError, Result};
use crate::model::account::DataSource;
use crate::model::contact::{lookup, AttrMap, AttrValue, GalContact};
use crate::model::domain::{AuthMech, Domain, ExternalGalSettings};
use crate::model::gal::{GalOp, GalSearchType, GalType};

use super::group::GroupHandler;

/// Page size for the internal directory.
pub const INTERNAL_PAGE_SIZE: u32 = 1000;

/// Clause excluding entries hidden from the GAL and system resources.
const VISIBLE_ENTRIES: &str = "(!(zimbraHideInGal=TRUE))(!(zimbraIsSystemResource=TRUE))";

/// Filter definition used when an internal data source names none.
pub const DEFAULT_SYNC_FILTER: &str = "zimbraSync";

/// Known filter definitions, by name. `%s` is the search key.
const FILTER_DEFS: &[(&str, &str)] = &[
    (
        "zimbraAccounts",
        "(&(|(cn=*%s*)(sn=*%s*)(gn=*%s*)(displayName=*%s*)(mail=*%s*)(zimbraMailDeliveryAddress=*%s*)(zimbraMailAlias=*%s*))(|(objectclass=zimbraAccount)(objectclass=zimbraDistributionList)(objectclass=zimbraGroup)))",
    ),
    (
        "zimbraAccountsOnly",
        "(&(|(cn=*%s*)(sn=*%s*)(gn=*%s*)(displayName=*%s*)(mail=*%s*)(zimbraMailDeliveryAddress=*%s*)(zimbraMailAlias=*%s*))(objectclass=zimbraAccount)(!(objectclass=zimbraCalendarResource)))",
    ),
    (
        "zimbraResources",
        "(&(|(cn=*%s*)(sn=*%s*)(gn=*%s*)(displayName=*%s*)(mail=*%s*)(zimbraMailDeliveryAddress=*%s*)(zimbraMailAlias=*%s*))(objectclass=zimbraCalendarResource))",
    ),
    (
        "zimbraGroups",
        "(&(|(cn=*%s*)(displayName=*%s*)(mail=*%s*)(zimbraMailDeliveryAddress=*%s*)(zimbraMailAlias=*%s*))(|(objectclass=zimbraDistributionList)(objectclass=zimbraGroup)))",
    ),
    (
        "zimbraAutoComplete",
        "(&(|(cn=%s*)(sn=%s*)(gn=%s*)(displayName=%s*)(mail=%s*)(zimbraMailDeliveryAddress=%s*)(zimbraMailAlias=%s*))(|(objectclass=zimbraAccount)(objectclass=zimbraDistributionList)(objectclass=zimbraGroup)))",
    ),
    (
        "zimbraAccountAutoComplete",
        "(&(|(cn=%s*)(sn=%s*)(gn=%s*)(displayName=%s*)(mail=%s*)(zimbraMailDeliveryAddress=%s*)(zimbraMailAlias=%s*))(objectclass=zimbraAccount)(!(objectclass=zimbraCalendarResource)))",
    ),
    (
        "zimbraResourceAutoComplete",
        "(&(|(cn=%s*)(sn=%s*)(gn=%s*)(displayName=%s*)(mail=%s*)(zimbraMailDeliveryAddress=%s*)(zimbraMailAlias=%s*))(objectclass=zimbraCalendarResource))",
    ),
    (
        "zimbraGroupAutoComplete",
        "(&(|(cn=%s*)(displayName=%s*)(mail=%s*)(zimbraMailDeliveryAddress=%s*)(zimbraMailAlias=%s*))(|(objectclass=zimbraDistributionList)(objectclass=zimbraGroup)))",
    ),
    (
        "zimbraSync",
        "(&(|(displayName=*)(cn=*)(sn=*)(gn=*)(mail=*)(zimbraMailDeliveryAddress=*)(zimbraMailAlias=*))(|(objectclass=zimbraAccount)(objectclass=zimbraDistributionList)(objectclass=zimbraGroup)))",
    ),
    (
        "zimbraAccountSync",
        "(&(|(displayName=*)(cn=*)(sn=*)(gn=*)(mail=*)(zimbraMailDeliveryAddress=*)(zimbraMailAlias=*))(objectclass=zimbraAccount)(!(objectclass=zimbraCalendarResource)))",
    ),
    (
        "zimbraResourceSync",
        "(&(|(displayName=*)(cn=*)(sn=*)(gn=*)(mail=*)(zimbraMailDeliveryAddress=*)(zimbraMailAlias=*))(objectclass=zimbraCalendarResource))",
    ),
    (
        "zimbraGroupSync",
        "(&(|(displayName=*)(cn=*)(mail=*)(zimbraMailDeliveryAddress=*)(zimbraMailAlias=*))(|(objectclass=zimbraDistributionList)(objectclass=zimbraGroup)))",
    ),
    (
        "ad",
        "(&(|(displayName=*%s*)(cn=*%s*)(sn=*%s*)(givenName=*%s*)(mail=*%s*))(!(msExchHideFromAddressLists=TRUE))(mailnickname=*)(|(&(objectCategory=person)(objectClass=user))(&(objectCategory=person)(objectClass=contact))(objectCategory=group)))",
    ),
    (
        "adAutoComplete",
        "(&(|(displayName=%s*)(cn=%s*)(sn=%s*)(givenName=%s*)(mail=%s*))(!(msExchHideFromAddressLists=TRUE))(mailnickname=*)(|(&(objectCategory=person)(objectClass=user))(&(objectCategory=person)(objectClass=contact))(objectCategory=group)))",
    ),
    (
        "externalLdapAutoComplete",
        "(|(cn=%s*)(sn=%s*)(gn=%s*)(mail=%s*))",
    ),
];

/// Look up a filter definition by name.
pub fn filter_def(name: &str) -> Option<&'static str> {
    FILTER_DEFS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, f)| *f)
}

/// A filter literal is used as is; anything without a parenthesis is the
/// name of a filter definition.
pub fn resolve_filter(filter: &str) -> String {
    if filter.contains('(') {
        return filter.to_string();
    }
    filter_def(filter).map(str::to_string).unwrap_or_else(|| {
        debug!(filter, "Unknown filter definition, using it as a literal");
        filter.to_string()
    })
}

/// Name of the canned internal template for an operation and search type.
pub fn internal_filter_name(op: GalOp, search_type: GalSearchType) -> &'static str {
    match (op, search_type) {
        (GalOp::Search, GalSearchType::All) => "zimbraAccounts",
        (GalOp::Search, GalSearchType::Account) => "zimbraAccountsOnly",
        (GalOp::Search, GalSearchType::Resource) => "zimbraResources",
        (GalOp::Search, GalSearchType::Group) => "zimbraGroups",
        (GalOp::Autocomplete, GalSearchType::All) => "zimbraAutoComplete",
        (GalOp::Autocomplete, GalSearchType::Account) => "zimbraAccountAutoComplete",
        (GalOp::Autocomplete, GalSearchType::Resource) => "zimbraResourceAutoComplete",
        (GalOp::Autocomplete, GalSearchType::Group) => "zimbraGroupAutoComplete",
        (GalOp::Sync, GalSearchType::All) => "zimbraSync",
        (GalOp::Sync, GalSearchType::Account) => "zimbraAccountSync",
        (GalOp::Sync, GalSearchType::Resource) => "zimbraResourceSync",
        (GalOp::Sync, GalSearchType::Group) => "zimbraGroupSync",
    }
}

/// Page size one smaller when the result limit is an exact multiple of it.
pub fn adjust_page_size(max_results: u32, page_size: u32) -> u32 {
    if page_size > 1 && max_results >= page_size && max_results % page_size == 0 {
        page_size - 1
    } else {
        page_size
    }
}

// ── Attribute mapping ───────────────────────────────────────────

/// `ldapAttr[,ldapAttr]=field[,field]`: values of the directory attributes,
/// in order, fill the contact fields. A single field takes every value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMapRule {
    pub ldap_attrs: Vec<String>,
    pub fields: Vec<String>,
}

impl AttributeMapRule {
    pub fn parse(rule: &str) -> Result<Self> {
        let (lhs, rhs) = rule
            .split_once('=')
            .ok_or_else(|| GalError::Config(format!("attribute map rule '{rule}' has no '='")))?;
        let split = |s: &str| -> Vec<String> {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        };
        let (ldap_attrs, fields) = (split(lhs), split(rhs));
        if ldap_attrs.is_empty() || fields.is_empty() {
            return Err(GalError::Config(format!(
                "attribute map rule '{rule}' is incomplete"
            )));
        }
        Ok(Self { ldap_attrs, fields })
    }

    fn apply(&self, entry: &AttrMap, out: &mut AttrMap) {
        let values: Vec<String> = self
            .ldap_attrs
            .iter()
            .filter_map(|a| lookup(entry, a))
            .flat_map(|v| v.values().into_iter().map(str::to_string))
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            return;
        }
        if let [field] = self.fields.as_slice() {
            out.entry(field.clone()).or_insert_with(|| AttrValue::from(values));
            return;
        }
        for (field, value) in self.fields.iter().zip(values) {
            out.entry(field.clone()).or_insert(AttrValue::Single(value));
        }
    }
}

const DEFAULT_ATTRIBUTE_MAP: &[&str] = &[
    "co=workCountry",
    "company=company",
    "givenName,gn=firstName",
    "sn=lastName",
    "displayName,cn=fullName,fullName2,fullName3",
    "initials=initials",
    "description=notes",
    "l=workCity",
    "physicalDeliveryOfficeName=office",
    "ou=department",
    "street,streetAddress=workStreet",
    "postalCode=workPostalCode",
    "st=workState",
    "telephoneNumber=workPhone",
    "mobile=mobilePhone",
    "title=jobTitle",
    "mail,zimbraMailDeliveryAddress,zimbraMailAlias=email,email2,email3,email4,email5,email6",
    "zimbraCalResType,msExchResourceSearchProperties=zimbraAccountCalendarUserType",
    "zimbraId=zimbraId",
    "objectClass=objectClass",
    "zimbraMailForwardingAddress=member",
    "whenChanged,modifyTimeStamp=modifyTimeStamp",
    "whenCreated,createTimeStamp=createTimeStamp",
];

/// Ordered mapping rules plus the key of the group handler that marks
/// group entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMapRules {
    pub rules: Vec<AttributeMapRule>,
    pub group_handler: Option<String>,
}

impl AttributeMapRules {
    pub fn parse(rules: &[String], group_handler: Option<String>) -> Result<Self> {
        Ok(Self {
            rules: rules
                .iter()
                .map(|r| AttributeMapRule::parse(r))
                .collect::<Result<_>>()?,
            group_handler,
        })
    }

    pub fn builtin() -> Self {
        Self {
            rules: DEFAULT_ATTRIBUTE_MAP
                .iter()
                .filter_map(|r| AttributeMapRule::parse(r).ok())
                .collect(),
            group_handler: None,
        }
    }

    /// Data-source rules, else domain rules, else the built-in map. The
    /// group handler follows the same order independently.
    pub fn resolve(data_source: Option<&DataSource>, domain: &Domain) -> Result<Self> {
        let rules: &[String] = match data_source {
            Some(ds) if !ds.attribute_map.is_empty() => ds.attribute_map.as_slice(),
            _ if !domain.attribute_map.is_empty() => domain.attribute_map.as_slice(),
            _ => &[],
        };
        let handler = data_source
            .and_then(|ds| ds.group_handler.clone())
            .or_else(|| domain.group_handler.clone());
        if rules.is_empty() {
            return Ok(Self {
                group_handler: handler,
                ..Self::builtin()
            });
        }
        Self::parse(rules, handler)
    }

    /// Map a raw directory entry into contact fields.
    pub fn apply(&self, entry: &GalContact, handler: &dyn GroupHandler) -> GalContact {
        let mut attrs = AttrMap::new();
        for rule in &self.rules {
            rule.apply(&entry.attrs, &mut attrs);
        }
        if handler.is_group(&entry.attrs) {
            attrs.insert("type".into(), AttrValue::from("group"));
            let members = handler.members(&entry.attrs);
            if !members.is_empty() {
                attrs.insert("member".into(), AttrValue::Multi(members));
            }
        }
        GalContact::new(entry.gal_type, entry.dn.clone(), attrs)
    }
}

// ── Search config ───────────────────────────────────────────────

/// Resolved settings for one directory operation.
#[derive(Debug, Clone, PartialEq)]
pub struct GalSearchConfig {
    pub op: GalOp,
    pub gal_type: GalType,
    pub url: Vec<String>,
    pub start_tls: bool,
    pub auth_mech: AuthMech,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub kerberos_principal: Option<String>,
    pub kerberos_keytab: Option<String>,
    pub search_base: String,
    /// Filter template, already resolved from a definition name.
    pub filter: String,
    pub timestamp_format: Option<String>,
    /// `and` / `or` when multi-word keys are split.
    pub tokenize_key: Option<String>,
    pub page_size: u32,
    pub rules: AttributeMapRules,
}

impl GalSearchConfig {
    /// The server's own directory.
    pub fn internal(op: GalOp, search_type: GalSearchType, domain: &Domain) -> Result<Self> {
        Self::internal_with_filter(op, internal_filter_name(op, search_type), domain, None)
    }

    fn internal_with_filter(
        op: GalOp,
        filter_name: &str,
        domain: &Domain,
        data_source: Option<&DataSource>,
    ) -> Result<Self> {
        let template = resolve_filter(filter_name);
        Ok(Self {
            op,
            gal_type: GalType::Internal,
            url: Vec::new(),
            start_tls: false,
            auth_mech: AuthMech::None,
            bind_dn: None,
            bind_password: None,
            kerberos_principal: None,
            kerberos_keytab: None,
            search_base: internal_search_base(domain),
            filter: format!("(&{template}{VISIBLE_ENTRIES})"),
            timestamp_format: None,
            tokenize_key: None,
            page_size: INTERNAL_PAGE_SIZE,
            rules: AttributeMapRules::resolve(data_source, domain)?,
        })
    }

    /// The domain's external directory. Sync settings are used only when
    /// they are complete, else the search settings stand in.
    pub fn external(op: GalOp, domain: &Domain) -> Result<Self> {
        let ext = &domain.external;
        let settings = match op {
            GalOp::Sync if ext.sync.is_complete() => ext.sync.clone(),
            GalOp::Sync => {
                debug!(domain = %domain.name, "Incomplete external sync settings, using search settings");
                ext.search.clone()
            }
            _ => ext.search.clone(),
        };
        let mut cfg = Self::from_settings(op, &settings, domain, None)?;
        if op == GalOp::Autocomplete {
            if let Some(ac) = &ext.autocomplete_filter {
                cfg.filter = resolve_filter(ac);
            }
        }
        cfg.tokenize_key = match op {
            GalOp::Autocomplete => ext.tokenize_autocomplete_key.clone(),
            GalOp::Search => ext.tokenize_search_key.clone(),
            GalOp::Sync => None,
        };
        Ok(cfg)
    }

    /// A GAL data source, layered over the domain's settings. An internal
    /// data source reads the server's own directory with its sync filter.
    pub fn for_data_source(data_source: &DataSource, domain: &Domain, op: GalOp) -> Result<Self> {
        if data_source.gal_type == GalType::Internal {
            let filter = data_source
                .ldap
                .filter
                .as_deref()
                .unwrap_or(DEFAULT_SYNC_FILTER);
            return Self::internal_with_filter(op, filter, domain, Some(data_source));
        }
        let domain_settings = match op {
            GalOp::Sync => domain.external.sync.or(&domain.external.search),
            _ => domain.external.search.clone(),
        };
        let settings = data_source.ldap.or(&domain_settings);
        Self::from_settings(op, &settings, domain, Some(data_source))
    }

    fn from_settings(
        op: GalOp,
        settings: &ExternalGalSettings,
        domain: &Domain,
        data_source: Option<&DataSource>,
    ) -> Result<Self> {
        Ok(Self {
            op,
            gal_type: GalType::External,
            url: settings.url.clone(),
            start_tls: settings.start_tls.unwrap_or(false),
            auth_mech: settings.auth_mech.unwrap_or_default(),
            bind_dn: settings.bind_dn.clone(),
            bind_password: settings.bind_password.clone(),
            kerberos_principal: settings.kerberos_principal.clone(),
            kerberos_keytab: settings.kerberos_keytab.clone(),
            search_base: settings.search_base.clone().unwrap_or_default(),
            filter: settings
                .filter
                .as_deref()
                .map(resolve_filter)
                .unwrap_or_default(),
            timestamp_format: settings.timestamp_format.clone(),
            tokenize_key: None,
            page_size: settings.page_size.unwrap_or(0),
            rules: AttributeMapRules::resolve(data_source, domain)?,
        })
    }

    /// Page size to request for a search bounded by `max_results`.
    pub fn effective_page_size(&self, max_results: u32) -> u32 {
        if self.page_size == 0 {
            return 0;
        }
        adjust_page_size(max_results, self.page_size)
    }
}

fn internal_search_base(domain: &Domain) -> String {
    match domain.internal_search_base.as_deref() {
        None | Some("DOMAIN") | Some("SUBDOMAINS") => domain.dn(),
        Some("ROOT") => String::new(),
        Some(base) => base.to_string(),
    }
}
