//! Per-request search context.
//!
//! [`GalSearchParams`] carries everything one GAL request needs while it
//! moves between the mailbox, proxy and directory paths: the caller, the
//! free-text key, the structured filter, both limits, the sync token and
//! the result callback. It also builds the query strings each backend
//! understands.

use std::collections::BTreeSet;

use tracing::debug;

use crate::backend::{DirectoryQuery, MailboxSearch, ProxyRequest};
use crate::error::{GalError, Result};
use crate::filter::ldap::to_ldap_filter;
use crate::filter::mailbox::to_mailbox_query;
use crate::filter::FilterTerm;
use crate::model::account::{Account, AuthToken};
use crate::model::domain::Domain;
use crate::model::gal::{GalOp, GalSearchType, GalType};
use crate::token::{parse_generalized_time, GalSyncToken, LdapCursor};

use super::callback::ResultCallback;
use super::config::GalSearchConfig;

/// Default sort order for mailbox searches.
pub const DEFAULT_SORT_BY: &str = "nameAsc";

pub struct GalSearchParams {
    pub domain: Domain,
    /// Account the request is made for.
    pub account: Option<Account>,
    pub auth: Option<AuthToken>,
    pub op: GalOp,
    pub search_type: GalSearchType,
    /// Free-text search key.
    pub query: Option<String>,
    /// Mailbox query supplied by the caller in place of the free-text key.
    pub gal_search_query: Option<String>,
    /// Fetch one entry by directory DN.
    pub entry_dn: Option<String>,
    pub extra_filter: Option<FilterTerm>,
    pub token: GalSyncToken,
    /// Result limit (0 = backend default).
    pub limit: u32,
    /// Overrides `limit` for directory searches.
    pub ldap_limit: Option<u32>,
    pub offset: u32,
    pub sort_by: String,
    pub id_only: bool,
    pub get_count: bool,
    pub wildcard: bool,
    /// GAL sync account named by the request.
    pub gal_sync_account: Option<Account>,
    /// Caller description used for sync admission.
    pub user_info: String,
    /// Config of the directory search being prepared.
    pub config: Option<GalSearchConfig>,
    /// Cursor of the directory search being prepared.
    pub cursor: Option<LdapCursor>,
    pub callback: Box<dyn ResultCallback + Send>,
}

impl GalSearchParams {
    pub fn new(domain: Domain, callback: Box<dyn ResultCallback + Send>) -> Self {
        Self {
            domain,
            account: None,
            auth: None,
            op: GalOp::Search,
            search_type: GalSearchType::All,
            query: None,
            gal_search_query: None,
            entry_dn: None,
            extra_filter: None,
            token: GalSyncToken::default(),
            limit: 0,
            ldap_limit: None,
            offset: 0,
            sort_by: DEFAULT_SORT_BY.to_string(),
            id_only: false,
            get_count: false,
            wildcard: true,
            gal_sync_account: None,
            user_info: String::new(),
            config: None,
            cursor: None,
            callback,
        }
    }

    /// Resolve the directory config for `gal_type` and the current
    /// operation and search type.
    pub fn create_search_config(&mut self, gal_type: GalType) -> Result<()> {
        let config = match gal_type {
            GalType::Internal => GalSearchConfig::internal(self.op, self.search_type, &self.domain)?,
            GalType::External => GalSearchConfig::external(self.op, &self.domain)?,
        };
        self.callback.set_tokenize_key(config.tokenize_key.as_deref());
        self.config = Some(config);
        Ok(())
    }

    fn config(&self) -> Result<&GalSearchConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| GalError::Config("no search config resolved".into()))
    }

    // ── Directory ───────────────────────────────────────────────

    /// LDAP filter for the current config: the template expanded with the
    /// search key, the change-time clause for a sync, and the extra filter.
    pub fn generate_ldap_query(&self) -> Result<String> {
        let config = self.config()?;
        if config.filter.is_empty() {
            return Err(GalError::Config(format!(
                "no {} filter configured for domain {}",
                config.gal_type, self.domain.name
            )));
        }

        let key = self.query.as_deref().unwrap_or("");
        let since = match (self.op, &self.cursor) {
            (GalOp::Sync, Some(cursor)) if !cursor.timestamp.is_empty() => Some(
                convert_timestamp(&cursor.timestamp, config.timestamp_format.as_deref()),
            ),
            _ => None,
        };
        let mut query = expand_filter(
            config.tokenize_key.as_deref(),
            &config.filter,
            key,
            since.as_deref(),
        );

        if let Some(extra) = &self.extra_filter {
            query = format!("(&{query}{})", to_ldap_filter(extra));
        }
        debug!(%query, gal_type = %config.gal_type, "Generated directory query");
        Ok(query)
    }

    pub fn directory_query(&self) -> Result<DirectoryQuery> {
        let config = self.config()?.clone();
        let name = self
            .query
            .as_deref()
            .map(|q| q.trim_matches('*'))
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        Ok(DirectoryQuery {
            filter: self.generate_ldap_query()?,
            search_type: self.search_type,
            name,
            entry_dn: self.entry_dn.clone(),
            extra: self.extra_filter.clone(),
            limit: self.limit,
            cursor: if self.op == GalOp::Sync {
                Some(self.cursor.clone().unwrap_or_default())
            } else {
                None
            },
            config,
        })
    }

    // ── Mailbox ─────────────────────────────────────────────────

    /// Contact search in a GAL sync account. With `add_inid`, the search is
    /// scoped to the folders of the account's GAL data sources that belong
    /// to the domain's GAL mode.
    pub fn mailbox_search(&self, account: Option<&Account>, add_inid: bool) -> MailboxSearch {
        let mut query = String::new();
        let mut text = None;
        let mut raw_query = None;

        if let Some(dn) = &self.entry_dn {
            query.push_str(&format!("#dn:({dn})"));
        } else if let Some(raw) = self.gal_search_query.as_deref().filter(|q| !q.is_empty()) {
            query.push_str(&escape_quotes(raw));
            raw_query = Some(raw.to_string());
        } else if let Some(q) = self.query.as_deref().filter(|q| !q.is_empty()) {
            query.push_str(&format!("contact:\"{}\"", escape_quotes(q)));
            text = Some(q.to_string());
        }

        if let Some(extra) = &self.extra_filter {
            let extra_query = to_mailbox_query(extra);
            debug!(%extra_query, "Extra search query");
            if !query.is_empty() {
                query.push_str(" AND");
            }
            query.push_str(&format!(" ({extra_query})"));
        }

        let mut folders = BTreeSet::new();
        if let (true, Some(account)) = (add_inid, account) {
            let mode = self.domain.gal_mode;
            let mut first = true;
            let mut closing = false;
            for ds in account.gal_data_sources() {
                if !mode.includes(ds.gal_type) {
                    continue;
                }
                if !query.is_empty() {
                    if first {
                        query.push_str(" AND (");
                        closing = true;
                    } else {
                        query.push_str(" OR");
                    }
                }
                first = false;
                query.push_str(&format!(" inid:{}", ds.folder_id));
                folders.insert(ds.folder_id);
            }
            if closing {
                query.push(')');
            }
        }

        query.push_str(search_type_clause(self.search_type));
        debug!(%query, "Mailbox query");

        MailboxSearch {
            query,
            text,
            raw_query,
            entry_dn: self.entry_dn.clone(),
            extra: self.extra_filter.clone(),
            folders,
            search_type: self.search_type,
            offset: self.offset,
            limit: self.limit,
            sort_by: self.sort_by.clone(),
        }
    }

    /// Resource-only search over the first internal GAL data source, or
    /// `None` when the account has no internal data source.
    pub fn local_resource_search(&self, account: &Account) -> Option<MailboxSearch> {
        let ds = account
            .gal_data_sources()
            .find(|ds| ds.gal_type == GalType::Internal)?;
        let mut query = String::new();
        let text = self.query.as_deref().filter(|q| !q.is_empty());
        if let Some(q) = text {
            query.push_str(&format!("contact:\"{}\" AND", escape_quotes(q)));
        }
        query.push_str(" #zimbraAccountCalendarUserType:RESOURCE");
        query.push_str(&format!(" AND ( inid:{})", ds.folder_id));
        debug!(%query, "Local resource query");

        Some(MailboxSearch {
            query,
            text: text.map(str::to_string),
            raw_query: None,
            entry_dn: None,
            extra: None,
            folders: BTreeSet::from([ds.folder_id]),
            search_type: GalSearchType::Resource,
            offset: self.offset,
            limit: self.limit,
            sort_by: self.sort_by.clone(),
        })
    }

    /// Mailbox query equivalent of this request, without folder scoping.
    pub fn gal_query(&self) -> String {
        self.mailbox_search(None, false).query
    }

    // ── Proxy ───────────────────────────────────────────────────

    pub fn proxy_request(&self, gal_account: &Account, sync: bool) -> ProxyRequest {
        let auth_account_id = match (&self.account, &self.auth) {
            (Some(acct), Some(auth)) if !acct.id.eq_ignore_ascii_case(&auth.account_id) => {
                Some(acct.id.clone())
            }
            _ => None,
        };
        ProxyRequest {
            search_type: self.search_type,
            limit: self.limit,
            name: self.query.clone(),
            entry_dn: self.entry_dn.clone(),
            get_count: self.get_count,
            gal_account_id: gal_account.id.clone(),
            proxied: true,
            token: sync.then(|| self.token.to_string()),
            auth_account_id,
        }
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}

fn search_type_clause(search_type: GalSearchType) -> &'static str {
    match search_type {
        GalSearchType::Resource => " AND #zimbraAccountCalendarUserType:RESOURCE",
        GalSearchType::Group => " AND #type:group",
        GalSearchType::Account => " AND !(#zimbraAccountCalendarUserType:RESOURCE)",
        GalSearchType::All => "",
    }
}

/// Escape a search key for a filter template. `*` is kept as a wildcard.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

/// Rewrite a generalized-time timestamp in the directory's own format.
fn convert_timestamp(ts: &str, format: Option<&str>) -> String {
    match (format, parse_generalized_time(ts)) {
        (Some(fmt), Some(dt)) => dt.format(fmt).to_string(),
        _ => ts.to_string(),
    }
}

fn expand_template(template: &str, key: &str) -> String {
    let mut query = template.replace("%s", &escape_key(key));
    while query.contains("**") {
        query = query.replace("**", "*");
    }
    query
}

/// Expand a filter template.
///
/// With a tokenize key (`and` / `or`), a multi-word key expands the
/// template once per word and joins the copies. A sync adds a clause
/// selecting entries created or modified at or after `since`.
pub fn expand_filter(
    tokenize: Option<&str>,
    template: &str,
    key: &str,
    since: Option<&str>,
) -> String {
    let words: Vec<&str> = key.split_whitespace().collect();
    let mut query = match tokenize {
        Some(op) if words.len() > 1 => {
            let joiner = if op.eq_ignore_ascii_case("or") { '|' } else { '&' };
            let parts: String = words.iter().map(|w| expand_template(template, w)).collect();
            format!("({joiner}{parts})")
        }
        _ => expand_template(template, key),
    };
    if let Some(ts) = since {
        query = format!("(&(|(modifyTimeStamp>={ts})(createTimeStamp>={ts})){query})");
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Operator;
    use crate::model::account::DataSource;
    use crate::model::gal::GalMode;
    use crate::search::callback::{CallbackOptions, GalSearchResultCallback};

    fn params(op: GalOp) -> GalSearchParams {
        let mut p = GalSearchParams::new(
            Domain::new("d1", "example.com"),
            Box::new(GalSearchResultCallback::new(CallbackOptions::new(op))),
        );
        p.op = op;
        p
    }

    fn gal_ds(id: &str, gal_type: GalType, folder: i32) -> DataSource {
        DataSource {
            id: id.into(),
            name: id.into(),
            kind: Default::default(),
            gal_type,
            folder_id: folder,
            enabled: true,
            gal_status: Default::default(),
            last_successful_sync: Some("20240101000000Z".into()),
            ldap: Default::default(),
            attribute_map: Vec::new(),
            group_handler: None,
        }
    }

    #[test]
    fn test_expand_filter_collapses_wildcards() {
        assert_eq!(expand_filter(None, "(cn=*%s*)", "*ann*", None), "(cn=*ann*)");
        assert_eq!(expand_filter(None, "(cn=*%s*)", "", None), "(cn=*)");
        assert_eq!(expand_filter(None, "(cn=%s*)", "a(b)", None), "(cn=a\\28b\\29*)");
    }

    #[test]
    fn test_expand_filter_tokenized() {
        assert_eq!(
            expand_filter(Some("and"), "(cn=*%s*)", "ann smith", None),
            "(&(cn=*ann*)(cn=*smith*))"
        );
        assert_eq!(
            expand_filter(Some("or"), "(cn=*%s*)", "ann smith", None),
            "(|(cn=*ann*)(cn=*smith*))"
        );
    }

    #[test]
    fn test_sync_query_has_timestamp_clause() {
        let mut p = params(GalOp::Sync);
        p.create_search_config(GalType::Internal).unwrap();
        p.cursor = Some(LdapCursor::from_timestamp("20240101000000Z"));
        let q = p.generate_ldap_query().unwrap();
        assert!(q.starts_with(
            "(&(|(modifyTimeStamp>=20240101000000Z)(createTimeStamp>=20240101000000Z))"
        ));
    }

    #[test]
    fn test_timestamp_format_conversion() {
        assert_eq!(
            convert_timestamp("20240102030405Z", Some("%Y%m%d%H%M%S.0Z")),
            "20240102030405.0Z"
        );
        assert_eq!(convert_timestamp("garbage", Some("%Y")), "garbage");
    }

    #[test]
    fn test_extra_filter_in_ldap_query() {
        let mut p = params(GalOp::Search);
        p.extra_filter = Some(FilterTerm::single("company", Operator::Eq, "Acme"));
        p.create_search_config(GalType::Internal).unwrap();
        let q = p.generate_ldap_query().unwrap();
        assert!(q.starts_with("(&(&"));
        assert!(q.ends_with("(company=Acme))"));
    }

    #[test]
    fn test_mailbox_query_shapes() {
        let mut p = params(GalOp::Search);
        p.query = Some("ann \"the\" ex".into());
        p.extra_filter = Some(FilterTerm::single("company", Operator::Eq, "Acme"));
        p.search_type = GalSearchType::Account;
        p.domain.gal_mode = GalMode::Both;

        let mut acct = Account::new("gal1", "galsync@example.com", "example.com");
        acct.data_sources = vec![
            gal_ds("int", GalType::Internal, 257),
            gal_ds("ext", GalType::External, 258),
        ];
        let search = p.mailbox_search(Some(&acct), true);
        assert_eq!(
            search.query,
            r##"contact:"ann \"the\" ex" AND (#company:"Acme") AND ( inid:257 OR inid:258) AND !(#zimbraAccountCalendarUserType:RESOURCE)"##
        );
        assert_eq!(search.folders, BTreeSet::from([257, 258]));

        p.domain.gal_mode = GalMode::External;
        let search = p.mailbox_search(Some(&acct), true);
        assert!(search.query.contains("( inid:258)"));
        assert!(!search.query.contains("257"));
    }

    #[test]
    fn test_mailbox_query_by_dn() {
        let mut p = params(GalOp::Search);
        p.entry_dn = Some("uid=ann,ou=people,dc=example,dc=com".into());
        p.query = Some("ignored".into());
        p.search_type = GalSearchType::Group;
        assert_eq!(
            p.gal_query(),
            "#dn:(uid=ann,ou=people,dc=example,dc=com) AND #type:group"
        );
    }

    #[test]
    fn test_local_resource_query() {
        let mut p = params(GalOp::Search);
        p.query = Some("room".into());
        let mut acct = Account::new("gal1", "galsync@example.com", "example.com");
        acct.data_sources = vec![
            gal_ds("ext", GalType::External, 258),
            gal_ds("int", GalType::Internal, 257),
        ];
        let search = p.local_resource_search(&acct).unwrap();
        assert_eq!(
            search.query,
            r#"contact:"room" AND #zimbraAccountCalendarUserType:RESOURCE AND ( inid:257)"#
        );

        acct.data_sources.remove(1);
        assert!(p.local_resource_search(&acct).is_none());
    }

    #[test]
    fn test_proxy_request() {
        let mut p = params(GalOp::Sync);
        p.token = GalSyncToken::new("20240101000000Z", "gal1", 42);
        p.account = Some(Account::new("u2", "bob@example.com", "example.com"));
        p.auth = Some(AuthToken::admin("admin-1"));
        let gal = Account::new("gal1", "galsync@example.com", "example.com");
        let req = p.proxy_request(&gal, true);
        assert!(req.proxied);
        assert_eq!(req.gal_account_id, "gal1");
        assert_eq!(req.token.as_deref(), Some("20240101000000Z:gal1:42"));
        assert_eq!(req.auth_account_id.as_deref(), Some("u2"));
        assert_eq!(p.proxy_request(&gal, false).token, None);
    }
}
