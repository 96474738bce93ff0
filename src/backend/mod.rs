//! Collaborator boundaries of the GAL control plane.
//!
//! The control plane never talks to a directory server, a mailbox store or
//! a peer node directly. It goes through these traits, which a deployment
//! implements over its real systems. [`memory`] provides in-process
//! implementations used by the CLI and the tests, and [`fixture`] fills
//! them from a TOML file.

pub mod fixture;
pub mod memory;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::filter::FilterTerm;
use crate::model::account::Account;
use crate::model::contact::{Contact, ContactElement, GalContact, Group};
use crate::model::domain::Domain;
use crate::model::gal::{GalOp, GalSearchType};
use crate::search::config::GalSearchConfig;
use crate::token::LdapCursor;

// ── Directory ───────────────────────────────────────────────────

/// One directory search, fully resolved.
///
/// `filter` is the RFC 4515 filter to send. The structured fields carry the
/// same request in parts, for backends that do not speak LDAP filters.
#[derive(Debug, Clone)]
pub struct DirectoryQuery {
    pub config: GalSearchConfig,
    pub filter: String,
    pub search_type: GalSearchType,
    /// Search key after wildcard handling; `None` matches everything.
    pub name: Option<String>,
    /// Fetch exactly this entry instead of searching.
    pub entry_dn: Option<String>,
    pub extra: Option<FilterTerm>,
    /// Maximum entries to return (0 = unlimited).
    pub limit: u32,
    /// Where a sync resumes; `None` for search and autocomplete.
    pub cursor: Option<LdapCursor>,
}

impl DirectoryQuery {
    pub fn op(&self) -> GalOp {
        self.config.op
    }
}

/// Raw directory entries, ordered by change time for a sync.
#[derive(Debug, Clone, Default)]
pub struct DirectoryResult {
    pub entries: Vec<GalContact>,
    /// The limit cut the result short.
    pub has_more: bool,
}

pub trait Directory: Send + Sync {
    fn search_gal(&self, query: &DirectoryQuery) -> Result<DirectoryResult>;
}

// ── Mailbox ─────────────────────────────────────────────────────

/// A contact search inside a GAL sync account mailbox.
#[derive(Debug, Clone, Default)]
pub struct MailboxSearch {
    /// Query in the mailbox search language.
    pub query: String,
    /// Free-text part (`contact:"..."`).
    pub text: Option<String>,
    /// Raw query supplied by the caller in place of `text`.
    pub raw_query: Option<String>,
    pub entry_dn: Option<String>,
    pub extra: Option<FilterTerm>,
    /// `inid:` scoping; empty means every folder.
    pub folders: BTreeSet<i32>,
    pub search_type: GalSearchType,
    pub offset: u32,
    pub limit: u32,
    pub sort_by: String,
}

#[derive(Debug, Clone)]
pub struct MailboxHit {
    pub contact: Contact,
    pub sort_field: String,
}

#[derive(Debug, Clone, Default)]
pub struct MailboxSearchResult {
    pub hits: Vec<MailboxHit>,
    pub has_more: bool,
    pub sort_by: String,
    pub offset: u32,
}

/// Items deleted since a change id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tombstones {
    pub ids: Vec<i32>,
    pub max_mod_sequence: i32,
}

pub trait Mailbox: Send + Sync {
    fn account_id(&self) -> &str;

    fn search(&self, search: &MailboxSearch) -> Result<MailboxSearchResult>;

    /// Ids of contacts in `folders` modified after `since`, oldest change
    /// first, at most `limit` (0 = all).
    fn modified_items(&self, since: i32, folders: &BTreeSet<i32>, limit: u32) -> Result<Vec<i32>>;

    fn modified_items_count(&self, since: i32, folders: &BTreeSet<i32>) -> Result<u32>;

    /// Fails with `NoSuchItem` when the item is gone.
    fn contact(&self, id: i32) -> Result<Contact>;

    /// Fails with `MustResync` when `since` predates the change log.
    fn tombstones(&self, since: i32) -> Result<Tombstones>;

    /// Directory timestamp the import into `folder_id` last reached, or
    /// `None` when the folder has no data source mapping.
    fn folder_sync_token(&self, folder_id: i32) -> Option<String>;
}

pub trait MailboxProvider: Send + Sync {
    fn mailbox(&self, account: &Account) -> Result<std::sync::Arc<dyn Mailbox>>;
}

// ── Provisioning and access control ─────────────────────────────

pub trait Provisioning: Send + Sync {
    fn account_by_id(&self, id: &str) -> Option<Account>;
    fn domain_by_name(&self, name: &str) -> Option<Domain>;
    /// Whether the account's mailbox lives on this node.
    fn is_local(&self, account: &Account) -> bool;
    fn is_distribution_list(&self, name: &str) -> bool;
    fn group_by_id(&self, id: &str) -> Result<Option<Group>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Right {
    ViewDistributionList,
}

pub trait AccessControl: Send + Sync {
    fn can_do(&self, account: &Account, group: &Group, right: Right) -> Result<bool>;
}

// ── Peer proxy ──────────────────────────────────────────────────

/// A GAL request forwarded to the node owning a GAL sync account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub search_type: GalSearchType,
    pub limit: u32,
    pub name: Option<String>,
    /// Entry-by-DN reference.
    pub entry_dn: Option<String>,
    pub get_count: bool,
    pub gal_account_id: String,
    /// Always set, so the peer does not forward again.
    pub proxied: bool,
    /// Sync token, for syncs only.
    pub token: Option<String>,
    /// Account the request acts for, when it is not the caller.
    pub auth_account_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub contacts: Vec<ContactElement>,
    /// Ids of deleted entries.
    pub deleted: Vec<String>,
    pub token: Option<String>,
    pub has_more: bool,
    pub remain: Option<u32>,
    pub sort_by: Option<String>,
    pub offset: Option<u32>,
}

/// A fault raised by the peer while handling the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyFault {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("peer fault {}: {}", .0.code, .0.message)]
    Fault(ProxyFault),
    #[error("transport failure: {0}")]
    Transport(String),
}

pub trait GalProxy: Send + Sync {
    fn invoke(
        &self,
        host: &str,
        request: &ProxyRequest,
    ) -> std::result::Result<ProxyResponse, ProxyError>;
}
