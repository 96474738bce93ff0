//! In-process collaborators.
//!
//! These hold plain data behind locks and evaluate the structured parts of
//! each query with the in-memory filter evaluator. The CLI serves fixture
//! files with them, and the tests script failures through them.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::{
    AccessControl, Directory, DirectoryQuery, DirectoryResult, GalProxy, Mailbox, MailboxHit,
    MailboxProvider, MailboxSearch, MailboxSearchResult, Provisioning, ProxyError, ProxyRequest,
    ProxyResponse, Right, Tombstones,
};
use crate::error::{GalError, Result};
use crate::filter::eval::matches;
use crate::model::account::Account;
use crate::model::contact::{Contact, GalContact, Group};
use crate::model::domain::Domain;
use crate::model::gal::{GalOp, GalSearchType, GalType};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Attributes a search key is matched against.
const NAME_ATTRS: &[&str] = &[
    "cn",
    "displayName",
    "givenName",
    "sn",
    "mail",
    "zimbraMailAlias",
    "fullName",
    "firstName",
    "lastName",
    "email",
];

/// Values starting with `key` (autocomplete) or containing it.
fn key_matches(values: &[&str], key: &str, prefix: bool) -> bool {
    let key = key.to_lowercase();
    values.iter().any(|v| {
        let v = v.to_lowercase();
        if prefix {
            v.starts_with(&key) || v.split_whitespace().any(|w| w.starts_with(&key))
        } else {
            v.contains(&key)
        }
    })
}

// ── Directory ───────────────────────────────────────────────────

/// Directory entries of the internal and the external directory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    internal: RwLock<Vec<GalContact>>,
    external: RwLock<Vec<GalContact>>,
    failure: RwLock<Option<String>>,
    queries: Mutex<Vec<DirectoryQuery>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: GalContact) {
        let store = match entry.gal_type {
            GalType::Internal => &self.internal,
            GalType::External => &self.external,
        };
        write(store).push(entry);
    }

    /// Make every search fail with `reason` (`None` to heal).
    pub fn set_failure(&self, reason: Option<&str>) {
        *write(&self.failure) = reason.map(str::to_string);
    }

    /// Every entry, internal directory first.
    pub fn entries(&self) -> Vec<GalContact> {
        let mut all = read(&self.internal).clone();
        all.extend(read(&self.external).iter().cloned());
        all
    }

    /// Queries received so far.
    pub fn queries(&self) -> Vec<DirectoryQuery> {
        lock(&self.queries).clone()
    }

    fn is_visible(entry: &GalContact) -> bool {
        !entry
            .attr("zimbraHideInGal")
            .is_some_and(|v| v.eq_ignore_ascii_case("TRUE"))
    }

    fn is_group(entry: &GalContact) -> bool {
        entry.attr_values("objectClass").iter().any(|oc| {
            ["zimbraDistributionList", "zimbraGroup", "group"]
                .iter()
                .any(|c| oc.eq_ignore_ascii_case(c))
        })
    }

    fn is_resource(entry: &GalContact) -> bool {
        entry
            .attr("zimbraAccountCalendarUserType")
            .is_some_and(|v| v.eq_ignore_ascii_case("RESOURCE"))
            || entry
                .attr_values("objectClass")
                .iter()
                .any(|oc| oc.eq_ignore_ascii_case("zimbraCalendarResource"))
    }

    /// Whether `dn` lies under `base` (an empty base is the root).
    fn in_subtree(dn: &str, base: &str) -> bool {
        if base.is_empty() {
            return true;
        }
        let (dn, base) = (dn.to_lowercase(), base.to_lowercase());
        dn == base || dn.ends_with(&format!(",{base}"))
    }

    fn selects(query: &DirectoryQuery, entry: &GalContact) -> bool {
        if entry.gal_type == GalType::Internal && !Self::is_visible(entry) {
            return false;
        }
        if !Self::in_subtree(&entry.dn, &query.config.search_base) {
            return false;
        }
        if let Some(dn) = &query.entry_dn {
            return entry.dn.eq_ignore_ascii_case(dn);
        }
        let type_ok = match query.search_type {
            GalSearchType::All => true,
            GalSearchType::Account => !Self::is_group(entry) && !Self::is_resource(entry),
            GalSearchType::Resource => Self::is_resource(entry),
            GalSearchType::Group => Self::is_group(entry),
        };
        if !type_ok {
            return false;
        }
        if let Some(key) = &query.name {
            let values: Vec<&str> = NAME_ATTRS
                .iter()
                .flat_map(|a| entry.attr_values(a))
                .collect();
            if !key_matches(&values, key, query.op() == GalOp::Autocomplete) {
                return false;
            }
        }
        query.extra.as_ref().is_none_or(|f| matches(f, entry))
    }
}

impl Directory for MemoryDirectory {
    fn search_gal(&self, query: &DirectoryQuery) -> Result<DirectoryResult> {
        lock(&self.queries).push(query.clone());
        if let Some(reason) = read(&self.failure).as_ref() {
            return Err(GalError::directory(reason));
        }

        let store = match query.config.gal_type {
            GalType::Internal => &self.internal,
            GalType::External => &self.external,
        };
        let mut found: Vec<GalContact> = read(store)
            .iter()
            .filter(|e| Self::selects(query, e))
            .cloned()
            .collect();

        if let Some(cursor) = &query.cursor {
            // Incremental: changed at or after the cursor, oldest first.
            if !cursor.timestamp.is_empty() {
                found.retain(|e| e.change_timestamp() >= cursor.timestamp);
            }
            found.sort_by(|a, b| {
                a.change_timestamp()
                    .cmp(&b.change_timestamp())
                    .then_with(|| a.dn.cmp(&b.dn))
            });
            if cursor.has_more {
                let mut skip = cursor.match_count;
                found.retain(|e| {
                    if skip > 0 && e.change_timestamp() == cursor.timestamp {
                        skip -= 1;
                        false
                    } else {
                        true
                    }
                });
            }
        }

        let limit = query.limit as usize;
        let has_more = limit != 0 && found.len() > limit;
        if has_more {
            found.truncate(limit);
        }
        debug!(
            gal_type = %query.config.gal_type,
            found = found.len(),
            has_more,
            "Memory directory search"
        );
        Ok(DirectoryResult {
            entries: found,
            has_more,
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MailboxState {
    contacts: BTreeMap<i32, Contact>,
    /// Listed as modified, gone by the time it is fetched.
    vanished: BTreeMap<i32, (i32, i32)>,
    /// `(item id, change id)` of deleted items.
    tombstones: Vec<(i32, i32)>,
    folder_tokens: HashMap<i32, String>,
    /// Oldest change id the change log still covers.
    change_log_start: i32,
    last_change: i32,
    failure: Option<String>,
}

/// A GAL sync account mailbox.
#[derive(Debug)]
pub struct MemoryMailbox {
    account_id: String,
    state: RwLock<MailboxState>,
}

impl MemoryMailbox {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            state: RwLock::new(MailboxState::default()),
        }
    }

    /// Store a contact. A zero change id is replaced by the next one.
    pub fn add_contact(&self, mut contact: Contact) -> i32 {
        let mut state = write(&self.state);
        if contact.mod_sequence == 0 {
            state.last_change += 1;
            contact.mod_sequence = state.last_change;
        } else {
            state.last_change = state.last_change.max(contact.mod_sequence);
        }
        let change = contact.mod_sequence;
        state.contacts.insert(contact.id, contact);
        change
    }

    /// Delete a contact, leaving a tombstone at the next change id.
    pub fn delete_contact(&self, id: i32) -> bool {
        let mut state = write(&self.state);
        if state.contacts.remove(&id).is_none() {
            return false;
        }
        state.last_change += 1;
        let change = state.last_change;
        state.tombstones.push((id, change));
        true
    }

    /// Drop a contact without a tombstone while it still shows up as
    /// modified, as when it is deleted mid-sync.
    pub fn vanish(&self, id: i32) {
        let mut state = write(&self.state);
        if let Some(c) = state.contacts.remove(&id) {
            state.vanished.insert(id, (c.folder_id, c.mod_sequence));
        }
    }

    pub fn set_folder_sync_token(&self, folder_id: i32, token: impl Into<String>) {
        write(&self.state).folder_tokens.insert(folder_id, token.into());
    }

    /// Forget changes older than `change_id`.
    pub fn truncate_change_log(&self, change_id: i32) {
        write(&self.state).change_log_start = change_id;
    }

    /// Make searches fail with `reason` (`None` to heal).
    pub fn set_failure(&self, reason: Option<&str>) {
        write(&self.state).failure = reason.map(str::to_string);
    }

    pub fn last_change(&self) -> i32 {
        read(&self.state).last_change
    }

    fn selects(search: &MailboxSearch, contact: &Contact) -> bool {
        if !search.folders.is_empty() && !search.folders.contains(&contact.folder_id) {
            return false;
        }
        if let Some(dn) = &search.entry_dn {
            return contact.dn().is_some_and(|d| d.eq_ignore_ascii_case(dn));
        }
        let resource = contact
            .get("zimbraAccountCalendarUserType")
            .is_some_and(|v| v.eq_ignore_ascii_case("RESOURCE"));
        let type_ok = match search.search_type {
            GalSearchType::All => true,
            GalSearchType::Account => !resource,
            GalSearchType::Resource => resource,
            GalSearchType::Group => contact.is_group(),
        };
        if !type_ok {
            return false;
        }
        if let Some(text) = &search.text {
            let values: Vec<String> = NAME_ATTRS
                .iter()
                .filter_map(|a| contact.attr(a))
                .flat_map(|v| v.values().into_iter().map(str::to_string).collect::<Vec<_>>())
                .collect();
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            let all_words = text
                .split_whitespace()
                .map(|w| w.trim_matches('*'))
                .filter(|w| !w.is_empty())
                .all(|w| key_matches(&values, w, true));
            if !all_words {
                return false;
            }
        }
        search.extra.as_ref().is_none_or(|f| matches(f, contact))
    }

    fn sort_key(contact: &Contact) -> String {
        contact
            .get("fullName")
            .or_else(|| contact.get("email"))
            .unwrap_or_default()
            .to_string()
    }
}

impl Mailbox for MemoryMailbox {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn search(&self, search: &MailboxSearch) -> Result<MailboxSearchResult> {
        let state = read(&self.state);
        if let Some(reason) = &state.failure {
            return Err(GalError::Mailbox(reason.clone()));
        }
        if search.raw_query.is_some() {
            return Err(GalError::Mailbox(
                "raw mailbox queries are not supported in memory".into(),
            ));
        }

        let mut hits: Vec<MailboxHit> = state
            .contacts
            .values()
            .filter(|c| Self::selects(search, c))
            .map(|c| MailboxHit {
                sort_field: Self::sort_key(c),
                contact: c.clone(),
            })
            .collect();
        match search.sort_by.as_str() {
            "none" => {}
            "nameDesc" => hits.sort_by_cached_key(|h| std::cmp::Reverse(h.sort_field.to_lowercase())),
            _ => hits.sort_by_cached_key(|h| h.sort_field.to_lowercase()),
        }

        let total = hits.len();
        let offset = (search.offset as usize).min(total);
        let mut page: Vec<MailboxHit> = hits.into_iter().skip(offset).collect();
        let limit = search.limit as usize;
        let has_more = limit != 0 && page.len() > limit;
        if has_more {
            page.truncate(limit);
        }
        Ok(MailboxSearchResult {
            hits: page,
            has_more,
            sort_by: search.sort_by.clone(),
            offset: search.offset,
        })
    }

    fn modified_items(&self, since: i32, folders: &BTreeSet<i32>, limit: u32) -> Result<Vec<i32>> {
        let state = read(&self.state);
        let in_scope = |folder: i32| folders.is_empty() || folders.contains(&folder);
        let mut changed: Vec<(i32, i32)> = state
            .contacts
            .values()
            .filter(|c| c.mod_sequence > since && in_scope(c.folder_id))
            .map(|c| (c.mod_sequence, c.id))
            .chain(
                state
                    .vanished
                    .iter()
                    .filter(|(_, (folder, seq))| *seq > since && in_scope(*folder))
                    .map(|(id, (_, seq))| (*seq, *id)),
            )
            .collect();
        changed.sort_unstable();
        let ids = changed.into_iter().map(|(_, id)| id);
        Ok(if limit == 0 {
            ids.collect()
        } else {
            ids.take(limit as usize).collect()
        })
    }

    fn modified_items_count(&self, since: i32, folders: &BTreeSet<i32>) -> Result<u32> {
        Ok(self.modified_items(since, folders, 0)?.len() as u32)
    }

    fn contact(&self, id: i32) -> Result<Contact> {
        read(&self.state)
            .contacts
            .get(&id)
            .cloned()
            .ok_or(GalError::NoSuchItem(id))
    }

    fn tombstones(&self, since: i32) -> Result<Tombstones> {
        let state = read(&self.state);
        if since < state.change_log_start {
            return Err(GalError::MustResync);
        }
        let mut result = Tombstones::default();
        for (id, change) in &state.tombstones {
            if *change > since {
                result.ids.push(*id);
                result.max_mod_sequence = result.max_mod_sequence.max(*change);
            }
        }
        Ok(result)
    }

    fn folder_sync_token(&self, folder_id: i32) -> Option<String> {
        read(&self.state).folder_tokens.get(&folder_id).cloned()
    }
}

/// Mailboxes by account id.
#[derive(Debug, Default)]
pub struct MemoryMailboxes {
    mailboxes: RwLock<HashMap<String, Arc<MemoryMailbox>>>,
}

impl MemoryMailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailbox of `account_id`, created on first use.
    pub fn open(&self, account_id: &str) -> Arc<MemoryMailbox> {
        let mut mailboxes = write(&self.mailboxes);
        mailboxes
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(MemoryMailbox::new(account_id)))
            .clone()
    }
}

impl MailboxProvider for MemoryMailboxes {
    fn mailbox(&self, account: &Account) -> Result<Arc<dyn Mailbox>> {
        match read(&self.mailboxes).get(&account.id) {
            Some(mbox) => Ok(mbox.clone() as Arc<dyn Mailbox>),
            None => Err(GalError::Mailbox(format!(
                "no mailbox for account {}",
                account.name
            ))),
        }
    }
}

// ── Provisioning and access control ─────────────────────────────

#[derive(Debug, Default)]
struct ProvisioningState {
    accounts: BTreeMap<String, Account>,
    domains: BTreeMap<String, Domain>,
    groups: BTreeMap<String, Group>,
}

/// Accounts, domains and distribution lists. Accounts on `local_host`, or
/// without a mail host, are local.
#[derive(Debug, Default)]
pub struct MemoryProvisioning {
    local_host: String,
    state: RwLock<ProvisioningState>,
}

impl MemoryProvisioning {
    pub fn new(local_host: impl Into<String>) -> Self {
        Self {
            local_host: local_host.into(),
            state: RwLock::default(),
        }
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn add_account(&self, account: Account) {
        write(&self.state).accounts.insert(account.id.clone(), account);
    }

    pub fn add_domain(&self, domain: Domain) {
        write(&self.state).domains.insert(domain.name.to_lowercase(), domain);
    }

    pub fn add_group(&self, group: Group) {
        write(&self.state).groups.insert(group.id.clone(), group);
    }

    /// Account by id or name.
    pub fn find_account(&self, key: &str) -> Option<Account> {
        let state = read(&self.state);
        state.accounts.get(key).cloned().or_else(|| {
            state
                .accounts
                .values()
                .find(|a| a.name.eq_ignore_ascii_case(key))
                .cloned()
        })
    }

    pub fn domains(&self) -> Vec<Domain> {
        read(&self.state).domains.values().cloned().collect()
    }
}

impl Provisioning for MemoryProvisioning {
    fn account_by_id(&self, id: &str) -> Option<Account> {
        read(&self.state).accounts.get(id).cloned()
    }

    fn domain_by_name(&self, name: &str) -> Option<Domain> {
        read(&self.state).domains.get(&name.to_lowercase()).cloned()
    }

    fn is_local(&self, account: &Account) -> bool {
        account.mail_host.is_empty() || account.mail_host.eq_ignore_ascii_case(&self.local_host)
    }

    fn is_distribution_list(&self, name: &str) -> bool {
        read(&self.state)
            .groups
            .values()
            .any(|g| g.name.eq_ignore_ascii_case(name))
    }

    fn group_by_id(&self, id: &str) -> Result<Option<Group>> {
        Ok(read(&self.state).groups.get(id).cloned())
    }
}

/// Explicit grants of a right on a group to an account.
#[derive(Debug, Default)]
pub struct MemoryAccessControl {
    grants: RwLock<BTreeSet<(String, String)>>,
    failure: RwLock<Option<String>>,
}

impl MemoryAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_view(&self, account_id: &str, group_id: &str) {
        write(&self.grants).insert((account_id.to_string(), group_id.to_string()));
    }

    pub fn set_failure(&self, reason: Option<&str>) {
        *write(&self.failure) = reason.map(str::to_string);
    }
}

impl AccessControl for MemoryAccessControl {
    fn can_do(&self, account: &Account, group: &Group, right: Right) -> Result<bool> {
        if let Some(reason) = read(&self.failure).as_ref() {
            return Err(GalError::PermissionDenied(reason.clone()));
        }
        match right {
            Right::ViewDistributionList => Ok(read(&self.grants)
                .contains(&(account.id.clone(), group.id.clone()))),
        }
    }
}

// ── Peer proxy ──────────────────────────────────────────────────

/// Peer replies served in order. Without a scripted reply the peer is
/// unreachable.
#[derive(Debug, Default)]
pub struct MemoryProxy {
    replies: Mutex<VecDeque<std::result::Result<ProxyResponse, ProxyError>>>,
    requests: Mutex<Vec<(String, ProxyRequest)>>,
}

impl MemoryProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: std::result::Result<ProxyResponse, ProxyError>) {
        lock(&self.replies).push_back(reply);
    }

    /// `(host, request)` pairs received so far.
    pub fn requests(&self) -> Vec<(String, ProxyRequest)> {
        lock(&self.requests).clone()
    }
}

impl GalProxy for MemoryProxy {
    fn invoke(
        &self,
        host: &str,
        request: &ProxyRequest,
    ) -> std::result::Result<ProxyResponse, ProxyError> {
        lock(&self.requests).push((host.to_string(), request.clone()));
        lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Err(ProxyError::Transport(format!("{host} is unreachable"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::contact::{AttrMap, AttrValue};
    use crate::search::config::GalSearchConfig;
    use crate::token::LdapCursor;

    fn person(uid: &str, cn: &str, modified: &str) -> GalContact {
        let mut attrs = AttrMap::new();
        attrs.insert("cn".into(), AttrValue::from(cn));
        attrs.insert("objectClass".into(), AttrValue::from("zimbraAccount"));
        attrs.insert("modifyTimeStamp".into(), AttrValue::from(modified));
        let dn = format!("uid={uid},ou=people,dc=example,dc=com");
        GalContact::new(GalType::Internal, dn, attrs)
    }

    fn sync_query(limit: u32, cursor: LdapCursor) -> DirectoryQuery {
        let domain = Domain::new("d1", "example.com");
        DirectoryQuery {
            config: GalSearchConfig::internal(GalOp::Sync, GalSearchType::All, &domain)
                .expect("config"),
            filter: String::new(),
            search_type: GalSearchType::All,
            name: None,
            entry_dn: None,
            extra: None,
            limit,
            cursor: Some(cursor),
        }
    }

    #[test]
    fn test_directory_sync_paging_within_one_second() {
        let dir = MemoryDirectory::new();
        dir.add(person("a", "A", "20240101000000Z"));
        dir.add(person("b", "B", "20240101000000Z"));
        dir.add(person("c", "C", "20240101000000Z"));

        let first = dir.search_gal(&sync_query(2, LdapCursor::default())).unwrap();
        assert!(first.has_more);
        assert_eq!(first.entries.len(), 2);

        let cursor = LdapCursor {
            timestamp: "20240101000000Z".into(),
            match_count: 2,
            has_more: true,
            max_timestamp: "20240101000000Z".into(),
        };
        let second = dir.search_gal(&sync_query(2, cursor)).unwrap();
        assert!(!second.has_more);
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].dn, "uid=c,ou=people,dc=example,dc=com");
    }

    #[test]
    fn test_hidden_entries_are_skipped() {
        let dir = MemoryDirectory::new();
        let mut hidden = person("h", "Hidden", "20240101000000Z");
        hidden.attrs.insert("zimbraHideInGal".into(), AttrValue::from("TRUE"));
        dir.add(hidden);
        dir.add(person("v", "Visible", "20240101000000Z"));
        let r = dir.search_gal(&sync_query(0, LdapCursor::default())).unwrap();
        assert_eq!(r.entries.len(), 1);
    }

    #[test]
    fn test_entries_outside_search_base_are_skipped() {
        let dir = MemoryDirectory::new();
        dir.add(person("a", "A", "20240101000000Z"));
        let mut elsewhere = person("b", "B", "20240101000000Z");
        elsewhere.dn = "uid=b,ou=people,dc=example,dc=org".into();
        dir.add(elsewhere);
        let r = dir.search_gal(&sync_query(0, LdapCursor::default())).unwrap();
        assert_eq!(r.entries.len(), 1);
        assert!(MemoryDirectory::in_subtree("DC=Example,DC=Com", "dc=example,dc=com"));
        assert!(!MemoryDirectory::in_subtree("uid=x,dc=badexample,dc=com", "dc=example,dc=com"));
    }

    #[test]
    fn test_mailbox_tombstones_and_change_log() {
        let mbox = MemoryMailbox::new("gal-1");
        for id in 300..303 {
            mbox.add_contact(Contact {
                id,
                folder_id: 257,
                mod_sequence: 0,
                fields: BTreeMap::new(),
            });
        }
        assert_eq!(mbox.last_change(), 3);
        assert!(mbox.delete_contact(301));
        let t = mbox.tombstones(3).unwrap();
        assert_eq!(t.ids, vec![301]);
        assert_eq!(t.max_mod_sequence, 4);

        mbox.truncate_change_log(2);
        assert!(matches!(mbox.tombstones(1), Err(GalError::MustResync)));
    }

    #[test]
    fn test_vanished_items_are_listed_but_not_fetchable() {
        let mbox = MemoryMailbox::new("gal-1");
        mbox.add_contact(Contact {
            id: 300,
            folder_id: 257,
            mod_sequence: 0,
            fields: BTreeMap::new(),
        });
        mbox.vanish(300);
        let folders = BTreeSet::from([257]);
        assert_eq!(mbox.modified_items(0, &folders, 0).unwrap(), vec![300]);
        assert!(matches!(mbox.contact(300), Err(GalError::NoSuchItem(300))));
    }

    #[test]
    fn test_proxy_without_reply_is_unreachable() {
        let proxy = MemoryProxy::new();
        let err = proxy.invoke("mbs2", &ProxyRequest::default()).unwrap_err();
        assert!(matches!(err, ProxyError::Transport(_)));
        assert_eq!(proxy.requests().len(), 1);
    }
}
