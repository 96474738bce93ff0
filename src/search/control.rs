//! GAL request orchestration.
//!
//! Every operation prefers a GAL sync account, a mailbox holding a synced
//! copy of the directory, and falls back to the live directory:
//!
//! 1. Check the caller's GAL features (admins are exempt).
//! 2. Resolve a usable GAL sync account.
//! 3. Serve from its mailbox when it is local, or forward to the node
//!    hosting it.
//! 4. Otherwise, or when step 3 fails, search the directory.
//!
//! Sync adds admission control in front of all of this.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{
    AccessControl, Directory, GalProxy, Mailbox, MailboxProvider, MailboxSearch, ProxyError,
    Provisioning, Right,
};
use crate::error::{GalError, Result};
use crate::model::account::Account;
use crate::model::contact::ItemId;
use crate::model::gal::{GalMode, GalOp, GalSearchType, GalType};
use crate::token::{
    bump_timestamp, earlier_timestamp, later_timestamp, GalSyncToken, LdapCursor,
    EARLIEST_SYNC_TOKEN,
};

use super::group::GroupHandlerRegistry;
use super::params::GalSearchParams;
use super::registry::{client_id, SyncClientRegistry};

/// The collaborators a control plane node talks to.
#[derive(Clone)]
pub struct GalServices {
    pub directory: Arc<dyn Directory>,
    pub mailboxes: Arc<dyn MailboxProvider>,
    pub provisioning: Arc<dyn Provisioning>,
    pub access: Arc<dyn AccessControl>,
    pub proxy: Arc<dyn GalProxy>,
    pub sync_clients: Arc<SyncClientRegistry>,
    pub group_handlers: Arc<GroupHandlerRegistry>,
}

/// Outcome of looking up a GAL sync account.
#[derive(Debug, Clone, PartialEq)]
pub enum GalAccountResolution {
    Resolved(Account),
    NotConfigured,
}

/// Outcome of a GAL sync account path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathOutcome {
    Served,
    /// Fall back to the directory.
    NotConfigured,
}

/// Feature switches checked on top of the base GAL feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feature {
    Autocomplete,
    Sync,
}

/// Paging state of one directory search.
#[derive(Debug, Clone, Default)]
struct DirectoryPage {
    has_more: bool,
    cursor: LdapCursor,
}

/// Runs one GAL request.
pub struct GalSearchControl<'a> {
    services: &'a GalServices,
    params: GalSearchParams,
}

impl<'a> GalSearchControl<'a> {
    pub fn new(services: &'a GalServices, params: GalSearchParams) -> Self {
        Self { services, params }
    }

    pub fn params(&self) -> &GalSearchParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut GalSearchParams {
        &mut self.params
    }

    /// Finish the response.
    pub fn into_response(mut self) -> super::callback::GalResponse {
        self.params.callback.finish()
    }

    fn check_feature_enabled(&self, extra: Option<Feature>) -> Result<()> {
        if self.params.auth.as_ref().is_some_and(|a| a.admin) {
            return Ok(());
        }

        let account = match &self.params.account {
            Some(acct) => Some(acct.clone()),
            None => self
                .params
                .auth
                .as_ref()
                .and_then(|a| self.services.provisioning.account_by_id(&a.account_id)),
        };
        let Some(account) = account else {
            return Err(GalError::PermissionDenied(
                "unable to get account for GAL feature checking".into(),
            ));
        };

        if !account.features.gal {
            return Err(GalError::PermissionDenied(
                "GAL feature (gal) is not enabled".into(),
            ));
        }
        let (enabled, name) = match extra {
            None => return Ok(()),
            Some(Feature::Autocomplete) => (account.features.autocomplete, "autocomplete"),
            Some(Feature::Sync) => (account.features.sync, "sync"),
        };
        if !enabled {
            return Err(GalError::PermissionDenied(format!(
                "GAL feature ({name}) is not enabled"
            )));
        }
        Ok(())
    }

    // ── Operations ──────────────────────────────────────────────

    pub fn autocomplete(&mut self) -> Result<()> {
        self.check_feature_enabled(Some(Feature::Autocomplete))?;
        self.params.op = GalOp::Autocomplete;

        let use_gal_account = self
            .params
            .account
            .as_ref()
            .is_none_or(|a| a.features.sync_account_autocomplete);

        if use_gal_account {
            if let GalAccountResolution::Resolved(gal) = self.requested_or_default_gal_account() {
                if self.account_search(&gal)? == PathOutcome::Served {
                    return Ok(());
                }
            }
        }

        let query = self.params.query.take().unwrap_or_default();
        self.params.query = Some(format!("{}*", query.trim_end_matches('*')));
        self.params.callback.reset();
        self.ldap_search()
    }

    pub fn search(&mut self) -> Result<()> {
        self.check_feature_enabled(None)?;
        // "." matches everything.
        if self.params.query.as_deref() == Some(".") {
            self.params.query = None;
        }
        self.params.op = GalOp::Search;

        if let GalAccountResolution::Resolved(gal) = self.requested_or_default_gal_account() {
            if self.account_search(&gal)? == PathOutcome::Served {
                return Ok(());
            }
        }

        let mut query = self.params.query.take().unwrap_or_default();
        if self.params.wildcard {
            if !query.ends_with('*') {
                query.push('*');
            }
            if !query.starts_with('*') {
                query.insert(0, '*');
            }
        }
        self.params.query = Some(query);
        self.params.callback.reset();
        self.ldap_search()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.check_feature_enabled(Some(Feature::Sync))?;

        let id = client_id(&self.params.user_info);
        let domain_name = self.params.domain.name.clone();
        let capacity = self.params.domain.sync_max_concurrent_clients;
        let Some(_slot) = self
            .services
            .sync_clients
            .acquire(&domain_name, &id, capacity)
        else {
            // No change: hand the same token back.
            self.params.callback.set_new_token(self.params.token.clone());
            self.params.callback.set_throttled(true);
            return Ok(());
        };

        self.params.query = None;
        self.params.op = GalOp::Sync;

        let domain_limit = self.params.domain.sync_size_limit;
        self.params.limit = match (self.params.limit, domain_limit) {
            (0, d) => d,
            (l, 0) => l,
            (l, d) => l.min(d),
        };

        let disabled = self.params.domain.ldap_gal_sync_disabled;
        let id_only = self.params.id_only;
        if self.params.token.does_mailbox_sync() && (id_only || disabled) {
            debug!("Sync against GAL sync account");
            let resolved = match self.params.gal_sync_account.clone() {
                Some(acct) => GalAccountResolution::Resolved(acct),
                None => self.gal_sync_account_for_sync(),
            };
            if let GalAccountResolution::Resolved(gal) = resolved {
                debug!(account = %gal.id, "Start syncing GAL sync account");
                if self.account_sync(&gal)? == PathOutcome::Served {
                    return Ok(());
                }
            }
            self.params.callback.reset();
        }

        if id_only || disabled {
            if let GalAccountResolution::Resolved(_) = self.gal_sync_account() {
                self.params.callback.set_full_sync_recommended(true);
            }
        }
        if disabled {
            self.params.callback.set_new_token(self.params.token.clone());
            return Ok(());
        }
        self.ldap_search()
    }

    // ── GAL sync account resolution ─────────────────────────────

    fn requested_or_default_gal_account(&self) -> GalAccountResolution {
        match &self.params.gal_sync_account {
            Some(acct) => GalAccountResolution::Resolved(acct.clone()),
            None => self.gal_sync_account(),
        }
    }

    /// The account a client already synced against, so successive syncs
    /// stay on one account.
    pub fn gal_sync_account_for_sync(&self) -> GalAccountResolution {
        let token = &self.params.token;
        if token.is_empty() || !token.does_mailbox_sync() {
            return self.gal_sync_account();
        }
        for id in &self.params.domain.gal_account_ids {
            if token.change_id(id) > 0 {
                return match self.services.provisioning.account_by_id(id) {
                    Some(acct) if acct.status.is_active() && is_valid_gal_sync_account(&acct) => {
                        GalAccountResolution::Resolved(acct)
                    }
                    _ => GalAccountResolution::NotConfigured,
                };
            }
        }
        GalAccountResolution::NotConfigured
    }

    /// First active and valid GAL sync account of the domain, preferring
    /// one hosted on this node.
    pub fn gal_sync_account(&self) -> GalAccountResolution {
        let mut found = None;
        for id in &self.params.domain.gal_account_ids {
            let Some(acct) = self.services.provisioning.account_by_id(id) else {
                continue;
            };
            if acct.status.is_active() && is_valid_gal_sync_account(&acct) {
                let local = self.services.provisioning.is_local(&acct);
                found = Some(acct);
                if local {
                    break;
                }
            }
        }
        match found {
            Some(acct) => GalAccountResolution::Resolved(acct),
            None => GalAccountResolution::NotConfigured,
        }
    }

    // ── GAL sync account search ─────────────────────────────────

    fn need_resources(&self) -> bool {
        let domain = &self.params.domain;
        domain.gal_mode == GalMode::External
            && matches!(
                self.params.search_type,
                GalSearchType::All | GalSearchType::Resource
            )
            && domain.always_include_local_calendar_resources
    }

    fn account_search(&mut self, gal: &Account) -> Result<PathOutcome> {
        if !gal.status.is_active() {
            info!(account = %gal.id, status = ?gal.status, "GAL sync account is not active");
            return Ok(PathOutcome::NotConfigured);
        }

        if self.services.provisioning.is_local(gal) {
            if self.need_resources() {
                if let Some(search) = self.params.local_resource_search(gal) {
                    if !self.local_search(gal, &search) {
                        return Ok(PathOutcome::NotConfigured);
                    }
                }
            }
            let search = self.params.mailbox_search(Some(gal), true);
            if !self.local_search(gal, &search) {
                return Ok(PathOutcome::NotConfigured);
            }
            return Ok(PathOutcome::Served);
        }

        match self.proxy_gal_account_search(gal, false) {
            Ok(true) => Ok(PathOutcome::Served),
            Ok(false) => Ok(PathOutcome::NotConfigured),
            Err(reason) => {
                warn!(account = %gal.name, %reason, "Remote search on GAL sync account failed");
                Ok(PathOutcome::NotConfigured)
            }
        }
    }

    /// Run a mailbox search; `false` means the caller should fall back.
    fn local_search(&mut self, gal: &Account, search: &MailboxSearch) -> bool {
        match self.try_local_search(gal, search) {
            Ok(()) => true,
            Err(e) => {
                warn!(account = %gal.id, error = %e, "Search on GAL sync account failed");
                false
            }
        }
    }

    fn try_local_search(&mut self, gal: &Account, search: &MailboxSearch) -> Result<()> {
        let mbox = self.services.mailboxes.mailbox(gal)?;
        let result = mbox.search(search)?;
        let limit = self.params.limit as usize;
        let callback = &mut self.params.callback;

        let mut consumed = 0;
        for hit in &result.hits {
            let id = ItemId::new(mbox.account_id(), hit.contact.id);
            callback.handle_contact(&id, &hit.contact, Some(&hit.sort_field));
            consumed += 1;
            if consumed == limit {
                break;
            }
        }
        callback.set_sort_by(&result.sort_by);
        callback.set_query_offset(result.offset);
        callback.set_has_more(result.has_more || consumed < result.hits.len());
        Ok(())
    }

    // ── GAL sync account sync ───────────────────────────────────

    fn account_sync(&mut self, gal: &Account) -> Result<PathOutcome> {
        if !gal.status.is_active() {
            info!(account = %gal.id, status = ?gal.status, "GAL sync account is not active");
            return Ok(PathOutcome::NotConfigured);
        }

        if self.services.provisioning.is_local(gal) {
            return match self.local_account_sync(gal) {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    warn!(account = %gal.id, error = %e, "Sync on GAL sync account failed");
                    Ok(PathOutcome::NotConfigured)
                }
            };
        }

        match self.proxy_gal_account_search(gal, true) {
            Ok(true) => Ok(PathOutcome::Served),
            Ok(false) => Ok(PathOutcome::NotConfigured),
            Err(reason) => {
                // The peer may be down; let the client retry with its token.
                warn!(account = %gal.name, %reason, "Remote sync on GAL sync account failed");
                self.params.callback.set_new_token(self.params.token.clone());
                Ok(PathOutcome::Served)
            }
        }
    }

    fn local_account_sync(&mut self, gal: &Account) -> Result<PathOutcome> {
        let mbox = self.services.mailboxes.mailbox(gal)?;
        let change_id = self.params.token.change_id(&gal.id);
        let domain = &self.params.domain;
        let mode = domain.gal_mode;
        let limit = self.params.limit;
        let get_count = self.params.get_count;

        // Local calendar resources ride along with the first data source
        // when the GAL itself comes from an external directory.
        let mut sync_local_resources =
            mode == GalMode::External && domain.always_include_local_calendar_resources;

        let mut folders = BTreeSet::new();
        let mut sync_token: Option<String> = None;
        for ds in gal.gal_data_sources() {
            if !mode.includes(ds.gal_type) {
                debug!(data_source = %ds.name, gal_type = %ds.gal_type, "Skipping data source of another GAL mode");
                continue;
            }
            let Some(folder_token) = mbox.folder_sync_token(ds.folder_id) else {
                debug!(data_source = %ds.name, "Skipping data source without folder mapping");
                continue;
            };
            folders.insert(ds.folder_id);
            sync_token = Some(match sync_token {
                Some(current) => earlier_timestamp(&current, &folder_token),
                None => folder_token,
            });

            if sync_local_resources {
                let token = sync_token.clone().unwrap_or_default();
                self.sync_modified(
                    &*mbox,
                    change_id,
                    &folders,
                    &token,
                    limit,
                    Some(("zimbraAccountCalendarUserType", "RESOURCE")),
                    get_count,
                )?;
                sync_local_resources = false;
            }
        }

        if folders.is_empty() {
            warn!(account = %gal.id, "No GAL data source with a mapped folder");
            return Ok(PathOutcome::NotConfigured);
        }
        let Some(sync_token) = sync_token else {
            warn!(account = %gal.id, "No GAL data source with a sync token");
            return Ok(PathOutcome::NotConfigured);
        };

        let has_more = self.sync_modified(
            &*mbox, change_id, &folders, &sync_token, limit, None, get_count,
        )?;

        if !has_more && change_id > 0 {
            match mbox.tombstones(change_id) {
                Ok(tombstones) => {
                    debug!(deleted_change_id = tombstones.max_mod_sequence, "Read tombstones");
                    if tombstones.max_mod_sequence > change_id {
                        let token = GalSyncToken::new(
                            &sync_token,
                            mbox.account_id(),
                            tombstones.max_mod_sequence,
                        );
                        debug!(%token, "Computed new sync token");
                        self.params.callback.set_new_token(token);
                    }
                    for id in tombstones.ids {
                        let item = ItemId::new(gal.id.clone(), id);
                        self.params.callback.handle_deleted(&item.to_string());
                    }
                }
                Err(GalError::MustResync) => {
                    warn!(account = %gal.id, change_id, "Sync token too old, deleted items will not be reported");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(PathOutcome::Served)
    }

    /// Feed contacts modified after `change_id` to the callback. Returns
    /// whether the limit cut the page short.
    #[allow(clippy::too_many_arguments)]
    fn sync_modified(
        &mut self,
        mbox: &dyn Mailbox,
        change_id: i32,
        folders: &BTreeSet<i32>,
        sync_token: &str,
        limit: u32,
        only: Option<(&str, &str)>,
        get_count: bool,
    ) -> Result<bool> {
        info!(limit, "Using limit for GAL account sync");
        let changed = mbox.modified_items(change_id, folders, limit)?;
        let callback = &mut self.params.callback;

        if get_count {
            let remain = if limit != 0 {
                let total = mbox.modified_items_count(change_id, folders)?;
                debug!(total, "Modified item count");
                total.saturating_sub(limit)
            } else {
                0
            };
            callback.set_remain(remain);
        }

        let mut last_change = change_id;
        let mut count = 0u32;
        let mut has_more = false;
        for item_id in changed {
            let contact = match mbox.contact(item_id) {
                Ok(c) => c,
                Err(GalError::NoSuchItem(_)) => {
                    warn!(item_id, "Skipping item deleted during sync");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some((attr, value)) = only {
                if contact.get(attr) != Some(value) {
                    continue;
                }
            }
            let id = ItemId::new(mbox.account_id(), item_id);
            callback.handle_contact(&id, &contact, None);
            count += 1;
            last_change = contact.mod_sequence;
            if count == limit {
                has_more = true;
                break;
            }
        }

        let token = GalSyncToken::new(sync_token, mbox.account_id(), last_change);
        debug!(%token, "Computed new sync token");
        callback.set_new_token(token);
        callback.set_has_more(has_more);
        Ok(has_more)
    }

    // ── Proxy ───────────────────────────────────────────────────

    /// Forward to the node hosting `gal`. `Ok(false)` asks for a fallback;
    /// `Err` is a transport failure.
    fn proxy_gal_account_search(
        &mut self,
        gal: &Account,
        sync: bool,
    ) -> std::result::Result<bool, String> {
        let request = self.params.proxy_request(gal, sync);
        if let Some(token) = &request.token {
            debug!(%token, "Setting token for proxied request");
        }
        let callback = &mut self.params.callback;

        let response = match self.services.proxy.invoke(&gal.mail_host, &request) {
            Ok(resp) => resp,
            Err(ProxyError::Fault(fault)) => {
                if callback.pass_through_proxied_response() {
                    callback.handle_proxied_response(Err(&fault));
                    return Ok(true);
                }
                warn!(account = %gal.name, code = %fault.code, "Remote search on GAL sync account faulted");
                return Ok(false);
            }
            Err(ProxyError::Transport(reason)) => return Err(reason),
        };

        if callback.pass_through_proxied_response() {
            callback.handle_proxied_response(Ok(&response));
            return Ok(true);
        }

        for element in &response.contacts {
            callback.handle_element(element);
        }
        for id in &response.deleted {
            callback.handle_deleted(id);
        }
        if let Some(token) = &response.token {
            let token = GalSyncToken::parse(token);
            debug!(account = %gal.id, %token, "New sync token from proxied account");
            callback.set_new_token(token);
        }
        callback.set_has_more(response.has_more);
        if self.params.get_count {
            callback.set_remain(response.remain.unwrap_or(0));
        }
        if response.has_more && !sync {
            if let Some(sort_by) = &response.sort_by {
                callback.set_sort_by(sort_by);
            }
            callback.set_query_offset(response.offset.unwrap_or(0));
        }
        Ok(true)
    }

    // ── Directory ───────────────────────────────────────────────

    /// Search the live directory. In `Both` mode the internal and external
    /// directory each get half the limit.
    pub fn ldap_search(&mut self) -> Result<()> {
        let mode = self.params.domain.gal_mode;
        let search_type = self.params.search_type;

        if self.need_resources() {
            self.params.search_type = GalSearchType::Resource;
            self.params.create_search_config(GalType::Internal)?;
            let saved = self.params.cursor.take();
            self.directory_search()?;
            self.params.cursor = saved;
            self.params.search_type = search_type;
        }

        let mut limit = self.params.ldap_limit.unwrap_or(self.params.limit);
        if limit == 0 && self.params.op != GalOp::Sync && self.params.ldap_limit.is_none() {
            limit = self.params.domain.max_results;
        }

        if self.params.op == GalOp::Sync {
            if let Some(ts) = self.params.domain.gal_definition_last_modified.clone() {
                self.params.callback.set_gal_definition_last_modified(&ts);
            }
        }

        info!(limit, "Using limit for directory search");
        self.params.limit = if mode == GalMode::Both { limit / 2 } else { limit };

        let first_type = if mode == GalMode::External {
            GalType::External
        } else {
            GalType::Internal
        };
        self.params.create_search_config(first_type)?;
        self.params.cursor = Some(self.params.token.internal_cursor());
        let first = self.directory_search()?;

        let second = if mode == GalMode::Both {
            self.params.create_search_config(GalType::External)?;
            self.params.cursor = Some(self.params.token.external_cursor());
            Some(self.directory_search()?)
        } else {
            None
        };

        if self.params.op == GalOp::Sync {
            let segment = LdapCursor::join(&first.cursor, second.as_ref().map(|p| &p.cursor));
            self.params
                .callback
                .set_new_token(GalSyncToken::from_directory(&segment));
        }
        let has_more = first.has_more || second.is_some_and(|p| p.has_more);
        self.params.callback.set_has_more(has_more);
        Ok(())
    }

    fn directory_search(&mut self) -> Result<DirectoryPage> {
        let query = self.params.directory_query()?;
        debug!(
            gal_type = %query.config.gal_type,
            base = %query.config.search_base,
            page_size = query.config.effective_page_size(query.limit),
            limit = query.limit,
            filter = %query.filter,
            "Directory search"
        );
        let result = self
            .services
            .directory
            .search_gal(&query)
            .map_err(|e| match e {
                GalError::Directory { .. } => e,
                other => GalError::directory(other),
            })?;

        let handler = self
            .services
            .group_handlers
            .get(query.config.rules.group_handler.as_deref());
        for entry in &result.entries {
            let mapped = query.config.rules.apply(entry, &*handler);
            self.params.callback.handle_gal_contact(&mapped);
        }

        let prev = query.cursor.unwrap_or_default();
        Ok(DirectoryPage {
            has_more: result.has_more,
            cursor: next_cursor(&prev, &result.entries, result.has_more),
        })
    }
}

/// Cursor after a directory sync page.
///
/// A cut-short page resumes at the change time of its last entry, skipping
/// the entries with that time already returned. A complete page moves the
/// timestamp one second past the newest change seen, since the directory
/// only offers `>=`. Without anything new the cursor stays put.
fn next_cursor(
    prev: &LdapCursor,
    entries: &[crate::model::contact::GalContact],
    has_more: bool,
) -> LdapCursor {
    let newest = entries
        .iter()
        .map(|e| e.change_timestamp())
        .fold(String::new(), |acc, ts| later_timestamp(&acc, &ts));

    if has_more {
        if let Some(last) = entries.last() {
            let ts = last.change_timestamp();
            let same = entries
                .iter()
                .filter(|e| e.change_timestamp() == ts)
                .count() as u32;
            let match_count = if prev.has_more && prev.timestamp == ts {
                prev.match_count + same
            } else {
                same
            };
            return LdapCursor {
                timestamp: ts,
                match_count,
                has_more: true,
                max_timestamp: later_timestamp(&prev.max_timestamp, &newest),
            };
        }
    }

    let base = if prev.has_more {
        prev.max_timestamp.as_str()
    } else {
        prev.timestamp.as_str()
    };
    let max = later_timestamp(base, &newest);
    if max.is_empty() {
        return LdapCursor::from_timestamp(EARLIEST_SYNC_TOKEN);
    }
    if entries.is_empty() && !prev.has_more {
        return LdapCursor::from_timestamp(&prev.timestamp);
    }
    LdapCursor::from_timestamp(&bump_timestamp(&max))
}

/// A sync account is usable when every GAL data source finished an import
/// and is switched on.
pub fn is_valid_gal_sync_account(account: &Account) -> bool {
    account.gal_data_sources().all(|ds| ds.is_usable_gal_source())
}

/// Whether `authed` may see the members of a GAL group.
///
/// A group without an id is external and needs no check. A local
/// distribution list needs the view-distribution-list right.
pub fn can_expand_gal_group(
    services: &GalServices,
    group_name: Option<&str>,
    group_id: Option<&str>,
    authed: Option<&Account>,
) -> bool {
    let (Some(name), Some(authed)) = (group_name, authed) else {
        return false;
    };
    let Some(group_id) = group_id else {
        return true;
    };
    if !services.provisioning.is_distribution_list(name) {
        return true;
    }

    let group = match services.provisioning.group_by_id(group_id) {
        Ok(Some(group)) => group,
        Ok(None) => {
            warn!(group = name, id = group_id, "Unable to find group for permission checking");
            return false;
        }
        Err(e) => {
            warn!(group = name, error = %e, "Unable to check permission for GAL group expansion");
            return false;
        }
    };
    match services
        .access
        .can_do(authed, &group, Right::ViewDistributionList)
    {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!(group = name, error = %e, "Unable to check permission for GAL group expansion");
            false
        }
    }
}
