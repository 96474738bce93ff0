//! Result accumulation.
//!
//! A [`ResultCallback`] receives entries of three shapes (mailbox contacts,
//! directory contacts, and contacts relayed by a peer) and turns them into
//! one [`GalResponse`]. Paging, sort and token metadata are collected while
//! the search runs and stamped onto the response once, in
//! [`ResultCallback::finish`].

use serde::Serialize;
use tracing::debug;

use crate::backend::{ProxyFault, ProxyResponse};
use crate::filter::eval::{matches, AttributeSource};
use crate::filter::FilterTerm;
use crate::model::contact::{lookup, AttrMap, AttrValue, Contact, ContactElement, GalContact, ItemId};
use crate::model::gal::GalOp;
use crate::token::GalSyncToken;

/// One encoded entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalEntry {
    pub id: String,
    /// Directory DN the entry comes from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_field: Option<String>,
    /// Empty for id-only responses.
    #[serde(skip_serializing_if = "AttrMap::is_empty")]
    pub attrs: AttrMap,
    /// For groups, whether the caller may expand the member list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_expand: Option<bool>,
}

impl GalEntry {
    pub fn attr(&self, name: &str) -> Option<&str> {
        lookup(&self.attrs, name).and_then(AttrValue::first)
    }

    pub fn is_group(&self) -> bool {
        self.attr("type") == Some("group")
    }
}

/// A finished GAL response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GalResponse {
    pub contacts: Vec<GalEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remain: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    pub paging_supported: bool,
    pub throttled: bool,
    pub full_sync_recommended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gal_definition_last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenize_key: Option<String>,
    /// A peer fault relayed as is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<ProxyFault>,
}

/// Receives results while a GAL operation runs.
pub trait ResultCallback {
    /// A contact from a local GAL sync account mailbox.
    fn handle_contact(&mut self, id: &ItemId, contact: &Contact, sort_field: Option<&str>);
    /// A contact straight from the directory.
    fn handle_gal_contact(&mut self, contact: &GalContact);
    /// A contact relayed by the peer owning the GAL sync account.
    fn handle_element(&mut self, element: &ContactElement);
    fn handle_deleted(&mut self, id: &str);

    /// Whether peer responses, faults included, are relayed untouched.
    fn pass_through_proxied_response(&self) -> bool {
        false
    }
    fn handle_proxied_response(&mut self, response: Result<&ProxyResponse, &ProxyFault>);

    /// Record a new token; successive tokens are merged.
    fn set_new_token(&mut self, token: GalSyncToken);
    fn set_has_more(&mut self, more: bool);
    fn set_remain(&mut self, remain: u32);
    fn set_sort_by(&mut self, sort_by: &str);
    /// Record the offset of the page returned; marks the result pageable.
    fn set_query_offset(&mut self, offset: u32);
    fn set_throttled(&mut self, throttled: bool);
    fn set_full_sync_recommended(&mut self, recommended: bool);
    fn set_gal_definition_last_modified(&mut self, ts: &str);
    fn set_tokenize_key(&mut self, key: Option<&str>);

    /// Drop everything gathered so far, before a fallback path runs.
    fn reset(&mut self);
    /// Stamp the metadata and return the response.
    fn finish(&mut self) -> GalResponse;
}

/// Options fixed when a callback is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackOptions {
    pub op: GalOp,
    /// Encode ids only (sync clients that fetch details later).
    pub id_only: bool,
    pub pass_through: bool,
}

impl CallbackOptions {
    pub fn new(op: GalOp) -> Self {
        Self {
            op,
            id_only: false,
            pass_through: false,
        }
    }
}

#[derive(Debug, Default)]
struct Metadata {
    token: Option<GalSyncToken>,
    more: bool,
    remain: Option<u32>,
    sort_by: Option<String>,
    offset: Option<u32>,
    paging_supported: bool,
    throttled: bool,
    full_sync_recommended: bool,
    gal_definition_last_modified: Option<String>,
    tokenize_key: Option<String>,
}

/// The standard callback.
pub struct GalSearchResultCallback {
    options: CallbackOptions,
    response: GalResponse,
    meta: Metadata,
    finished: bool,
}

impl GalSearchResultCallback {
    pub fn new(options: CallbackOptions) -> Self {
        Self {
            options,
            response: GalResponse::default(),
            meta: Metadata::default(),
            finished: false,
        }
    }

    pub fn options(&self) -> CallbackOptions {
        self.options
    }

    /// Autocomplete returns only the fields that carry a value.
    fn encode_attrs(&self, attrs: AttrMap) -> AttrMap {
        if self.options.id_only {
            return AttrMap::new();
        }
        if self.options.op == GalOp::Autocomplete {
            return attrs.into_iter().filter(|(_, v)| !v.is_blank()).collect();
        }
        attrs
    }

    fn push(&mut self, entry: GalEntry) {
        self.response.contacts.push(entry);
    }
}

impl ResultCallback for GalSearchResultCallback {
    fn handle_contact(&mut self, id: &ItemId, contact: &Contact, sort_field: Option<&str>) {
        let attrs = self.encode_attrs(contact.attr_map());
        self.push(GalEntry {
            id: id.to_string(),
            dn: contact.dn().map(str::to_string),
            sort_field: sort_field.map(str::to_string),
            attrs,
            can_expand: None,
        });
    }

    fn handle_gal_contact(&mut self, contact: &GalContact) {
        let attrs = self.encode_attrs(contact.attrs.clone());
        self.push(GalEntry {
            id: contact.id().unwrap_or(&contact.dn).to_string(),
            dn: Some(contact.dn.clone()),
            sort_field: None,
            attrs,
            can_expand: None,
        });
    }

    fn handle_element(&mut self, element: &ContactElement) {
        let attrs = self.encode_attrs(element.attrs.clone());
        self.push(GalEntry {
            id: element.id.clone(),
            dn: None,
            sort_field: element.sort_field.clone(),
            attrs,
            can_expand: None,
        });
    }

    fn handle_deleted(&mut self, id: &str) {
        self.response.deleted.push(id.to_string());
    }

    fn pass_through_proxied_response(&self) -> bool {
        self.options.pass_through
    }

    fn handle_proxied_response(&mut self, response: Result<&ProxyResponse, &ProxyFault>) {
        match response {
            Ok(resp) => {
                for element in &resp.contacts {
                    self.handle_element(element);
                }
                for id in &resp.deleted {
                    self.handle_deleted(id);
                }
                if let Some(token) = &resp.token {
                    self.set_new_token(GalSyncToken::parse(token));
                }
                self.meta.more = resp.has_more;
                self.meta.remain = resp.remain;
                self.meta.sort_by = resp.sort_by.clone();
                self.meta.offset = resp.offset;
            }
            Err(fault) => self.response.fault = Some(fault.clone()),
        }
    }

    fn set_new_token(&mut self, token: GalSyncToken) {
        match &mut self.meta.token {
            Some(current) if *current != token => current.merge(&token),
            Some(_) => {}
            None => self.meta.token = Some(token),
        }
    }

    fn set_has_more(&mut self, more: bool) {
        self.meta.more = more;
    }

    fn set_remain(&mut self, remain: u32) {
        self.meta.remain = Some(remain);
    }

    fn set_sort_by(&mut self, sort_by: &str) {
        self.meta.sort_by = Some(sort_by.to_string());
    }

    fn set_query_offset(&mut self, offset: u32) {
        self.meta.offset = Some(offset);
        self.meta.paging_supported = true;
    }

    fn set_throttled(&mut self, throttled: bool) {
        self.meta.throttled = throttled;
    }

    fn set_full_sync_recommended(&mut self, recommended: bool) {
        self.meta.full_sync_recommended = recommended;
    }

    fn set_gal_definition_last_modified(&mut self, ts: &str) {
        self.meta.gal_definition_last_modified = Some(ts.to_string());
    }

    fn set_tokenize_key(&mut self, key: Option<&str>) {
        self.meta.tokenize_key = key.map(str::to_string);
    }

    fn reset(&mut self) {
        debug!(
            discarded = self.response.contacts.len(),
            "Resetting result callback"
        );
        self.response = GalResponse::default();
        self.meta = Metadata::default();
        self.finished = false;
    }

    fn finish(&mut self) -> GalResponse {
        if !self.finished {
            let meta = std::mem::take(&mut self.meta);
            let r = &mut self.response;
            r.token = meta.token.map(|t| t.to_string());
            r.more = meta.more;
            r.remain = meta.remain;
            r.sort_by = meta.sort_by;
            r.offset = meta.offset;
            r.paging_supported = meta.paging_supported;
            r.throttled = meta.throttled;
            r.full_sync_recommended = meta.full_sync_recommended;
            r.gal_definition_last_modified = meta.gal_definition_last_modified;
            r.tokenize_key = meta.tokenize_key;
            self.finished = true;
        }
        self.response.clone()
    }
}

/// Callback keeping only entries that match a filter.
///
/// The backends page over unfiltered results, so the page offset only holds
/// when the backend itself reported one; otherwise the response is marked
/// as not pageable.
pub struct FilteredGalSearchResultCallback {
    inner: GalSearchResultCallback,
    filter: FilterTerm,
    filtered_out: usize,
}

impl FilteredGalSearchResultCallback {
    pub fn new(options: CallbackOptions, filter: FilterTerm) -> Self {
        Self {
            inner: GalSearchResultCallback::new(options),
            filter,
            filtered_out: 0,
        }
    }

    /// Entries dropped by the filter so far.
    pub fn filtered_out(&self) -> usize {
        self.filtered_out
    }

    fn keep<S: AttributeSource + ?Sized>(&mut self, source: &S) -> bool {
        let keep = matches(&self.filter, source);
        if !keep {
            self.filtered_out += 1;
        }
        keep
    }
}

impl ResultCallback for FilteredGalSearchResultCallback {
    fn handle_contact(&mut self, id: &ItemId, contact: &Contact, sort_field: Option<&str>) {
        if self.keep(contact) {
            self.inner.handle_contact(id, contact, sort_field);
        }
    }

    fn handle_gal_contact(&mut self, contact: &GalContact) {
        if self.keep(contact) {
            self.inner.handle_gal_contact(contact);
        }
    }

    fn handle_element(&mut self, element: &ContactElement) {
        if self.keep(element) {
            self.inner.handle_element(element);
        }
    }

    fn handle_deleted(&mut self, id: &str) {
        self.inner.handle_deleted(id);
    }

    fn pass_through_proxied_response(&self) -> bool {
        self.inner.pass_through_proxied_response()
    }

    fn handle_proxied_response(&mut self, response: Result<&ProxyResponse, &ProxyFault>) {
        match response {
            Ok(resp) => {
                for element in &resp.contacts {
                    self.handle_element(element);
                }
                let rest = ProxyResponse {
                    contacts: Vec::new(),
                    ..resp.clone()
                };
                self.inner.handle_proxied_response(Ok(&rest));
            }
            Err(fault) => self.inner.handle_proxied_response(Err(fault)),
        }
    }

    fn set_new_token(&mut self, token: GalSyncToken) {
        self.inner.set_new_token(token);
    }

    fn set_has_more(&mut self, more: bool) {
        self.inner.set_has_more(more);
    }

    fn set_remain(&mut self, remain: u32) {
        self.inner.set_remain(remain);
    }

    fn set_sort_by(&mut self, sort_by: &str) {
        self.inner.set_sort_by(sort_by);
    }

    fn set_query_offset(&mut self, offset: u32) {
        self.inner.set_query_offset(offset);
    }

    fn set_throttled(&mut self, throttled: bool) {
        self.inner.set_throttled(throttled);
    }

    fn set_full_sync_recommended(&mut self, recommended: bool) {
        self.inner.set_full_sync_recommended(recommended);
    }

    fn set_gal_definition_last_modified(&mut self, ts: &str) {
        self.inner.set_gal_definition_last_modified(ts);
    }

    fn set_tokenize_key(&mut self, key: Option<&str>) {
        self.inner.set_tokenize_key(key);
    }

    fn reset(&mut self) {
        self.filtered_out = 0;
        self.inner.reset();
    }

    fn finish(&mut self) -> GalResponse {
        let mut response = self.inner.finish();
        if !response.paging_supported {
            response.offset = None;
        }
        if self.filtered_out > 0 {
            debug!(filtered_out = self.filtered_out, "Filtered GAL results");
        }
        response
    }
}
