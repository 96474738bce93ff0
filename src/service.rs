//! Request handlers.
//!
//! Each handler resolves the caller's account and domain, turns the
//! request into [`GalSearchParams`], runs the control and returns the
//! finished response.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GalError, Result};
use crate::filter::input::ConditionsInput;
use crate::filter::FilterTerm;
use crate::model::account::{Account, AuthToken};
use crate::model::domain::Domain;
use crate::model::gal::{GalOp, GalSearchType};
use crate::search::callback::{
    CallbackOptions, FilteredGalSearchResultCallback, GalResponse, GalSearchResultCallback,
    ResultCallback,
};
use crate::search::control::{can_expand_gal_group, GalSearchControl, GalServices};
use crate::search::params::GalSearchParams;
use crate::token::GalSyncToken;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchGalRequest {
    /// Search key; `.` matches everything.
    pub name: Option<String>,
    pub search_type: GalSearchType,
    pub limit: u32,
    pub offset: u32,
    pub sort_by: Option<String>,
    /// Fetch one entry by directory DN.
    pub entry_dn: Option<String>,
    pub gal_account_id: Option<String>,
    pub search_filter: Option<ConditionsInput>,
    /// Report for each group whether the caller may expand it.
    pub need_can_expand: bool,
    pub wildcard: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCompleteGalRequest {
    pub name: String,
    pub search_type: GalSearchType,
    pub limit: u32,
    pub gal_account_id: Option<String>,
    pub need_can_expand: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncGalRequest {
    pub token: Option<String>,
    pub limit: u32,
    /// Override of the limit for directory searches.
    pub ldap_limit: Option<u32>,
    pub id_only: bool,
    pub get_count: bool,
    pub gal_account_id: Option<String>,
}

/// GAL request entry points.
pub struct GalService {
    services: GalServices,
}

impl GalService {
    pub fn new(services: GalServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &GalServices {
        &self.services
    }

    fn caller(&self, auth: &AuthToken) -> Result<(Account, Domain)> {
        let account = self
            .services
            .provisioning
            .account_by_id(&auth.account_id)
            .ok_or_else(|| {
                GalError::PermissionDenied(format!("no such account: {}", auth.account_id))
            })?;
        let domain = self
            .services
            .provisioning
            .domain_by_name(&account.domain)
            .ok_or_else(|| {
                GalError::InvalidRequest(format!("no such domain: {}", account.domain))
            })?;
        Ok((account, domain))
    }

    /// The GAL sync account named by a request. It has to be one of the
    /// domain's.
    fn named_gal_account(&self, id: Option<&str>, domain: &Domain) -> Result<Option<Account>> {
        let Some(id) = id else {
            return Ok(None);
        };
        if !domain.gal_account_ids.iter().any(|g| g == id) {
            return Err(GalError::InvalidRequest(format!(
                "{id} is not a GAL sync account of {}",
                domain.name
            )));
        }
        match self.services.provisioning.account_by_id(id) {
            Some(acct) => Ok(Some(acct)),
            None => Err(GalError::InvalidRequest(format!("no such account: {id}"))),
        }
    }

    fn params(
        &self,
        auth: &AuthToken,
        op: GalOp,
        callback: Box<dyn ResultCallback + Send>,
    ) -> Result<GalSearchParams> {
        let (account, domain) = self.caller(auth)?;
        let mut params = GalSearchParams::new(domain, callback);
        params.op = op;
        params.user_info = account.name.clone();
        params.account = Some(account);
        params.auth = Some(auth.clone());
        Ok(params)
    }

    fn mark_expandable(&self, response: &mut GalResponse, authed: Option<&Account>) {
        for entry in response.contacts.iter_mut().filter(|e| e.is_group()) {
            let name = entry.attr("email").or_else(|| entry.attr("mail"));
            let id = entry.attr("zimbraId");
            entry.can_expand = Some(can_expand_gal_group(&self.services, name, id, authed));
        }
    }

    pub fn search_gal(&self, auth: &AuthToken, request: &SearchGalRequest) -> Result<GalResponse> {
        // A malformed filter is rejected before anything runs.
        let filter: Option<FilterTerm> = request
            .search_filter
            .as_ref()
            .map(FilterTerm::try_from)
            .transpose()?;

        let options = CallbackOptions::new(GalOp::Search);
        let callback: Box<dyn ResultCallback + Send> = match &filter {
            Some(f) => Box::new(FilteredGalSearchResultCallback::new(options, f.clone())),
            None => Box::new(GalSearchResultCallback::new(options)),
        };

        let mut params = self.params(auth, GalOp::Search, callback)?;
        params.gal_sync_account =
            self.named_gal_account(request.gal_account_id.as_deref(), &params.domain)?;
        params.query = request.name.clone();
        params.search_type = request.search_type;
        params.limit = request.limit;
        params.offset = request.offset;
        if let Some(sort_by) = &request.sort_by {
            params.sort_by = sort_by.clone();
        }
        params.entry_dn = request.entry_dn.clone();
        params.extra_filter = filter;
        if let Some(wildcard) = request.wildcard {
            params.wildcard = wildcard;
        }
        let authed = params.account.clone();
        debug!(query = ?params.query, search_type = %params.search_type, "SearchGal");

        let mut control = GalSearchControl::new(&self.services, params);
        control.search()?;
        let mut response = control.into_response();
        if request.need_can_expand {
            self.mark_expandable(&mut response, authed.as_ref());
        }
        Ok(response)
    }

    pub fn autocomplete_gal(
        &self,
        auth: &AuthToken,
        request: &AutoCompleteGalRequest,
    ) -> Result<GalResponse> {
        if request.name.trim().is_empty() {
            return Err(GalError::InvalidRequest("autocomplete needs a name".into()));
        }
        let callback = Box::new(GalSearchResultCallback::new(CallbackOptions::new(
            GalOp::Autocomplete,
        )));
        let mut params = self.params(auth, GalOp::Autocomplete, callback)?;
        params.gal_sync_account =
            self.named_gal_account(request.gal_account_id.as_deref(), &params.domain)?;
        params.query = Some(request.name.clone());
        params.search_type = request.search_type;
        params.limit = request.limit;
        let authed = params.account.clone();
        debug!(query = %request.name, "AutoCompleteGal");

        let mut control = GalSearchControl::new(&self.services, params);
        control.autocomplete()?;
        let mut response = control.into_response();
        if request.need_can_expand {
            self.mark_expandable(&mut response, authed.as_ref());
        }
        Ok(response)
    }

    pub fn sync_gal(&self, auth: &AuthToken, request: &SyncGalRequest) -> Result<GalResponse> {
        let mut options = CallbackOptions::new(GalOp::Sync);
        options.id_only = request.id_only;
        let callback = Box::new(GalSearchResultCallback::new(options));

        let mut params = self.params(auth, GalOp::Sync, callback)?;
        params.gal_sync_account =
            self.named_gal_account(request.gal_account_id.as_deref(), &params.domain)?;
        params.token = request
            .token
            .as_deref()
            .map(GalSyncToken::parse)
            .unwrap_or_default();
        params.limit = request.limit;
        params.ldap_limit = request.ldap_limit;
        params.id_only = request.id_only;
        params.get_count = request.get_count;
        debug!(token = %params.token, limit = params.limit, "SyncGal");

        let mut control = GalSearchControl::new(&self.services, params);
        control.sync()?;
        Ok(control.into_response())
    }
}
