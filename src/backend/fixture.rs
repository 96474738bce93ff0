//! TOML fixtures for the in-memory collaborators.
//!
//! A fixture describes one node's view of the world: its host name, the
//! domains and accounts it knows, the directory entries and the contents
//! of GAL sync account mailboxes.
//!
//! ```toml
//! local_host = "mbs1.example.com"
//!
//! [[domains]]
//! id = "d1"
//! name = "example.com"
//! gal_account_ids = ["gal-1"]
//!
//! [[directory]]
//! dn = "uid=ann,ou=people,dc=example,dc=com"
//! [directory.attrs]
//! cn = "Ann Example"
//! mail = ["ann@example.com", "a@example.com"]
//!
//! [[mailboxes]]
//! account = "gal-1"
//! folder_tokens = { 257 = "20240101000000Z" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use super::memory::{
    MemoryAccessControl, MemoryDirectory, MemoryMailboxes, MemoryProvisioning, MemoryProxy,
};
use crate::error::{GalError, Result};
use crate::model::account::Account;
use crate::model::contact::{Contact, GalContact, Group};
use crate::model::domain::Domain;
use crate::search::group::GroupHandlerRegistry;
use crate::search::registry::SyncClientRegistry;
use crate::search::GalServices;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub local_host: String,
    pub domains: Vec<Domain>,
    pub accounts: Vec<Account>,
    pub groups: Vec<Group>,
    pub grants: Vec<Grant>,
    pub directory: Vec<GalContact>,
    pub mailboxes: Vec<MailboxFixture>,
}

/// View right of an account on a distribution list.
#[derive(Debug, Clone, Deserialize)]
pub struct Grant {
    pub account: String,
    pub group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailboxFixture {
    pub account: String,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    /// Folder id → directory timestamp of its last import.
    #[serde(default)]
    pub folder_tokens: BTreeMap<String, String>,
    /// Items deleted after the contacts were added.
    #[serde(default)]
    pub deleted: Vec<i32>,
    #[serde(default)]
    pub change_log_start: i32,
}

impl Fixture {
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|e| GalError::Fixture {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load a fixture file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| GalError::io(path, e))?;
        let fixture = Self::parse(&text, path)?;
        info!(
            path = %path.display(),
            domains = fixture.domains.len(),
            accounts = fixture.accounts.len(),
            entries = fixture.directory.len(),
            "Loaded fixture"
        );
        Ok(fixture)
    }

    /// Fill the in-memory collaborators.
    pub fn build(self, path: &Path) -> Result<Backends> {
        let backends = Backends::new(&self.local_host);
        for domain in self.domains {
            backends.provisioning.add_domain(domain);
        }
        for account in self.accounts {
            backends.provisioning.add_account(account);
        }
        for group in self.groups {
            backends.provisioning.add_group(group);
        }
        for grant in &self.grants {
            backends.access.grant_view(&grant.account, &grant.group);
        }
        for entry in self.directory {
            backends.directory.add(entry);
        }

        for mb in self.mailboxes {
            let mbox = backends.mailboxes.open(&mb.account);
            for contact in mb.contacts {
                mbox.add_contact(contact);
            }
            for id in mb.deleted {
                mbox.delete_contact(id);
            }
            for (folder, token) in mb.folder_tokens {
                let folder_id: i32 = folder.parse().map_err(|_| GalError::Fixture {
                    path: path.to_path_buf(),
                    reason: format!("folder id '{folder}' of mailbox {} is not a number", mb.account),
                })?;
                mbox.set_folder_sync_token(folder_id, token);
            }
            mbox.truncate_change_log(mb.change_log_start);
            debug!(account = %mb.account, last_change = mbox.last_change(), "Filled mailbox");
        }
        Ok(backends)
    }
}

/// The in-memory collaborators, kept concrete so callers can keep
/// adjusting them.
pub struct Backends {
    pub directory: Arc<MemoryDirectory>,
    pub mailboxes: Arc<MemoryMailboxes>,
    pub provisioning: Arc<MemoryProvisioning>,
    pub access: Arc<MemoryAccessControl>,
    pub proxy: Arc<MemoryProxy>,
    pub sync_clients: Arc<SyncClientRegistry>,
}

impl Backends {
    pub fn new(local_host: &str) -> Self {
        Self {
            directory: Arc::new(MemoryDirectory::new()),
            mailboxes: Arc::new(MemoryMailboxes::new()),
            provisioning: Arc::new(MemoryProvisioning::new(local_host)),
            access: Arc::new(MemoryAccessControl::new()),
            proxy: Arc::new(MemoryProxy::new()),
            sync_clients: Arc::new(SyncClientRegistry::new()),
        }
    }

    /// Services over these collaborators.
    pub fn services(&self) -> GalServices {
        GalServices {
            directory: self.directory.clone(),
            mailboxes: self.mailboxes.clone(),
            provisioning: self.provisioning.clone(),
            access: self.access.clone(),
            proxy: self.proxy.clone(),
            sync_clients: Arc::clone(&self.sync_clients),
            group_handlers: Arc::new(GroupHandlerRegistry::new()),
        }
    }
}

/// Load `path` and fill fresh collaborators from it.
pub fn load_backends(path: &Path) -> Result<Backends> {
    Fixture::load(path)?.build(path)
}
