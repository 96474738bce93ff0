//! Group detection for directory entries.
//!
//! Directories mark groups differently. A [`GroupHandler`] recognises group
//! entries and lists their members; the handler for an attribute map is
//! picked by key from a [`GroupHandlerRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::model::contact::{lookup, AttrMap};

pub trait GroupHandler: Send + Sync {
    fn is_group(&self, entry: &AttrMap) -> bool;
    fn members(&self, entry: &AttrMap) -> Vec<String>;
}

fn has_object_class(entry: &AttrMap, classes: &[&str]) -> bool {
    lookup(entry, "objectClass").is_some_and(|v| {
        v.values()
            .iter()
            .any(|oc| classes.iter().any(|c| oc.eq_ignore_ascii_case(c)))
    })
}

fn values_of(entry: &AttrMap, attr: &str) -> Vec<String> {
    lookup(entry, attr)
        .map(|v| v.values().into_iter().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Groups of the server's own directory.
pub struct DefaultGroupHandler;

impl GroupHandler for DefaultGroupHandler {
    fn is_group(&self, entry: &AttrMap) -> bool {
        has_object_class(entry, &["zimbraDistributionList", "zimbraGroup"])
    }

    fn members(&self, entry: &AttrMap) -> Vec<String> {
        values_of(entry, "zimbraMailForwardingAddress")
    }
}

/// Active Directory groups.
pub struct ActiveDirectoryGroupHandler;

impl GroupHandler for ActiveDirectoryGroupHandler {
    fn is_group(&self, entry: &AttrMap) -> bool {
        has_object_class(entry, &["group"])
    }

    fn members(&self, entry: &AttrMap) -> Vec<String> {
        values_of(entry, "member")
    }
}

/// Handlers by configuration key, created once per key.
#[derive(Default)]
pub struct GroupHandlerRegistry {
    cache: Mutex<HashMap<String, Arc<dyn GroupHandler>>>,
}

impl GroupHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler for `key`. A missing or unknown key gets the default handler.
    pub fn get(&self, key: Option<&str>) -> Arc<dyn GroupHandler> {
        let key = key.map(str::trim).unwrap_or("").to_ascii_lowercase();
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .entry(key.clone())
            .or_insert_with(|| create_handler(&key))
            .clone()
    }

    /// Number of handlers created so far.
    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn create_handler(key: &str) -> Arc<dyn GroupHandler> {
    match key {
        "" | "default" | "zimbra" => Arc::new(DefaultGroupHandler),
        "ad" | "activedirectory" => Arc::new(ActiveDirectoryGroupHandler),
        other => {
            warn!(handler = other, "Unknown group handler, using the default");
            Arc::new(DefaultGroupHandler)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::contact::AttrValue;

    fn entry(classes: &[&str]) -> AttrMap {
        let mut e = AttrMap::new();
        e.insert(
            "objectClass".into(),
            AttrValue::Multi(classes.iter().map(|c| c.to_string()).collect()),
        );
        e.insert("member".into(), AttrValue::from("cn=ann"));
        e
    }

    #[test]
    fn test_handlers_by_key() {
        let registry = GroupHandlerRegistry::new();
        let ad = registry.get(Some("AD"));
        assert!(ad.is_group(&entry(&["top", "group"])));
        assert_eq!(ad.members(&entry(&["group"])), vec!["cn=ann".to_string()]);

        let default = registry.get(None);
        assert!(default.is_group(&entry(&["zimbraDistributionList"])));
        assert!(!default.is_group(&entry(&["group"])));
    }

    #[test]
    fn test_handlers_are_cached() {
        let registry = GroupHandlerRegistry::new();
        let a = registry.get(Some("ad"));
        let b = registry.get(Some("ad"));
        assert!(Arc::ptr_eq(&a, &b));
        registry.get(Some("no-such-handler"));
        assert_eq!(registry.len(), 2);
    }
}
