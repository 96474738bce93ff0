//! Contact representations.
//!
//! A GAL entry reaches the control plane in one of two shapes: a
//! [`GalContact`] straight from the directory, or a [`Contact`] item stored
//! in a GAL sync account mailbox. Both expose their attributes as
//! [`AttrValue`]s so filters evaluate identically on either.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::gal::GalType;
use crate::token::later_timestamp;

/// A scalar or multi-valued attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Single(String),
    Multi(Vec<String>),
}

impl AttrValue {
    /// All values, scalar or not.
    pub fn values(&self) -> Vec<&str> {
        match self {
            AttrValue::Single(v) => vec![v.as_str()],
            AttrValue::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    pub fn first(&self) -> Option<&str> {
        match self {
            AttrValue::Single(v) => Some(v.as_str()),
            AttrValue::Multi(vs) => vs.first().map(String::as_str),
        }
    }

    /// True when there is no non-empty value.
    pub fn is_blank(&self) -> bool {
        self.values().iter().all(|v| v.is_empty())
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Single(v.to_string())
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(mut vs: Vec<String>) -> Self {
        if vs.len() == 1 {
            AttrValue::Single(vs.remove(0))
        } else {
            AttrValue::Multi(vs)
        }
    }
}

/// Attribute name → value.
pub type AttrMap = BTreeMap<String, AttrValue>;

/// Case-insensitive lookup, exact match first.
pub fn lookup<'a>(attrs: &'a AttrMap, name: &str) -> Option<&'a AttrValue> {
    attrs.get(name).or_else(|| {
        attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

/// A contact as returned by a directory search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalContact {
    #[serde(default)]
    pub gal_type: GalType,
    pub dn: String,
    #[serde(default)]
    pub attrs: AttrMap,
}

impl GalContact {
    pub fn new(gal_type: GalType, dn: impl Into<String>, attrs: AttrMap) -> Self {
        Self {
            gal_type,
            dn: dn.into(),
            attrs,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        lookup(&self.attrs, name).and_then(AttrValue::first)
    }

    pub fn attr_values(&self, name: &str) -> Vec<&str> {
        lookup(&self.attrs, name)
            .map(AttrValue::values)
            .unwrap_or_default()
    }

    /// Stable entry id, if the directory provides one.
    pub fn id(&self) -> Option<&str> {
        self.attr("zimbraId")
    }

    /// Latest of the create and modify timestamps.
    pub fn change_timestamp(&self) -> String {
        later_timestamp(
            self.attr("modifyTimeStamp").unwrap_or(""),
            self.attr("createTimeStamp").unwrap_or(""),
        )
    }
}

/// Id of an item inside a specific account's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemId {
    pub account_id: String,
    pub id: i32,
}

impl ItemId {
    pub fn new(account_id: impl Into<String>, id: i32) -> Self {
        Self {
            account_id: account_id.into(),
            id,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.id)
    }
}

/// A contact item in a mailbox.
///
/// Fields are plain strings. Multi-valued fields are stored as a JSON
/// array string (`["a@x.com","b@y.com"]`), the mailbox's own encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: i32,
    pub folder_id: i32,
    /// Change id of the last modification.
    #[serde(default)]
    pub mod_sequence: i32,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Contact {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Decoded field value; JSON arrays become [`AttrValue::Multi`].
    pub fn attr(&self, name: &str) -> Option<Cow<'_, AttrValue>> {
        let raw = self.fields.get(name)?;
        if raw.starts_with('[') {
            if let Ok(values) = serde_json::from_str::<Vec<String>>(raw) {
                return Some(Cow::Owned(AttrValue::Multi(values)));
            }
        }
        Some(Cow::Owned(AttrValue::Single(raw.clone())))
    }

    /// All fields decoded as attributes.
    pub fn attr_map(&self) -> AttrMap {
        self.fields
            .keys()
            .filter_map(|k| self.attr(k).map(|v| (k.clone(), v.into_owned())))
            .collect()
    }

    /// Directory DN the contact was imported from.
    pub fn dn(&self) -> Option<&str> {
        self.get("dn")
    }

    pub fn is_group(&self) -> bool {
        self.get("type") == Some("group")
    }
}

/// A contact as relayed by a peer node that owns the GAL sync account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactElement {
    /// `account:item` id on the peer.
    pub id: String,
    #[serde(default)]
    pub sort_field: Option<String>,
    #[serde(default)]
    pub attrs: AttrMap,
}

/// A distribution list known to provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_multi_value_decoding() {
        let mut fields = BTreeMap::new();
        fields.insert("email".to_string(), r#"["a@x.com","b@y.com"]"#.to_string());
        fields.insert("fullName".to_string(), "Ann Example".to_string());
        let c = Contact {
            id: 300,
            folder_id: 257,
            mod_sequence: 12,
            fields,
        };
        assert_eq!(
            c.attr("email").map(Cow::into_owned),
            Some(AttrValue::Multi(vec!["a@x.com".into(), "b@y.com".into()]))
        );
        assert_eq!(c.attr("fullName").unwrap().first(), Some("Ann Example"));
        assert!(c.attr("company").is_none());
    }

    #[test]
    fn test_gal_contact_change_timestamp() {
        let mut attrs = AttrMap::new();
        attrs.insert("createTimeStamp".into(), "20240101000000Z".into());
        attrs.insert("modifytimestamp".into(), "20240301000000Z".into());
        let gc = GalContact::new(GalType::Internal, "uid=ann,ou=people,dc=example,dc=com", attrs);
        assert_eq!(gc.change_timestamp(), "20240301000000Z");
    }

    #[test]
    fn test_attr_value_from_vec() {
        assert_eq!(AttrValue::from(vec!["x".to_string()]), AttrValue::Single("x".into()));
        assert!(AttrValue::Multi(vec![String::new()]).is_blank());
    }
}
