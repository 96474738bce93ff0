//! GAL sync tokens.
//!
//! A token tells the server where a client left off. It combines the
//! directory timestamp of the last directory-based sync with the last
//! mailbox change id seen for each GAL sync account:
//!
//! ```text
//! <directoryTimestamp>[:<accountId>:<changeId>]*
//! ```
//!
//! A token without any colon is the legacy form and carries only a
//! directory timestamp. The directory segment itself may hold paging
//! cursors for the internal and external directory, joined with `_`
//! (see [`LdapCursor`]).

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::debug;

/// Generalized time as written by the directory (`yyyyMMddHHmmssZ`).
pub const GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%SZ";

/// Token used when a directory sync starts from scratch.
pub const EARLIEST_SYNC_TOKEN: &str = "19700101000000Z";

/// Parse a generalized-time string, with or without fractional seconds.
pub fn parse_generalized_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, GENERALIZED_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S%.fZ"))
        .ok()
        .map(|n| n.and_utc())
}

/// Format a timestamp in generalized time.
pub fn to_generalized_time(dt: &DateTime<Utc>) -> String {
    dt.format(GENERALIZED_TIME_FORMAT).to_string()
}

/// The timestamp that should be used for the next `>=` directory query.
///
/// The directory has no strict `>` operator, so a fresh token is pushed one
/// second forward to avoid returning the newest entries twice. Unparseable
/// timestamps are returned untouched.
pub fn bump_timestamp(ts: &str) -> String {
    match parse_generalized_time(ts) {
        Some(dt) => to_generalized_time(&(dt + Duration::seconds(1))),
        None => ts.to_string(),
    }
}

/// Return the earlier of two directory timestamps. An empty side is
/// ignored. Only the leading timestamp of a composite segment is compared.
pub fn earlier_timestamp(a: &str, b: &str) -> String {
    pick_timestamp(a, b, true)
}

/// Return the later of two directory timestamps. An empty side is ignored.
pub fn later_timestamp(a: &str, b: &str) -> String {
    pick_timestamp(a, b, false)
}

fn pick_timestamp(a: &str, b: &str, earliest: bool) -> String {
    if a.is_empty() {
        return b.to_string();
    }
    if b.is_empty() {
        return a.to_string();
    }
    let lead_a = a.split('_').next().unwrap_or(a);
    let lead_b = b.split('_').next().unwrap_or(b);
    let a_first = match (parse_generalized_time(lead_a), parse_generalized_time(lead_b)) {
        (Some(x), Some(y)) => x <= y,
        _ => lead_a <= lead_b,
    };
    if a_first == earliest {
        a.to_string()
    } else {
        b.to_string()
    }
}

/// Resume point of a paged directory sync.
///
/// `timestamp` is the change time of the last entry returned and
/// `match_count` how many entries with exactly that time were already
/// returned. `max_timestamp` is the newest change time seen so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapCursor {
    pub timestamp: String,
    pub match_count: u32,
    pub has_more: bool,
    pub max_timestamp: String,
}

impl LdapCursor {
    /// Cursor for a plain timestamp (nothing pending).
    pub fn from_timestamp(ts: &str) -> Self {
        Self {
            timestamp: ts.to_string(),
            match_count: 0,
            has_more: false,
            max_timestamp: ts.to_string(),
        }
    }

    fn from_parts(parts: &[&str]) -> Self {
        match parts {
            [ts] => Self::from_timestamp(ts),
            [ts, count, more, max] => Self {
                timestamp: ts.to_string(),
                match_count: count.parse().unwrap_or(0),
                has_more: *more == "1",
                max_timestamp: max.to_string(),
            },
            _ => Self::from_timestamp(parts.first().copied().unwrap_or("")),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty() && self.max_timestamp.is_empty()
    }

    /// Encode as `ts_count_hasmore_maxts`.
    pub fn encode(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.timestamp,
            self.match_count,
            u8::from(self.has_more),
            self.max_timestamp
        )
    }

    /// Join the internal and (optional) external cursor into one directory
    /// segment.
    pub fn join(internal: &LdapCursor, external: Option<&LdapCursor>) -> String {
        match external {
            Some(ext) => format!("{}_{}", internal.encode(), ext.encode()),
            None => internal.encode(),
        }
    }
}

/// A parsed GAL sync token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GalSyncToken {
    ldap_timestamp: String,
    change_ids: BTreeMap<String, i32>,
}

impl GalSyncToken {
    /// Token for a mailbox-based sync of one GAL sync account.
    pub fn new(ldap_timestamp: &str, account_id: &str, change_id: i32) -> Self {
        let mut change_ids = BTreeMap::new();
        change_ids.insert(account_id.to_string(), change_id);
        Self {
            ldap_timestamp: ldap_timestamp.to_string(),
            change_ids,
        }
    }

    /// Token carrying only a directory segment.
    pub fn from_directory(ldap_timestamp: &str) -> Self {
        Self {
            ldap_timestamp: ldap_timestamp.to_string(),
            change_ids: BTreeMap::new(),
        }
    }

    /// Parse a client-supplied token. Never fails: anything that does not
    /// have the `ts:id:cid` pair structure is kept as a bare timestamp.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let Some((ts, rest)) = raw.split_once(':') else {
            return Self::from_directory(raw);
        };

        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() % 2 != 0 {
            debug!(token = raw, "Odd token segment count, treating as bare timestamp");
            return Self::from_directory(raw);
        }

        let mut change_ids = BTreeMap::new();
        for pair in parts.chunks(2) {
            let (id, cid) = (pair[0], pair[1]);
            match cid.parse::<i32>() {
                Ok(cid) if !id.is_empty() => {
                    change_ids.insert(id.to_string(), cid);
                }
                _ => {
                    debug!(token = raw, "Unparseable change id, treating as bare timestamp");
                    return Self::from_directory(raw);
                }
            }
        }

        Self {
            ldap_timestamp: ts.to_string(),
            change_ids,
        }
    }

    pub fn ldap_timestamp(&self) -> &str {
        &self.ldap_timestamp
    }

    /// Last change id seen for `account_id`, or 0 when unknown.
    pub fn change_id(&self, account_id: &str) -> i32 {
        self.change_ids.get(account_id).copied().unwrap_or(0)
    }

    pub fn change_ids(&self) -> &BTreeMap<String, i32> {
        &self.change_ids
    }

    pub fn is_empty(&self) -> bool {
        self.ldap_timestamp.is_empty() && self.change_ids.is_empty()
    }

    /// No foothold for an incremental sync.
    pub fn requires_full_resync(&self) -> bool {
        self.is_empty()
    }

    /// Whether the token can be served from a GAL sync account mailbox.
    /// A legacy directory-only token has to keep syncing against the
    /// directory so the client stays consistent.
    pub fn does_mailbox_sync(&self) -> bool {
        self.is_empty() || !self.change_ids.is_empty()
    }

    /// Merge `other` into this token: the earlier timestamp wins and every
    /// change id from `other` overwrites ours.
    pub fn merge(&mut self, other: &GalSyncToken) {
        debug!(this = %self, other = %other, "Merging sync tokens");
        self.ldap_timestamp = earlier_timestamp(&self.ldap_timestamp, &other.ldap_timestamp);
        for (id, cid) in &other.change_ids {
            self.change_ids.insert(id.clone(), *cid);
        }
    }

    /// Paging cursor for the internal directory.
    pub fn internal_cursor(&self) -> LdapCursor {
        let parts = self.directory_parts();
        match parts.len() {
            0 => LdapCursor::default(),
            4 | 8 => LdapCursor::from_parts(&parts[..4]),
            _ => LdapCursor::from_parts(&parts[..1]),
        }
    }

    /// Paging cursor for the external directory. A legacy bare timestamp
    /// applies to both directories.
    pub fn external_cursor(&self) -> LdapCursor {
        let parts = self.directory_parts();
        match parts.len() {
            8 => LdapCursor::from_parts(&parts[4..]),
            4 | 0 => LdapCursor::default(),
            _ => LdapCursor::from_parts(&parts[..1]),
        }
    }

    fn directory_parts(&self) -> Vec<&str> {
        if self.ldap_timestamp.is_empty() {
            return Vec::new();
        }
        self.ldap_timestamp.split('_').collect()
    }
}

impl fmt::Display for GalSyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ldap_timestamp)?;
        for (id, cid) in &self.change_ids {
            write!(f, ":{id}:{cid}")?;
        }
        Ok(())
    }
}

impl FromStr for GalSyncToken {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl serde::Serialize for GalSyncToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for GalSyncToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}
