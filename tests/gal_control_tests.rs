//! Integration tests for GAL search, autocomplete and sync over the
//! in-memory collaborators.

use std::collections::BTreeMap;
use std::path::Path;

use galsync::backend::fixture::{load_backends, Backends};
use galsync::backend::{Provisioning, ProxyError, ProxyFault, ProxyResponse};
use galsync::error::GalError;
use galsync::filter::input::{ConditionInput, ConditionsInput};
use galsync::model::account::{AccountStatus, AuthToken};
use galsync::model::contact::{AttrMap, AttrValue, Contact, ContactElement, GalContact};
use galsync::model::gal::{GalSearchType, GalType};
use galsync::search::GalResponse;
use galsync::service::{AutoCompleteGalRequest, GalService, SearchGalRequest, SyncGalRequest};
use galsync::token::GalSyncToken;

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn setup() -> (Backends, GalService) {
    let backends = load_backends(&fixture("domain.toml")).unwrap();
    let service = GalService::new(backends.services());
    (backends, service)
}

fn ids(response: &GalResponse) -> Vec<&str> {
    response.contacts.iter().map(|c| c.id.as_str()).collect()
}

fn search(name: &str) -> SearchGalRequest {
    SearchGalRequest {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn id_only_sync(token: Option<&str>) -> SyncGalRequest {
    SyncGalRequest {
        token: token.map(str::to_string),
        id_only: true,
        ..Default::default()
    }
}

fn acme_only() -> ConditionsInput {
    ConditionsInput {
        cond: vec![ConditionInput {
            attr: Some("company".into()),
            op: Some("eq".into()),
            value: Some("Acme".into()),
            not: false,
        }],
        ..Default::default()
    }
}

// ─── Test 1: Search is served by the local GAL sync account ─────────

#[test]
fn test_search_from_gal_sync_account() {
    let (backends, service) = setup();
    let r = service
        .search_gal(&AuthToken::user("u1"), &search("ann"))
        .unwrap();

    assert_eq!(ids(&r), vec!["gal-1:300"]);
    assert_eq!(r.contacts[0].attr("fullName"), Some("Ann Archer"));
    assert_eq!(r.contacts[0].sort_field.as_deref(), Some("Ann Archer"));
    assert!(r.paging_supported);
    assert_eq!(r.offset, Some(0));
    assert!(!r.more);
    assert!(backends.directory.queries().is_empty());
}

// ─── Test 2: "." matches every contact, sorted by name ──────────────

#[test]
fn test_search_dot_matches_everything() {
    let (_backends, service) = setup();
    let r = service
        .search_gal(&AuthToken::user("u1"), &search("."))
        .unwrap();
    assert_eq!(
        ids(&r),
        vec![
            "gal-1:300", // Ann Archer
            "gal-1:305", // Board
            "gal-1:301", // Bob Baker
            "gal-1:302", // Carol Cole
            "gal-1:303", // Room One
            "gal-1:304", // Team
        ]
    );
    assert_eq!(r.sort_by.as_deref(), Some("nameAsc"));
}

// ─── Test 3: Limit cuts the mailbox page short ──────────────────────

#[test]
fn test_search_limit_sets_more() {
    let (_backends, service) = setup();
    let request = SearchGalRequest {
        limit: 2,
        ..search(".")
    };
    let r = service.search_gal(&AuthToken::user("u1"), &request).unwrap();
    assert_eq!(r.contacts.len(), 2);
    assert!(r.more);
}

// ─── Test 4: Feature checks ─────────────────────────────────────────

#[test]
fn test_feature_checks() {
    let (_backends, service) = setup();

    // bob has GAL switched off.
    let err = service
        .search_gal(&AuthToken::user("u2"), &search("ann"))
        .unwrap_err();
    assert!(matches!(err, GalError::PermissionDenied(_)), "got {err:?}");

    // carol may search but not sync.
    assert!(service
        .search_gal(&AuthToken::user("u3"), &search("ann"))
        .is_ok());
    let err = service
        .sync_gal(&AuthToken::user("u3"), &SyncGalRequest::default())
        .unwrap_err();
    assert!(matches!(err, GalError::PermissionDenied(_)));

    // Admins are exempt.
    assert!(service
        .search_gal(&AuthToken::admin("u2"), &search("ann"))
        .is_ok());

    let err = service
        .search_gal(&AuthToken::user("nobody"), &search("ann"))
        .unwrap_err();
    assert!(matches!(err, GalError::PermissionDenied(_)));
}

// ─── Test 5: Broken mailbox falls back to the directory ─────────────

#[test]
fn test_mailbox_failure_falls_back_to_directory() {
    let (backends, service) = setup();
    backends
        .mailboxes
        .open("gal-1")
        .set_failure(Some("index unavailable"));

    let r = service
        .search_gal(&AuthToken::user("u1"), &search("ann"))
        .unwrap();
    assert_eq!(ids(&r), vec!["u1"]);
    let ann = &r.contacts[0];
    assert_eq!(ann.dn.as_deref(), Some("uid=ann,ou=people,dc=example,dc=com"));
    assert_eq!(ann.attr("fullName"), Some("Ann Archer"));
    assert_eq!(ann.attr("firstName"), Some("Ann"));
    assert_eq!(ann.attr("email"), Some("ann@example.com"));
    assert!(!r.paging_supported);

    let queries = backends.directory.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].name.as_deref(), Some("ann"));
    assert_eq!(queries[0].limit, 100, "domain max results applies");
    assert_eq!(queries[0].config.search_base, "dc=example,dc=com");
    assert!(queries[0].filter.contains("(cn=*ann*)"));
    assert!(queries[0].filter.contains("(!(zimbraHideInGal=TRUE))"));
}

// ─── Test 6: A directory failure is fatal ───────────────────────────

#[test]
fn test_directory_failure_is_surfaced() {
    let (backends, service) = setup();
    backends.mailboxes.open("gal-1").set_failure(Some("index unavailable"));
    backends.directory.set_failure(Some("connection refused"));

    let err = service
        .search_gal(&AuthToken::user("u1"), &search("ann"))
        .unwrap_err();
    assert!(matches!(err, GalError::Directory { .. }));
    assert!(err.to_string().contains("connection refused"));
}

// ─── Test 7: Autocomplete prefers the GAL sync account ──────────────

#[test]
fn test_autocomplete() {
    let (backends, service) = setup();
    let request = AutoCompleteGalRequest {
        name: "car".into(),
        ..Default::default()
    };
    let r = service
        .autocomplete_gal(&AuthToken::user("u1"), &request)
        .unwrap();
    assert_eq!(ids(&r), vec!["gal-1:302"]);

    // With the sync account closed the directory answers, by prefix.
    let mut gal = backends.provisioning.find_account("gal-1").unwrap();
    gal.status = AccountStatus::Closed;
    backends.provisioning.add_account(gal);

    let r = service
        .autocomplete_gal(&AuthToken::user("u1"), &request)
        .unwrap();
    assert_eq!(ids(&r), vec!["u3"]);
    let queries = backends.directory.queries();
    assert!(queries[0].filter.contains("(cn=car*)"));

    let empty = AutoCompleteGalRequest::default();
    assert!(matches!(
        service.autocomplete_gal(&AuthToken::user("u1"), &empty),
        Err(GalError::InvalidRequest(_))
    ));
}

// ─── Test 8: Sync admission hands the same token back ───────────────

#[test]
fn test_sync_throttled_when_domain_is_busy() {
    let (backends, service) = setup();
    let held = backends
        .sync_clients
        .acquire("example.com", "other-thread / someone@example.com", 1)
        .unwrap();

    let request = SyncGalRequest {
        token: Some("20240101000000Z".into()),
        ..Default::default()
    };
    let r = service.sync_gal(&AuthToken::user("u1"), &request).unwrap();
    assert!(r.throttled);
    assert_eq!(r.token.as_deref(), Some("20240101000000Z"));
    assert!(r.contacts.is_empty());
    assert!(backends.directory.queries().is_empty());

    drop(held);
    let r = service.sync_gal(&AuthToken::user("u1"), &request).unwrap();
    assert!(!r.throttled);
    assert_eq!(r.contacts.len(), 6);
    assert_eq!(
        r.token.as_deref(),
        Some("20240103000001Z_0_0_20240103000001Z")
    );
    assert_eq!(r.gal_definition_last_modified.as_deref(), Some("20240201000000Z"));
    assert_eq!(backends.sync_clients.active("example.com"), 0);
}

// ─── Test 9: Paged directory sync resumes inside one second ─────────

#[test]
fn test_paged_directory_sync() {
    let (_backends, service) = setup();
    let page = |token: Option<String>| SyncGalRequest {
        token,
        limit: 4,
        ..Default::default()
    };

    let first = service.sync_gal(&AuthToken::user("u1"), &page(None)).unwrap();
    assert_eq!(ids(&first), vec!["u1", "u2", "u3", "g-2"]);
    assert!(first.more);
    assert_eq!(
        first.token.as_deref(),
        Some("20240103000000Z_1_1_20240103000000Z")
    );

    let second = service
        .sync_gal(&AuthToken::user("u1"), &page(first.token.clone()))
        .unwrap();
    assert_eq!(
        ids(&second),
        vec!["g-1", "uid=room1,ou=people,dc=example,dc=com"]
    );
    assert!(!second.more);
    assert_eq!(
        second.token.as_deref(),
        Some("20240103000001Z_0_0_20240103000001Z")
    );

    let team = &second.contacts[0];
    assert_eq!(team.attr("type"), Some("group"));
    assert_eq!(
        team.attrs.get("member"),
        Some(&AttrValue::Multi(vec![
            "ann@example.com".into(),
            "bob@example.com".into()
        ]))
    );

    // Nothing changed since: no entries, same token.
    let third = service
        .sync_gal(&AuthToken::user("u1"), &page(second.token.clone()))
        .unwrap();
    assert!(third.contacts.is_empty());
    assert_eq!(third.token, second.token);
}

// ─── Test 10: Both mode splits the limit between directories ────────

#[test]
fn test_both_mode_halves_limit() {
    let (backends, service) = setup();
    let request = SearchGalRequest {
        limit: 10,
        ..search(".")
    };
    let r = service.search_gal(&AuthToken::user("u20"), &request).unwrap();

    let queries = backends.directory.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].config.gal_type, GalType::Internal);
    assert_eq!(queries[1].config.gal_type, GalType::External);
    assert!(queries.iter().all(|q| q.limit == 5));
    assert!(queries[1].filter.contains("msExchHideFromAddressLists"));

    // 2 internal entries, 5 of 6 external ones.
    assert_eq!(r.contacts.len(), 7);
    assert!(r.more, "external half was cut short");
}

// ─── Test 11: Both mode sync token carries two cursors ──────────────

#[test]
fn test_both_mode_sync_token() {
    let (_backends, service) = setup();
    let r = service
        .sync_gal(&AuthToken::user("u20"), &SyncGalRequest::default())
        .unwrap();
    assert_eq!(r.contacts.len(), 8);
    let token = r.token.clone().unwrap();
    assert_eq!(
        token,
        "20240111000001Z_0_0_20240111000001Z_20240206000001Z_0_0_20240206000001Z"
    );
    let parsed = GalSyncToken::parse(&token);
    assert_eq!(parsed.internal_cursor().timestamp, "20240111000001Z");
    assert_eq!(parsed.external_cursor().timestamp, "20240206000001Z");

    let again = service
        .sync_gal(
            &AuthToken::user("u20"),
            &SyncGalRequest {
                token: Some(token.clone()),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(again.contacts.is_empty());
    assert_eq!(again.token.as_deref(), Some(token.as_str()));
}

// ─── Test 12: Mailbox sync reports changes and deletions ────────────

#[test]
fn test_mailbox_sync_with_deletions() {
    let (backends, service) = setup();
    let first = service
        .sync_gal(&AuthToken::user("u1"), &id_only_sync(None))
        .unwrap();
    assert_eq!(first.contacts.len(), 6);
    assert!(first.contacts.iter().all(|c| c.attrs.is_empty()));
    assert_eq!(first.token.as_deref(), Some("20240301000000Z:gal-1:6"));
    assert!(first.deleted.is_empty());
    assert!(backends.directory.queries().is_empty());

    let mbox = backends.mailboxes.open("gal-1");
    let mut fields = BTreeMap::new();
    fields.insert("fullName".to_string(), "Dana Dorn".to_string());
    mbox.add_contact(Contact {
        id: 306,
        folder_id: 257,
        mod_sequence: 0,
        fields,
    });
    assert!(mbox.delete_contact(301));

    let second = service
        .sync_gal(&AuthToken::user("u1"), &id_only_sync(first.token.as_deref()))
        .unwrap();
    assert_eq!(ids(&second), vec!["gal-1:306"]);
    assert_eq!(second.deleted, vec!["gal-1:301".to_string()]);
    assert_eq!(second.token.as_deref(), Some("20240301000000Z:gal-1:8"));
}

// ─── Test 13: Sync page with count ──────────────────────────────────

#[test]
fn test_mailbox_sync_limit_and_count() {
    let (_backends, service) = setup();
    let request = SyncGalRequest {
        limit: 2,
        get_count: true,
        ..id_only_sync(None)
    };
    let r = service.sync_gal(&AuthToken::user("u1"), &request).unwrap();
    assert_eq!(ids(&r), vec!["gal-1:300", "gal-1:301"]);
    assert!(r.more);
    assert_eq!(r.remain, Some(4));
    assert_eq!(r.token.as_deref(), Some("20240301000000Z:gal-1:2"));
}

// ─── Test 14: Token older than the change log ───────────────────────

#[test]
fn test_mailbox_sync_past_change_log() {
    let (backends, service) = setup();
    let mbox = backends.mailboxes.open("gal-1");
    assert!(mbox.delete_contact(300));
    mbox.truncate_change_log(5);

    let r = service
        .sync_gal(
            &AuthToken::user("u1"),
            &id_only_sync(Some("20240301000000Z:gal-1:3")),
        )
        .unwrap();
    assert_eq!(ids(&r), vec!["gal-1:303", "gal-1:304", "gal-1:305"]);
    assert!(r.deleted.is_empty(), "deletions are lost past the change log");
    assert_eq!(r.token.as_deref(), Some("20240301000000Z:gal-1:6"));
}

// ─── Test 15: Inactive sync account syncs like the directory ────────

#[test]
fn test_inactive_gal_account_sync_matches_directory() {
    let (closed, service_closed) = setup();
    let mut gal = closed.provisioning.find_account("gal-1").unwrap();
    gal.status = AccountStatus::Closed;
    closed.provisioning.add_account(gal);

    let (plain, service_plain) = setup();
    let mut domain = plain.provisioning.domain_by_name("example.com").unwrap();
    domain.gal_account_ids.clear();
    plain.provisioning.add_domain(domain);

    let a = service_closed
        .sync_gal(&AuthToken::user("u1"), &id_only_sync(None))
        .unwrap();
    let b = service_plain
        .sync_gal(&AuthToken::user("u1"), &id_only_sync(None))
        .unwrap();

    assert_eq!(ids(&a), ids(&b));
    assert_eq!(a.contacts.len(), 6);
    assert_eq!(a.token, b.token);
    assert_eq!(a.more, b.more);
    // A closed account is never resolved, so no full sync is suggested.
    assert!(!a.full_sync_recommended);
    assert!(!b.full_sync_recommended);
}

// ─── Test 16: Directory sync switched off echoes the token ──────────

#[test]
fn test_sync_disabled_echoes_token() {
    let (backends, service) = setup();
    let mut domain = backends.provisioning.domain_by_name("example.com").unwrap();
    domain.ldap_gal_sync_disabled = true;
    backends.provisioning.add_domain(domain);

    let request = SyncGalRequest {
        token: Some("20240101000000Z".into()),
        ..Default::default()
    };
    let r = service.sync_gal(&AuthToken::user("u1"), &request).unwrap();
    assert!(r.contacts.is_empty());
    assert_eq!(r.token.as_deref(), Some("20240101000000Z"));
    assert!(r.full_sync_recommended);
    assert!(backends.directory.queries().is_empty());
}

// ─── Test 17: Remote sync account results are relayed ───────────────

#[test]
fn test_remote_gal_account_search_is_proxied() {
    let (backends, service) = setup();
    let mut attrs = AttrMap::new();
    attrs.insert("fullName".into(), AttrValue::from("Ann Archer"));
    backends.proxy.push_reply(Ok(ProxyResponse {
        contacts: vec![ContactElement {
            id: "gal-2:300".into(),
            sort_field: Some("Ann Archer".into()),
            attrs,
        }],
        has_more: true,
        sort_by: Some("nameAsc".into()),
        offset: Some(0),
        ..Default::default()
    }));

    let r = service
        .search_gal(&AuthToken::user("u10"), &search("ann"))
        .unwrap();
    assert_eq!(ids(&r), vec!["gal-2:300"]);
    assert!(r.more);
    assert!(r.paging_supported);
    assert_eq!(r.sort_by.as_deref(), Some("nameAsc"));

    let requests = backends.proxy.requests();
    assert_eq!(requests.len(), 1);
    let (host, request) = &requests[0];
    assert_eq!(host, "mbs2.example.com");
    assert_eq!(request.gal_account_id, "gal-2");
    assert_eq!(request.name.as_deref(), Some("ann"));
    assert!(request.proxied);
    assert!(request.token.is_none());
    assert!(backends.directory.queries().is_empty());
}

// ─── Test 18: Peer fault falls back to the directory ────────────────

#[test]
fn test_remote_fault_falls_back() {
    let (backends, service) = setup();
    backends.proxy.push_reply(Err(ProxyError::Fault(ProxyFault {
        code: "service.FAILURE".into(),
        message: "mailbox offline".into(),
    })));

    let r = service
        .search_gal(&AuthToken::user("u10"), &search("ann"))
        .unwrap();
    assert!(r.contacts.is_empty());
    assert!(r.fault.is_none());
    let queries = backends.directory.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].config.search_base, "dc=example,dc=net");
}

// ─── Test 19: Unreachable peer during sync keeps the token ──────────

#[test]
fn test_remote_sync_unreachable_keeps_token() {
    let (backends, service) = setup();
    let token = "20240301000000Z:gal-2:4";
    let r = service
        .sync_gal(&AuthToken::user("u10"), &id_only_sync(Some(token)))
        .unwrap();
    assert!(r.contacts.is_empty());
    assert_eq!(r.token.as_deref(), Some(token));
    assert!(backends.directory.queries().is_empty());

    let requests = backends.proxy.requests();
    assert_eq!(requests[0].1.token.as_deref(), Some(token));
}

// ─── Test 20: Structured filter narrows the results ─────────────────

#[test]
fn test_search_filter() {
    let (_backends, service) = setup();
    let request = SearchGalRequest {
        search_filter: Some(acme_only()),
        ..search(".")
    };
    let r = service.search_gal(&AuthToken::user("u1"), &request).unwrap();
    assert_eq!(ids(&r), vec!["gal-1:300", "gal-1:302"]);

    let broken = SearchGalRequest {
        search_filter: Some(ConditionsInput {
            cond: vec![ConditionInput {
                attr: Some("company".into()),
                op: Some("eq".into()),
                value: None,
                not: false,
            }],
            ..Default::default()
        }),
        ..search(".")
    };
    assert!(matches!(
        service.search_gal(&AuthToken::user("u1"), &broken),
        Err(GalError::InvalidFilter(_))
    ));
}

// ─── Test 21: Filter also applies on the directory path ─────────────

#[test]
fn test_search_filter_on_directory() {
    let (backends, service) = setup();
    backends.mailboxes.open("gal-1").set_failure(Some("index unavailable"));
    let request = SearchGalRequest {
        search_filter: Some(acme_only()),
        ..search(".")
    };
    let r = service.search_gal(&AuthToken::user("u1"), &request).unwrap();
    assert_eq!(ids(&r), vec!["u1", "u3"]);
    assert!(backends.directory.queries()[0]
        .filter
        .contains("(company=Acme)"));
}

// ─── Test 22: Group expansion needs the view right ──────────────────

#[test]
fn test_can_expand_groups() {
    let (_backends, service) = setup();
    let request = SearchGalRequest {
        search_type: GalSearchType::Group,
        need_can_expand: true,
        ..search(".")
    };

    let r = service.search_gal(&AuthToken::user("u1"), &request).unwrap();
    assert_eq!(ids(&r), vec!["gal-1:305", "gal-1:304"]);
    assert_eq!(r.contacts[0].can_expand, Some(false), "no grant on board");
    assert_eq!(r.contacts[1].can_expand, Some(true), "ann may view team");

    let r = service.search_gal(&AuthToken::user("u3"), &request).unwrap();
    assert!(r.contacts.iter().all(|c| c.can_expand == Some(false)));
}

// ─── Test 23: Named GAL sync account must belong to the domain ──────

#[test]
fn test_named_gal_account() {
    let (_backends, service) = setup();
    let request = SearchGalRequest {
        gal_account_id: Some("gal-2".into()),
        ..search("ann")
    };
    assert!(matches!(
        service.search_gal(&AuthToken::user("u1"), &request),
        Err(GalError::InvalidRequest(_))
    ));

    let request = SearchGalRequest {
        gal_account_id: Some("gal-1".into()),
        ..search("ann")
    };
    let r = service.search_gal(&AuthToken::user("u1"), &request).unwrap();
    assert_eq!(ids(&r), vec!["gal-1:300"]);
}

// ─── Test 24: Directory sync moves past entries at the cursor ───────

#[test]
fn test_directory_sync_converges_on_cursor_timestamp() {
    let (backends, service) = setup();
    let sync = |token: Option<String>| {
        service
            .sync_gal(
                &AuthToken::user("u1"),
                &SyncGalRequest {
                    token,
                    ..Default::default()
                },
            )
            .unwrap()
    };

    let first = sync(None);
    assert_eq!(
        first.token.as_deref(),
        Some("20240103000001Z_0_0_20240103000001Z")
    );

    let mut attrs = AttrMap::new();
    attrs.insert("cn".into(), AttrValue::from("Zoe Zane"));
    attrs.insert("mail".into(), AttrValue::from("zoe@example.com"));
    attrs.insert("zimbraId".into(), AttrValue::from("z-1"));
    attrs.insert("objectClass".into(), AttrValue::from("zimbraAccount"));
    attrs.insert("modifyTimeStamp".into(), AttrValue::from("20240103000001Z"));
    backends.directory.add(GalContact::new(
        GalType::Internal,
        "uid=zoe,ou=people,dc=example,dc=com",
        attrs,
    ));

    let second = sync(first.token.clone());
    assert_eq!(ids(&second), vec!["z-1"]);
    assert_eq!(
        second.token.as_deref(),
        Some("20240103000002Z_0_0_20240103000002Z")
    );

    let third = sync(second.token.clone());
    assert!(third.contacts.is_empty());
    assert_eq!(third.token, second.token);
}

// ─── Test 25: An inactive account listed first is passed over ───────

#[test]
fn test_resolution_skips_inactive_gal_account() {
    let (backends, service) = setup();
    let mut closed = backends.provisioning.find_account("gal-1").unwrap();
    closed.id = "gal-0".into();
    closed.name = "galsync0@example.com".into();
    closed.status = AccountStatus::Closed;
    backends.provisioning.add_account(closed);

    let mut domain = backends.provisioning.domain_by_name("example.com").unwrap();
    domain.gal_account_ids = vec!["gal-0".into(), "gal-1".into()];
    backends.provisioning.add_domain(domain);

    let r = service
        .search_gal(&AuthToken::user("u1"), &search("ann"))
        .unwrap();
    assert_eq!(ids(&r), vec!["gal-1:300"]);
    assert!(backends.directory.queries().is_empty());

    let r = service
        .sync_gal(&AuthToken::user("u1"), &id_only_sync(None))
        .unwrap();
    assert_eq!(r.token.as_deref(), Some("20240301000000Z:gal-1:6"));
}
