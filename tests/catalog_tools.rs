mod common;

use anyhow::Result;
use rowguard::{Error, NewScope, catalog::NewMember};

#[tokio::test]
async fn catalog_enforces_slug_rules() -> Result<()> {
    let db = common::start().await?;
    let store = db.store().await?;
    let tenants = store.tenants();

    let acme = tenants
        .create(NewScope::new("Acme", "acme-01").description("first tenant"))
        .await?;
    assert!(acme.active);
    assert_eq!(acme.description.as_deref(), Some("first tenant"));

    let dup = tenants.create(NewScope::new("Acme Again", "acme-01")).await;
    assert!(matches!(dup, Err(Error::DuplicateSlug(_))));

    for slug in ["ab", "Acme", "-acme", "acme_01"] {
        let res = tenants.create(NewScope::new("Bad", slug)).await;
        assert!(matches!(res, Err(Error::InvalidSlug { .. })), "slug {slug:?}");
    }

    assert_eq!(
        tenants.find_by_slug("acme-01").await?.map(|s| s.id),
        Some(acme.id)
    );

    let globex = tenants.create(NewScope::new("Globex", "globex")).await?;
    tenants.set_active(globex.id, false).await?;
    let active: Vec<i32> = tenants.list_active(10).await?.iter().map(|s| s.id).collect();
    assert_eq!(active, [acme.id]);
    let all: Vec<i32> = tenants.list(10).await?.iter().map(|s| s.id).collect();
    assert_eq!(all, [acme.id, globex.id]);

    let err = tenants.require_active(globex.id).await.unwrap_err();
    assert!(matches!(err, Error::UnknownOrInactiveScope { .. }));
    let err = tenants.set_active(9_999, true).await.unwrap_err();
    assert!(matches!(err, Error::ScopeNotFound { .. }));

    tenants
        .add_member(acme.id, NewMember::new("alice").email("alice@acme.test"))
        .await?;
    let dup = tenants.add_member(acme.id, NewMember::new("alice")).await;
    assert!(matches!(dup, Err(Error::DuplicateRecord { .. })));
    let inactive = tenants.add_member(globex.id, NewMember::new("bob")).await;
    assert!(matches!(inactive, Err(Error::UnknownOrInactiveScope { .. })));

    let stats = tenants.stats().await?;
    assert_eq!((stats.total, stats.active, stats.inactive), (2, 1, 1));
    assert_eq!(stats.members, 1);
    assert_eq!(stats.recent.first().map(|s| s.id), Some(globex.id));
    Ok(())
}

#[tokio::test]
async fn tools_report_success_and_failure_as_json() -> Result<()> {
    let db = common::start().await?;
    let store = db.store().await?;
    let tools = store.tools::<rowguard::Tenant>();

    let created = tools
        .create_scope("Acme", "acme-01", Some("  first tenant "))
        .await;
    assert_eq!(created["success"], true);
    assert_eq!(created["scope"]["slug"], "acme-01");
    assert_eq!(created["scope"]["description"], "first tenant");
    let id = created["scope"]["id"].to_string();

    let dup = tools.create_scope("Acme", "acme-01", None).await;
    assert_eq!(dup["success"], false);
    assert_eq!(dup["code"], "CONFLICT");

    let listed = tools.list_scopes(10).await;
    assert_eq!(listed["count"], 1);

    let fetched = tools.get_scope(&id).await;
    assert_eq!(fetched["scope"]["name"], "Acme");

    let malformed = tools.get_scope("abc").await;
    assert_eq!(malformed["success"], false);
    assert_eq!(malformed["code"], "MALFORMED_IDENTITY");

    let missing = tools.get_scope("4242").await;
    assert_eq!(missing["code"], "NOT_FOUND");

    let member = tools.add_scope_member(&id, "alice", None).await;
    assert_eq!(member["success"], true);
    let members = tools.list_scope_members(&id, 20).await;
    assert_eq!(members["count"], 1);
    assert_eq!(members["members"][0]["username"], "alice");

    let off = tools.set_scope_active(&id, false).await;
    assert_eq!(off["scope"]["active"], false);

    let stats = tools.scope_stats().await;
    assert_eq!(stats["stats"]["inactive"], 1);
    assert_eq!(stats["stats"]["members"], 1);

    let branches = store.tools::<rowguard::Branch>();
    let bad = branches.get_scope("42").await;
    assert_eq!(bad["code"], "MALFORMED_IDENTITY");
    Ok(())
}
