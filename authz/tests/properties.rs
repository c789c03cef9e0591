use std::collections::BTreeSet;

use authz::hashing::permission_hash;
use authz::{
    ClaimsBuilder, CustomAccessOverride, DatabaseUserRecord, IdentityMetadata, PermissionCatalog,
    Role,
};
use chrono::Utc;
use rstest::rstest;

fn metadata(catalog: &PermissionCatalog, role: Role, permissions: &[&str]) -> IdentityMetadata {
    let permissions: BTreeSet<String> = permissions.iter().map(|p| p.to_string()).collect();
    IdentityMetadata {
        role,
        permission_hash: permission_hash(&permissions),
        permissions,
        permission_version: catalog.version().to_string(),
        database_id: "7".to_string(),
        manager_id: None,
        is_staff: false,
        custom_access: None,
        assigned_by: "admin".to_string(),
        assigned_at: Utc::now(),
        last_updated: Utc::now(),
    }
}

#[test]
fn inheritance_is_monotonic_for_every_role_pair() {
    let catalog = PermissionCatalog::standard();
    for (i, lower) in Role::ALL.iter().enumerate() {
        for higher in &Role::ALL[i..] {
            let lower_set = catalog.capabilities_for(*lower);
            let higher_set = catalog.capabilities_for(*higher);
            assert!(
                lower_set.is_subset(&higher_set),
                "{} is not a subset of {}",
                lower,
                higher
            );
        }
    }
}

#[test]
fn inheritance_holds_for_sparse_custom_tables() {
    let viewer: &[&str] = &["a.read"];
    let manager: &[&str] = &["a.write"];
    let catalog = PermissionCatalog::new("test", [(Role::Viewer, viewer), (Role::Manager, manager)]);

    assert_eq!(catalog.capabilities_for(Role::Consultant).len(), 1);
    assert_eq!(catalog.capabilities_for(Role::Developer).len(), 2);
    assert!(catalog.grants(Role::OrgAdmin, "a.read"));
}

#[test]
fn hash_is_order_independent() {
    let catalog = PermissionCatalog::standard();
    for role in Role::ALL {
        let sorted: Vec<String> = catalog.capabilities_for(role).into_iter().collect();
        let expected = permission_hash(&sorted);

        let mut reversed = sorted.clone();
        reversed.reverse();
        assert_eq!(permission_hash(&reversed), expected);

        for shift in 1..sorted.len() {
            let mut rotated = sorted.clone();
            rotated.rotate_left(shift);
            assert_eq!(permission_hash(&rotated), expected, "{} rotated by {}", role, shift);
        }
    }
}

#[test]
fn hashes_do_not_collide_within_catalog_sets() {
    let catalog = PermissionCatalog::standard();
    let mut hashes = BTreeSet::new();
    for role in Role::ALL {
        let set = catalog.capabilities_for(role);
        assert!(hashes.insert(permission_hash(&set)));

        // Every single-removal variant differs too.
        for removed in &set {
            let smaller: Vec<&String> = set.iter().filter(|c| *c != removed).collect();
            assert!(hashes.insert(permission_hash(smaller)));
        }
    }
}

#[rstest]
#[case(Role::Viewer)]
#[case(Role::Consultant)]
#[case(Role::Manager)]
#[case(Role::OrgAdmin)]
#[case(Role::Developer)]
fn untrusted_claims_never_exceed_role_catalog(#[case] role: Role) {
    let catalog = PermissionCatalog::standard();
    let everything: Vec<String> = catalog.capabilities_for(Role::Developer).into_iter().collect();
    let everything: Vec<&str> = everything.iter().map(String::as_str).collect();
    let mut stored = metadata(&catalog, role, &everything);
    stored.permission_hash = "forged".to_string();

    let claims = ClaimsBuilder::new(&catalog).build("user_1", Some(&stored), None);
    let allowed = catalog.capabilities_for(role);
    assert_eq!(claims.default_role, role);
    assert!(claims.permissions.iter().all(|p| allowed.contains(p)));
    assert_eq!(claims.permissions.len(), allowed.len());
    assert_eq!(claims.permission_hash, permission_hash(&claims.permissions));
}

#[rstest]
#[case(Role::Viewer)]
#[case(Role::Manager)]
#[case(Role::Developer)]
fn trusted_claims_mirror_stored_hash(#[case] role: Role) {
    let catalog = PermissionCatalog::standard();
    let caps: Vec<String> = catalog.capabilities_for(role).into_iter().collect();
    let caps: Vec<&str> = caps.iter().map(String::as_str).collect();
    let stored = metadata(&catalog, role, &caps);

    let claims = ClaimsBuilder::new(&catalog).build("user_1", Some(&stored), None);
    assert_eq!(claims.permission_hash, stored.permission_hash);
    assert_eq!(claims.permissions.len(), stored.permissions.len());
}

#[test]
fn overrides_only_narrow_claims() {
    let catalog = PermissionCatalog::standard();
    let over = CustomAccessOverride::new()
        .deny("payroll.read")
        .deny("system.debug");
    let snapshot = catalog.narrowed_snapshot_for(Role::Manager, Some(&over));
    let caps: Vec<&str> = snapshot.capabilities().iter().map(String::as_str).collect();
    let mut stored = metadata(&catalog, Role::Manager, &caps);
    stored.custom_access = Some(over);

    let record = DatabaseUserRecord {
        id: "7".to_string(),
        external_id: "user_1".to_string(),
        org_id: Some("org_1".to_string()),
        manager_id: Some("3".to_string()),
        is_staff: true,
    };
    let claims = ClaimsBuilder::new(&catalog).build("user_1", Some(&stored), Some(&record));

    assert!(!claims.allows("payroll.read"));
    assert!(!claims.allows("system.debug"));
    assert_eq!(
        claims.permissions.len(),
        catalog.capabilities_for(Role::Manager).len() - 1
    );
    assert!(snapshot
        .capabilities()
        .is_subset(&catalog.capabilities_for(Role::Manager)));
    assert_eq!(claims.permission_hash, snapshot.hash());
    assert_eq!(claims.manager_id.as_deref(), Some("3"));
    assert_eq!(claims.org_id.as_deref(), Some("org_1"));
}

#[test]
fn missing_everything_yields_most_restrictive_claims() {
    let catalog = PermissionCatalog::standard();
    let claims = ClaimsBuilder::new(&catalog).build("user_1", None, None);

    assert_eq!(claims.default_role, Role::lowest());
    assert_eq!(claims.allowed_roles, vec![Role::lowest()]);
    assert!(claims.permissions.is_empty());
    assert!(claims.user_id.is_none());
    assert!(claims.org_id.is_none());
    assert!(!claims.is_staff);
    assert_eq!(claims.permission_version, "");
}
