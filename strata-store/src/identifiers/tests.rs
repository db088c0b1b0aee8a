// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::RefCell;
use std::rc::Rc;

use assert_matches::assert_matches;
use strata_core::ResourceIdentifier;

use crate::identifiers::{IdentifierCache, IdentifierConfig, IdentityError};

#[test]
fn stable_identity() {
    let cache = IdentifierCache::default();

    let key_1 = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();
    let key_2 = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert!(key_1.ptr_eq(&key_2));
    assert_eq!(key_1.lid(), "@lid:user-1");

    // Same id but different type is a different resource.
    let key_3 = cache
        .get_or_create(&ResourceIdentifier::new("post", "1"))
        .unwrap();
    assert_ne!(key_1, key_3);

    // Looking up by lid alone also returns the same key.
    let key_4 = cache
        .get_or_create(&ResourceIdentifier::local("user", "@lid:user-1"))
        .unwrap();
    assert_eq!(key_1, key_4);
}

#[test]
fn peek_never_creates() {
    let cache = IdentifierCache::default();

    assert_eq!(cache.peek(&ResourceIdentifier::new("user", "1")), None);
    let key = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_eq!(cache.peek(&ResourceIdentifier::new("user", "1")), Some(key));

    // Unknown lids are not aliased by peek.
    let identifier = ResourceIdentifier::new("user", "1").with_lid("@lid:other");
    assert!(cache.peek(&identifier).is_some());
    assert_eq!(cache.peek(&ResourceIdentifier::local("user", "@lid:other")), None);
}

#[test]
fn unknown_lid_becomes_alias() {
    let cache = IdentifierCache::default();

    let key = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();
    let aliased = cache
        .get_or_create(&ResourceIdentifier::new("user", "1").with_lid("@lid:from-server"))
        .unwrap();
    assert_eq!(key, aliased);
    assert_eq!(
        cache.peek(&ResourceIdentifier::local("user", "@lid:from-server")),
        Some(key)
    );
}

#[test]
fn lid_mismatch() {
    let cache = IdentifierCache::default();

    cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();
    let result =
        cache.get_or_create(&ResourceIdentifier::new("user", "2").with_lid("@lid:user-1"));
    assert_matches!(result, Err(IdentityError::LidMismatch { .. }));
}

#[test]
fn id_is_assigned_once() {
    let cache = IdentifierCache::default();

    let key = cache.create_for_new("user").unwrap();
    assert!(key.is_new());
    assert!(key.lid().starts_with("@lid:user-"));

    let updated = cache
        .update(&key, &ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_eq!(updated.key, key);
    assert!(updated.id_assigned);
    assert_eq!(updated.abandoned, None);
    assert_eq!(key.id(), Some("1"));

    // The id index got populated lazily.
    assert_eq!(cache.peek(&ResourceIdentifier::new("user", "1")), Some(key.clone()));

    // Applying the same id again is a no-op.
    let updated = cache
        .update(&key, &ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert!(!updated.id_assigned);

    // .. a different one is not allowed.
    assert_matches!(
        cache.update(&key, &ResourceIdentifier::new("user", "2")),
        Err(IdentityError::IdChange { .. })
    );
    assert_eq!(key.id(), Some("1"));
}

#[test]
fn lid_never_changes() {
    let cache = IdentifierCache::default();

    let key = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_matches!(
        cache.update(&key, &ResourceIdentifier::new("user", "1").with_lid("@lid:else")),
        Err(IdentityError::LidChange { .. })
    );
}

#[test]
fn merge_keeps_identifier_with_id() {
    let cache = IdentifierCache::default();

    let created = cache.create_for_new("user").unwrap();
    let existing = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();

    // The server tells us that the created resource is user 1, which we already know about.
    let updated = cache
        .update(&created, &ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_eq!(updated.key, existing);
    assert_eq!(updated.abandoned, Some(created.clone()));

    // The abandoned lid now points at the survivor.
    assert!(!cache.is_known(&created));
    assert_eq!(
        cache.peek(&ResourceIdentifier::local("user", created.lid())),
        Some(existing.clone())
    );
}

#[test]
fn merge_is_idempotent() {
    let cache = IdentifierCache::default();

    let created = cache.create_for_new("user").unwrap();
    cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();

    let data = ResourceIdentifier::new("user", "1").with_lid(created.lid());
    let first = cache.update(&created, &data).unwrap();

    // Pushing the same conflicting identities a second time resolves to the same survivor.
    let resolved = cache.get_or_create(&data).unwrap();
    let second = cache.update(&resolved, &data).unwrap();
    assert_eq!(first.key, second.key);
    assert_eq!(second.abandoned, None);
}

#[test]
fn merge_hook() {
    let cache = IdentifierCache::new(
        IdentifierConfig::new().merge(|target, _matched, _data| target.clone()),
    );

    let created = cache.create_for_new("user").unwrap();
    let existing = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();

    let updated = cache
        .update(&created, &ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_eq!(updated.key, created);
    assert_eq!(updated.abandoned, Some(existing));
    assert!(updated.id_assigned);
    assert_eq!(created.id(), Some("1"));
    assert_eq!(
        cache.peek(&ResourceIdentifier::new("user", "1")),
        Some(created)
    );
}

#[test]
fn invalid_merge_result() {
    let stranger = IdentifierCache::default().create_for_new("user").unwrap();
    let cache = IdentifierCache::new(
        IdentifierConfig::new().merge(move |_target, _matched, _data| stranger.clone()),
    );

    let created = cache.create_for_new("user").unwrap();
    cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();

    assert_matches!(
        cache.update(&created, &ResourceIdentifier::new("user", "1")),
        Err(IdentityError::InvalidMergeResult { .. })
    );
    assert!(cache.is_known(&created));
}

#[test]
fn polymorphic_type_correction() {
    let cache = IdentifierCache::default();

    let pet = cache
        .get_or_create(&ResourceIdentifier::new("pet", "1"))
        .unwrap();
    let dog = cache
        .get_or_create(&ResourceIdentifier::new("dog", "1"))
        .unwrap();

    // Same id and lid, but the real type is "dog".
    let updated = cache
        .update(&pet, &ResourceIdentifier::new("dog", "1").with_lid(pet.lid()))
        .unwrap();
    assert_eq!(updated.key, dog);
    assert_eq!(updated.abandoned, Some(pet.clone()));
    assert_eq!(cache.peek(&ResourceIdentifier::new("pet", "1")), Some(dog.clone()));

    // Unknown target type can't be resolved.
    let cat = cache
        .get_or_create(&ResourceIdentifier::new("cat", "2"))
        .unwrap();
    assert_matches!(
        cache.update(&cat, &ResourceIdentifier::new("lion", "2")),
        Err(IdentityError::TypeChange { .. })
    );
}

#[test]
fn ambiguous_update() {
    let cache = IdentifierCache::default();

    let created = cache.create_for_new("pet").unwrap();
    cache
        .get_or_create(&ResourceIdentifier::new("dog", "1"))
        .unwrap();

    assert_matches!(
        cache.update(&created, &ResourceIdentifier::new("dog", "1")),
        Err(IdentityError::AmbiguousUpdate { .. })
    );
    assert!(created.is_new());
}

#[test]
fn forget_and_hooks() {
    let updated = Rc::new(RefCell::new(Vec::new()));
    let forgotten = Rc::new(RefCell::new(Vec::new()));

    let cache = {
        let updated = updated.clone();
        let forgotten = forgotten.clone();
        IdentifierCache::new(
            IdentifierConfig::new()
                .generate(|identifier| match &identifier.id {
                    Some(id) => format!("{}:{}", identifier.resource_type, id),
                    None => format!("{}:new", identifier.resource_type),
                })
                .on_update(move |key| updated.borrow_mut().push(key.lid().to_owned()))
                .on_forget(move |key| forgotten.borrow_mut().push(key.lid().to_owned())),
        )
    };

    let key = cache.create_for_new("user").unwrap();
    assert_eq!(key.lid(), "user:new");

    // Generated lid is taken already.
    assert_matches!(
        cache.create_for_new("user"),
        Err(IdentityError::DuplicateLid { .. })
    );

    cache
        .update(&key, &ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_eq!(*updated.borrow(), vec!["user:new".to_owned()]);

    assert!(cache.forget(&key));
    assert!(!cache.forget(&key));
    assert_eq!(*forgotten.borrow(), vec!["user:new".to_owned()]);
    assert!(!cache.is_known(&key));
    assert_eq!(cache.peek(&ResourceIdentifier::new("user", "1")), None);

    // A forgotten key can't be updated anymore.
    let result = cache
        .update(&key, &ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert!(!result.id_assigned);

    let fresh = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_ne!(fresh, key);

    cache.reset();
    assert!(!cache.is_known(&fresh));
}

#[test]
fn scratch_is_detached() {
    let updated = Rc::new(RefCell::new(Vec::new()));
    let cache = IdentifierCache::new(IdentifierConfig::new().on_update({
        let updated = updated.clone();
        move |key| updated.borrow_mut().push(key.to_string())
    }));

    let created = cache.create_for_new("user").unwrap();
    let existing = cache
        .get_or_create(&ResourceIdentifier::new("user", "1"))
        .unwrap();

    let assigned = ResourceIdentifier::new("user", "2").with_lid(created.lid());
    let referenced = [assigned.clone(), ResourceIdentifier::new("user", "1")];
    let scratch = cache.scratch(&referenced);
    let identifiers = scratch.identifiers();

    // Copies behave like the live keys.
    let copy = identifiers.get_or_create(&assigned).unwrap();
    assert_ne!(copy, created);
    assert_eq!(scratch.origin(&copy), Some(&created));
    assert!(identifiers.update(&copy, &assigned).unwrap().id_assigned);
    assert_eq!(copy.id(), Some("2"));

    // Keys created in the scratch have no origin and never reach the live cache.
    let fresh = identifiers
        .get_or_create(&ResourceIdentifier::new("user", "3"))
        .unwrap();
    assert_eq!(scratch.origin(&fresh), None);

    // Generated lids collide with live ones the scratch didn't copy, like they would live.
    cache
        .get_or_create(&ResourceIdentifier::local("user", "@lid:user-9"))
        .unwrap();
    assert_matches!(
        identifiers.get_or_create(&ResourceIdentifier::new("user", "9")),
        Err(IdentityError::DuplicateLid { .. })
    );
    assert_matches!(
        cache.get_or_create(&ResourceIdentifier::new("user", "9")),
        Err(IdentityError::DuplicateLid { .. })
    );
    let copy_1 = identifiers
        .peek(&ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_eq!(scratch.origin(&copy_1), Some(&existing));

    assert!(created.is_new());
    assert!(
        cache
            .peek(&ResourceIdentifier::new("user", "3"))
            .is_none()
    );
    assert!(updated.borrow().is_empty());
}
