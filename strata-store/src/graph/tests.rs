// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashSet;
use std::rc::Rc;

use assert_matches::assert_matches;
use strata_core::{FieldSchema, MemorySchema, ResourceIdentifier, ResourceKey};

use crate::graph::{
    Edge, GraphError, Operation, RelationshipGraph, RelationshipUpdate, RelationshipValue,
    implicit_field,
};
use crate::identifiers::IdentifierCache;
use crate::notifications::{Bucket, NotificationManager, NotificationTarget};
use crate::test_utils::{RecordingSubscriber, user_schema};

fn setup() -> (IdentifierCache, RelationshipGraph, NotificationManager) {
    let identifiers = IdentifierCache::default();
    let notifications = NotificationManager::new();
    let graph = RelationshipGraph::new(
        identifiers.clone(),
        Rc::new(user_schema()),
        notifications.clone(),
    );
    (identifiers, graph, notifications)
}

fn key(identifiers: &IdentifierCache, resource_type: &str, id: &str) -> ResourceKey {
    identifiers
        .get_or_create(&ResourceIdentifier::new(resource_type, id))
        .unwrap()
}

fn local(graph: &RelationshipGraph, key: &ResourceKey, field: &str) -> Vec<ResourceKey> {
    match graph.get_data(key, field).unwrap().data {
        RelationshipValue::One(key) => key.into_iter().collect(),
        RelationshipValue::Many(keys) => keys,
    }
}

fn remote(graph: &RelationshipGraph, key: &ResourceKey, field: &str) -> Vec<ResourceKey> {
    match graph.get(key, field).unwrap() {
        Edge::Resource(edge) => edge.remote_state.into_iter().collect(),
        Edge::Collection(edge) => edge.remote_members.into_iter().collect(),
        Edge::Implicit(edge) => edge.remote_members.into_iter().collect(),
    }
}

fn update(record: &ResourceKey, field: &str, payload: RelationshipUpdate) -> Operation {
    Operation::UpdateRelationship {
        record: record.clone(),
        field: field.into(),
        payload,
    }
}

#[test]
fn mutual_best_friends() {
    let (identifiers, graph, _) = setup();
    let user_1 = key(&identifiers, "user", "1");
    let user_2 = key(&identifiers, "user", "2");

    graph
        .push(update(&user_1, "bestFriend", RelationshipUpdate::one(Some(user_2.clone()))))
        .unwrap();
    graph
        .push(update(&user_2, "bestFriend", RelationshipUpdate::one(Some(user_1.clone()))))
        .unwrap();

    assert_eq!(remote(&graph, &user_1, "bestFriend"), vec![user_2.clone()]);
    assert_eq!(local(&graph, &user_1, "bestFriend"), vec![user_2.clone()]);
    assert_eq!(remote(&graph, &user_2, "bestFriend"), vec![user_1.clone()]);
    assert_eq!(local(&graph, &user_2, "bestFriend"), vec![user_1.clone()]);

    assert!(graph.get(&user_1, "bestFriend").unwrap().has_received_data());
}

#[test]
fn inverse_stays_symmetric() {
    let (identifiers, graph, _) = setup();
    let user_1 = key(&identifiers, "user", "1");
    let user_2 = key(&identifiers, "user", "2");
    let post_1 = key(&identifiers, "post", "1");
    let post_2 = key(&identifiers, "post", "2");

    graph
        .push(Operation::AddToHasMany {
            record: user_1.clone(),
            field: "posts".into(),
            value: vec![post_1.clone(), post_2.clone()],
            index: None,
        })
        .unwrap();
    assert_eq!(local(&graph, &post_1, "author"), vec![user_1.clone()]);
    assert_eq!(local(&graph, &post_2, "author"), vec![user_1.clone()]);

    // Moving a post to another author removes it from the previous one.
    graph
        .push(Operation::ReplaceRelatedRecord {
            record: post_1.clone(),
            field: "author".into(),
            value: Some(user_2.clone()),
        })
        .unwrap();
    assert_eq!(local(&graph, &user_1, "posts"), vec![post_2.clone()]);
    assert_eq!(local(&graph, &user_2, "posts"), vec![post_1.clone()]);

    graph
        .push(Operation::RemoveFromHasMany {
            record: user_1.clone(),
            field: "posts".into(),
            value: vec![post_2.clone()],
        })
        .unwrap();
    assert!(local(&graph, &post_2, "author").is_empty());

    // Local mutations never touch the remote side.
    assert!(remote(&graph, &user_2, "posts").is_empty());
}

#[test]
fn to_one_displaces_previous_inverse() {
    let (identifiers, graph, _) = setup();
    let user_1 = key(&identifiers, "user", "1");
    let user_2 = key(&identifiers, "user", "2");
    let user_3 = key(&identifiers, "user", "3");

    graph
        .push(Operation::ReplaceRelatedRecord {
            record: user_1.clone(),
            field: "bestFriend".into(),
            value: Some(user_2.clone()),
        })
        .unwrap();
    graph
        .push(Operation::ReplaceRelatedRecord {
            record: user_3.clone(),
            field: "bestFriend".into(),
            value: Some(user_2.clone()),
        })
        .unwrap();

    assert!(local(&graph, &user_1, "bestFriend").is_empty());
    assert_eq!(local(&graph, &user_2, "bestFriend"), vec![user_3.clone()]);
    assert_eq!(local(&graph, &user_3, "bestFriend"), vec![user_2.clone()]);

    graph
        .push(Operation::ReplaceRelatedRecord {
            record: user_3.clone(),
            field: "bestFriend".into(),
            value: None,
        })
        .unwrap();
    assert!(local(&graph, &user_2, "bestFriend").is_empty());
}

#[test]
fn add_at_index() {
    let (identifiers, graph, _) = setup();
    let user = key(&identifiers, "user", "1");
    let posts: Vec<ResourceKey> = (1..=3)
        .map(|id| key(&identifiers, "post", &id.to_string()))
        .collect();

    graph
        .push(Operation::AddToHasMany {
            record: user.clone(),
            field: "posts".into(),
            value: posts[..2].to_vec(),
            index: None,
        })
        .unwrap();
    graph
        .push(Operation::AddToHasMany {
            record: user.clone(),
            field: "posts".into(),
            value: vec![posts[2].clone()],
            index: Some(0),
        })
        .unwrap();

    assert_eq!(
        local(&graph, &user, "posts"),
        vec![posts[2].clone(), posts[0].clone(), posts[1].clone()]
    );
}

#[test]
fn polymorphic_type_error_changes_nothing() {
    let (identifiers, graph, notifications) = setup();
    let subscriber = RecordingSubscriber::all(&notifications);
    let user = key(&identifiers, "user", "1");
    let post = key(&identifiers, "post", "1");
    let pet = key(&identifiers, "pet", "1");

    let result = graph.push(Operation::ReplaceRelatedRecords {
        record: user.clone(),
        field: "posts".into(),
        value: vec![post.clone(), pet.clone()],
    });
    assert_matches!(result, Err(GraphError::PolymorphicType(err)) if err.actual == "pet");

    // The valid member was not added either.
    assert!(local(&graph, &user, "posts").is_empty());
    assert!(local(&graph, &post, "author").is_empty());
    assert!(subscriber.is_empty());

    // Polymorphic relationships accept any type.
    let dog = key(&identifiers, "dog", "1");
    graph
        .push(Operation::AddToHasMany {
            record: user.clone(),
            field: "pets".into(),
            value: vec![pet.clone(), dog.clone()],
            index: None,
        })
        .unwrap();
    assert_eq!(local(&graph, &user, "pets"), vec![pet, dog.clone()]);
    assert_eq!(
        local(&graph, &dog, &implicit_field("user", "pets")),
        vec![user.clone()]
    );
}

#[test]
fn invalid_operations() {
    let (identifiers, graph, _) = setup();
    let user = key(&identifiers, "user", "1");

    assert_matches!(
        graph.push(Operation::AddToHasMany {
            record: user.clone(),
            field: "bestFriend".into(),
            value: vec![],
            index: None,
        }),
        Err(GraphError::KindMismatch { .. })
    );
    assert_matches!(
        graph.push(Operation::ReplaceRelatedRecord {
            record: user.clone(),
            field: "name".into(),
            value: None,
        }),
        Err(GraphError::UnknownField { .. })
    );
    assert_matches!(
        graph.push(Operation::ReplaceRelatedRecords {
            record: user.clone(),
            field: implicit_field("post", "author"),
            value: vec![],
        }),
        Err(GraphError::KindMismatch { .. })
    );
}

#[test]
fn forgotten_resources_are_ignored() {
    let (identifiers, graph, _) = setup();
    let user_1 = key(&identifiers, "user", "1");
    let user_2 = key(&identifiers, "user", "2");

    graph.unload(&user_2);
    assert!(!identifiers.is_known(&user_2));

    graph
        .push(Operation::ReplaceRelatedRecord {
            record: user_2.clone(),
            field: "bestFriend".into(),
            value: Some(user_1.clone()),
        })
        .unwrap();
    assert!(local(&graph, &user_2, "bestFriend").is_empty());
    assert!(graph.fields(&user_2).is_empty());

    // .. also as a member.
    graph
        .push(Operation::ReplaceRelatedRecord {
            record: user_1.clone(),
            field: "bestFriend".into(),
            value: Some(user_2.clone()),
        })
        .unwrap();
    assert!(local(&graph, &user_1, "bestFriend").is_empty());
}

#[test]
fn unload_tears_down_edges() {
    let (identifiers, graph, _) = setup();
    let user = key(&identifiers, "user", "1");
    let pet = key(&identifiers, "pet", "1");
    let post = key(&identifiers, "post", "1");
    let implicit = implicit_field("user", "pets");

    graph
        .push(update(&user, "pets", RelationshipUpdate::many(vec![pet.clone()])))
        .unwrap();
    graph
        .push(update(&user, "posts", RelationshipUpdate::many(vec![post.clone()])))
        .unwrap();
    assert_eq!(remote(&graph, &pet, &implicit), vec![user.clone()]);
    assert_eq!(graph.fields(&pet), vec![implicit.clone()]);

    graph.unload(&user);

    assert!(!identifiers.is_known(&user));
    assert!(graph.fields(&pet).is_empty());
    assert!(graph.is_detached(&post));
    assert!(remote(&graph, &post, "author").is_empty());
    assert!(local(&graph, &post, "author").is_empty());
}

#[test]
fn delete_record() {
    let (identifiers, graph, _) = setup();
    let user = key(&identifiers, "user", "1");
    let post = key(&identifiers, "post", "1");
    let draft = identifiers.create_for_new("post").unwrap();

    graph
        .push(update(&user, "posts", RelationshipUpdate::many(vec![post.clone()])))
        .unwrap();
    graph
        .push(Operation::AddToHasMany {
            record: user.clone(),
            field: "posts".into(),
            value: vec![draft.clone()],
            index: None,
        })
        .unwrap();

    graph
        .push(Operation::DeleteRecord {
            record: post.clone(),
            is_new: false,
        })
        .unwrap();
    assert_eq!(local(&graph, &user, "posts"), vec![draft.clone()]);
    assert_eq!(remote(&graph, &user, "posts"), vec![post.clone()]);
    assert!(identifiers.is_known(&post));

    graph
        .push(Operation::DeleteRecord {
            record: draft.clone(),
            is_new: true,
        })
        .unwrap();
    assert!(local(&graph, &user, "posts").is_empty());
    assert!(!identifiers.is_known(&draft));
}

#[test]
fn flush_keeps_unsaved_members() {
    let (identifiers, graph, _) = setup();
    let user = key(&identifiers, "user", "1");
    let post = key(&identifiers, "post", "1");
    let removed = key(&identifiers, "post", "2");
    let draft = identifiers.create_for_new("post").unwrap();

    graph
        .push(Operation::AddToHasMany {
            record: user.clone(),
            field: "posts".into(),
            value: vec![draft.clone(), removed.clone()],
            index: None,
        })
        .unwrap();
    graph
        .push(update(&user, "posts", RelationshipUpdate::many(vec![post.clone()])))
        .unwrap();

    // Saved local-only members are replaced by the server state, unsaved ones survive.
    assert_eq!(remote(&graph, &user, "posts"), vec![post.clone()]);
    assert_eq!(local(&graph, &user, "posts"), vec![post.clone(), draft.clone()]);
    assert_eq!(local(&graph, &draft, "author"), vec![user.clone()]);
    assert!(local(&graph, &removed, "author").is_empty());
}

#[test]
fn coalesced_notifications() {
    let (identifiers, graph, notifications) = setup();
    let subscriber = RecordingSubscriber::all(&notifications);
    let user = key(&identifiers, "user", "1");
    let post_1 = key(&identifiers, "post", "1");
    let post_2 = key(&identifiers, "post", "2");

    {
        let _batch = graph.batch();
        graph
            .push(update(
                &user,
                "posts",
                RelationshipUpdate::many(vec![post_1.clone(), post_2.clone()]),
            ))
            .unwrap();
        graph
            .push(update(&post_1, "author", RelationshipUpdate::one(Some(user.clone()))))
            .unwrap();
        graph
            .push(update(&post_2, "author", RelationshipUpdate::one(Some(user.clone()))))
            .unwrap();

        // Nothing flushed or delivered before the batch ends.
        assert!(local(&graph, &user, "posts").is_empty());
        assert!(subscriber.is_empty());
    }

    let received = subscriber.take();
    let unique: HashSet<_> = received.iter().cloned().collect();
    assert_eq!(unique.len(), received.len());
    assert_eq!(received.len(), 3);
    assert!(
        received
            .iter()
            .all(|notification| notification.bucket == Bucket::Relationships)
    );
    assert_eq!(
        received
            .iter()
            .filter(|notification| notification.target == NotificationTarget::Resource(user.clone()))
            .count(),
        1
    );
    assert_eq!(local(&graph, &user, "posts"), vec![post_1, post_2]);

    // Pushing the same state again is silent.
    graph
        .push(update(&user, "posts", RelationshipUpdate::many(local(&graph, &user, "posts"))))
        .unwrap();
    assert!(subscriber.is_empty());
}

#[test]
fn flush_is_order_independent() {
    fn run(reverse: bool) -> (HashSet<String>, HashSet<String>) {
        let (identifiers, graph, _) = setup();
        let user = key(&identifiers, "user", "1");
        let other = key(&identifiers, "user", "2");
        let post_1 = key(&identifiers, "post", "1");
        let post_2 = key(&identifiers, "post", "2");

        let mut operations = vec![
            update(
                &user,
                "posts",
                RelationshipUpdate::many(vec![post_1.clone(), post_2.clone()]),
            ),
            update(&post_1, "author", RelationshipUpdate::one(Some(user.clone()))),
            update(&post_2, "author", RelationshipUpdate::one(Some(other.clone()))),
            update(&post_2, "author", RelationshipUpdate::one(Some(user.clone()))),
        ];
        if reverse {
            operations.reverse();
            // Keep the last write to the same edge last.
            operations.swap(0, 1);
        }

        {
            let _batch = graph.batch();
            for operation in operations {
                graph.push(operation).unwrap();
            }
        }

        let lids = |keys: Vec<ResourceKey>| -> HashSet<String> {
            keys.iter().map(|key| key.lid().to_owned()).collect()
        };
        (
            lids(local(&graph, &user, "posts")),
            lids(local(&graph, &other, "posts")),
        )
    }

    let forward = run(false);
    let backward = run(true);
    assert_eq!(forward, backward);
    assert_eq!(forward.0.len(), 2);
    assert!(forward.1.is_empty());
}

#[test]
fn links_and_meta() {
    let (identifiers, graph, _) = setup();
    let user = key(&identifiers, "user", "1");
    let post = key(&identifiers, "post", "1");

    graph
        .push(update(&user, "posts", RelationshipUpdate::many(vec![post.clone()])))
        .unwrap();

    // A payload without data leaves the membership alone.
    graph
        .push(update(
            &user,
            "posts",
            RelationshipUpdate {
                data: None,
                links: Some(serde_json::json!({ "related": "/users/1/posts" })),
                meta: None,
            },
        ))
        .unwrap();

    let state = graph.get_data(&user, "posts").unwrap();
    assert_eq!(state.data, RelationshipValue::Many(vec![post]));
    assert_eq!(
        state.links,
        Some(serde_json::json!({ "related": "/users/1/posts" }))
    );
}

#[test]
fn merge_moves_edges() {
    let (identifiers, graph, _) = setup();
    let created = identifiers.create_for_new("user").unwrap();
    let existing = key(&identifiers, "user", "1");
    let friend = key(&identifiers, "user", "2");

    graph
        .push(Operation::ReplaceRelatedRecord {
            record: created.clone(),
            field: "bestFriend".into(),
            value: Some(friend.clone()),
        })
        .unwrap();

    let updated = identifiers
        .update(&created, &ResourceIdentifier::new("user", "1"))
        .unwrap();
    assert_eq!(updated.key, existing);
    graph
        .merge(&updated.key, updated.abandoned.as_ref().unwrap())
        .unwrap();

    assert_eq!(local(&graph, &existing, "bestFriend"), vec![friend.clone()]);
    assert_eq!(local(&graph, &friend, "bestFriend"), vec![existing]);
    assert!(graph.fields(&created).is_empty());
}

#[test]
fn failed_merge_keeps_edges() {
    // Dogs declare an inverse users don't have.
    let schema = MemorySchema::new()
        .with_type("user", [FieldSchema::has_many("pets", "pet").inverse("owner")])
        .with_type("pet", [FieldSchema::belongs_to("owner", "user").inverse("pets")])
        .with_type("dog", [FieldSchema::belongs_to("owner", "user").inverse("dogs")]);
    let identifiers = IdentifierCache::default();
    let graph = RelationshipGraph::new(
        identifiers.clone(),
        Rc::new(schema),
        NotificationManager::new(),
    );

    let user = key(&identifiers, "user", "1");
    let pet = key(&identifiers, "pet", "1");
    let dog = key(&identifiers, "dog", "1");
    graph
        .push(Operation::ReplaceRelatedRecord {
            record: pet.clone(),
            field: "owner".into(),
            value: Some(user.clone()),
        })
        .unwrap();

    assert_matches!(
        graph.validate_merge(&dog, &pet),
        Err(GraphError::MissingInverse { .. })
    );
    assert_matches!(
        graph.merge(&dog, &pet),
        Err(GraphError::MissingInverse { .. })
    );

    assert_eq!(local(&graph, &pet, "owner"), vec![user.clone()]);
    assert_eq!(local(&graph, &user, "pets"), vec![pet]);
    assert!(graph.fields(&dog).is_empty());
}
