//! End-to-end directory scenarios.

use reldir_core::{
    CheckRequest, Directory, DirectoryError, GetObjectRequest, GetRelationRequest, Object,
    PaginationRequest, Relation, RelationFilter, RelationQuery,
};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SHARING: &str = "\
model:
  version: 3
types:
  user: {}
  group:
    relations:
      member: user
  folder:
    relations:
      parent: folder
      owner: user
      viewer:
        types: user | group#member
        union: owner
    permissions:
      delete: owner
      read: viewer
";

fn directory() -> Directory {
    let dir = Directory::open_in_memory().unwrap();
    dir.set_manifest(SHARING).unwrap();
    dir
}

#[test]
fn manifest_round_trip() {
    let dir = directory();
    let manifest = dir.get_manifest("").unwrap().found().unwrap();
    assert_eq!(manifest.body, SHARING.as_bytes());

    let model = dir.get_model();
    assert!(model.assignment_allowed("folder", "viewer", "group", Some("member"), false));
    assert!(model.assignment_allowed("folder", "parent", "folder", None, false));
    assert!(!model.assignment_allowed("folder", "parent", "user", None, false));
}

#[test]
fn object_crud_with_etag() {
    let dir = directory();
    let first = dir
        .set_object(Object::new("user", "alice").with_display_name("Alice"))
        .unwrap();
    assert!(!first.etag.is_empty());

    let again = dir
        .set_object(Object::new("user", "alice").with_display_name("Alice"))
        .unwrap();
    assert_eq!(again.etag, first.etag);
    assert_eq!(again.created_at, first.created_at);
    assert_eq!(again.updated_at, first.updated_at);

    thread::sleep(Duration::from_millis(5));
    let renamed = dir
        .set_object(
            Object::new("user", "alice")
                .with_display_name("A.")
                .with_etag(&first.etag),
        )
        .unwrap();
    assert_ne!(renamed.etag, first.etag);
    assert!(renamed.updated_at > first.updated_at);
    assert_eq!(renamed.created_at, first.created_at);

    let stale = dir.set_object(
        Object::new("user", "alice")
            .with_display_name("A2")
            .with_etag(&first.etag),
    );
    assert!(matches!(stale, Err(DirectoryError::HashMismatch { .. })));
    let stored = dir
        .get_object(&GetObjectRequest::new("user", "alice"))
        .unwrap()
        .found()
        .unwrap();
    assert_eq!(stored.result, renamed);

    dir.delete_object("user", "alice", false).unwrap();
    dir.delete_object("user", "alice", false).unwrap();
    assert!(dir
        .get_object(&GetObjectRequest::new("user", "alice"))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn relation_indexes_agree() {
    let dir = directory();
    let stored = dir
        .set_relation(Relation::new(("folder", "root"), "viewer", ("user", "alice"), ""))
        .unwrap();

    let by_object = RelationFilter {
        object_type: "folder".into(),
        object_id: "root".into(),
        ..Default::default()
    };
    let by_subject = RelationFilter {
        subject_type: "user".into(),
        subject_id: "alice".into(),
        ..Default::default()
    };
    let page = PaginationRequest::default();
    assert_eq!(dir.get_relations(&by_object, &page).unwrap().results, [stored.clone()]);
    assert_eq!(dir.get_relations(&by_subject, &page).unwrap().results, [stored.clone()]);

    let request = GetRelationRequest {
        query: RelationQuery {
            subject_relation: None,
            ..RelationQuery::exact(&stored.identifier())
        },
        ..Default::default()
    };
    assert_eq!(
        dir.get_relation(&request).unwrap().found().unwrap().result,
        stored
    );

    dir.delete_relation(&stored.identifier()).unwrap();
    assert!(dir.get_relations(&by_object, &page).unwrap().results.is_empty());
    assert!(dir.get_relations(&by_subject, &page).unwrap().results.is_empty());
    assert!(dir.get_relation(&request).unwrap_err().is_not_found());
}

#[test]
fn group_expansion() {
    let dir = directory();
    let membership = dir
        .set_relation(Relation::new(("group", "g"), "member", ("user", "alice"), ""))
        .unwrap();
    dir.set_relation(Relation::new(("folder", "root"), "viewer", ("group", "g"), "member"))
        .unwrap();

    let cancel = CancellationToken::new();
    let request = CheckRequest::new(("folder", "root"), "viewer", ("user", "alice"));
    assert!(dir.check_relation(&request, &cancel).unwrap().check);

    dir.delete_relation(&membership.identifier()).unwrap();
    assert!(!dir.check_relation(&request, &cancel).unwrap().check);
}

#[test]
fn permission_derivation() {
    let dir = directory();
    dir.set_relation(Relation::new(("folder", "root"), "owner", ("user", "alice"), ""))
        .unwrap();

    let cancel = CancellationToken::new();
    let alice = CheckRequest::new(("folder", "root"), "delete", ("user", "alice"));
    let bob = CheckRequest::new(("folder", "root"), "delete", ("user", "bob"));
    assert!(dir.check_permission(&alice, &cancel).unwrap().check);
    assert!(!dir.check_permission(&bob, &cancel).unwrap().check);

    // A permission holds exactly when one of its granting relations does.
    for subject in ["alice", "bob"] {
        let permission = CheckRequest::new(("folder", "root"), "read", ("user", subject));
        let relation = CheckRequest::new(("folder", "root"), "viewer", ("user", subject));
        assert_eq!(
            dir.check_permission(&permission, &cancel).unwrap().check,
            dir.check_relation(&relation, &cancel).unwrap().check
        );
    }
}

#[test]
fn blocking_manifest_change() {
    let dir = directory();
    dir.set_object(Object::new("user", "alice")).unwrap();
    dir.set_relation(Relation::new(("group", "g"), "member", ("user", "alice"), ""))
        .unwrap();

    let without_membership = SHARING
        .replace("    relations:\n      member: user\n", "")
        .replace("user | group#member", "user");
    let err = dir.set_manifest(without_membership).unwrap_err();
    match err {
        DirectoryError::CannotUpdateModel(reason) => assert!(reason.contains("group#member")),
        other => panic!("unexpected error: {other}"),
    }

    let manifest = dir.get_manifest("").unwrap().found().unwrap();
    assert_eq!(manifest.body, SHARING.as_bytes());
    assert!(dir.get_model().relation_exists("group", "member"));
    assert_eq!(
        dir.get_objects("user", &PaginationRequest::default())
            .unwrap()
            .results
            .len(),
        1
    );
}

#[test]
fn cascade_delete_removes_both_sides() {
    let dir = directory();
    dir.set_object(Object::new("group", "g")).unwrap();
    dir.set_relation(Relation::new(("group", "g"), "member", ("user", "alice"), ""))
        .unwrap();
    dir.set_relation(Relation::new(("folder", "root"), "viewer", ("group", "g"), "member"))
        .unwrap();

    dir.delete_object("group", "g", true).unwrap();
    let stats = dir.get_stats().unwrap();
    assert_eq!(stats.object_count(), 0);
    assert_eq!(stats.relation_count(), 0);
}

#[test]
fn paging_through_objects() {
    let dir = directory();
    for i in 0..25 {
        dir.set_object(Object::new("user", format!("u{i:02}"))).unwrap();
    }
    let mut seen = Vec::new();
    let mut page = PaginationRequest::size(10);
    loop {
        let result = dir.get_objects("user", &page).unwrap();
        seen.extend(result.results.into_iter().map(|o| o.id));
        if result.page.next_token.is_empty() {
            break;
        }
        page = PaginationRequest::next(10, result.page.next_token);
    }
    let expected: Vec<String> = (0..25).map(|i| format!("u{i:02}")).collect();
    assert_eq!(seen, expected);
}
