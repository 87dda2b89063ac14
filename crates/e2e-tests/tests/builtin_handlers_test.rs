//! Built-in handlers E2E tests against the Tantivy store.
//!
//! Users, groups, profile sections, tags and plain content flow through the
//! service into an on-disk index and are queried back by system field.

use std::time::Duration;

use pretty_assertions::assert_eq;

use e2e_tests::{
    content_event, fast_retries, single_queue, wait_for_drain, wait_until, FaultPlan, FlakyStore,
    TestHarness,
};
use indexer_pipeline::QueueConfig;
use indexer_search::{ContentIndex, DocumentStore, SearchIndexConfig, TantivyDocumentStore};
use indexer_types::{id_query, Authorizable, Entity, Permission, Zone};

const TIMEOUT: Duration = Duration::from_secs(10);
const SECTION: &str = "a:alice/public/authprofile/aboutme";

fn populate(harness: &TestHarness) {
    let repo = &harness.repo;
    repo.put_authorizable(
        Authorizable::user("alice")
            .with_property("firstName", "Alice")
            .with_property("lastName", "Liddell")
            .with_property("email", "alice@example.com")
            .with_principal("g-math"),
    );
    repo.put_authorizable(
        Authorizable::group("g-math")
            .with_property("sakai:group-title", "Math")
            .with_member("alice"),
    );
    repo.grant(Zone::Authorizables, "alice", "everyone", Permission::Read);

    repo.put_entity(Entity::new(SECTION).with_resource_type("sakai/user-profile"));
    repo.put_entity(Entity::new(format!("{}/elements", SECTION)));
    repo.put_entity(
        Entity::new(format!("{}/elements/interests", SECTION)).with_property("value", "chess"),
    );

    repo.put_entity(
        Entity::new("/tags/rust")
            .with_resource_type("sakai/tag")
            .with_property("sakai:tag-name", "rust"),
    );
    harness.put_content("/docs/readme", "sakai/pooled-content", "Readme");
    repo.grant(Zone::Content, "/docs", "g-math", Permission::Read);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_builtin_documents_land_in_search_index() {
    let (harness, _builtins) = TestHarness::with_builtins();
    populate(&harness);

    let index = ContentIndex::open_or_create(SearchIndexConfig::new(&harness.index_path)).unwrap();
    let store = TantivyDocumentStore::new(&index);
    let service = harness.open_service(single_queue(10), fast_retries(), |queue| {
        Box::new(store.handle(queue.name.clone())) as Box<dyn DocumentStore>
    });

    for (topic, path) in [
        ("authorizables/ADDED", "alice"),
        ("authorizables/ADDED", "g-math"),
        ("content/UPDATED", "a:alice/public/authprofile/aboutme/elements/interests"),
        ("content/ADDED", "/tags/rust"),
        ("content/ADDED", "/docs/readme"),
    ] {
        service.submit_event(content_event(topic, path)).unwrap();
    }
    service.start().await.unwrap();
    assert!(wait_for_drain(&service, TIMEOUT).await);

    assert_eq!(index.num_docs().unwrap(), 5);
    assert_eq!(index.count("resourceType:authorizable").unwrap(), 2);
    assert_eq!(index.count("resourceType:profile").unwrap(), 1);
    assert_eq!(index.count(&id_query(SECTION)).unwrap(), 1);
    assert_eq!(index.count(&id_query("/tags/rust")).unwrap(), 1);
    assert_eq!(index.count("readers:everyone").unwrap(), 1);
    // Group members can read the group; content inherits the grant on /docs.
    assert_eq!(index.count("readers:alice").unwrap(), 1);
    assert_eq!(index.count(r#"readers:"g-math""#).unwrap(), 1);

    // Deletes remove the documents by id.
    harness.repo.remove_entity("/tags/rust");
    harness.repo.remove_authorizable("g-math");
    service
        .submit_event(content_event("content/DELETE", "/tags/rust").with_resource_type("sakai/tag"))
        .unwrap();
    service
        .submit_event(content_event("authorizables/DELETE", "g-math"))
        .unwrap();
    assert!(wait_for_drain(&service, TIMEOUT).await);
    service.stop().await.unwrap();

    assert_eq!(index.num_docs().unwrap(), 3);
    assert_eq!(index.count(&id_query("/tags/rust")).unwrap(), 0);
    assert_eq!(index.count("resourceType:authorizable").unwrap(), 1);
}

/// Profile sections are re-indexed whole on element changes and removed when
/// the section itself is deleted.
#[tokio::test(flavor = "multi_thread")]
async fn test_profile_section_lifecycle() {
    let (harness, _builtins) = TestHarness::with_builtins();
    populate(&harness);

    let index = ContentIndex::open_or_create(SearchIndexConfig::new(&harness.index_path)).unwrap();
    let store = TantivyDocumentStore::new(&index);
    let service = harness.open_service(single_queue(10), fast_retries(), |queue| {
        Box::new(store.handle(queue.name.clone())) as Box<dyn DocumentStore>
    });
    service.start().await.unwrap();

    let element = format!("{}/elements/interests", SECTION);
    service
        .submit_event(content_event("content/ADDED", &element))
        .unwrap();
    harness.repo.put_entity(
        Entity::new(format!("{}/elements/hobbies", SECTION)).with_property("value", "rowing"),
    );
    service
        .submit_event(content_event("content/ADDED", &format!("{}/elements/hobbies", SECTION)))
        .unwrap();
    assert!(wait_for_drain(&service, TIMEOUT).await);
    // Both element events collapse into the one section document.
    assert_eq!(index.count(&id_query(SECTION)).unwrap(), 1);
    assert_eq!(index.num_docs().unwrap(), 1);

    for path in [
        format!("{}/elements/hobbies", SECTION),
        format!("{}/elements/interests", SECTION),
        format!("{}/elements", SECTION),
        SECTION.to_string(),
    ] {
        harness.repo.remove_entity(&path);
    }
    service
        .submit_event(
            content_event("content/DELETE", SECTION).with_resource_type("sakai/user-profile"),
        )
        .unwrap();
    assert!(wait_for_drain(&service, TIMEOUT).await);
    service.stop().await.unwrap();

    assert_eq!(index.num_docs().unwrap(), 0);
}

/// Two queues write to one index. The zippy queue's commits always fail and
/// are rolled back; none of the loafing queue's committed work may be lost.
#[tokio::test(flavor = "multi_thread")]
async fn test_failing_queue_keeps_other_queue_commits() {
    let harness = TestHarness::new();
    harness.put_content("/docs/fast", "sakai/pooled-content", "Fast");
    for i in 0..20 {
        harness.put_content(&format!("/docs/slow-{}", i), "sakai/pooled-content", "Slow");
    }

    let index = ContentIndex::open_or_create(SearchIndexConfig::new(&harness.index_path)).unwrap();
    let store = TantivyDocumentStore::new(&index);
    let faults = FaultPlan::new().always_fail().shared();
    let queues = vec![
        QueueConfig::new("loafing", Duration::from_millis(20), 1),
        QueueConfig::new("zippy", Duration::from_millis(5), 1),
    ];
    let service = harness.open_service(queues, fast_retries(), |queue| {
        let handle = store.handle(queue.name.clone());
        if queue.name == "zippy" {
            Box::new(FlakyStore::new(handle, faults.clone())) as Box<dyn DocumentStore>
        } else {
            Box::new(handle) as Box<dyn DocumentStore>
        }
    });

    let fast = content_event("content/ADDED", "/docs/fast").with_property("ttl", 5);
    assert_eq!(service.queue_for(service.effective_ttl(&fast)), "zippy");
    service.submit_event(fast).unwrap();
    for i in 0..20 {
        service
            .submit_event(content_event("content/ADDED", &format!("/docs/slow-{}", i)))
            .unwrap();
    }

    service.start().await.unwrap();
    let loafing = service.dispatcher("loafing").unwrap().queue().clone();
    assert!(wait_until(TIMEOUT, || loafing.is_empty()).await);
    assert!(wait_until(TIMEOUT, || faults.commit_calls() >= 2).await);
    service.stop().await.unwrap();

    assert_eq!(index.num_docs().unwrap(), 20);
    assert_eq!(index.count(&id_query("/docs/fast")).unwrap(), 0);
    assert_eq!(service.dispatcher("loafing").unwrap().stats().entries_committed, 20);
}
