//! End-to-end behavior of the cache policy against the in-process store.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::Method;
use depcache::cache::{
    BypassReason, CacheBackend, CacheConfig, CachePolicy, EntityRef, Invalidator, Invocation,
    MemoryBackend, Outcome, PurgeError, Purger, RequestFacts, RequestScope,
};

const POST: u32 = 7;
const TAG: u32 = 9;

fn memory() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(
        NonZeroUsize::new(1024).expect("non-zero capacity"),
    ))
}

fn page_view() -> Invocation {
    Invocation::new("viewA", "func1")
}

async fn render_post(policy: &CachePolicy, runs: &AtomicUsize) -> Outcome {
    policy
        .compute(
            &RequestFacts::get("/page/1"),
            &RequestScope::new(),
            &page_view(),
            |deps| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                deps.record(EntityRef::new(POST, 42));
                "<article>42</article>".to_string()
            },
        )
        .await
        .expect("compute")
        .outcome
}

#[tokio::test]
async fn miss_hit_invalidate_miss() {
    let backend = memory();
    let policy = CachePolicy::new(backend.clone(), CacheConfig::default());
    let invalidator = Invalidator::for_policy(&policy);
    let runs = AtomicUsize::new(0);
    let entry = page_view().fingerprint("/page/1", None).expect("key");

    assert!(matches!(render_post(&policy, &runs).await, Outcome::Stored));
    assert!(backend.contains(&entry));
    assert_eq!(
        policy
            .registry()
            .entries_for_entity(&EntityRef::new(POST, 42))
            .await
            .expect("index"),
        [entry.clone()]
    );

    let writes_before_hit = backend.calls().writes();
    assert!(render_post(&policy, &runs).await.is_hit());
    assert_eq!(backend.calls().writes(), writes_before_hit);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let invalidation = invalidator
        .notify_entity_changed(POST, 42)
        .await
        .expect("notify");
    assert_eq!(invalidation.entries, [entry.clone()]);
    assert_eq!(invalidation.paths, ["/page/1"]);
    assert!(!backend.contains(&entry));

    assert!(matches!(render_post(&policy, &runs).await, Outcome::Stored));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn extra_components_separate_entries() {
    let policy = CachePolicy::new(memory(), CacheConfig::default());
    let runs = AtomicUsize::new(0);
    let counter = &runs;

    for version in ["v1", "v2", "v1"] {
        policy
            .compute(
                &RequestFacts::get("/"),
                &RequestScope::new(),
                &page_view().extra(version),
                |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    format!("rendered {version}")
                },
            )
            .await
            .expect("compute");
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unsafe_methods_and_messages_bypass() {
    let backend = memory();
    let policy = CachePolicy::new(backend.clone(), CacheConfig::default());

    let post = policy
        .compute(
            &RequestFacts::new(Method::POST, "/page/1"),
            &RequestScope::new(),
            &page_view(),
            |_| async { "created".to_string() },
        )
        .await
        .expect("compute");
    assert!(matches!(
        post.outcome,
        Outcome::Bypass(BypassReason::UnsafeMethod)
    ));

    let flashed = policy
        .compute(
            &RequestFacts::get("/page/1").with_transient_messages(true),
            &RequestScope::new(),
            &page_view(),
            |_| async { "saved!".to_string() },
        )
        .await
        .expect("compute");
    assert_eq!(flashed.artifact, "saved!");
    assert!(matches!(
        flashed.outcome,
        Outcome::Bypass(BypassReason::TransientMessages)
    ));

    assert!(backend.is_empty());
}

#[tokio::test]
async fn nested_computations_register_into_the_outer_entry() {
    let policy = CachePolicy::new(memory(), CacheConfig::default());
    let scope = RequestScope::new();
    let request = RequestFacts::get("/posts/42");
    let outer = Invocation::new("PostView", "page");
    let inner = Invocation::new("TagList", "fragment").arg(42);

    let (shared, nested_scope, nested_request, fragment) = (&policy, &scope, &request, &inner);
    let page = policy
        .compute(&request, &scope, &outer, move |deps| async move {
            deps.record(EntityRef::new(POST, 42));
            let tags = shared
                .compute(nested_request, nested_scope, fragment, |deps| async move {
                    deps.record(EntityRef::new(TAG, 1));
                    "<ul><li>rust</li></ul>".to_string()
                })
                .await
                .expect("inner compute")
                .into_artifact();
            format!("<article>{tags}</article>")
        })
        .await
        .expect("outer compute");
    assert!(matches!(page.outcome, Outcome::Stored));

    let outer_key = outer.fingerprint("/posts/42", None).expect("key");
    let inner_key = inner.fingerprint("/posts/42", None).expect("key");
    let tag_entries = policy
        .registry()
        .entries_for_entity(&EntityRef::new(TAG, 1))
        .await
        .expect("index");
    assert_eq!(tag_entries, [inner_key.clone(), outer_key.clone()]);
    assert_eq!(
        policy.registry().contributions(&outer_key).await.expect("read"),
        vec![EntityRef::new(POST, 42), EntityRef::new(TAG, 1)]
    );
}

#[tokio::test]
async fn nested_hit_still_registers_into_the_outer_entry() {
    let policy = CachePolicy::new(memory(), CacheConfig::default());
    let request = RequestFacts::get("/sidebar");
    let inner = Invocation::new("TagList", "fragment");

    // Warm the fragment on its own.
    policy
        .compute(&request, &RequestScope::new(), &inner, |deps| async move {
            deps.record(EntityRef::new(TAG, 5));
            "<ul/>".to_string()
        })
        .await
        .expect("warm fragment");

    let scope = RequestScope::new();
    let outer = Invocation::new("Layout", "page");
    let (shared, nested_scope, nested_request, cached) = (&policy, &scope, &request, &inner);
    let page = policy
        .compute(&request, &scope, &outer, move |_| async move {
            let fragment = shared
                .compute(nested_request, nested_scope, cached, |_| async {
                    "recomputed".to_string()
                })
                .await
                .expect("inner compute");
            assert!(fragment.outcome.is_hit());
            fragment.into_artifact()
        })
        .await
        .expect("outer compute");
    assert_eq!(page.artifact, "<ul/>");

    let outer_key = outer.fingerprint("/sidebar", None).expect("key");
    assert_eq!(
        policy.registry().contributions(&outer_key).await.expect("read"),
        vec![EntityRef::new(TAG, 5)]
    );
}

#[tokio::test]
async fn serial_backend_behaves_like_batching_backend() {
    let backend = Arc::new(MemoryBackend::without_batching(
        NonZeroUsize::new(256).expect("non-zero capacity"),
    ));
    let policy = CachePolicy::new(backend.clone(), CacheConfig::default());
    let runs = AtomicUsize::new(0);

    assert!(matches!(render_post(&policy, &runs).await, Outcome::Stored));
    assert!(render_post(&policy, &runs).await.is_hit());

    let calls = backend.calls();
    assert_eq!(calls.get_many + calls.set_many + calls.delete_many, 0);
    assert!(calls.set > 0);

    Invalidator::for_policy(&policy)
        .notify_type_created(POST)
        .await
        .expect("notify");
    assert!(matches!(render_post(&policy, &runs).await, Outcome::Stored));
}

#[derive(Default)]
struct RecordingPurger {
    paths: Mutex<Vec<String>>,
}

#[async_trait]
impl Purger for RecordingPurger {
    async fn purge(&self, paths: &[String]) -> Result<(), PurgeError> {
        self.paths
            .lock()
            .expect("purger lock")
            .extend_from_slice(paths);
        Ok(())
    }
}

#[tokio::test]
async fn purger_receives_paths_of_listings() {
    let policy = CachePolicy::new(memory(), CacheConfig::default());
    for page in 1..=2 {
        let path = format!("/posts?page={page}");
        policy
            .compute(
                &RequestFacts::get(path.as_str()),
                &RequestScope::new(),
                &Invocation::new("PostList", "index"),
                |deps| async move {
                    deps.record(EntityRef::new(POST, page));
                    format!("page {page}")
                },
            )
            .await
            .expect("compute");
    }

    let purger = Arc::new(RecordingPurger::default());
    let invalidator = Invalidator::for_policy(&policy).with_purger(purger.clone());
    let invalidation = invalidator.notify_type_created(POST).await.expect("notify");

    assert_eq!(invalidation.entries.len(), 2);
    assert_eq!(
        *purger.paths.lock().expect("purger lock"),
        ["/posts?page=1", "/posts?page=2"]
    );
}

#[tokio::test]
async fn shared_store_needs_no_batching_from_callers() {
    let backend: Arc<dyn CacheBackend> = memory();
    let policy = CachePolicy::new(backend.clone(), CacheConfig::default());
    let runs = AtomicUsize::new(0);
    render_post(&policy, &runs).await;

    let entry = page_view().fingerprint("/page/1", None).expect("key");
    assert!(backend.get(&entry).await.expect("get").is_some());
}
