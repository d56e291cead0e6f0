use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use futures::FutureExt;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{AcquireOptions, Lease},
    memory::InMemoryCollection,
    prelude::*,
    stage::{GroupKey, GroupSpec},
};

/// Wraps the in-memory backend, counting acquisitions and lease cleanups.
#[derive(Debug, Clone, Default)]
struct CountingStore {
    inner: InMemoryStore,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl StoreBackend for CountingStore {
    type Handle = InMemoryCollection;

    async fn acquire_collection(
        &self,
        name: &str,
        options: AcquireOptions,
    ) -> DocumentStoreResult<Lease<Self::Handle>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let handle = self.inner.acquire_collection(name, options).await?.handle().clone();
        let released = self.released.clone();

        Ok(Lease::new(handle).with_cleanup(Box::new(move || {
            async move {
                released.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })))
    }

    async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.inner.create_collection(name).await
    }

    async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.inner.drop_collection(name).await
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        self.inner.list_collections().await
    }
}

fn orders() -> Vec<Document> {
    vec![
        doc! { "_id": "o1", "category": "books", "status": "open", "amount": 12 },
        doc! { "_id": "o2", "category": "games", "status": "open", "amount": 40 },
        doc! { "_id": "o3", "category": "books", "status": "closed", "amount": 8 },
        doc! { "_id": "o4", "category": "books", "status": "open", "amount": 30 },
    ]
}

async fn seeded() -> DocumentStore<InMemoryStore> {
    let backend = InMemoryStore::builder()
        .with_documents("orders", orders())
        .build()
        .await
        .unwrap();

    DocumentStore::builder(backend)
        .config(StoreConfig::new("shop"))
        .build()
        .unwrap()
}

fn ids(result: &PaginatedResult<'_, impl StoreBackend>) -> Vec<String> {
    result
        .items()
        .iter()
        .filter_map(|item| item.as_document())
        .filter_map(|item| item.get_str("_id").ok())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_paginates_through_matching_items() {
    let store = seeded().await;
    let orders = store.collection("orders");

    let first = orders
        .find(QueryBuilder::new().eq("status", "open").ascending("amount").limit(2))
        .await
        .unwrap();

    assert_eq!(ids(&first), vec!["o1", "o4"]);
    assert_eq!(first.total_count(), 3);
    assert_eq!(first.total_pages(), 2);
    assert!(first.has_next());
    assert!(!first.has_prev());

    let second = first.next().await.unwrap();

    assert_eq!(ids(&second), vec!["o2"]);
    assert_eq!(second.page(), 2);
    assert!(!second.has_next());
    assert!(second.has_prev());

    let back = second.prev().await.unwrap();
    assert_eq!(ids(&back), vec!["o1", "o4"]);
}

#[tokio::test]
async fn test_groups_with_accumulators() {
    let store = seeded().await;

    let totals = store
        .collection("orders")
        .find(
            QueryBuilder::new()
                .group_by(["category"])
                .sum("amount")
                .count()
                .ascending("category"),
        )
        .await
        .unwrap();

    assert_eq!(totals.total_count(), 2);
    assert_eq!(
        totals.into_items(),
        vec![
            Bson::Document(doc! { "_id": { "category": "books" }, "amountSum": 50, "count": 3 }),
            Bson::Document(doc! { "_id": { "category": "games" }, "amountSum": 40, "count": 1 }),
        ]
    );
}

#[tokio::test]
async fn test_group_builder_errors_surface_before_execution() {
    let store = seeded().await;
    let orders = store.collection("orders");

    let regrouped = orders
        .find(QueryBuilder::new().group_by(["category"]).group_by(["status"]))
        .await;
    assert!(matches!(regrouped, Err(DocumentStoreError::AlreadyGrouped)));

    let doubled = orders
        .run(
            QueryBuilder::new()
                .group_by(["category"])
                .stage(Stage::Group(GroupSpec::new(GroupKey::All))),
        )
        .await;
    assert!(matches!(doubled, Err(DocumentStoreError::TooManyGroupStages(2))));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    #[serde(rename = "_id")]
    id: String,
    category: String,
    amount: i32,
}

#[tokio::test]
async fn test_insert_then_get() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection("orders");
    let order = Order { id: "o9".into(), category: "music".into(), amount: 5 };

    let stored = orders.insert_as(&order).await.unwrap();
    assert!(stored.contains_key("_createdDate"));
    assert!(stored.contains_key("_updatedDate"));

    assert_eq!(orders.get_as::<Order>("o9").await.unwrap(), Some(order));
    assert_eq!(orders.get("missing").await.unwrap(), None);

    let duplicate = orders.insert(doc! { "_id": "o9" }).await;
    assert!(matches!(duplicate, Err(DocumentStoreError::Execution { .. })));
}

#[tokio::test]
async fn test_item_updates() {
    let store = seeded().await;
    let orders = store.collection("orders");

    let updated = orders.update("o1", doc! { "status": "closed" }).await.unwrap();
    assert_eq!(updated.get_str("status").unwrap(), "closed");

    let incremented = orders.increment("o1", "amount", 3).await.unwrap();
    assert_eq!(incremented.get_i32("amount").unwrap(), 15);

    orders.push("o1", "tags", ["gift", "rush"]).await.unwrap();
    let pulled = orders.pull("o1", "tags", ["rush"]).await.unwrap();
    assert_eq!(pulled.get_array("tags").unwrap(), &vec![Bson::String("gift".into())]);

    let missing = orders.update("nope", doc! { "status": "closed" }).await;
    assert!(matches!(missing, Err(DocumentStoreError::DocumentNotFound(..))));

    let protected = orders.update("o1", doc! { "_owner": "mallory" }).await;
    assert!(matches!(protected, Err(DocumentStoreError::ValidationFailed(_))));

    assert!(orders.remove("o1").await.unwrap().is_some());
    assert_eq!(orders.remove("o1").await.unwrap(), None);
}

#[tokio::test]
async fn test_replace_keeps_creation_metadata() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection("orders");

    let created = orders.insert(doc! { "_id": "o1", "amount": 1 }).await.unwrap();
    let replaced = orders.replace("o1", doc! { "amount": 2 }).await.unwrap();

    assert_eq!(replaced.get_i32("amount").unwrap(), 2);
    assert_eq!(replaced.get("_createdDate"), created.get("_createdDate"));

    let saved = orders.save(doc! { "_id": "o2", "amount": 3 }).await.unwrap();
    assert_eq!(saved.get_str("_id").unwrap(), "o2");
    assert_eq!(orders.count(QueryBuilder::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_cached_reads_skip_the_backend_until_flushed() {
    let backend = CountingStore::default();
    let acquired = backend.acquired.clone();
    let store = DocumentStore::new(backend);
    let orders = store
        .collection("orders")
        .with_options(OperationOptions { use_cache: true, ..Default::default() });
    orders.insert(doc! { "_id": "o1", "status": "open" }).await.unwrap();
    let after_insert = acquired.load(Ordering::SeqCst);

    let query = || QueryBuilder::new().eq("status", "open");

    let first = orders.find(query()).await.unwrap();
    assert!(!first.from_cache());
    assert_eq!(acquired.load(Ordering::SeqCst), after_insert + 1);

    let second = orders.find(query()).await.unwrap();
    assert!(second.from_cache());
    assert_eq!(second.items(), first.items());
    assert_eq!(acquired.load(Ordering::SeqCst), after_insert + 1);

    store.flush_cache(&["query"]).await.unwrap();

    let third = orders.find(query()).await.unwrap();
    assert!(!third.from_cache());
    assert_eq!(acquired.load(Ordering::SeqCst), after_insert + 2);

    assert!(store.flush_cache(&["sessions"]).await.is_err());
}

#[tokio::test]
async fn test_eager_cleanup_releases_leases() {
    let backend = CountingStore::default();
    let released = backend.released.clone();
    let store = DocumentStore::new(backend);

    store.collection("orders").insert(doc! { "n": 1 }).await.unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 0);

    let eager = store
        .collection("orders")
        .with_options(OperationOptions { eager_cleanup: true, ..Default::default() });
    eager.insert(doc! { "n": 2 }).await.unwrap();
    eager.find(QueryBuilder::new()).await.unwrap();

    assert_eq!(released.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_hooks_rewrite_arguments_and_results() {
    let hooks = HookRegistry::new()
        .before("orders", Operation::Query, |payload: HookPayload, _ctx: HookContext| async move {
            let query = payload.into_query()?;
            Ok::<_, HookError>(Some(HookPayload::Query(query.eq("category", "books"))))
        })
        .after("orders", Operation::Count, |payload: HookPayload, _ctx: HookContext| async move {
            let count = payload.into_count()?;
            Ok::<_, HookError>(Some(HookPayload::Count(count * 10)))
        });
    let backend = InMemoryStore::builder()
        .with_documents("orders", orders())
        .build()
        .await
        .unwrap();
    let store = DocumentStore::builder(backend).hooks(hooks).build().unwrap();
    let orders = store.collection("orders");

    let books = orders.find(QueryBuilder::new().ascending("amount")).await.unwrap();
    assert_eq!(ids(&books), vec!["o3", "o1", "o4"]);
    assert_eq!(orders.count(QueryBuilder::new()).await.unwrap(), 40);

    let unhooked = orders
        .clone()
        .with_options(OperationOptions { suppress_hooks: true, ..Default::default() });
    assert_eq!(unhooked.count(QueryBuilder::new()).await.unwrap(), 4);
}

#[tokio::test]
async fn test_failing_before_hook_aborts_writes_only() {
    let hooks = HookRegistry::new()
        .before("orders", Operation::Insert, |_: HookPayload, _: HookContext| async {
            Err::<Option<HookPayload>, HookError>("orders are frozen".into())
        })
        .before("orders", Operation::Query, |_: HookPayload, _: HookContext| async {
            Err::<Option<HookPayload>, HookError>("audit unavailable".into())
        });
    let backend = InMemoryStore::builder()
        .with_documents("orders", orders())
        .build()
        .await
        .unwrap();
    let store = DocumentStore::builder(backend).hooks(hooks).build().unwrap();
    let orders = store.collection("orders");

    let insert = orders.insert(doc! { "n": 1 }).await;
    assert!(matches!(
        insert,
        Err(DocumentStoreError::HookFailure { hook, .. }) if hook == "beforeInsert"
    ));

    let all = orders.find(QueryBuilder::new()).await.unwrap();
    assert_eq!(all.total_count(), 4);
}

#[tokio::test]
async fn test_owned_reads() {
    let backend = InMemoryStore::new();
    let alice = DocumentStore::builder(backend.clone())
        .identity_provider(FixedIdentity(Identity::new("alice")))
        .build()
        .unwrap();
    let anonymous = DocumentStore::new(backend);
    let owned = OperationOptions { only_owned: true, ..Default::default() };

    let mine = alice.collection("notes").insert(doc! { "_id": "n1" }).await.unwrap();
    assert_eq!(mine.get_str("_owner").unwrap(), "alice");
    anonymous.collection("notes").insert(doc! { "_id": "n2" }).await.unwrap();

    let notes = alice.collection("notes").with_options(owned);
    let page = notes.find(QueryBuilder::new()).await.unwrap();
    assert_eq!(ids(&page), vec!["n1"]);
    assert_eq!(page.total_count(), 1);
    assert_eq!(notes.get("n2").await.unwrap(), None);

    let denied = anonymous.collection("notes").with_options(owned).find(QueryBuilder::new()).await;
    assert!(matches!(denied, Err(DocumentStoreError::ValidationFailed(_))));
}

#[tokio::test]
async fn test_distinct_values() {
    let store = seeded().await;
    let orders = store.collection("orders");

    let categories = orders.distinct(QueryBuilder::new(), "category").await.unwrap();
    assert_eq!(categories.total_count(), 2);
    assert_eq!(
        orders.count_distinct(QueryBuilder::new().eq("status", "open"), "category").await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_save_acquires_the_collection_once() {
    let backend = CountingStore::default();
    let acquired = backend.acquired.clone();
    let store = DocumentStore::new(backend);
    let orders = store.collection("orders");

    let before = acquired.load(Ordering::SeqCst);
    let inserted = orders.save(doc! { "_id": "s1", "amount": 1 }).await.unwrap();
    assert_eq!(acquired.load(Ordering::SeqCst), before + 1);
    assert_eq!(inserted.get_i32("amount").unwrap(), 1);

    let replaced = orders.save(doc! { "_id": "s1", "amount": 2 }).await.unwrap();
    assert_eq!(acquired.load(Ordering::SeqCst), before + 2);
    assert_eq!(replaced.get_i32("amount").unwrap(), 2);
    assert_eq!(orders.count(QueryBuilder::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_estimated_total_counts_the_whole_collection() {
    let store = seeded().await;
    let orders = store
        .collection("orders")
        .with_options(OperationOptions { exact_count: false, ..Default::default() });

    let open = orders.find(QueryBuilder::new().eq("status", "open")).await.unwrap();

    assert_eq!(open.items().len(), 3);
    assert_eq!(open.total_count(), 4);
}

#[tokio::test]
async fn test_groups_literal_rows_by_category() {
    let backend = InMemoryStore::builder()
        .with_documents(
            "ledger",
            vec![
                doc! { "category": "a", "amount": 10 },
                doc! { "category": "a", "amount": 5 },
                doc! { "category": "b", "amount": 7 },
            ],
        )
        .build()
        .await
        .unwrap();
    let store = DocumentStore::new(backend);

    let totals = store
        .collection("ledger")
        .find(
            QueryBuilder::new()
                .group_by(["category"])
                .sum("amount")
                .count()
                .ascending("category"),
        )
        .await
        .unwrap();

    assert_eq!(
        totals.into_items(),
        vec![
            Bson::Document(doc! { "_id": { "category": "a" }, "amountSum": 15, "count": 2 }),
            Bson::Document(doc! { "_id": { "category": "b" }, "amountSum": 7, "count": 1 }),
        ]
    );
}

#[tokio::test]
async fn test_paginates_active_items_by_creation() {
    let backend = InMemoryStore::builder()
        .with_documents(
            "tasks",
            vec![
                doc! { "_id": "t1", "status": "active", "createdAt": 1 },
                doc! { "_id": "t2", "status": "done", "createdAt": 2 },
                doc! { "_id": "t3", "status": "active", "createdAt": 3 },
                doc! { "_id": "t4", "status": "done", "createdAt": 4 },
                doc! { "_id": "t5", "status": "active", "createdAt": 5 },
            ],
        )
        .build()
        .await
        .unwrap();
    let store = DocumentStore::new(backend);

    let first = store
        .collection("tasks")
        .find(
            QueryBuilder::new()
                .eq("status", "active")
                .ascending("createdAt")
                .limit(2),
        )
        .await
        .unwrap();

    assert_eq!(ids(&first), vec!["t1", "t3"]);
    assert_eq!(first.total_count(), 3);
    assert!(first.has_next());

    let second = first.next().await.unwrap();
    assert_eq!(ids(&second), vec!["t5"]);
    assert!(!second.has_next());
}

#[tokio::test]
async fn test_group_sort_on_a_member_field_uses_the_first_member() {
    let store = seeded().await;

    let groups = store
        .collection("orders")
        .find(QueryBuilder::new().group_by(["category"]).count().descending("amount"))
        .await
        .unwrap();

    assert_eq!(
        groups.into_items(),
        vec![
            Bson::Document(doc! { "_id": { "category": "games" }, "count": 1 }),
            Bson::Document(doc! { "_id": { "category": "books" }, "count": 3 }),
        ]
    );
}

#[tokio::test]
async fn test_insert_then_get_without_hooks_or_cache() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection("orders").with_options(OperationOptions {
        suppress_hooks: true,
        use_cache: false,
        ..Default::default()
    });

    let inserted = orders
        .insert(doc! { "_id": "r1", "category": "music", "tags": ["a", "b"], "amount": 5 })
        .await
        .unwrap();

    assert_eq!(orders.get("r1").await.unwrap(), Some(inserted));
}
