use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use product_service::store::InMemoryProductStore;
use product_service::{AvailabilityStatus, CatalogError, ProductCatalog, ProductDraft};
use shared::test_utils::FlakyBroker;
use shared::{Broker, Fact, InMemoryBroker, ProductId, ResilientPublisher, RetryPolicy, PRODUCTS_EXCHANGE};

const WATCH: &str = "watch_product_facts";

async fn fabric() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::connected());
    broker.declare_exchange(PRODUCTS_EXCHANGE).await.unwrap();
    broker.declare_queue(WATCH).await.unwrap();
    broker.bind_queue(WATCH, PRODUCTS_EXCHANGE, "#").await.unwrap();
    broker
}

fn catalog_on(broker: Arc<dyn Broker>) -> (ProductCatalog, Arc<InMemoryProductStore>) {
    let store = Arc::new(InMemoryProductStore::new());
    let publisher = ResilientPublisher::new(broker, RetryPolicy::new(2, Duration::from_millis(1)));
    (ProductCatalog::new(store.clone(), publisher), store)
}

fn draft(name: &str) -> ProductDraft {
    ProductDraft {
        name: name.to_string(),
        description: "Warm white".to_string(),
        price: BigDecimal::from_str("24.90").unwrap(),
        category: "home".to_string(),
    }
}

fn announced(broker: &InMemoryBroker) -> Vec<Fact> {
    broker
        .drain(WATCH)
        .iter()
        .map(|d| Fact::decode(&d.routing_key, &d.payload).unwrap())
        .collect()
}

#[tokio::test]
async fn test_create_announces_initial_stock() {
    let broker = fabric().await;
    let (catalog, _) = catalog_on(broker.clone());

    let product = catalog.create_product(7, draft("Desk lamp"), 12).await.unwrap();
    assert_eq!(product.status, AvailabilityStatus::Pending);
    assert_eq!(product.seller_id, 7);
    assert_eq!(
        announced(&broker),
        vec![Fact::ProductCreated {
            product_id: product.id,
            quantity: 12,
            seller_id: Some(7)
        }]
    );
}

#[tokio::test]
async fn test_create_rejects_invalid_input_without_announcing() {
    let broker = fabric().await;
    let (catalog, store) = catalog_on(broker.clone());

    let err = catalog.create_product(7, draft("Desk lamp"), -1).await.unwrap_err();
    assert!(matches!(err, CatalogError::InvalidArgument(_)));

    let mut free = draft("Desk lamp");
    free.price = BigDecimal::from(0);
    let err = catalog.create_product(7, free, 1).await.unwrap_err();
    assert!(matches!(err, CatalogError::InvalidArgument(_)));

    let err = catalog.create_product(7, draft("  "), 1).await.unwrap_err();
    assert!(matches!(err, CatalogError::InvalidArgument(_)));

    assert!(store.is_empty());
    assert!(announced(&broker).is_empty());
}

#[tokio::test]
async fn test_only_the_owner_may_delete() {
    let broker = fabric().await;
    let (catalog, _) = catalog_on(broker.clone());
    let product = catalog.create_product(7, draft("Desk lamp"), 1).await.unwrap();
    announced(&broker);

    let err = catalog.delete_product(8, product.id).await.unwrap_err();
    assert!(matches!(err, CatalogError::Forbidden { seller_id: 8, .. }));
    let err = catalog.delete_product(7, ProductId(999)).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotFound(ProductId(999))));
    assert!(announced(&broker).is_empty());

    catalog.delete_product(7, product.id).await.unwrap();
    assert_eq!(
        announced(&broker),
        vec![Fact::ProductDeleted {
            product_id: product.id,
            seller_id: Some(7)
        }]
    );
    // Rows stay until the inventory authority confirms.
    assert_eq!(catalog.get_product(product.id).await.unwrap().id, product.id);
}

#[tokio::test]
async fn test_seller_listing_is_newest_first_and_scoped() {
    let broker = fabric().await;
    let (catalog, _) = catalog_on(broker);
    let first = catalog.create_product(7, draft("Desk lamp"), 1).await.unwrap();
    let second = catalog.create_product(7, draft("Floor lamp"), 1).await.unwrap();
    catalog.create_product(8, draft("Kettle"), 1).await.unwrap();

    let ids: Vec<ProductId> = catalog
        .list_seller_products(7)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert!(catalog.list_seller_products(9).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unannounced_creation_reports_publish_failure() {
    let inner = fabric().await;
    let flaky = Arc::new(FlakyBroker::new(inner.clone(), usize::MAX));
    let (catalog, store) = catalog_on(flaky.clone());

    let err = catalog.create_product(7, draft("Desk lamp"), 3).await.unwrap_err();
    assert!(matches!(err, CatalogError::Publish { .. }));
    assert_eq!(flaky.attempts(), 2);

    // The product row is committed even though nobody heard about it.
    assert_eq!(store.len(), 1);
    assert!(announced(&inner).is_empty());
}

#[tokio::test]
async fn test_transient_publish_failure_is_retried() {
    let inner = fabric().await;
    let flaky = Arc::new(FlakyBroker::new(inner.clone(), 1));
    let (catalog, _) = catalog_on(flaky.clone());

    let product = catalog.create_product(7, draft("Desk lamp"), 3).await.unwrap();
    assert_eq!(flaky.attempts(), 2);
    assert_eq!(announced(&inner).len(), 1);
    assert_eq!(catalog.get_product(product.id).await.unwrap().status, AvailabilityStatus::Pending);
}
