use std::sync::Arc;
use std::time::Duration;

use inventory_service::store::InMemoryLedgerStore;
use inventory_service::{LedgerEngine, LedgerError};
use shared::test_utils::FlakyBroker;
use shared::{Broker, Fact, InMemoryBroker, ProductId, ResilientPublisher, RetryPolicy, INVENTORY_EXCHANGE};

const WATCH: &str = "watch_inventory_facts";
const P: ProductId = ProductId(42);

async fn fabric() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::connected());
    broker.declare_exchange(INVENTORY_EXCHANGE).await.unwrap();
    broker.declare_queue(WATCH).await.unwrap();
    broker.bind_queue(WATCH, INVENTORY_EXCHANGE, "#").await.unwrap();
    broker
}

fn engine_on(broker: Arc<dyn Broker>) -> LedgerEngine {
    let publisher = ResilientPublisher::new(broker, RetryPolicy::new(2, Duration::from_millis(1)));
    LedgerEngine::new(Arc::new(InMemoryLedgerStore::default()), publisher)
}

async fn setup() -> (LedgerEngine, Arc<InMemoryBroker>) {
    let broker = fabric().await;
    (engine_on(broker.clone()), broker)
}

fn announced(broker: &InMemoryBroker) -> Vec<Fact> {
    broker
        .drain(WATCH)
        .iter()
        .map(|d| Fact::decode(&d.routing_key, &d.payload).unwrap())
        .collect()
}

#[tokio::test]
async fn test_reserve_replenish_sell_scenario() {
    let (engine, broker) = setup().await;
    engine.create_entry(P, 10).await.unwrap();
    assert_eq!(
        announced(&broker),
        vec![Fact::StockCreated {
            product_id: P,
            quantity: 10
        }]
    );

    let entry = engine.reserve(P, 10).await.unwrap();
    assert_eq!(entry.available(), 0);
    assert_eq!(announced(&broker), vec![Fact::StockOutOfStock { product_id: P }]);

    let entry = engine.replenish(P, 5).await.unwrap();
    assert_eq!((entry.quantity, entry.available()), (15, 5));
    assert_eq!(
        announced(&broker),
        vec![Fact::StockReplenish {
            product_id: P,
            available: Some(5)
        }]
    );

    let entry = engine.sell(P, 10).await.unwrap();
    assert_eq!((entry.quantity, entry.reserved), (5, 0));
    assert!(announced(&broker).is_empty());
}

#[tokio::test]
async fn test_release_beyond_reserved_leaves_row_unchanged() {
    let (engine, _broker) = setup().await;
    engine.create_entry(P, 10).await.unwrap();
    engine.reserve(P, 2).await.unwrap();

    let err = engine.release(P, 3).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InvalidRelease {
            requested: 3,
            reserved: 2,
            ..
        }
    ));

    let entry = engine.get_entry(P).await.unwrap();
    assert_eq!((entry.quantity, entry.reserved), (10, 2));
}

#[tokio::test]
async fn test_exhausting_reserve_announces_once_then_rejects() {
    let (engine, broker) = setup().await;
    engine.create_entry(P, 5).await.unwrap();
    announced(&broker);

    engine.reserve(P, 5).await.unwrap();
    let err = engine.reserve(P, 1).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock { available: 0, .. }));

    assert_eq!(announced(&broker), vec![Fact::StockOutOfStock { product_id: P }]);
    let entry = engine.get_entry(P).await.unwrap();
    assert_eq!((entry.quantity, entry.reserved), (5, 5));
}

#[tokio::test]
async fn test_reserve_then_release_restores_reserved() {
    let (engine, _broker) = setup().await;
    engine.create_entry(P, 8).await.unwrap();
    engine.reserve(P, 3).await.unwrap();

    engine.reserve(P, 4).await.unwrap();
    let entry = engine.release(P, 4).await.unwrap();
    assert_eq!(entry.reserved, 3);
    assert_eq!(engine.get_available(P).await.unwrap(), 5);
}

#[tokio::test]
async fn test_release_from_exhausted_announces_replenish() {
    let (engine, broker) = setup().await;
    engine.create_entry(P, 4).await.unwrap();
    engine.reserve(P, 4).await.unwrap();
    announced(&broker);

    engine.release(P, 1).await.unwrap();
    assert_eq!(
        announced(&broker),
        vec![Fact::StockReplenish {
            product_id: P,
            available: Some(1)
        }]
    );
}

#[tokio::test]
async fn test_create_entry_is_idempotent_and_reannounces() {
    let (engine, broker) = setup().await;
    engine.create_entry(P, 10).await.unwrap();
    engine.reserve(P, 4).await.unwrap();

    let entry = engine.create_entry(P, 25).await.unwrap();
    assert_eq!((entry.quantity, entry.reserved), (10, 4));

    let facts = announced(&broker);
    assert_eq!(
        facts,
        vec![
            Fact::StockCreated {
                product_id: P,
                quantity: 10
            },
            Fact::StockCreated {
                product_id: P,
                quantity: 6
            },
        ]
    );
}

#[tokio::test]
async fn test_missing_entry_is_not_found() {
    let (engine, broker) = setup().await;
    assert!(matches!(engine.reserve(P, 1).await, Err(LedgerError::NotFound(P))));
    assert!(matches!(engine.get_available(P).await, Err(LedgerError::NotFound(P))));
    assert!(matches!(engine.delete_entry(P).await, Err(LedgerError::NotFound(P))));
    assert!(announced(&broker).is_empty());
}

#[tokio::test]
async fn test_delete_entry_announces_stock_deleted() {
    let (engine, broker) = setup().await;
    engine.create_entry(P, 7).await.unwrap();
    announced(&broker);

    engine.delete_entry(P).await.unwrap();
    assert_eq!(
        announced(&broker),
        vec![Fact::StockDeleted {
            product_id: P,
            quantity: Some(7)
        }]
    );
    assert!(matches!(engine.get_entry(P).await, Err(LedgerError::NotFound(P))));
}

#[tokio::test]
async fn test_non_positive_quantities_are_rejected() {
    let (engine, _broker) = setup().await;
    engine.create_entry(P, 3).await.unwrap();

    assert!(matches!(engine.reserve(P, 0).await, Err(LedgerError::InvalidArgument(_))));
    assert!(matches!(engine.release(P, -1).await, Err(LedgerError::InvalidArgument(_))));
    assert!(matches!(engine.sell(P, 0).await, Err(LedgerError::InvalidArgument(_))));
    assert!(matches!(engine.replenish(P, -2).await, Err(LedgerError::InvalidArgument(_))));
    assert!(matches!(
        engine.create_entry(ProductId(7), -1).await,
        Err(LedgerError::InvalidArgument(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reserves_never_overcommit() {
    let (engine, broker) = setup().await;
    engine.create_entry(P, 10).await.unwrap();
    announced(&broker);

    let tasks: Vec<_> = (0..25)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.reserve(P, 1).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientStock { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!((succeeded, rejected), (10, 15));
    assert_eq!(engine.get_available(P).await.unwrap(), 0);
    assert_eq!(announced(&broker), vec![Fact::StockOutOfStock { product_id: P }]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mixed_reserves_stay_within_stock() {
    let (engine, _broker) = setup().await;
    engine.create_entry(P, 20).await.unwrap();

    let tasks: Vec<_> = [7, 3, 9, 5, 6, 2, 8, 4]
        .into_iter()
        .map(|n| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.reserve(P, n).await.map(|_| n) })
        })
        .collect();

    let mut reserved = 0;
    for task in tasks {
        if let Ok(n) = task.await.unwrap() {
            reserved += n;
        }
    }

    let entry = engine.get_entry(P).await.unwrap();
    assert_eq!(entry.reserved, reserved);
    assert!(entry.reserved <= entry.quantity);
    assert!(entry.available() >= 0);
}

#[tokio::test]
async fn test_publish_failure_surfaces_after_commit() {
    let inner = fabric().await;
    let flaky = Arc::new(FlakyBroker::new(inner.clone(), usize::MAX));
    let engine = engine_on(flaky.clone());

    // Creation announces too, so it already fails to publish.
    assert!(matches!(
        engine.create_entry(P, 3).await,
        Err(LedgerError::Publish { .. })
    ));
    let err = engine.reserve(P, 3).await.unwrap_err();
    assert!(matches!(err, LedgerError::Publish { product_id: P, .. }));
    assert!(err.is_retryable());

    assert_eq!(engine.get_available(P).await.unwrap(), 0);
    assert_eq!(flaky.attempts(), 4);
    assert!(inner.queued(WATCH).is_empty());
}
