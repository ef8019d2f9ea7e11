//! PgStore against a real database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p smm-store --features postgres`.

#![cfg(feature = "postgres")]

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use sqlx::PgPool;
use uuid::Uuid;

use smm_domain::{
    EncryptedSecret, Link, Money, Order, OrderStatus, Provider, ProviderKind, ProviderStatus,
    RateChange, Service, TransactionKind, UserId,
};
use smm_store::{
    AccountRepository, CatalogRepository, ClaimOutcome, OrderPatch, OrderRepository, PgStore,
    Store, StoreError, UnitOfWork,
};

async fn catalog(store: &PgStore) -> Service {
    let provider = Provider {
        id: Uuid::now_v7(),
        name: "panel".to_string(),
        api_url: "https://panel.example/api/v2".to_string(),
        kind: ProviderKind::Standard,
        status: ProviderStatus::Active,
        api_key: EncryptedSecret::from_encoded("00:00"),
    };
    store.save_provider(&provider).await.unwrap();

    let service =
        Service::new("Followers", provider.id, "101", dec!(7), dec!(0), dec!(0), None, 10, 10_000)
            .unwrap();
    store.save_service(&service).await.unwrap();
    service
}

async fn funded(store: &PgStore, amount: rust_decimal::Decimal) -> UserId {
    let user = Uuid::now_v7();
    store
        .commit(UnitOfWork::new().credit(
            user,
            Money::positive(amount).unwrap(),
            TransactionKind::Deposit,
            "deposit",
            None,
        ))
        .await
        .unwrap();
    user
}

fn placement(user: UserId, service: &Service) -> (Order, UnitOfWork) {
    let order = Order::new_pending(
        user,
        service,
        Link::parse("https://instagram.com/p/abc").unwrap(),
        1000,
    )
    .unwrap();
    let uow = UnitOfWork::new()
        .insert_order(order.clone())
        .debit(user, order.charge, TransactionKind::Order, "order", Some(order.id));
    (order, uow)
}

#[sqlx::test(migrations = "../migrations")]
async fn test_placement_commit_and_rollback(pool: PgPool) {
    let store = PgStore::new(Arc::new(pool));
    let service = catalog(&store).await;
    let user = funded(&store, dec!(10)).await;

    let (order, uow) = placement(user, &service);
    store.commit(uow).await.unwrap();

    let account = store.find_account(user).await.unwrap().unwrap();
    assert_eq!(account.balance.as_decimal(), dec!(3));
    assert_eq!(store.find_by_reference(order.id).await.unwrap().len(), 1);

    // Second order does not fit: neither the order nor the debit lands
    let (second, uow) = placement(user, &service);
    let err = store.commit(uow).await.unwrap_err();
    assert!(matches!(err, StoreError::InsufficientFunds { .. }));
    assert!(store.find_by_id(second.id).await.unwrap().is_none());
    assert_eq!(store.list_transactions(user).await.unwrap().len(), 2);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_concurrent_debits_never_overdraw(pool: PgPool) {
    let store = Arc::new(PgStore::new(Arc::new(pool)));
    let service = catalog(&store).await;
    let user = funded(&store, dec!(10)).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let (_, uow) = placement(user, &service);
        handles.push(tokio::spawn(async move { store.commit(uow).await }));
    }

    let mut committed = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            committed += 1;
        }
    }

    assert_eq!(committed, 1);
    let account = store.find_account(user).await.unwrap().unwrap();
    assert_eq!(account.balance.as_decimal(), dec!(3));
    assert_eq!(store.find_by_user(user).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_guarded_transition_and_claim(pool: PgPool) {
    let store = PgStore::new(Arc::new(pool));
    let service = catalog(&store).await;
    let user = funded(&store, dec!(10)).await;
    let (order, uow) = placement(user, &service);
    store.commit(uow).await.unwrap();

    let now = Utc::now();
    let claimed = store.claim_dispatch(order.id, now + Duration::seconds(60), now).await.unwrap();
    assert!(matches!(claimed, ClaimOutcome::Claimed(_)));
    let again = store.claim_dispatch(order.id, now + Duration::seconds(60), now).await.unwrap();
    assert!(matches!(again, ClaimOutcome::Leased { .. }));

    store
        .commit(UnitOfWork::new().transition(
            order.id,
            &[OrderStatus::Pending],
            OrderStatus::Processing,
            OrderPatch::dispatched("U-1"),
        ))
        .await
        .unwrap();

    let dispatched = store.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(dispatched.status, OrderStatus::Processing);
    assert_eq!(dispatched.upstream_order_id.as_deref(), Some("U-1"));
    assert!(dispatched.dispatch_lease_until.is_none());
    assert_eq!(store.find_reconcilable().await.unwrap().len(), 1);

    // A stale writer still expecting `pending` changes nothing
    let err = store
        .commit(
            UnitOfWork::new()
                .transition(
                    order.id,
                    &[OrderStatus::Pending],
                    OrderStatus::Refunded,
                    OrderPatch::default().refund(order.charge),
                )
                .credit(user, order.charge, TransactionKind::Refund, "refund", Some(order.id)),
        )
        .await
        .unwrap_err();
    assert!(err.is_stale());
    let account = store.find_account(user).await.unwrap().unwrap();
    assert_eq!(account.balance.as_decimal(), dec!(3));
}

#[sqlx::test(migrations = "../migrations")]
async fn test_rate_change_history(pool: PgPool) {
    let store = PgStore::new(Arc::new(pool));
    let mut service = catalog(&store).await;

    let change = RateChange::between(&service, service.provider_rate, dec!(8));
    service.reprice(dec!(8)).unwrap();
    store.record_rate_change(&change).await.unwrap();
    store.save_service(&service).await.unwrap();

    let history = store.find_rate_changes(service.id).await.unwrap();
    assert_eq!(history.len(), 1);
    let saved = store.find_service(service.id).await.unwrap().unwrap();
    assert_eq!(saved.provider_rate, dec!(8));
}

#[sqlx::test(migrations = "../migrations")]
async fn test_record_upstream_order_hands_over_to_reconciliation(pool: PgPool) {
    let store = PgStore::new(Arc::new(pool));
    let service = catalog(&store).await;
    let user = funded(&store, dec!(10)).await;
    let (order, uow) = placement(user, &service);
    store.commit(uow).await.unwrap();

    let now = Utc::now();
    store.claim_dispatch(order.id, now + Duration::seconds(60), now).await.unwrap();

    assert!(store.record_upstream_order(order.id, "U-7").await.unwrap());
    assert!(!store.record_upstream_order(order.id, "U-8").await.unwrap());

    let stored = store.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.upstream_order_id.as_deref(), Some("U-7"));
    assert!(stored.dispatch_lease_until.is_none());
    assert!(store.find_undispatched().await.unwrap().is_empty());
    assert_eq!(store.find_reconcilable().await.unwrap().len(), 1);
}
