//! End-to-end pipeline tests: placement, dispatch, reconciliation and refunds
//! running against the in-memory store, queue and stub upstream.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use smm_domain::{OrderStatus, Service, TransactionKind, UpstreamStatus, UserId};
use smm_engine::RetryPolicy;
use smm_exec::{
    ExecError, FulfillmentWorker, JobOutcome, MemoryQueue, OrderPlacementService, PlaceOrder,
    Reconciler, RefundPath, StubResponse, StubUpstream, StubUpstreamFactory,
};
use smm_store::{MemoryStore, Store};
use smm_testkit::{fund_account, seed_catalog, seed_service};

struct Pipeline {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    upstream: Arc<StubUpstream>,
    placement: OrderPlacementService,
    worker: FulfillmentWorker,
    reconciler: Reconciler,
    refunds: RefundPath,
    service: Service,
}

async fn pipeline() -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let upstream = Arc::new(StubUpstream::new());
    let factory = Arc::new(StubUpstreamFactory::new(upstream.clone()));
    let catalog = seed_catalog(store.as_ref()).await.unwrap();

    Pipeline {
        placement: OrderPlacementService::new(store.clone(), queue.clone()),
        worker: FulfillmentWorker::new(
            store.clone(),
            queue.clone(),
            factory.clone(),
            RetryPolicy::new(3, Duration::from_millis(1)),
            chrono::Duration::seconds(60),
        ),
        reconciler: Reconciler::new(
            store.clone(),
            queue.clone(),
            factory,
            chrono::Duration::seconds(300),
        ),
        refunds: RefundPath::new(store.clone()),
        service: catalog.service,
        store,
        queue,
        upstream,
    }
}

impl Pipeline {
    fn request(&self, user_id: UserId, quantity: u32) -> PlaceOrder {
        PlaceOrder {
            user_id,
            service_id: self.service.id,
            link: "https://instagram.com/p/abc".to_string(),
            quantity,
        }
    }

    async fn balance(&self, user_id: UserId) -> Decimal {
        self.store
            .accounts()
            .find_account(user_id)
            .await
            .unwrap()
            .map(|a| a.balance.as_decimal())
            .unwrap_or_default()
    }

    async fn status(&self, order_id: Uuid) -> OrderStatus {
        self.store.orders().find_by_id(order_id).await.unwrap().unwrap().status
    }

    async fn assert_ledger_consistent(&self, user_id: UserId) {
        let transactions = self.store.accounts().list_transactions(user_id).await.unwrap();
        let sum: Decimal = transactions.iter().map(|t| t.signed_amount()).sum();
        assert_eq!(self.balance(user_id).await, sum);
    }
}

#[tokio::test]
async fn test_charge_is_rounded_to_four_places() {
    let p = pipeline().await;
    let provider_id = p.service.provider_id;
    let service = seed_service(p.store.as_ref(), provider_id, "202", dec!(2.50)).await.unwrap();

    let user = Uuid::now_v7();
    fund_account(p.store.as_ref(), user, dec!(10)).await.unwrap();

    let order = p
        .placement
        .place_order(PlaceOrder {
            user_id: user,
            service_id: service.id,
            link: "https://youtube.com/watch?v=x".to_string(),
            quantity: 2000,
        })
        .await
        .unwrap();

    assert_eq!(order.charge.as_decimal(), dec!(5.0000));
    assert_eq!(p.balance(user).await, dec!(5));
    p.assert_ledger_consistent(user).await;
}

#[tokio::test]
async fn test_upstream_rejection_refunds_in_full() {
    let p = pipeline().await;
    let user = Uuid::now_v7();
    fund_account(p.store.as_ref(), user, dec!(10)).await.unwrap();

    let order = p.placement.place_order(p.request(user, 1000)).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(p.balance(user).await, dec!(3));

    p.upstream.push_create(StubResponse::Reject("Invalid link".to_string()));
    let outcome = p.worker.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Refunded { .. }));

    assert_eq!(p.status(order.id).await, OrderStatus::Refunded);
    assert_eq!(p.balance(user).await, dec!(10));

    let kinds: Vec<TransactionKind> = p
        .store
        .accounts()
        .find_by_reference(order.id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.kind)
        .collect();
    assert_eq!(kinds, vec![TransactionKind::Order, TransactionKind::Refund]);
    p.assert_ledger_consistent(user).await;
}

#[tokio::test]
async fn test_cancelled_upstream_refunds_once_across_passes() {
    let p = pipeline().await;
    let user = Uuid::now_v7();
    fund_account(p.store.as_ref(), user, dec!(10)).await.unwrap();

    let order = p.placement.place_order(p.request(user, 1000)).await.unwrap();
    let outcome = p.worker.poll_once().await.unwrap().unwrap();
    let JobOutcome::Dispatched { upstream_order_id, .. } = outcome else {
        panic!("expected dispatch, got {:?}", outcome);
    };
    assert_eq!(p.status(order.id).await, OrderStatus::Processing);

    p.upstream.set_status(&upstream_order_id, UpstreamStatus::Cancelled, 0, 1000);
    let first = p.reconciler.run_once().await.unwrap();
    let second = p.reconciler.run_once().await.unwrap();

    assert_eq!(first.refunded, 1);
    assert_eq!(second.refunded, 0);
    assert_eq!(p.status(order.id).await, OrderStatus::Refunded);
    assert_eq!(p.balance(user).await, dec!(10));

    let refunds = p
        .store
        .accounts()
        .find_by_reference(order.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionKind::Refund)
        .count();
    assert_eq!(refunds, 1);
    p.assert_ledger_consistent(user).await;
}

#[tokio::test]
async fn test_refund_twice_credits_once() {
    let p = pipeline().await;
    let user = Uuid::now_v7();
    fund_account(p.store.as_ref(), user, dec!(10)).await.unwrap();
    let order = p.placement.place_order(p.request(user, 1000)).await.unwrap();

    let first = p.refunds.refund_order(order.id, "operator").await.unwrap();
    let second = p.refunds.refund_order(order.id, "operator").await.unwrap();

    assert!(first.is_refunded());
    assert!(!second.is_refunded());
    assert_eq!(p.balance(user).await, dec!(10));
    assert_eq!(p.store.transaction_count(), 3);

    // The queued job finds a settled order and does nothing
    let outcome = p.worker.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Skipped { .. }));
    assert_eq!(p.upstream.create_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_placements_never_overdraw() {
    let p = pipeline().await;
    let user = Uuid::now_v7();
    fund_account(p.store.as_ref(), user, dec!(10)).await.unwrap();

    // Each order costs 7.00, so only one of them fits
    let mut handles = Vec::new();
    for _ in 0..8 {
        let placement = p.placement.clone();
        let request = p.request(user, 1000);
        handles.push(tokio::spawn(async move { placement.place_order(request).await }));
    }

    let mut placed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => placed += 1,
            Err(ExecError::InsufficientFunds { .. }) => {},
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(placed, 1);
    assert_eq!(p.balance(user).await, dec!(3));
    assert_eq!(p.store.order_count(), 1);
    assert_eq!(p.queue.len(), 1);
    p.assert_ledger_consistent(user).await;
}

#[tokio::test]
async fn test_failed_placements_leave_no_trace() {
    let p = pipeline().await;
    let user = Uuid::now_v7();
    fund_account(p.store.as_ref(), user, dec!(1)).await.unwrap();

    assert!(p.placement.place_order(p.request(user, 1000)).await.is_err());
    assert!(p.placement.place_order(p.request(user, 1)).await.is_err());
    let mut bad_link = p.request(user, 100);
    bad_link.link = "  ".to_string();
    assert!(p.placement.place_order(bad_link).await.is_err());

    assert_eq!(p.store.order_count(), 0);
    assert_eq!(p.store.transaction_count(), 1);
    assert!(p.queue.is_empty());
    p.assert_ledger_consistent(user).await;
}

#[tokio::test]
async fn test_partial_delivery_then_completion_of_others() {
    let p = pipeline().await;
    let user = Uuid::now_v7();
    fund_account(p.store.as_ref(), user, dec!(20)).await.unwrap();

    let partial = p.placement.place_order(p.request(user, 1000)).await.unwrap();
    let complete = p.placement.place_order(p.request(user, 1000)).await.unwrap();
    p.worker.poll_once().await.unwrap();
    p.worker.poll_once().await.unwrap();

    let partial_upstream = p
        .store
        .orders()
        .find_by_id(partial.id)
        .await
        .unwrap()
        .unwrap()
        .upstream_order_id
        .unwrap();
    let complete_upstream = p
        .store
        .orders()
        .find_by_id(complete.id)
        .await
        .unwrap()
        .unwrap()
        .upstream_order_id
        .unwrap();

    p.upstream.set_status(&partial_upstream, UpstreamStatus::Partial, 100, 500);
    p.upstream.set_status(&complete_upstream, UpstreamStatus::Completed, 100, 0);
    let report = p.reconciler.run_once().await.unwrap();

    assert_eq!(report.partial, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(p.status(partial.id).await, OrderStatus::Partial);
    assert_eq!(p.status(complete.id).await, OrderStatus::Completed);

    // 20 - 7 - 7 + 3.50 for the undelivered half
    assert_eq!(p.balance(user).await, dec!(9.5));
    p.assert_ledger_consistent(user).await;
}
