mod common;

use camper_core::ChargeStatus;
use camper_order::{
    AttemptStatus, ChannelOutcome, DomainEvent, EngineError, ErrorKind, OrderStatus, OrderType,
    PartChannel, PaymentConfirmation, PaymentRequest, TransactionKind,
};
use camper_shared::{Masked, Money};
use common::{customer, harness, order_request, split, Script};

#[tokio::test]
async fn test_split_payment_settles_balance_then_channel() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 150).await;

    let order = h.engine.create_order(&alice, order_request(OrderType::TourPackage, 300, 1)).await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);

    let resolution = h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap();

    assert_eq!(resolution.attempt.status, AttemptStatus::Succeeded);
    assert_eq!(resolution.order.status, OrderStatus::InProgress);
    assert_eq!(resolution.order.amount_paid, Money::from_minor(300));
    assert_eq!(h.balance(&alice).await, Money::from_minor(50));
    assert_eq!(h.channel.charges().len(), 1);
    assert_eq!(h.channel.charges()[0].amount, Money::from_minor(200));
    assert_eq!(h.engine.ledger.verify_balance(&alice.account_id).await.unwrap(), Money::from_minor(50));

    let ledger = h.ledger(&alice).await;
    let payment = ledger.iter().find(|tx| tx.kind == TransactionKind::Payment).unwrap();
    assert_eq!(payment.amount, Money::from_minor(-100));
    assert_eq!(payment.related_attempt_id, Some(resolution.attempt.id));
    assert!(h.events.topics().contains(&"orders.paid"));
}

#[tokio::test]
async fn test_declined_channel_returns_balance() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 150).await;
    h.channel.push(Script::Decline("card blocked".to_string()));

    let order = h.engine.create_order(&alice, order_request(OrderType::TourPackage, 300, 1)).await.unwrap();
    let err = h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExternalChannelError);
    assert_eq!(err.failed_leg(), Some(PartChannel::ThirdParty));
    assert_eq!(h.balance(&alice).await, Money::from_minor(150));

    let attempts = h.attempts(&alice, order.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert!(attempts[0].compensation_transaction_id.is_some());
    assert_eq!(attempts[0].failure.as_ref().unwrap().leg, PartChannel::ThirdParty);

    let order = h.engine.get_order(&alice, order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(order.amount_paid, Money::ZERO);

    let kinds: Vec<_> = h.ledger(&alice).await.iter().map(|tx| tx.kind).collect();
    assert_eq!(kinds, vec![TransactionKind::Bonus, TransactionKind::Payment, TransactionKind::Refund]);
    h.engine.ledger.verify_balance(&alice.account_id).await.unwrap();

    // The order can still be paid afterwards.
    let retry = h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap();
    assert_eq!(retry.order.status, OrderStatus::InProgress);
}

#[tokio::test]
async fn test_insufficient_balance_leaves_no_trace() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 50).await;

    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();
    let err = h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap_err();

    assert!(matches!(err, EngineError::InsufficientBalance { .. }));
    assert_eq!(err.failed_leg(), Some(PartChannel::Balance));
    assert!(h.channel.charges().is_empty());
    assert_eq!(h.balance(&alice).await, Money::from_minor(50));
    assert_eq!(h.ledger(&alice).await.len(), 1);

    let attempts = h.attempts(&alice, order.id).await;
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].failure.as_ref().unwrap().leg, PartChannel::Balance);
}

#[tokio::test]
async fn test_malformed_parts_are_rejected_before_any_effect() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 500).await;
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();

    let err = h.engine.attempt_payment(&alice, order.id, split(100, 100)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AmountMismatch);

    let err = h
        .engine
        .attempt_payment(&alice, order.id, PaymentRequest { parts: vec![], payment_password: None })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    assert!(h.attempts(&alice, order.id).await.is_empty());
    assert_eq!(h.balance(&alice).await, Money::from_minor(500));
}

#[tokio::test]
async fn test_only_owner_may_pay() {
    let h = harness();
    let alice = customer("alice");
    let mallory = customer("mallory");
    h.fund(&mallory, 500).await;
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();

    let err = h.engine.attempt_payment(&mallory, order.id, split(300, 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(h.balance(&mallory).await, Money::from_minor(500));
}

#[tokio::test]
async fn test_confirm_payment_is_idempotent() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 300).await;
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();
    let paid = h.engine.attempt_payment(&alice, order.id, split(300, 0)).await.unwrap();

    let first = h.engine.confirm_payment(&alice, order.id, PaymentConfirmation::default()).await.unwrap();
    let second = h.engine.confirm_payment(&alice, order.id, PaymentConfirmation::default()).await.unwrap();

    assert_eq!(first.attempt.id, paid.attempt.id);
    assert_eq!(second.attempt.id, paid.attempt.id);
    assert_eq!(second.order.status, OrderStatus::InProgress);
    assert_eq!(second.order.amount_paid, Money::from_minor(300));
    assert_eq!(h.ledger(&alice).await.len(), 2);

    let paid_events = h
        .events
        .events()
        .into_iter()
        .filter(|e| matches!(e, DomainEvent::OrderPaid(_)))
        .count();
    assert_eq!(paid_events, 1);
}

#[tokio::test]
async fn test_repeated_success_notification_is_a_no_op() {
    let h = harness();
    let alice = customer("alice");
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();
    let paid = h.engine.attempt_payment(&alice, order.id, split(0, 300)).await.unwrap();
    let ext = paid.attempt.external_transaction_id.clone().unwrap();

    let again = h
        .engine
        .resolve_attempt(paid.attempt.id, ChannelOutcome::Charged { external_transaction_id: ext })
        .await
        .unwrap();
    assert_eq!(again.order.amount_paid, Money::from_minor(300));
    assert_eq!(again.attempt.status, AttemptStatus::Succeeded);
}

#[tokio::test]
async fn test_success_after_compensation_needs_reconciliation() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 100).await;
    h.channel.push(Script::Decline("insufficient funds".to_string()));
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();
    h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap_err();
    let failed = h.attempts(&alice, order.id).await.remove(0);

    let err = h
        .engine
        .resolve_attempt(failed.id, ChannelOutcome::Charged { external_transaction_id: "late_1".to_string() })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ReconciliationRequired);
    assert!(h.events.topics().contains(&"payments.reconciliation_required"));
    let order = h.engine.get_order(&alice, order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(h.balance(&alice).await, Money::from_minor(100));
}

#[tokio::test]
async fn test_timeout_leaves_attempt_unresolved_until_recovery() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 150).await;
    h.channel.push(Script::Hang);
    let order = h.engine.create_order(&alice, order_request(OrderType::TourPackage, 300, 1)).await.unwrap();

    let err = h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap_err();
    assert!(matches!(err, EngineError::ExternalChannel { outcome_unknown: true, .. }));

    let attempt = h.attempts(&alice, order.id).await.remove(0);
    assert_eq!(attempt.status, AttemptStatus::Unresolved);
    // The balance leg stays taken while the outcome is unknown.
    assert_eq!(h.balance(&alice).await, Money::from_minor(50));

    // Retrying while the channel still cannot say is refused.
    h.channel.set_status(attempt.id.to_string(), ChargeStatus::Pending);
    let err = h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReconciliationRequired);

    h.channel.set_status(
        attempt.id.to_string(),
        ChargeStatus::Succeeded { external_transaction_id: "wx_late".to_string() },
    );
    let report = h.engine.run_recovery().await;
    assert_eq!(report.resolved, vec![attempt.id]);

    let order = h.engine.get_order(&alice, order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::InProgress);
    assert_eq!(h.balance(&alice).await, Money::from_minor(50));
    h.engine.ledger.verify_balance(&alice.account_id).await.unwrap();
}

#[tokio::test]
async fn test_recovery_compensates_charges_the_channel_never_saw() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 150).await;
    h.channel.push(Script::Transport("connection reset".to_string()));
    let order = h.engine.create_order(&alice, order_request(OrderType::TourPackage, 300, 1)).await.unwrap();

    h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap_err();
    let report = h.engine.run_recovery().await;

    assert_eq!(report.compensated.len(), 1);
    assert!(report.is_clean());
    assert_eq!(h.balance(&alice).await, Money::from_minor(150));
    let order = h.engine.get_order(&alice, order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
}

#[tokio::test]
async fn test_recovery_reports_still_unknown_attempts() {
    let h = harness();
    let alice = customer("alice");
    h.channel.push(Script::Hang);
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();
    h.engine.attempt_payment(&alice, order.id, split(0, 300)).await.unwrap_err();

    let attempt = h.attempts(&alice, order.id).await.remove(0);
    h.channel.set_status(attempt.id.to_string(), ChargeStatus::Pending);
    let report = h.engine.run_recovery().await;

    assert_eq!(report.unresolved, vec![attempt.id]);
    assert!(!report.is_clean());
    assert!(h.events.topics().contains(&"payments.reconciliation_required"));
}

#[tokio::test]
async fn test_concurrent_attempts_settle_once() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 600).await;
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();

    let (a, b) = tokio::join!(
        h.engine.attempt_payment(&alice, order.id, split(300, 0)),
        h.engine.attempt_payment(&alice, order.id, split(300, 0)),
    );
    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let loser = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert_eq!(loser.kind(), ErrorKind::StateConflict);

    assert_eq!(h.balance(&alice).await, Money::from_minor(300));
    h.engine.ledger.verify_balance(&alice.account_id).await.unwrap();
}

#[tokio::test]
async fn test_payment_password_guards_balance_leg() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 300).await;
    h.engine.wallet.set_payment_password(&alice, "135790", "135790").await.unwrap();
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();

    let err = h.engine.attempt_payment(&alice, order.id, split(300, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::PaymentPasswordRequired));

    let mut request = split(300, 0);
    request.payment_password = Some(Masked("000000".to_string()));
    let err = h.engine.attempt_payment(&alice, order.id, request).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidPaymentPassword));

    let mut request = split(300, 0);
    request.payment_password = Some(Masked("135790".to_string()));
    h.engine.attempt_payment(&alice, order.id, request).await.unwrap();
    assert_eq!(h.balance(&alice).await, Money::ZERO);
    assert!(h.engine.wallet.verify_payment_password(&alice, "135790").await.unwrap());
}
