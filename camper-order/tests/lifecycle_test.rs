mod common;

use camper_core::{ChargeStatus, ThirdPartyMethod};
use camper_order::{
    ContractStatus, DomainContractStatus, DomainEvent, EngineError, EngineRepository, ErrorKind,
    OrderFilter, OrderStatus, OrderType, Page, RechargeStatus, SignatureArtifact, TransactionKind,
    MAX_PASSWORD_FAILURES,
};
use camper_shared::Money;
use common::{customer, harness, harness_with, operator, order_request, split, test_config, Script};

#[tokio::test]
async fn test_contract_gates_confirmation() {
    let h = harness();
    let alice = customer("alice");
    let ops = operator();

    let order = h.engine.create_order(&alice, order_request(OrderType::VehicleRental, 88000, 3)).await.unwrap();
    let contract_id = order.contract_id.expect("rental orders get a contract");
    let paid = h.engine.attempt_payment(&alice, order.id, split(0, 264000)).await.unwrap();
    assert_eq!(paid.order.status, OrderStatus::PendingConfirmation);

    let err = h.engine.confirm_order(&ops, order.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    let contract = h.sign_and_verify(&alice, contract_id).await;
    assert_eq!(contract.status, ContractStatus::Verified);
    assert_eq!(contract.status.domain_status(), DomainContractStatus::Active);

    let confirmed = h.engine.confirm_order(&ops, order.id).await.unwrap();
    assert_eq!(confirmed.status, OrderStatus::InProgress);
    // Confirming again returns the same order.
    let again = h.engine.confirm_order(&ops, order.id).await.unwrap();
    assert_eq!(again.status, OrderStatus::InProgress);

    let done = h.engine.complete_order(&ops, order.id).await.unwrap();
    assert_eq!(done.status, OrderStatus::Completed);
    let contract = h.engine.get_contract(&alice, contract_id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Completed);
}

#[tokio::test]
async fn test_signed_contract_clears_when_policy_allows() {
    let mut config = test_config();
    config.accept_signed_contracts = true;
    let h = harness_with(config);
    let alice = customer("alice");

    let order = h.engine.create_order(&alice, order_request(OrderType::CustomTour, 5000, 2)).await.unwrap();
    h.sign(&alice, order.contract_id.unwrap()).await;

    // Custom tours need no merchant step, so a signed contract lets payment finish the order.
    let paid = h.engine.attempt_payment(&alice, order.id, split(0, 10000)).await.unwrap();
    assert_eq!(paid.order.status, OrderStatus::InProgress);
}

#[tokio::test]
async fn test_unsigned_custom_tour_waits_for_contract() {
    let h = harness();
    let alice = customer("alice");

    let order = h.engine.create_order(&alice, order_request(OrderType::CustomTour, 5000, 2)).await.unwrap();
    let paid = h.engine.attempt_payment(&alice, order.id, split(0, 10000)).await.unwrap();
    assert_eq!(paid.order.status, OrderStatus::PendingConfirmation);
}

#[tokio::test]
async fn test_customers_cannot_operate() {
    let h = harness();
    let alice = customer("alice");
    let bob = customer("bob");
    let order = h.engine.create_order(&alice, order_request(OrderType::CampBooking, 300, 1)).await.unwrap();

    assert_eq!(h.engine.confirm_order(&alice, order.id).await.unwrap_err().kind(), ErrorKind::Forbidden);
    assert_eq!(h.engine.complete_order(&alice, order.id).await.unwrap_err().kind(), ErrorKind::Forbidden);
    assert_eq!(h.engine.get_order(&bob, order.id).await.unwrap_err().kind(), ErrorKind::Forbidden);
    assert_eq!(
        h.engine.cancel_order(&bob, order.id, None).await.unwrap_err().kind(),
        ErrorKind::Forbidden
    );
}

#[tokio::test]
async fn test_no_shortcut_to_completion() {
    let h = harness();
    let alice = customer("alice");
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();

    let err = h.engine.complete_order(&operator(), order.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
    let order = h.engine.get_order(&alice, order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
}

#[tokio::test]
async fn test_zero_amount_orders() {
    let h = harness();
    let alice = customer("alice");

    let mall = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 0, 1)).await.unwrap();
    assert_eq!(mall.status, OrderStatus::InProgress);

    let camp = h.engine.create_order(&alice, order_request(OrderType::CampBooking, 0, 2)).await.unwrap();
    assert_eq!(camp.status, OrderStatus::PendingConfirmation);
    let err = h.engine.attempt_payment(&alice, camp.id, split(0, 100)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
}

#[tokio::test]
async fn test_invalid_pricing_creates_nothing() {
    let h = harness();
    let alice = customer("alice");
    let err = h
        .engine
        .create_order(&alice, order_request(OrderType::MallProduct, 300, 0))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidPricingInput);
    assert!(h.engine.list_orders(&alice, OrderFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_coupon_is_applied_at_creation() {
    let h = harness();
    let alice = customer("alice");
    let mut request = order_request(OrderType::TourPackage, 300, 1);
    request.coupon_ids.insert("WELCOME50".to_string());

    let order = h.engine.create_order(&alice, request).await.unwrap();
    assert_eq!(order.discount, Money::from_minor(50));
    assert_eq!(order.amount_due, Money::from_minor(250));
    assert_eq!(order.applied_coupons, vec!["WELCOME50".to_string()]);
}

#[tokio::test]
async fn test_cancel_unpaid_order_cancels_contract() {
    let h = harness();
    let alice = customer("alice");
    let order = h.engine.create_order(&alice, order_request(OrderType::VehicleRental, 1000, 1)).await.unwrap();

    let cancelled = h.engine.cancel_order(&alice, order.id, Some("plans changed".to_string())).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("plans changed"));

    let contract = h.engine.get_contract(&alice, order.contract_id.unwrap()).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Cancelled);

    // Cancelling twice is harmless.
    let again = h.engine.cancel_order(&alice, order.id, None).await.unwrap();
    assert_eq!(again.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_paid_order_refunds_both_portions() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 150).await;
    let order = h.engine.create_order(&alice, order_request(OrderType::TourPackage, 300, 1)).await.unwrap();
    let paid = h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap();
    assert_eq!(h.balance(&alice).await, Money::from_minor(50));

    let refunded = h.engine.cancel_order(&alice, order.id, None).await.unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert_eq!(refunded.amount_refunded, Money::from_minor(300));
    assert_eq!(h.balance(&alice).await, Money::from_minor(150));

    let refund_requests: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            DomainEvent::RefundRequested(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(refund_requests.len(), 1);
    assert_eq!(refund_requests[0].amount, Money::from_minor(200));
    assert_eq!(Some(refund_requests[0].external_transaction_id.clone()), paid.attempt.external_transaction_id);
    assert_eq!(refund_requests[0].method, ThirdPartyMethod::Wechat.as_str());

    let kinds: Vec<_> = h.ledger(&alice).await.iter().map(|tx| tx.kind).collect();
    assert_eq!(kinds, vec![TransactionKind::Bonus, TransactionKind::Payment, TransactionKind::Refund]);
    h.engine.ledger.verify_balance(&alice.account_id).await.unwrap();
}

#[tokio::test]
async fn test_reject_paid_booking_refunds() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 300).await;
    let order = h.engine.create_order(&alice, order_request(OrderType::CampBooking, 300, 1)).await.unwrap();
    let paid = h.engine.attempt_payment(&alice, order.id, split(300, 0)).await.unwrap();
    assert_eq!(paid.order.status, OrderStatus::PendingConfirmation);

    let rejected = h
        .engine
        .reject_order(&operator(), order.id, Some("camp full".to_string()))
        .await
        .unwrap();
    assert_eq!(rejected.status, OrderStatus::Refunded);
    assert_eq!(h.balance(&alice).await, Money::from_minor(300));
}

#[tokio::test]
async fn test_cancel_settles_in_flight_payment_first() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 100).await;
    h.channel.push(Script::Transport("gateway reset".to_string()));
    let order = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 300, 1)).await.unwrap();
    h.engine.attempt_payment(&alice, order.id, split(100, 200)).await.unwrap_err();
    assert_eq!(h.balance(&alice).await, Money::ZERO);

    // The channel never saw the charge, so cancelling returns the balance leg.
    let cancelled = h.engine.cancel_order(&alice, order.id, None).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(h.balance(&alice).await, Money::from_minor(100));
}

#[tokio::test]
async fn test_signature_session_rules() {
    let h = harness();
    let alice = customer("alice");
    let bob = customer("bob");
    let order = h.engine.create_order(&alice, order_request(OrderType::VehicleRental, 1000, 1)).await.unwrap();
    let contract_id = order.contract_id.unwrap();

    let err = h
        .engine
        .open_signature_session(&alice, contract_id, bob.account_id.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let session = h
        .engine
        .open_signature_session(&alice, contract_id, alice.account_id.clone())
        .await
        .unwrap();
    let err = h
        .engine
        .open_signature_session(&alice, contract_id, alice.account_id.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionAlreadyOpen(_)));

    let contract = h.engine.get_contract(&alice, contract_id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::PendingSignature);
    let artifact = SignatureArtifact {
        artifact_ref: "esign://abc".to_string(),
        signed_checksum: contract.content_checksum.clone(),
    };
    let signed = h.engine.complete_signature(&alice, session.id, artifact.clone()).await.unwrap();
    assert_eq!(signed.status, ContractStatus::Signed);
    let repeat = h.engine.complete_signature(&alice, session.id, artifact).await.unwrap();
    assert_eq!(repeat.status, ContractStatus::Signed);

    let err = h.engine.generate_contract(&alice, order.id).await.unwrap_err();
    assert!(matches!(err, EngineError::ContractAlreadySigned(_)));
    let err = h
        .engine
        .open_signature_session(&alice, contract_id, alice.account_id.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ContractAlreadySigned(_)));
}

#[tokio::test]
async fn test_expired_session_cannot_complete() {
    let mut config = test_config();
    config.signature_session_ttl = chrono::Duration::zero();
    let h = harness_with(config);
    let alice = customer("alice");
    let order = h.engine.create_order(&alice, order_request(OrderType::CustomTour, 1000, 1)).await.unwrap();
    let contract_id = order.contract_id.unwrap();

    let session = h
        .engine
        .open_signature_session(&alice, contract_id, alice.account_id.clone())
        .await
        .unwrap();
    let err = h
        .engine
        .complete_signature(
            &alice,
            session.id,
            SignatureArtifact { artifact_ref: "esign://1".to_string(), signed_checksum: "x".to_string() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionExpired(_)));

    // A fresh session replaces the expired one.
    h.engine
        .open_signature_session(&alice, contract_id, alice.account_id.clone())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_mismatched_signature_needs_manual_review() {
    let h = harness();
    let alice = customer("alice");
    let order = h.engine.create_order(&alice, order_request(OrderType::VehicleRental, 1000, 1)).await.unwrap();
    let contract_id = order.contract_id.unwrap();

    let session = h
        .engine
        .open_signature_session(&alice, contract_id, alice.account_id.clone())
        .await
        .unwrap();
    h.engine
        .complete_signature(
            &alice,
            session.id,
            SignatureArtifact {
                artifact_ref: "esign://2".to_string(),
                signed_checksum: "checksum-of-an-older-draft".to_string(),
            },
        )
        .await
        .unwrap();

    let err = h.engine.verify_contract_signature(&alice, contract_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SignatureVerificationFailed);
    let contract = h.engine.get_contract(&alice, contract_id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Signed);
    assert!(contract.needs_manual_review);
}

#[tokio::test]
async fn test_regenerate_supersedes_unsigned_contract() {
    let h = harness();
    let alice = customer("alice");
    let order = h.engine.create_order(&alice, order_request(OrderType::VehicleRental, 1000, 1)).await.unwrap();
    let first = order.contract_id.unwrap();

    let second = h.engine.generate_contract(&alice, order.id).await.unwrap();
    assert_ne!(second.id, first);
    let old = h.engine.get_contract(&alice, first).await.unwrap();
    assert_eq!(old.status, ContractStatus::Superseded);
    assert_eq!(h.engine.get_order(&alice, order.id).await.unwrap().contract_id, Some(second.id));

    let mall = h.engine.create_order(&alice, order_request(OrderType::MallProduct, 10, 1)).await.unwrap();
    let err = h.engine.generate_contract(&alice, mall.id).await.unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedContractType(_)));

    let listed = h.engine.list_contracts(&alice, None).await.unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn test_list_orders_filters_and_scopes() {
    let h = harness();
    let alice = customer("alice");
    let bob = customer("bob");
    h.engine.create_order(&alice, order_request(OrderType::MallProduct, 10, 1)).await.unwrap();
    h.engine.create_order(&alice, order_request(OrderType::CampBooking, 10, 1)).await.unwrap();
    h.engine.create_order(&bob, order_request(OrderType::MallProduct, 10, 1)).await.unwrap();

    let mine = h.engine.list_orders(&alice, OrderFilter::default()).await.unwrap();
    assert_eq!(mine.len(), 2);

    let camp = OrderFilter { order_type: Some(OrderType::CampBooking), ..Default::default() };
    assert_eq!(h.engine.list_orders(&alice, camp).await.unwrap().len(), 1);

    let everyone = h.engine.list_orders(&operator(), OrderFilter::default()).await.unwrap();
    assert_eq!(everyone.len(), 3);

    let paged = OrderFilter { page: Some(Page::new(2, 2)), ..Default::default() };
    assert_eq!(h.engine.list_orders(&operator(), paged).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_wallet_recharge_and_withdraw() {
    let h = harness();
    let alice = customer("alice");

    let tx = h
        .engine
        .wallet
        .recharge(&alice, Money::from_minor(1000), ThirdPartyMethod::Alipay)
        .await
        .unwrap();
    assert_eq!(tx.kind, TransactionKind::Recharge);
    assert_eq!(h.balance(&alice).await, Money::from_minor(1000));

    h.channel.push(Script::Decline("limit".to_string()));
    let err = h
        .engine
        .wallet
        .recharge(&alice, Money::from_minor(500), ThirdPartyMethod::Alipay)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalChannelError);
    assert_eq!(h.balance(&alice).await, Money::from_minor(1000));

    let err = h.engine.wallet.withdraw(&alice, Money::from_minor(5000), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBalance);

    h.engine.wallet.withdraw(&alice, Money::from_minor(400), None).await.unwrap();
    assert_eq!(h.balance(&alice).await, Money::from_minor(600));
    assert!(h.events.topics().contains(&"wallet.withdrawal_requested"));

    let summary = h.engine.wallet.summary(&alice).await.unwrap();
    assert_eq!(summary.balance, Money::from_minor(600));
    assert!(!summary.has_payment_password);
    h.engine.ledger.verify_balance(&alice.account_id).await.unwrap();
}

#[tokio::test]
async fn test_recharge_answered_after_timeout_is_credited_by_recovery() {
    let h = harness();
    let alice = customer("alice");

    // The channel takes the money but answers after the 50ms timeout.
    h.channel.push(Script::Hang);
    let err = h
        .engine
        .wallet
        .recharge(&alice, Money::from_minor(500), ThirdPartyMethod::Wechat)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExternalChannel { outcome_unknown: true, .. }));
    assert_eq!(h.balance(&alice).await, Money::ZERO);
    assert!(h.events.topics().contains(&"payments.reconciliation_required"));

    let open = h.repo.list_open_recharges().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, RechargeStatus::Unresolved);
    let reference = h.channel.charges()[0].reference.clone();
    assert_eq!(reference, open[0].reference());
    h.channel.set_status(
        reference,
        ChargeStatus::Succeeded { external_transaction_id: "wx_late".to_string() },
    );

    let report = h.engine.run_recovery().await;
    assert_eq!(report.recharges_credited, vec![open[0].id]);
    assert!(report.is_clean());
    assert_eq!(h.balance(&alice).await, Money::from_minor(500));

    let again = h.engine.run_recovery().await;
    assert!(again.recharges_credited.is_empty());
    assert_eq!(h.balance(&alice).await, Money::from_minor(500));
    let recharges: Vec<_> = h
        .ledger(&alice)
        .await
        .into_iter()
        .filter(|tx| tx.kind == TransactionKind::Recharge)
        .collect();
    assert_eq!(recharges.len(), 1);

    let intent = h.repo.get_recharge(open[0].id).await.unwrap().unwrap();
    assert_eq!(intent.status, RechargeStatus::Succeeded);
    assert_eq!(intent.external_transaction_id.as_deref(), Some("wx_late"));
    assert_eq!(intent.ledger_transaction_id, Some(recharges[0].id));
    h.engine.ledger.verify_balance(&alice.account_id).await.unwrap();
}

#[tokio::test]
async fn test_recharge_with_unknown_outcome_is_reported_until_settled() {
    let h = harness();
    let alice = customer("alice");

    h.channel.push(Script::Transport("connection reset".to_string()));
    h.engine
        .wallet
        .recharge(&alice, Money::from_minor(300), ThirdPartyMethod::Alipay)
        .await
        .unwrap_err();
    let reference = h.channel.charges()[0].reference.clone();

    // The channel says the charge is still pending.
    h.channel.set_status(reference.clone(), ChargeStatus::Pending);
    let report = h.engine.run_recovery().await;
    assert_eq!(report.recharges_unresolved.len(), 1);
    assert!(!report.is_clean());
    assert_eq!(h.balance(&alice).await, Money::ZERO);

    h.channel.set_status(reference, ChargeStatus::Failed { reason: "expired".to_string() });
    let report = h.engine.run_recovery().await;
    assert_eq!(report.recharges_failed.len(), 1);
    assert!(report.is_clean());
    assert_eq!(h.balance(&alice).await, Money::ZERO);
    assert!(h.repo.list_open_recharges().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_payment_password_locks_after_repeated_failures() {
    let h = harness();
    let alice = customer("alice");
    h.fund(&alice, 1000).await;
    h.engine.wallet.set_payment_password(&alice, "135790", "135790").await.unwrap();

    for _ in 0..MAX_PASSWORD_FAILURES - 1 {
        assert!(!h.engine.wallet.verify_payment_password(&alice, "000000").await.unwrap());
    }
    let err = h
        .engine
        .wallet
        .withdraw(&alice, Money::from_minor(100), Some("000000"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPaymentPassword));

    // Locked now: even the right password is refused and nothing is debited.
    let err = h
        .engine
        .wallet
        .withdraw(&alice, Money::from_minor(100), Some("135790"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = h.engine.wallet.verify_payment_password(&alice, "135790").await.unwrap_err();
    assert!(matches!(err, EngineError::PaymentPasswordLocked { .. }));
    assert_eq!(h.balance(&alice).await, Money::from_minor(1000));

    // Setting a new password clears the lock.
    h.engine.wallet.set_payment_password(&alice, "246802", "246802").await.unwrap();
    h.engine.wallet.withdraw(&alice, Money::from_minor(100), Some("246802")).await.unwrap();
    assert_eq!(h.balance(&alice).await, Money::from_minor(900));
}
