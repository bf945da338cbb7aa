use camper_catalog::LineItem;
use camper_core::{AccountId, ThirdPartyMethod};
use camper_shared::{Masked, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What is being bought. Drives whether a contract and a merchant
/// confirmation step are needed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    VehicleRental,
    CampBooking,
    TourPackage,
    CustomTour,
    MallProduct,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::VehicleRental => "VEHICLE_RENTAL",
            OrderType::CampBooking => "CAMP_BOOKING",
            OrderType::TourPackage => "TOUR_PACKAGE",
            OrderType::CustomTour => "CUSTOM_TOUR",
            OrderType::MallProduct => "MALL_PRODUCT",
        }
    }

    /// Template family used when a contract is generated for this order type.
    pub fn contract_type(&self) -> Option<ContractType> {
        match self {
            OrderType::VehicleRental => Some(ContractType::Rental),
            OrderType::CampBooking => Some(ContractType::Camp),
            OrderType::TourPackage | OrderType::CustomTour => Some(ContractType::Tour),
            OrderType::MallProduct => None,
        }
    }

    /// Orders of these types cannot be confirmed until their contract is signed.
    pub fn requires_contract(&self) -> bool {
        matches!(self, OrderType::VehicleRental | OrderType::CustomTour)
    }

    /// Orders of these types wait for the merchant after payment.
    pub fn requires_manual_confirmation(&self) -> bool {
        matches!(self, OrderType::VehicleRental | OrderType::CampBooking)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    PendingPayment,
    PendingConfirmation,
    InProgress,
    Completed,
    Cancelled,
    PendingRefund,
    Refunded,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::Draft,
        OrderStatus::PendingPayment,
        OrderStatus::PendingConfirmation,
        OrderStatus::InProgress,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::PendingRefund,
        OrderStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "DRAFT",
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::PendingConfirmation => "PENDING_CONFIRMATION",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::PendingRefund => "PENDING_REFUND",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactInfo {
    pub name: String,
    pub phone: Masked<String>,
}

/// A customer's purchase. The amount due is fixed at creation from the
/// pricing quote and never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: AccountId,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub items: Vec<LineItem>,
    pub applied_coupons: Vec<String>,
    pub insurance_id: Option<String>,
    pub subtotal: Money,
    pub discount: Money,
    pub insurance_fee: Money,
    pub amount_due: Money,
    pub amount_paid: Money,
    pub amount_refunded: Money,
    pub contract_id: Option<Uuid>,
    pub contact: Option<ContactInfo>,
    pub metadata: serde_json::Value,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// What still has to be paid before the order is settled.
    pub fn outstanding(&self) -> Money {
        let left = self.amount_due.checked_sub(self.amount_paid).unwrap_or(Money::ZERO);
        if left.is_negative() {
            Money::ZERO
        } else {
            left
        }
    }

    pub fn is_paid(&self) -> bool {
        self.amount_paid.is_positive()
    }

    /// Whether a payment attempt may currently be made against this order.
    pub fn accepts_payment(&self) -> bool {
        self.status == OrderStatus::PendingPayment
    }

    pub(crate) fn update_status(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Wallet account. `balance` is a cache of the ledger sum and is only ever
/// changed together with a ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Money,
    #[serde(skip_serializing)]
    pub payment_password_hash: Option<String>,
    #[serde(default, skip_serializing)]
    pub failed_password_attempts: u32,
    #[serde(default)]
    pub password_locked_until: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn open(id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: Money::ZERO,
            payment_password_hash: None,
            failed_password_attempts: 0,
            password_locked_until: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_payment_password(&self) -> bool {
        self.payment_password_hash.is_some()
    }

    pub fn password_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.password_locked_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Recharge,
    Withdraw,
    Payment,
    Refund,
    Commission,
    Bonus,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Recharge => "RECHARGE",
            TransactionKind::Withdraw => "WITHDRAW",
            TransactionKind::Payment => "PAYMENT",
            TransactionKind::Refund => "REFUND",
            TransactionKind::Commission => "COMMISSION",
            TransactionKind::Bonus => "BONUS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            TransactionKind::Recharge,
            TransactionKind::Withdraw,
            TransactionKind::Payment,
            TransactionKind::Refund,
            TransactionKind::Commission,
            TransactionKind::Bonus,
        ]
        .into_iter()
        .find(|k| k.as_str() == value)
    }
}

/// Append-only ledger entry. `amount` is signed: credits positive, debits
/// negative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub account_id: AccountId,
    pub kind: TransactionKind,
    pub amount: Money,
    pub balance_after: Money,
    pub related_order_id: Option<Uuid>,
    pub related_attempt_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Where one part of a payment is taken from. Also names the failing leg in
/// payment errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartChannel {
    Balance,
    ThirdParty,
}

impl PartChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartChannel::Balance => "BALANCE",
            PartChannel::ThirdParty => "THIRD_PARTY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentPart {
    pub channel: PartChannel,
    pub amount: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<ThirdPartyMethod>,
}

impl PaymentPart {
    pub fn balance(amount: Money) -> Self {
        Self { channel: PartChannel::Balance, amount, method: None }
    }

    pub fn third_party(amount: Money, method: ThirdPartyMethod) -> Self {
        Self { channel: PartChannel::ThirdParty, amount, method: Some(method) }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed,
    /// The third-party outcome is unknown (timeout, transport error). The
    /// balance leg stays debited until reconciliation decides.
    Unresolved,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "PENDING",
            AttemptStatus::Succeeded => "SUCCEEDED",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Unresolved => "UNRESOLVED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            AttemptStatus::Pending,
            AttemptStatus::Succeeded,
            AttemptStatus::Failed,
            AttemptStatus::Unresolved,
        ]
        .into_iter()
        .find(|s| s.as_str() == value)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, AttemptStatus::Pending | AttemptStatus::Unresolved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentFailure {
    pub leg: PartChannel,
    pub reason: String,
}

/// One try at settling an order, possibly split across balance and a
/// third-party channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub order_id: Uuid,
    pub account_id: AccountId,
    pub parts: Vec<PaymentPart>,
    pub status: AttemptStatus,
    pub external_transaction_id: Option<String>,
    pub balance_transaction_id: Option<Uuid>,
    pub compensation_transaction_id: Option<Uuid>,
    pub failure: Option<PaymentFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn new(order_id: Uuid, account_id: AccountId, parts: Vec<PaymentPart>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            account_id,
            parts,
            status: AttemptStatus::Pending,
            external_transaction_id: None,
            balance_transaction_id: None,
            compensation_transaction_id: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn balance_part(&self) -> Option<&PaymentPart> {
        self.parts.iter().find(|p| p.channel == PartChannel::Balance)
    }

    pub fn third_party_part(&self) -> Option<&PaymentPart> {
        self.parts.iter().find(|p| p.channel == PartChannel::ThirdParty)
    }

    pub fn balance_amount(&self) -> Money {
        self.balance_part().map(|p| p.amount).unwrap_or(Money::ZERO)
    }

    pub fn third_party_amount(&self) -> Money {
        self.third_party_part().map(|p| p.amount).unwrap_or(Money::ZERO)
    }

    pub fn total(&self) -> Money {
        Money::checked_sum(self.parts.iter().map(|p| p.amount)).unwrap_or(Money::ZERO)
    }

    pub(crate) fn set_status(&mut self, status: AttemptStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub(crate) fn fail(&mut self, leg: PartChannel, reason: impl Into<String>) {
        self.failure = Some(PaymentFailure { leg, reason: reason.into() });
        self.set_status(AttemptStatus::Failed);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RechargeStatus {
    Pending,
    Succeeded,
    Failed,
    /// The channel call timed out or failed in transport. Nothing has been
    /// credited; the recovery pass asks the channel what happened.
    Unresolved,
}

impl RechargeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RechargeStatus::Pending => "PENDING",
            RechargeStatus::Succeeded => "SUCCEEDED",
            RechargeStatus::Failed => "FAILED",
            RechargeStatus::Unresolved => "UNRESOLVED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            RechargeStatus::Pending,
            RechargeStatus::Succeeded,
            RechargeStatus::Failed,
            RechargeStatus::Unresolved,
        ]
        .into_iter()
        .find(|s| s.as_str() == value)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, RechargeStatus::Pending | RechargeStatus::Unresolved)
    }
}

/// A wallet top-up, recorded before the channel is charged. The channel
/// reference is derived from the id so a lost answer can be looked up later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeIntent {
    pub id: Uuid,
    pub account_id: AccountId,
    pub amount: Money,
    pub method: ThirdPartyMethod,
    pub status: RechargeStatus,
    pub external_transaction_id: Option<String>,
    pub ledger_transaction_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RechargeIntent {
    pub fn new(account_id: AccountId, amount: Money, method: ThirdPartyMethod) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            amount,
            method,
            status: RechargeStatus::Pending,
            external_transaction_id: None,
            ledger_transaction_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reference(&self) -> String {
        format!("recharge-{}", self.id)
    }

    pub(crate) fn set_status(&mut self, status: RechargeStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    Rental,
    Camp,
    Tour,
    Hosting,
    Crowdfunding,
    Purchase,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::Rental => "rental",
            ContractType::Camp => "camp",
            ContractType::Tour => "tour",
            ContractType::Hosting => "hosting",
            ContractType::Crowdfunding => "crowdfunding",
            ContractType::Purchase => "purchase",
        }
    }
}

/// Internal signing workflow status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractStatus {
    Generated,
    PendingSignature,
    Signed,
    Verified,
    Completed,
    Cancelled,
    Terminated,
    Superseded,
}

/// The coarser status reported to customers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DomainContractStatus {
    Pending,
    Active,
    Completed,
    Expired,
    Cancelled,
    Terminated,
}

impl ContractStatus {
    pub fn domain_status(&self) -> DomainContractStatus {
        match self {
            ContractStatus::Generated | ContractStatus::PendingSignature => DomainContractStatus::Pending,
            ContractStatus::Signed | ContractStatus::Verified => DomainContractStatus::Active,
            ContractStatus::Completed => DomainContractStatus::Completed,
            ContractStatus::Cancelled => DomainContractStatus::Cancelled,
            ContractStatus::Terminated => DomainContractStatus::Terminated,
            ContractStatus::Superseded => DomainContractStatus::Expired,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, ContractStatus::Signed | ContractStatus::Verified | ContractStatus::Completed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ContractStatus::Completed
                | ContractStatus::Cancelled
                | ContractStatus::Terminated
                | ContractStatus::Superseded
        )
    }
}

/// What the e-signature provider hands back once the customer has signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureArtifact {
    pub artifact_ref: String,
    /// Checksum of the content the signer saw.
    pub signed_checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: Uuid,
    pub order_id: Uuid,
    pub customer_id: AccountId,
    pub contract_type: ContractType,
    pub template_version: String,
    pub rendered_content: String,
    pub content_checksum: String,
    pub status: ContractStatus,
    pub signature_session_id: Option<Uuid>,
    pub signer_account_id: Option<AccountId>,
    pub signature: Option<SignatureArtifact>,
    pub signature_seal: Option<String>,
    pub needs_manual_review: bool,
    pub signed_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    pub(crate) fn set_status(&mut self, status: ContractStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Open,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSession {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub signer_account_id: AccountId,
    pub status: SessionStatus,
    pub artifact: Option<SignatureArtifact>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SignatureSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Expired || (self.status == SessionStatus::Open && now >= self.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_type_rules() {
        assert!(OrderType::VehicleRental.requires_contract());
        assert!(OrderType::VehicleRental.requires_manual_confirmation());
        assert!(OrderType::CustomTour.requires_contract());
        assert!(!OrderType::CustomTour.requires_manual_confirmation());
        assert!(!OrderType::CampBooking.requires_contract());
        assert!(OrderType::CampBooking.requires_manual_confirmation());
        assert_eq!(OrderType::MallProduct.contract_type(), None);
        assert_eq!(OrderType::TourPackage.contract_type(), Some(ContractType::Tour));
    }

    #[test]
    fn test_status_string_forms_match_serde() {
        for status in OrderStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_contract_domain_status() {
        assert_eq!(ContractStatus::PendingSignature.domain_status(), DomainContractStatus::Pending);
        assert_eq!(ContractStatus::Verified.domain_status(), DomainContractStatus::Active);
        assert_eq!(ContractStatus::Superseded.domain_status(), DomainContractStatus::Expired);
    }

    #[test]
    fn test_attempt_amounts() {
        let attempt = PaymentAttempt::new(
            Uuid::new_v4(),
            AccountId::new("user-1").unwrap(),
            vec![
                PaymentPart::balance(Money::from_minor(100)),
                PaymentPart::third_party(Money::from_minor(200), ThirdPartyMethod::Alipay),
            ],
        );
        assert_eq!(attempt.balance_amount(), Money::from_minor(100));
        assert_eq!(attempt.third_party_amount(), Money::from_minor(200));
        assert_eq!(attempt.total(), Money::from_minor(300));
        assert!(attempt.status.is_open());
    }

    #[test]
    fn test_recharge_intent_reference() {
        let intent = RechargeIntent::new(
            AccountId::new("user-1").unwrap(),
            Money::from_minor(500),
            ThirdPartyMethod::Wechat,
        );
        assert_eq!(intent.reference(), format!("recharge-{}", intent.id));
        assert!(intent.status.is_open());
        assert_eq!(RechargeStatus::parse("UNRESOLVED"), Some(RechargeStatus::Unresolved));
        assert!(!RechargeStatus::Succeeded.is_open());
    }

    #[test]
    fn test_account_hides_password_hash() {
        let mut account = Account::open(AccountId::new("user-1").unwrap());
        account.payment_password_hash = Some("deadbeef".to_string());
        let json = serde_json::to_value(&account).unwrap();
        assert!(json.get("payment_password_hash").is_none());
    }
}
