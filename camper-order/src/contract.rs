use camper_core::{AccountId, Caller};
use camper_shared::models::events::ContractSignedEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{
    Contract, ContractStatus, ContractType, Order, OrderStatus, SessionStatus, SignatureArtifact,
    SignatureSession,
};
use crate::repository::ChangeSet;

pub const TEMPLATE_VERSION: &str = "2024.06";

/// Metadata keys copied into the booking section when present.
const BOOKING_FIELDS: &[(&str, &str)] = &[
    ("start_date", "Start date"),
    ("end_date", "End date"),
    ("pickup_location", "Pick-up location"),
    ("return_location", "Return location"),
    ("camp_name", "Camp"),
    ("route", "Route"),
    ("travellers", "Travellers"),
];

pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Binds a signature artifact to one contract and signer.
pub fn signature_seal(contract_id: Uuid, signer: &AccountId, artifact: &SignatureArtifact) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contract_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(signer.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(artifact.signed_checksum.as_bytes());
    hasher.update(b"|");
    hasher.update(artifact.artifact_ref.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rendered contract text that has not been stored.
#[derive(Debug, Clone, Serialize)]
pub struct ContractPreview {
    pub contract_type: ContractType,
    pub template_version: String,
    pub content: String,
    pub content_checksum: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContractTemplates;

impl ContractTemplates {
    pub fn preview(&self, order: &Order) -> EngineResult<ContractPreview> {
        let contract_type = order
            .order_type
            .contract_type()
            .ok_or_else(|| EngineError::UnsupportedContractType(order.order_type.as_str().to_string()))?;
        let content = self.render_text(contract_type, order);
        Ok(ContractPreview {
            contract_type,
            template_version: TEMPLATE_VERSION.to_string(),
            content_checksum: checksum(&content),
            content,
        })
    }

    pub fn render(&self, order: &Order, now: DateTime<Utc>) -> EngineResult<Contract> {
        let preview = self.preview(order)?;
        Ok(Contract {
            id: Uuid::new_v4(),
            order_id: order.id,
            customer_id: order.customer_id.clone(),
            contract_type: preview.contract_type,
            template_version: preview.template_version,
            rendered_content: preview.content,
            content_checksum: preview.content_checksum,
            status: ContractStatus::Generated,
            signature_session_id: None,
            signer_account_id: None,
            signature: None,
            signature_seal: None,
            needs_manual_review: false,
            signed_at: None,
            verified_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn render_text(&self, contract_type: ContractType, order: &Order) -> String {
        let mut lines = vec![
            title(contract_type).to_string(),
            format!("Template {} / Order {}", TEMPLATE_VERSION, order.id),
            String::new(),
            format!("Customer: {}", order.customer_id),
        ];
        if let Some(contact) = &order.contact {
            lines.push(format!("Contact: {} {}", contact.name, contact.phone.expose()));
        }

        if let Some(meta) = order.metadata.as_object() {
            let booking: Vec<String> = BOOKING_FIELDS
                .iter()
                .filter_map(|(key, label)| {
                    let value = meta.get(*key)?;
                    let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                    Some(format!("  {}: {}", label, value))
                })
                .collect();
            if !booking.is_empty() {
                lines.push(String::new());
                lines.push("Booking".to_string());
                lines.extend(booking);
            }
        }

        lines.push(String::new());
        lines.push("Items".to_string());
        for item in &order.items {
            lines.push(format!("  {} x{} @ {}", item.name, item.quantity, item.unit_price));
        }
        lines.push(String::new());
        lines.push(format!("Subtotal: {}", order.subtotal));
        if order.discount.is_positive() {
            lines.push(format!("Discount: -{}", order.discount));
        }
        if order.insurance_fee.is_positive() {
            lines.push(format!("Insurance: {}", order.insurance_fee));
        }
        lines.push(format!("Total due: {}", order.amount_due));

        lines.push(String::new());
        lines.push("Terms".to_string());
        for (i, clause) in clauses(contract_type).iter().enumerate() {
            lines.push(format!("  {}. {}", i + 1, clause));
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

fn title(contract_type: ContractType) -> &'static str {
    match contract_type {
        ContractType::Rental => "RV Rental Agreement",
        ContractType::Camp => "Campsite Booking Agreement",
        ContractType::Tour => "Tour Service Agreement",
        ContractType::Hosting => "RV Hosting Agreement",
        ContractType::Crowdfunding => "Crowdfunding Participation Agreement",
        ContractType::Purchase => "Vehicle Purchase Agreement",
    }
}

fn clauses(contract_type: ContractType) -> &'static [&'static str] {
    match contract_type {
        ContractType::Rental => &[
            "The renter holds a valid driving licence for the vehicle class.",
            "The vehicle is returned with the fuel and water levels it was handed over with.",
            "Damage not covered by the selected insurance is charged to the renter.",
            "Late returns are charged per started day.",
        ],
        ContractType::Camp => &[
            "Check-in from 14:00, check-out by 12:00.",
            "Quiet hours apply from 22:00 to 07:00.",
            "Pitches are left clean; waste is disposed of at the camp's stations.",
        ],
        ContractType::Tour => &[
            "The itinerary may change for safety or weather reasons.",
            "Travellers follow the guide's instructions during activities.",
            "Cancellation terms follow the order's refund policy.",
        ],
        ContractType::Hosting => &[
            "The platform manages bookings for the hosted vehicle.",
            "Revenue is shared as stated in the hosting terms.",
        ],
        ContractType::Crowdfunding => &[
            "Contributions are used for the stated project only.",
            "Returns are not guaranteed.",
        ],
        ContractType::Purchase => &[
            "Ownership passes on full payment.",
            "The vehicle is delivered with its registration documents.",
        ],
    }
}

/// Generation, signing and verification of order contracts.
#[derive(Clone)]
pub struct ContractManager {
    ctx: Context,
    templates: ContractTemplates,
}

impl ContractManager {
    pub(crate) fn new(ctx: Context) -> Self {
        Self { ctx, templates: ContractTemplates }
    }

    /// Render the contract an order would get, without storing it.
    pub async fn preview(&self, caller: &Caller, order_id: Uuid) -> EngineResult<ContractPreview> {
        let order = self.ctx.load_order(order_id).await?;
        ensure_party(caller, &order.customer_id)?;
        self.templates.preview(&order)
    }

    /// Generate (or regenerate) the order's contract. The previous unsigned
    /// contract is superseded.
    pub async fn generate(&self, caller: &Caller, order_id: Uuid) -> EngineResult<Contract> {
        let _order_guard = self.ctx.locks.order(order_id).await;
        let mut order = self.ctx.load_order(order_id).await?;
        ensure_party(caller, &order.customer_id)?;
        if !matches!(
            order.status,
            OrderStatus::PendingPayment | OrderStatus::PendingConfirmation | OrderStatus::InProgress
        ) {
            return Err(EngineError::StateConflict(format!(
                "cannot generate a contract for order {} in status {}",
                order.id,
                order.status.as_str()
            )));
        }

        let mut changes = ChangeSet::default();
        let _previous_guard = match order.contract_id {
            Some(previous_id) => {
                let guard = self.ctx.locks.contract(previous_id).await;
                let mut previous = self.ctx.load_contract(previous_id).await?;
                if previous.status.is_signed() {
                    return Err(EngineError::ContractAlreadySigned(previous_id));
                }
                if !previous.status.is_closed() {
                    previous.set_status(ContractStatus::Superseded);
                    changes.put_contract(&previous);
                }
                Some(guard)
            }
            None => None,
        };

        let now = Utc::now();
        let contract = self.templates.render(&order, now)?;
        order.contract_id = Some(contract.id);
        order.updated_at = now;
        changes.put_contract(&contract);
        changes.put_order(&order);
        self.ctx.commit(changes).await?;

        info!("Generated {} contract {} for order {}", contract.contract_type.as_str(), contract.id, order.id);
        Ok(contract)
    }

    pub async fn get_contract(&self, caller: &Caller, contract_id: Uuid) -> EngineResult<Contract> {
        let contract = self.ctx.load_contract(contract_id).await?;
        ensure_party(caller, &contract.customer_id)?;
        Ok(contract)
    }

    /// Customers see their own contracts; operators may list anyone's.
    pub async fn list_contracts(
        &self,
        caller: &Caller,
        customer_id: Option<AccountId>,
    ) -> EngineResult<Vec<Contract>> {
        let customer = if caller.is_operator() {
            customer_id
        } else {
            Some(caller.account_id.clone())
        };
        Ok(self.ctx.repo.list_contracts(customer.as_ref()).await?)
    }

    pub async fn open_signature_session(
        &self,
        caller: &Caller,
        contract_id: Uuid,
        signer: AccountId,
    ) -> EngineResult<SignatureSession> {
        let order_id = self.ctx.load_contract(contract_id).await?.order_id;
        let _order_guard = self.ctx.locks.order(order_id).await;
        let _contract_guard = self.ctx.locks.contract(contract_id).await;
        let mut contract = self.ctx.load_contract(contract_id).await?;

        ensure_party(caller, &contract.customer_id)?;
        if signer != contract.customer_id {
            return Err(EngineError::Forbidden(format!(
                "{} is not a party to contract {}",
                signer, contract_id
            )));
        }
        if contract.status.is_signed() {
            return Err(EngineError::ContractAlreadySigned(contract_id));
        }
        if contract.status.is_closed() {
            return Err(EngineError::StateConflict(format!(
                "contract {} is {:?}",
                contract_id, contract.status
            )));
        }

        let now = Utc::now();
        let mut changes = ChangeSet::default();
        for mut session in self.ctx.repo.list_sessions_for_contract(contract_id).await? {
            if session.status != SessionStatus::Open {
                continue;
            }
            if session.is_expired_at(now) {
                session.status = SessionStatus::Expired;
                changes.put_session(&session);
            } else {
                return Err(EngineError::SessionAlreadyOpen(contract_id));
            }
        }

        let session = SignatureSession {
            id: Uuid::new_v4(),
            contract_id,
            signer_account_id: signer,
            status: SessionStatus::Open,
            artifact: None,
            expires_at: now + self.ctx.config.signature_session_ttl,
            completed_at: None,
            created_at: now,
        };
        contract.signature_session_id = Some(session.id);
        contract.set_status(ContractStatus::PendingSignature);
        changes.put_session(&session);
        changes.put_contract(&contract);
        self.ctx.commit(changes).await?;

        info!("Opened signature session {} for contract {}", session.id, contract_id);
        Ok(session)
    }

    pub async fn complete_signature(
        &self,
        caller: &Caller,
        session_id: Uuid,
        artifact: SignatureArtifact,
    ) -> EngineResult<Contract> {
        let contract_id = self
            .ctx
            .repo
            .get_session(session_id)
            .await?
            .ok_or(EngineError::SessionNotFound(session_id))?
            .contract_id;
        let order_id = self.ctx.load_contract(contract_id).await?.order_id;
        let _order_guard = self.ctx.locks.order(order_id).await;
        let _contract_guard = self.ctx.locks.contract(contract_id).await;

        let mut session = self
            .ctx
            .repo
            .get_session(session_id)
            .await?
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let mut contract = self.ctx.load_contract(contract_id).await?;

        if !caller.can_act_for(&session.signer_account_id) {
            return Err(EngineError::Forbidden(format!(
                "session {} belongs to another signer",
                session_id
            )));
        }

        let now = Utc::now();
        match session.status {
            SessionStatus::Completed => return Ok(contract),
            SessionStatus::Expired => return Err(EngineError::SessionExpired(session_id)),
            SessionStatus::Open if session.is_expired_at(now) => {
                session.status = SessionStatus::Expired;
                let mut changes = ChangeSet::default();
                changes.put_session(&session);
                self.ctx.commit(changes).await?;
                return Err(EngineError::SessionExpired(session_id));
            }
            SessionStatus::Open => {}
        }

        if contract.status != ContractStatus::PendingSignature || contract.signature_session_id != Some(session_id) {
            return Err(EngineError::StateConflict(format!(
                "contract {} is not awaiting signature session {}",
                contract_id, session_id
            )));
        }
        if artifact.artifact_ref.trim().is_empty() || artifact.signed_checksum.trim().is_empty() {
            return Err(EngineError::Validation(
                "signature artifact needs a reference and a signed checksum".to_string(),
            ));
        }

        let seal = signature_seal(contract_id, &session.signer_account_id, &artifact);
        session.status = SessionStatus::Completed;
        session.artifact = Some(artifact.clone());
        session.completed_at = Some(now);
        contract.signer_account_id = Some(session.signer_account_id.clone());
        contract.signature = Some(artifact);
        contract.signature_seal = Some(seal);
        contract.signed_at = Some(now);
        contract.set_status(ContractStatus::Signed);

        let mut changes = ChangeSet::default();
        changes.put_session(&session);
        changes.put_contract(&contract);
        self.ctx.commit(changes).await?;

        info!("Contract {} signed by {}", contract_id, session.signer_account_id);
        self.ctx.publish(vec![signed_event(&contract, false)]).await;
        Ok(contract)
    }

    /// Check the stored signature against the rendered content. A mismatch
    /// leaves the contract SIGNED and flags it for manual review.
    pub async fn verify(&self, caller: &Caller, contract_id: Uuid) -> EngineResult<Contract> {
        let order_id = self.ctx.load_contract(contract_id).await?.order_id;
        let _order_guard = self.ctx.locks.order(order_id).await;
        let _contract_guard = self.ctx.locks.contract(contract_id).await;
        let mut contract = self.ctx.load_contract(contract_id).await?;
        ensure_party(caller, &contract.customer_id)?;

        match contract.status {
            ContractStatus::Verified | ContractStatus::Completed => return Ok(contract),
            ContractStatus::Signed => {}
            other => {
                return Err(EngineError::StateConflict(format!(
                    "contract {} cannot be verified in status {:?}",
                    contract_id, other
                )))
            }
        }

        if signature_holds(&contract) {
            contract.verified_at = Some(Utc::now());
            contract.needs_manual_review = false;
            contract.set_status(ContractStatus::Verified);
            let mut changes = ChangeSet::default();
            changes.put_contract(&contract);
            self.ctx.commit(changes).await?;
            info!("Contract {} verified", contract_id);
            self.ctx.publish(vec![signed_event(&contract, true)]).await;
            Ok(contract)
        } else {
            contract.needs_manual_review = true;
            contract.updated_at = Utc::now();
            let mut changes = ChangeSet::default();
            changes.put_contract(&contract);
            self.ctx.commit(changes).await?;
            error!("Signature verification failed for contract {}", contract_id);
            Err(EngineError::SignatureVerificationFailed(contract_id))
        }
    }
}

fn signature_holds(contract: &Contract) -> bool {
    let (Some(signer), Some(artifact), Some(seal)) =
        (&contract.signer_account_id, &contract.signature, &contract.signature_seal)
    else {
        return false;
    };
    checksum(&contract.rendered_content) == contract.content_checksum
        && artifact.signed_checksum == contract.content_checksum
        && &signature_seal(contract.id, signer, artifact) == seal
}

fn ensure_party(caller: &Caller, owner: &AccountId) -> EngineResult<()> {
    if caller.can_act_for(owner) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(format!("{} may not act for {}", caller.account_id, owner)))
    }
}

fn signed_event(contract: &Contract, verified: bool) -> DomainEvent {
    DomainEvent::ContractSigned(ContractSignedEvent {
        contract_id: contract.id,
        order_id: contract.order_id,
        signer_account_id: contract
            .signer_account_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default(),
        verified,
        timestamp: Utc::now().timestamp(),
    })
}
