pub mod contract;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod locks;
pub mod manager;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod recovery;
pub mod repository;
pub mod wallet;

mod context;

pub use contract::{ContractManager, ContractPreview, ContractTemplates, TEMPLATE_VERSION};
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use events::{DomainEvent, EventPublisher, NoopPublisher, RecordingPublisher};
pub use ledger::Ledger;
pub use manager::{CreateOrderRequest, OrderEvent, OrderManager, OrderStateMachine};
pub use memory::InMemoryRepository;
pub use models::*;
pub use orchestrator::{
    ChannelOutcome, PaymentConfirmation, PaymentOrchestrator, PaymentRequest, PaymentResolution,
};
pub use recovery::{RecoveryPass, RecoveryReport};
pub use repository::{
    ChangeSet, EngineRepository, OrderFilter, Page, RepoError, RepoResult, TransactionFilter,
};
pub use wallet::{RechargeSettlement, WalletService, WalletSummary, MAX_PASSWORD_FAILURES};
