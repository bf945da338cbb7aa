pub mod identity;
pub mod payment;

pub use identity::{AccountId, Caller, CallerRole};
pub use payment::{
    ChannelError, ChargeOutcome, ChargeRequest, ChargeStatus, PaymentChannel, RefundOutcome,
    SandboxChannel, ThirdPartyMethod,
};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Identity verification failed: {0}")]
    IdentityError(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
