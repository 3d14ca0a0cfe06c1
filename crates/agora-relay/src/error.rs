use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Outbox(#[from] agora_outbox::OutboxError),

    #[error(transparent)]
    Broker(#[from] agora_broker::BrokerError),
}

pub type RelayResult<T> = Result<T, RelayError>;
