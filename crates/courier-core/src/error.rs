use thiserror::Error;

use crate::app::BuildError;
use crate::config::ConfigError;
use crate::ports::{BrokerError, ResultStoreError};
use crate::typed::{CodecError, RegistryError};

/// Errors surfaced to callers of the library API (gateway, builder, config).
///
/// Task failures never show up here; they become `ExecutionOutcome::Failure`.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("result store: {0}")]
    ResultStore(#[from] ResultStoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Codec(CodecError::Malformed(err))
    }
}
