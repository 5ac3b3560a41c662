use std::convert::Infallible;

use sled::transaction::TransactionError;

/// Problems with caller supplied input, raised before any store access.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("action must be 'accept' or 'reject', got '{0}'")]
    UnknownAction(String),
    #[error("Amount must be greater than zero")]
    ZeroAmount,
    #[error("Item count must be greater than zero")]
    ZeroCount,
    #[error("{0} contains a reserved character")]
    ReservedCharacter(&'static str),
    #[error("Name must be at least 2 characters")]
    NameTooShort,
    #[error("Valid email required")]
    InvalidEmail,
}

#[derive(thiserror::Error, Debug)]
pub enum DistributionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("{0}")]
    Internal(String),
}

/// Status classification reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Forbidden,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }
}

impl DistributionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DistributionError::Validation(_) => ErrorKind::InvalidInput,
            DistributionError::Forbidden(_) => ErrorKind::Forbidden,
            DistributionError::NotFound(_) => ErrorKind::NotFound,
            DistributionError::Conflict(_) => ErrorKind::Conflict,
            DistributionError::Storage(_)
            | DistributionError::Encode(_)
            | DistributionError::Decode(_)
            | DistributionError::Internal(_) => ErrorKind::Internal,
        }
    }
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}

impl From<TransactionError<DistributionError>> for DistributionError {
    fn from(value: TransactionError<DistributionError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => DistributionError::Storage(err),
        }
    }
}
