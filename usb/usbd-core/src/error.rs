use driver_udc::UDCError;
use thiserror::Error;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("operation not allowed in the current device state")]
    InvalidState,

    #[error("no such object")]
    InvalidHandle,

    #[error("object pool exhausted")]
    AllocationExhausted,

    #[error("no physical endpoint available")]
    NotAvailable,

    #[error("endpoint is not ready")]
    NotReady,

    #[error("object already exists")]
    AlreadyExists,

    #[error("transfer queue full")]
    Full,

    #[error("transfer timed out")]
    Timeout,

    #[error("transfer aborted")]
    Aborted,

    #[error("receive error")]
    Receive,

    #[error("transmit error")]
    Transmit,

    #[error("controller error: {0}")]
    Driver(#[from] UDCError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
