use thiserror::Error;

/// Recoverable-error families from the client's state-machine/codec/store
/// layer. Programming invariants (state outside the defined set) panic
/// instead of flowing through here — see `machine::Client::handle`.
#[derive(Error, Debug)]
pub enum DhcpError {
    #[error("wire codec error: {0}")]
    Wire(String),

    #[error("lease store error: {0}")]
    LeaseStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configurator error: {0}")]
    Configurator(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("option validation error: {0}")]
    Validation(#[from] crate::validate::ValidationError),
}

pub type Result<T> = std::result::Result<T, DhcpError>;
