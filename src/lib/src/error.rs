/// The certificate store error type.
#[derive(Debug, thiserror::Error)]
pub enum CSError {
    #[error("Internal error: [{0}]")]
    InternalError(String),

    #[error("Store initialization failed: {0}")]
    InitFailure(String),

    #[error("Certificate store is not ready")]
    NotReady,

    #[error("I/O error")]
    IOError(#[from] std::io::Error),

    #[error("Stream is not open")]
    NotOpen,

    #[error("Short read (expected {expected} bytes, got {actual})")]
    ShortRead { expected: usize, actual: usize },

    #[error("Storage busy, try again")]
    WouldBlock,

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Certificate too large ({length} bytes, max: {max})")]
    CertificateTooLarge { length: usize, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Usage error: {0}")]
    UsageError(&'static str),
}

impl CSError {
    /// Storage-level failures: the lookup could not be completed.
    ///
    /// Callers must refuse the connection on these, but should report them
    /// differently from an unknown issuer.
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            CSError::IOError(_)
                | CSError::NotOpen
                | CSError::ShortRead { .. }
                | CSError::WouldBlock
                | CSError::Corrupt(_)
                | CSError::NotReady
        )
    }

    /// The stored certificate could not be turned into a trust anchor.
    pub fn is_parse_failure(&self) -> bool {
        matches!(
            self,
            CSError::ParseError(_)
                | CSError::UnsupportedAlgorithm(_)
                | CSError::CertificateTooLarge { .. }
        )
    }
}
