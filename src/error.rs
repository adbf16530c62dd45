use std::fmt::Display;

/// Penciller errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid data, typically decoding errors, checksum mismatches, or
    /// unexpected internal values.
    InvalidData(String),
    /// An IO error.
    IO(String),
    /// A point lookup was attempted with a key the codec declines to hash.
    NotLookupable,
    /// A pushed batch carried a max SQN below the current ledger SQN. The
    /// upstream journal owns SQN assignment; a regression is a contract
    /// violation.
    SqnRegression { pushed: u64, ledger: u64 },
    /// The penciller has shut down and can no longer service requests.
    Closed,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotLookupable => write!(f, "key is not point-lookable"),
            Error::SqnRegression { pushed, ledger } => {
                write!(f, "sqn regression: pushed max {pushed} below ledger {ledger}")
            }
            Error::Closed => write!(f, "penciller is closed"),
        }
    }
}

/// A penciller Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
