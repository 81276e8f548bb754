#![forbid(unsafe_code)]

use thiserror::Error;

/// Error enumerates the errors returned by this application.
#[derive(Error, Debug)]
pub enum Errors {
    /// Input parameter logging.
    #[error("formstore_server input parameters:\n{}", .0)]
    InputParms(String),

    /// Represents all other cases of `std::io::Error`.
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    /// Inaccessible logger configuration file.
    #[error("Unable to access the Log4rs configuration file: {}", .0)]
    Log4rsInitialization(String),

    #[error("Reading application configuration file: {}", .0)]
    ReadingConfigFile(String),

    #[error("Unable to parse TOML file: {}", .0)]
    TOMLParseError(String),

    /// A listening socket could not be bound at startup.
    #[error("Unable to bind {} to {}: {}", .0, .1, .2)]
    BindFailed(String, String, std::io::Error),

    /// Requested static resource is absent.
    #[error("Resource not found: {}", .0)]
    NotFound(String),

    /// Submission body exceeds the configured limit.
    #[error("Submission of {} bytes exceeds the {} byte limit", .0, .1)]
    PayloadTooLarge(usize, usize),

    /// Datagram body could not be decoded into key/value pairs.
    #[error("Malformed submission: {}", .0)]
    MalformedSubmission(String),

    /// Store document exists but does not parse.
    #[error("Store document {} is corrupt, refusing to overwrite it: {}", .0, .1)]
    StoreCorrupt(String, String),

    /// Store document could not be written; the submission is lost.
    #[error("Unable to write store document {}: {}", .0, .1)]
    StoreUnwritable(String, String),

    /// The store actor is no longer accepting requests.
    #[error("Store is unavailable: {}", .0)]
    StoreUnavailable(String),

    /// The ingest endpoint could not be reached from the web front.
    #[error("Ingest listener unreachable at {}: {}", .0, .1)]
    TransportUnreachable(String, String),
}
