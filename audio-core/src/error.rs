use thiserror::Error;

/// Every fallible operation this crate exposes to callers returns one of
/// these. Driver/backend failures are logged at the point they occur and
/// only reach here when a caller explicitly asked for a fallible variant
/// (e.g. `find_driver` vs `try_find_driver`).
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no driver installed with identity key \"{0}\"")]
    MissingDriver(String),

    #[error("no active interface with identity key \"{0}\"")]
    MissingInterface(String),

    #[error("channel operation attempted with no buffer configured")]
    MissingBuffer,

    #[error("failed to read property \"{0}\" from driver \"{1}\"")]
    ReadPropertyError(String, String),

    #[error("failed to write property \"{0}\" on driver \"{1}\"")]
    WritePropertyError(String, String),

    #[error("driver \"{0}\" failed to initialize: {1}")]
    DriverInitError(String, String),

    #[error("driver identity key \"{0}\" is already installed")]
    DuplicateDriver(String),

    #[error("sample load failed for effect {0}: {1}")]
    SampleLoadError(i32, String),
}
