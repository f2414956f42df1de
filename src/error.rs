//! The errors that can end a `list` or `sign` run.

use std::{fmt, io, path::PathBuf};

use crate::card::module::{ModuleError, SlotId};
use crate::config::ConfigError;
use crate::pdf::PdfError;


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    /// None of the probed locations holds the PKCS#11 module.
    LibraryNotFound(Vec<PathBuf>),

    /// The module could not be loaded or initialized.
    LibraryLoad { path: PathBuf, reason: String },

    /// A session could not be opened with the token in a slot.
    SessionOpen { slot: SlotId, reason: ModuleError },

    /// The token rejected the PIN.
    Authentication {
        slot: SlotId,
        remaining_attempts: Option<u32>,
    },

    /// The user PIN of the token is locked.
    LockedOut { slot: SlotId },

    /// No PIN could be obtained from the configured source.
    PinUnavailable(String),

    /// Not exactly one certificate with a matching private key was found.
    AmbiguousOrMissingSigningCertificate { found: usize },

    /// The token refused to produce a signature.
    SigningOperationFailed(String),

    /// A certificate object does not hold a usable X.509 certificate.
    MalformedCertificate { reason: String },

    /// Enumerating slots or objects failed.
    Device(ModuleError),

    Pdf(PdfError),

    Io { context: String, source: io::Error },

    Config(ConfigError),
}

impl Error {
    pub fn io(context: impl fmt::Display, source: io::Error) -> Self {
        Error::Io {
            context: context.to_string(),
            source,
        }
    }

    pub fn malformed(reason: impl fmt::Display) -> Self {
        Error::MalformedCertificate {
            reason: reason.to_string(),
        }
    }

    pub fn signing(reason: impl fmt::Display) -> Self {
        Error::SigningOperationFailed(reason.to_string())
    }

    /// Classifies a failed C_Login.
    ///
    /// `remaining_attempts` is what the token reports after the failure,
    /// if anything.
    pub fn login_failed(slot: SlotId, err: ModuleError, remaining_attempts: Option<u32>) -> Self {
        match err {
            ModuleError::PinLocked => Error::LockedOut { slot },
            ModuleError::PinIncorrect if remaining_attempts == Some(0) => Error::LockedOut { slot },
            ModuleError::PinIncorrect => Error::Authentication {
                slot,
                remaining_attempts,
            },
            other => Error::Device(other),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::LibraryNotFound(paths) => {
                write!(f, "PKCS#11 library not found, probed:")?;
                for path in paths {
                    write!(f, " {}", path.display())?;
                }
                Ok(())
            }
            Error::LibraryLoad { path, reason } => {
                write!(f, "Cannot load PKCS#11 library '{}': {}", path.display(), reason)
            }
            Error::SessionOpen { slot, reason } => {
                write!(f, "Cannot open session with token in slot {}: {}", slot, reason)
            }
            Error::Authentication {
                slot,
                remaining_attempts,
            } => match remaining_attempts {
                Some(n) => write!(
                    f,
                    "Login failed for token in slot {}: wrong PIN, {} attempt(s) left",
                    slot, n
                ),
                None => write!(f, "Login failed for token in slot {}: wrong PIN", slot),
            },
            Error::LockedOut { slot } => write!(f, "The PIN of the token in slot {} is locked", slot),
            Error::PinUnavailable(reason) => write!(f, "No PIN available: {}", reason),
            Error::AmbiguousOrMissingSigningCertificate { found } => {
                if *found == 0 {
                    write!(f, "No signing certificate found")
                } else {
                    write!(
                        f,
                        "Expected exactly one signing certificate, found {}",
                        found
                    )
                }
            }
            Error::SigningOperationFailed(reason) => write!(f, "Signing failed: {}", reason),
            Error::MalformedCertificate { reason } => write!(f, "Malformed certificate: {}", reason),
            Error::Device(e) => write!(f, "Device error: {}", e),
            Error::Pdf(e) => write!(f, "PDF error: {}", e),
            Error::Io { context, source } => write!(f, "{}: {}", context, source),
            Error::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            Error::Device(e) => Some(e),
            Error::Pdf(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ModuleError> for Error {
    fn from(e: ModuleError) -> Self {
        Error::Device(e)
    }
}

impl From<PdfError> for Error {
    fn from(e: PdfError) -> Self {
        Error::Pdf(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}


//------------ Tests ---------------------------------------------------------
