//! Various tool-wide constants.

use log::LevelFilter;


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `eidsign` binary.
pub const EIDSIGN_APP: &str = "eID Sign Tool";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the path to the config file.
pub const EIDSIGN_ENV_CONFIG: &str = "EIDSIGN_CONFIG";

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It
/// overrides the config file and is itself overridden by `--log-level`.
pub const EIDSIGN_ENV_LOG_LEVEL: &str = "EIDSIGN_LOG_LEVEL";

/// The environment variable with the path to the PKCS#11 library.
///
/// When neither this variable, the `--pkcs11-lib` option nor the config
/// file name a library, the well-known install locations are probed.
pub const EIDSIGN_ENV_PKCS11_LIB: &str = "EIDSIGN_PKCS11_LIB";


//------------ Defaults -----------------------------------------------------

/// The log level used when nothing else is configured.
///
/// Warnings are shown by default because a failed login on one slot is
/// only reported as a warning.
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Warn;

/// The number of bytes reserved in a PDF for the CMS signature blob.
pub const DEFAULT_SIGNATURE_PLACEHOLDER_SIZE: usize = 8192;

/// The partial field name given to signature fields we add.
pub const SIGNATURE_FIELD_PREFIX: &str = "Signature";


//------------ Vendor Library Locations -------------------------------------

/// The architecture suffix the eID client uses for its module file names.
pub const fn library_arch() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "x64"
    } else {
        "x86"
    }
}

/// The known install locations of the eID client's PKCS#11 module.
///
/// The order matters: the first existing path wins.
pub fn vendor_library_candidates() -> Vec<String> {
    let arch = library_arch();
    vec![
        format!(r"C:\Program Files (x86)\eID klient\pkcs11_{arch}.dll"),
        format!(r"C:\Program Files\eID klient\pkcs11_{arch}.dll"),
        format!("C:/Program Files/EAC MW klient/pkcs11_{arch}.dll"),
        format!("C:/Program Files (x86)/EAC MW klient/pkcs11_{arch}.dll"),
        format!("/usr/lib/eidklient/libpkcs11_sig_{arch}.so"),
        "/Applications/eIDklient.app/Contents/Pkcs11/libPkcs11.dylib".to_string(),
    ]
}
