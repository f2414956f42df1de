//! The interface to a loaded PKCS#11 module.
//!
//! Everything above this trait talks in terms of plain identifiers and
//! byte vectors so that the controller can be driven by the native
//! [`CryptokiModule`][super::cryptoki::CryptokiModule] as well as by the
//! in-memory [`MockModule`][super::mock::MockModule].

use std::fmt;

use secrecy::SecretString;


//------------ Identifiers ---------------------------------------------------

/// The identifier of a slot as reported by `C_GetSlotList`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A handle to an open session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A handle to an object, valid only within the session that found it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}


//------------ LibraryDetails ------------------------------------------------

/// What `C_GetInfo` tells about the module.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LibraryDetails {
    pub manufacturer: String,
    pub description: String,
    pub cryptoki_version: (u8, u8),
}

impl fmt::Display for LibraryDetails {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} (Cryptoki v{}.{})",
            self.manufacturer, self.description, self.cryptoki_version.0, self.cryptoki_version.1
        )
    }
}


//------------ TokenDetails --------------------------------------------------

/// The user PIN flags of a token.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PinStatus {
    /// An incorrect PIN has been entered at least once since the last
    /// successful authentication.
    pub count_low: bool,

    /// Supplying an incorrect PIN will lock the token.
    pub final_try: bool,

    /// The user PIN has been locked.
    pub locked: bool,
}

impl PinStatus {
    /// The number of attempts left, if the token tells.
    pub fn remaining_attempts(&self) -> Option<u32> {
        if self.locked {
            Some(0)
        } else if self.final_try {
            Some(1)
        } else {
            None
        }
    }
}

/// What `C_GetTokenInfo` tells about the card in a slot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TokenDetails {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,

    /// The token has its own way of getting the PIN, e.g. a PIN pad or a
    /// helper application, and expects `C_Login` with a NULL PIN.
    pub protected_authentication_path: bool,

    /// There are functions that cannot be used without logging in.
    pub login_required: bool,

    pub pin_status: PinStatus,
}

impl fmt::Display for TokenDetails {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} (model: {}, vendor: {}, serial: {})",
            self.label, self.model, self.manufacturer, self.serial_number
        )
    }
}


//------------ Objects -------------------------------------------------------

/// A certificate object as found on the token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawCertificate {
    pub handle: ObjectHandle,

    /// The CKA_ID attribute, empty if absent.
    pub id: Vec<u8>,

    /// The CKA_LABEL attribute, empty if absent.
    pub label: String,

    /// The DER encoded certificate (CKA_VALUE).
    pub value: Vec<u8>,
}

/// The kind of private key, as far as signing is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyKind {
    Rsa,
    Ec,
    Other,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyKind::Rsa => write!(f, "RSA"),
            KeyKind::Ec => write!(f, "EC"),
            KeyKind::Other => write!(f, "unsupported"),
        }
    }
}

/// A private key object as found on the token. The key material itself
/// never leaves the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawPrivateKey {
    pub handle: ObjectHandle,

    /// The CKA_ID attribute, empty if absent.
    pub id: Vec<u8>,

    /// The CKA_LABEL attribute, empty if absent.
    pub label: String,

    pub kind: KeyKind,
}


//------------ SignMechanism -------------------------------------------------

/// The signing mechanisms we use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignMechanism {
    /// CKM_RSA_PKCS: the token applies PKCS#1 v1.5 padding to the input,
    /// which must be a DER encoded DigestInfo.
    RsaPkcs,

    /// CKM_ECDSA: the input is the raw digest, the output is `r || s`.
    Ecdsa,
}


//------------ Pkcs11Module --------------------------------------------------

/// A loaded and initialized PKCS#11 module.
///
/// Sessions are not assumed to be reentrant: implementations may rely on
/// being used from a single thread.
pub trait Pkcs11Module {
    /// Returns the general module information.
    fn library_details(&self) -> Result<LibraryDetails, ModuleError>;

    /// Returns the slots that currently hold a token, in module order.
    fn slots_with_token(&self) -> Result<Vec<SlotId>, ModuleError>;

    /// Returns the details of the token in the given slot.
    fn token_details(&self, slot: SlotId) -> Result<TokenDetails, ModuleError>;

    /// Opens a read-only session with the token in the given slot.
    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, ModuleError>;

    /// Logs the normal user in. `None` means the protected authentication
    /// path is used.
    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), ModuleError>;

    /// Returns all X.509 certificate objects visible in the session.
    fn find_certificates(&self, session: SessionHandle) -> Result<Vec<RawCertificate>, ModuleError>;

    /// Returns all private key objects visible in the session.
    fn find_private_keys(&self, session: SessionHandle) -> Result<Vec<RawPrivateKey>, ModuleError>;

    /// Signs `data` with the given key in a single `C_SignInit`/`C_Sign`
    /// round.
    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError>;

    /// Closes a session.
    fn close_session(&self, session: SessionHandle) -> Result<(), ModuleError>;

    /// Finalizes the module. No other method may be called afterwards.
    fn finalize(&self) -> Result<(), ModuleError>;
}


//------------ ModuleError ---------------------------------------------------

/// A failed call into the module, classified as far as we care.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModuleError {
    /// CKR_PIN_INCORRECT
    PinIncorrect,

    /// CKR_PIN_LOCKED
    PinLocked,

    /// CKR_DEVICE_REMOVED, CKR_TOKEN_NOT_PRESENT and friends.
    DeviceRemoved,

    /// CKR_SESSION_HANDLE_INVALID, CKR_SESSION_CLOSED
    SessionInvalid,

    /// CKR_USER_NOT_LOGGED_IN
    NotLoggedIn,

    /// CKR_USER_ALREADY_LOGGED_IN
    AlreadyLoggedIn,

    /// Anything else, with the module's own description.
    Other(String),
}

impl ModuleError {
    /// Whether the token rejected the PIN itself.
    pub fn is_pin_failure(&self) -> bool {
        matches!(self, ModuleError::PinIncorrect | ModuleError::PinLocked)
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModuleError::PinIncorrect => write!(f, "PIN incorrect"),
            ModuleError::PinLocked => write!(f, "PIN locked"),
            ModuleError::DeviceRemoved => write!(f, "device or token removed"),
            ModuleError::SessionInvalid => write!(f, "session closed or invalid"),
            ModuleError::NotLoggedIn => write!(f, "user not logged in"),
            ModuleError::AlreadyLoggedIn => write!(f, "user already logged in"),
            ModuleError::Other(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for ModuleError {}


//------------ Tests ---------------------------------------------------------
