//! An in-memory PKCS#11 module for tests.
//!
//! Tokens are described up front with certificates and software keys. The
//! module checks PINs, keeps track of sessions and counts calls, so that
//! tests can assert on how the controller drives it.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ec::{EcGroup, EcKey},
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::{Padding, Rsa},
    x509::{X509, X509NameBuilder},
};
use secrecy::{ExposeSecret, SecretString};

use super::module::{
    KeyKind, LibraryDetails, ModuleError, ObjectHandle, PinStatus, Pkcs11Module, RawCertificate,
    RawPrivateKey, SessionHandle, SignMechanism, SlotId, TokenDetails,
};


//------------ FnIdx ---------------------------------------------------------

/// The module functions whose calls are counted.
pub enum FnIdx {
    OpenSession,
    Login,
    FindCertificates,
    FindPrivateKeys,
    Sign,
    CloseSession,
    Finalize,
    Count,
}


//------------ MockToken -----------------------------------------------------

/// A software key pair stored on a mock token.
#[derive(Clone)]
pub struct MockKey {
    pub id: Vec<u8>,
    pub label: String,
    pub key: PKey<Private>,
}

impl MockKey {
    pub fn kind(&self) -> KeyKind {
        match self.key.id() {
            openssl::pkey::Id::RSA => KeyKind::Rsa,
            openssl::pkey::Id::EC => KeyKind::Ec,
            _ => KeyKind::Other,
        }
    }
}

/// A certificate object stored on a mock token.
#[derive(Clone, Debug)]
pub struct MockCertificate {
    pub id: Vec<u8>,
    pub label: String,
    pub der: Vec<u8>,
}

/// The contents and behaviour of a token in a mock slot.
#[derive(Clone)]
pub struct MockToken {
    label: String,
    pin: String,
    tries_left: u32,
    protected_path: bool,
    client_unreachable: bool,
    private_certificates: bool,
    fail_open: bool,
    pin_status: PinStatus,
    certificates: Vec<MockCertificate>,
    keys: Vec<MockKey>,
}

impl MockToken {
    pub fn new(label: &str, pin: &str) -> Self {
        MockToken {
            label: label.to_string(),
            pin: pin.to_string(),
            tries_left: 3,
            protected_path: false,
            client_unreachable: false,
            private_certificates: false,
            fail_open: false,
            pin_status: PinStatus::default(),
            certificates: Vec::new(),
            keys: Vec::new(),
        }
    }

    /// Adds a certificate and its private key, both with the given id.
    pub fn with_pair(self, id: &[u8], der: Vec<u8>, key: PKey<Private>) -> Self {
        self.with_certificate(id, der).with_key(id, key)
    }

    pub fn with_certificate(mut self, id: &[u8], der: Vec<u8>) -> Self {
        let label = format!("cert-{}", hex::encode(id));
        self.certificates.push(MockCertificate {
            id: id.to_vec(),
            label,
            der,
        });
        self
    }

    pub fn with_key(mut self, id: &[u8], key: PKey<Private>) -> Self {
        let label = format!("key-{}", hex::encode(id));
        self.keys.push(MockKey {
            id: id.to_vec(),
            label,
            key,
        });
        self
    }

    /// Lets the token obtain the PIN by itself, like the eID client does.
    pub fn with_protected_path(mut self) -> Self {
        self.protected_path = true;
        self
    }

    /// Makes a login through the protected path fail as if the eID client
    /// was not running.
    pub fn with_unreachable_client(mut self) -> Self {
        self.protected_path = true;
        self.client_unreachable = true;
        self
    }

    /// Only shows certificates after login.
    pub fn with_private_certificates(mut self) -> Self {
        self.private_certificates = true;
        self
    }

    /// Sets the number of PIN attempts left before the token locks.
    pub fn with_tries_left(mut self, tries: u32) -> Self {
        self.tries_left = tries;
        self.update_pin_status();
        self
    }

    /// Makes C_OpenSession fail for this token.
    pub fn with_failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    fn update_pin_status(&mut self) {
        self.pin_status.final_try = self.tries_left == 1;
        self.pin_status.locked = self.tries_left == 0;
    }

    fn details(&self) -> TokenDetails {
        TokenDetails {
            label: self.label.clone(),
            manufacturer: "Mock".to_string(),
            model: "Mock eID".to_string(),
            serial_number: format!("{:016}", self.label.len()),
            protected_authentication_path: self.protected_path,
            login_required: true,
            pin_status: self.pin_status,
        }
    }
}

impl fmt::Debug for MockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockToken")
            .field("label", &self.label)
            .field("certificates", &self.certificates.len())
            .field("keys", &self.keys.len())
            .finish()
    }
}


//------------ MockModule ----------------------------------------------------

struct MockSlot {
    id: SlotId,
    token: Option<MockToken>,
}

struct MockSession {
    slot: SlotId,
    logged_in: bool,
    keys: Vec<usize>,
}

/// A module with a fixed set of slots.
pub struct MockModule {
    slots: RefCell<Vec<MockSlot>>,
    sessions: RefCell<HashMap<u64, MockSession>>,
    next_session: Cell<u64>,
    closed: RefCell<Vec<u64>>,
    finalized: Cell<bool>,
    call_counts: RefCell<Vec<u32>>,
    violations: RefCell<Vec<String>>,
}

// test interface
impl MockModule {
    pub fn new() -> Self {
        let mut call_counts = Vec::with_capacity(FnIdx::Count as usize);
        call_counts.resize(FnIdx::Count as usize, 0);

        MockModule {
            slots: RefCell::new(Vec::new()),
            sessions: RefCell::new(HashMap::new()),
            next_session: Cell::new(1),
            closed: RefCell::new(Vec::new()),
            finalized: Cell::new(false),
            call_counts: RefCell::new(call_counts),
            violations: RefCell::new(Vec::new()),
        }
    }

    /// Adds a slot holding the given token.
    pub fn with_token(self, token: MockToken) -> Self {
        let id = SlotId(self.slots.borrow().len() as u64);
        self.slots.borrow_mut().push(MockSlot { id, token: Some(token) });
        self
    }

    /// Adds a card reader without a card in it.
    pub fn with_empty_slot(self) -> Self {
        let id = SlotId(self.slots.borrow().len() as u64);
        self.slots.borrow_mut().push(MockSlot { id, token: None });
        self
    }

    /// Pulls the card out of a slot.
    pub fn remove_token(&self, slot: SlotId) {
        if let Some(s) = self.slots.borrow_mut().iter_mut().find(|s| s.id == slot) {
            s.token = None;
        }
    }

    pub fn calls(&self, fn_idx: FnIdx) -> u32 {
        self.call_counts.borrow()[fn_idx as usize]
    }

    /// The number of sessions that are still open.
    pub fn open_sessions(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.get()
    }

    /// The misuse the module has seen, e.g. closing a session twice.
    pub fn violations(&self) -> Vec<String> {
        self.violations.borrow().clone()
    }

    fn inc(&self, fn_idx: FnIdx) {
        self.call_counts.borrow_mut()[fn_idx as usize] += 1;
    }

    fn check_live(&self, function: &str) -> Result<(), ModuleError> {
        if self.finalized.get() {
            self.violations
                .borrow_mut()
                .push(format!("{} called after C_Finalize", function));
            Err(ModuleError::Other("CKR_CRYPTOKI_NOT_INITIALIZED".to_string()))
        } else {
            Ok(())
        }
    }

    fn on_token<T>(&self, slot: SlotId, op: impl FnOnce(&mut MockToken) -> T) -> Result<T, ModuleError> {
        let mut slots = self.slots.borrow_mut();
        let token = slots
            .iter_mut()
            .find(|s| s.id == slot)
            .and_then(|s| s.token.as_mut())
            .ok_or(ModuleError::DeviceRemoved)?;
        Ok(op(token))
    }

    fn session_slot(&self, session: SessionHandle) -> Result<SlotId, ModuleError> {
        if self.closed.borrow().contains(&session.0) {
            return Err(ModuleError::SessionInvalid);
        }
        self.sessions
            .borrow()
            .get(&session.0)
            .map(|s| s.slot)
            .ok_or(ModuleError::SessionInvalid)
    }
}

impl Default for MockModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Pkcs11Module for MockModule {
    fn library_details(&self) -> Result<LibraryDetails, ModuleError> {
        self.check_live("C_GetInfo")?;
        Ok(LibraryDetails {
            manufacturer: "Mock".to_string(),
            description: "In-memory PKCS#11 module".to_string(),
            cryptoki_version: (2, 40),
        })
    }

    fn slots_with_token(&self) -> Result<Vec<SlotId>, ModuleError> {
        self.check_live("C_GetSlotList")?;
        Ok(self
            .slots
            .borrow()
            .iter()
            .filter(|s| s.token.is_some())
            .map(|s| s.id)
            .collect())
    }

    fn token_details(&self, slot: SlotId) -> Result<TokenDetails, ModuleError> {
        self.check_live("C_GetTokenInfo")?;
        self.on_token(slot, |token| token.details())
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, ModuleError> {
        self.check_live("C_OpenSession")?;
        self.inc(FnIdx::OpenSession);
        if self.on_token(slot, |token| token.fail_open)? {
            return Err(ModuleError::Other("CKR_DEVICE_ERROR".to_string()));
        }

        let handle = self.next_session.get();
        self.next_session.set(handle + 1);
        self.sessions.borrow_mut().insert(
            handle,
            MockSession {
                slot,
                logged_in: false,
                keys: Vec::new(),
            },
        );
        Ok(SessionHandle(handle))
    }

    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), ModuleError> {
        self.check_live("C_Login")?;
        self.inc(FnIdx::Login);
        let slot = self.session_slot(session)?;

        if self.sessions.borrow().get(&session.0).is_some_and(|s| s.logged_in) {
            return Err(ModuleError::AlreadyLoggedIn);
        }

        self.on_token(slot, |token| {
            if token.pin_status.locked {
                return Err(ModuleError::PinLocked);
            }
            let accepted = match pin {
                Some(pin) => pin.expose_secret() == token.pin,
                None if token.client_unreachable => {
                    return Err(ModuleError::Other("CKR_FUNCTION_FAILED".to_string()))
                }
                None if token.protected_path => true,
                None => return Err(ModuleError::Other("CKR_ARGUMENTS_BAD".to_string())),
            };
            if accepted {
                token.tries_left = 3;
                token.pin_status = PinStatus::default();
                Ok(())
            } else {
                token.tries_left = token.tries_left.saturating_sub(1);
                token.pin_status.count_low = true;
                token.update_pin_status();
                Err(ModuleError::PinIncorrect)
            }
        })??;

        if let Some(s) = self.sessions.borrow_mut().get_mut(&session.0) {
            s.logged_in = true;
        }
        Ok(())
    }

    fn find_certificates(&self, session: SessionHandle) -> Result<Vec<RawCertificate>, ModuleError> {
        self.check_live("C_FindObjects")?;
        self.inc(FnIdx::FindCertificates);
        let slot = self.session_slot(session)?;
        let logged_in = self.sessions.borrow().get(&session.0).is_some_and(|s| s.logged_in);

        let certificates = self.on_token(slot, |token| {
            if token.private_certificates && !logged_in {
                Vec::new()
            } else {
                token.certificates.clone()
            }
        })?;

        Ok(certificates
            .into_iter()
            .enumerate()
            .map(|(index, cert)| RawCertificate {
                handle: ObjectHandle(1000 + index as u64),
                id: cert.id,
                label: cert.label,
                value: cert.der,
            })
            .collect())
    }

    fn find_private_keys(&self, session: SessionHandle) -> Result<Vec<RawPrivateKey>, ModuleError> {
        self.check_live("C_FindObjects")?;
        self.inc(FnIdx::FindPrivateKeys);
        let slot = self.session_slot(session)?;
        let logged_in = self.sessions.borrow().get(&session.0).is_some_and(|s| s.logged_in);
        if !logged_in {
            // Private objects are invisible in a public session.
            return Ok(Vec::new());
        }

        let keys = self.on_token(slot, |token| token.keys.clone())?;

        let mut sessions = self.sessions.borrow_mut();
        let s = sessions.get_mut(&session.0).ok_or(ModuleError::SessionInvalid)?;
        Ok(keys
            .into_iter()
            .enumerate()
            .map(|(index, key)| {
                s.keys.push(index);
                RawPrivateKey {
                    handle: ObjectHandle(2000 + index as u64),
                    kind: key.kind(),
                    id: key.id,
                    label: key.label,
                }
            })
            .collect())
    }

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError> {
        self.check_live("C_Sign")?;
        self.inc(FnIdx::Sign);
        let slot = self.session_slot(session)?;
        if !self.sessions.borrow().get(&session.0).is_some_and(|s| s.logged_in) {
            return Err(ModuleError::NotLoggedIn);
        }

        let index = key
            .0
            .checked_sub(2000)
            .ok_or_else(|| ModuleError::Other("CKR_KEY_HANDLE_INVALID".to_string()))? as usize;
        if !self.sessions.borrow().get(&session.0).is_some_and(|s| s.keys.contains(&index)) {
            return Err(ModuleError::Other("CKR_KEY_HANDLE_INVALID".to_string()));
        }
        let key = self
            .on_token(slot, |token| token.keys.get(index).cloned())?
            .ok_or_else(|| ModuleError::Other("CKR_KEY_HANDLE_INVALID".to_string()))?;

        let res = match (mechanism, key.kind()) {
            (SignMechanism::RsaPkcs, KeyKind::Rsa) => sign_rsa_pkcs1(&key.key, data),
            (SignMechanism::Ecdsa, KeyKind::Ec) => sign_ecdsa_raw(&key.key, data),
            _ => return Err(ModuleError::Other("CKR_KEY_TYPE_INCONSISTENT".to_string())),
        };
        res.map_err(|e| ModuleError::Other(format!("CKR_FUNCTION_FAILED: {}", e)))
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), ModuleError> {
        self.check_live("C_CloseSession")?;
        self.inc(FnIdx::CloseSession);
        if self.closed.borrow().contains(&session.0) {
            self.violations
                .borrow_mut()
                .push(format!("session {} closed twice", session));
            return Err(ModuleError::SessionInvalid);
        }
        match self.sessions.borrow_mut().remove(&session.0) {
            Some(_) => {
                self.closed.borrow_mut().push(session.0);
                Ok(())
            }
            None => Err(ModuleError::SessionInvalid),
        }
    }

    fn finalize(&self) -> Result<(), ModuleError> {
        self.inc(FnIdx::Finalize);
        if self.finalized.get() {
            self.violations.borrow_mut().push("C_Finalize called twice".to_string());
            return Err(ModuleError::Other("CKR_CRYPTOKI_NOT_INITIALIZED".to_string()));
        }
        if !self.sessions.borrow().is_empty() {
            self.violations
                .borrow_mut()
                .push("C_Finalize called with open sessions".to_string());
        }
        self.finalized.set(true);
        Ok(())
    }
}

/// What CKM_RSA_PKCS does: PKCS#1 v1.5 type 1 padding, then the raw RSA
/// private key operation.
fn sign_rsa_pkcs1(key: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let rsa = key.rsa()?;
    let mut out = vec![0; rsa.size() as usize];
    let len = rsa.private_encrypt(data, &mut out, Padding::PKCS1)?;
    out.truncate(len);
    Ok(out)
}

/// What CKM_ECDSA does: sign the given digest and return `r || s`.
fn sign_ecdsa_raw(key: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let ec = key.ec_key()?;
    let field_len = ec.group().degree().div_ceil(8) as i32;
    let sig = EcdsaSig::sign(data, &ec)?;
    let mut out = sig.r().to_vec_padded(field_len)?;
    out.extend(sig.s().to_vec_padded(field_len)?);
    Ok(out)
}


//------------ Test credentials ----------------------------------------------

/// Generates an RSA key and a self-signed certificate for it.
///
/// The subject is `C=SK, CN=<common_name>`.
pub fn rsa_credentials(common_name: &str) -> Result<(Vec<u8>, PKey<Private>), ErrorStack> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;
    let cert = self_signed(common_name, &key)?;
    Ok((cert.to_der()?, key))
}

/// Generates a P-256 key and a self-signed certificate for it.
pub fn ec_credentials(common_name: &str) -> Result<(Vec<u8>, PKey<Private>), ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;
    let cert = self_signed(common_name, &key)?;
    Ok((cert.to_der()?, key))
}

fn self_signed(common_name: &str, key: &PKey<Private>) -> Result<X509, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("C", "SK")?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(0x5eed)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(365)?.as_ref())?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}


//------------ Tests ---------------------------------------------------------
