//! Driving a PKCS#11 module: slots, sessions, login and object discovery.

use std::{
    cell::{Cell, RefCell},
    fmt,
    path::Path,
    rc::Rc,
};

use log::{debug, info, warn};
use super::{
    certificate::CardCertificate,
    cryptoki::CryptokiModule,
    module::{ModuleError, Pkcs11Module, RawPrivateKey, SlotId, TokenDetails},
    resolver::{self, SigningCertificate, TokenCertificate},
    session::Pkcs11Session,
};
use crate::{
    error::Error,
    pin::{PinPrompt, PinProvider, PinSecret},
};


//------------ Slot ----------------------------------------------------------

/// A slot with a token in it.
#[derive(Clone, Debug)]
pub struct Slot {
    pub id: SlotId,
    pub token: TokenDetails,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slot {} with token {}", self.id, self.token)
    }
}


//------------ CardDeviceController ------------------------------------------

/// Owns a loaded module and every session opened through it.
///
/// Sessions are closed in reverse order of opening and the module is
/// finalized afterwards, once, by [`dispose`][Self::dispose] or on drop.
pub struct CardDeviceController {
    module: Rc<dyn Pkcs11Module>,
    pin_provider: Box<dyn PinProvider>,
    sessions: RefCell<Vec<Rc<Pkcs11Session>>>,
    disposed: Cell<bool>,
}

impl CardDeviceController {
    /// Loads the PKCS#11 library at `path`.
    pub fn open(path: &Path, pin_provider: Box<dyn PinProvider>) -> Result<Self, Error> {
        let module = CryptokiModule::load(path)?;
        Ok(Self::new(Rc::new(module), pin_provider))
    }

    /// Takes over an already initialized module.
    pub fn new(module: Rc<dyn Pkcs11Module>, pin_provider: Box<dyn PinProvider>) -> Self {
        match module.library_details() {
            Ok(details) => info!("Using PKCS#11 library {}", details),
            Err(err) => warn!("Cannot read PKCS#11 library info: {}", err),
        }
        CardDeviceController {
            module,
            pin_provider,
            sessions: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
        }
    }

    fn check_live(&self) -> Result<(), Error> {
        if self.disposed.get() {
            Err(Error::Device(ModuleError::Other(
                "the PKCS#11 library has been unloaded".to_string(),
            )))
        } else {
            Ok(())
        }
    }

    /// Returns the slots that hold a token, in module order.
    pub fn list_slots_with_token(&self) -> Result<Vec<Slot>, Error> {
        self.check_live()?;
        let mut res = Vec::new();
        for id in self.module.slots_with_token()? {
            match self.module.token_details(id) {
                Ok(token) => {
                    debug!("Found token '{}' in slot {}", token.label, id);
                    res.push(Slot { id, token })
                }
                Err(err) => warn!("Skipping slot {}: cannot read token info: {}", id, err),
            }
        }
        Ok(res)
    }

    /// Opens a session with the token in `slot`.
    ///
    /// The controller keeps a reference so it can close the session on
    /// disposal.
    pub fn open_session(&self, slot: &Slot) -> Result<Rc<Pkcs11Session>, Error> {
        self.check_live()?;
        let session = Pkcs11Session::open(self.module.clone(), slot.id).map_err(|reason| Error::SessionOpen {
            slot: slot.id,
            reason,
        })?;
        let session = Rc::new(session);
        self.sessions.borrow_mut().push(session.clone());
        Ok(session)
    }

    /// Logs the user in, asking the PIN provider once.
    pub fn login(&self, session: &Pkcs11Session, slot: &Slot) -> Result<(), Error> {
        if session.is_logged_in() {
            return Ok(());
        }
        if slot.token.pin_status.locked {
            return Err(Error::LockedOut { slot: slot.id });
        }

        let prompt = PinPrompt {
            slot: slot.id,
            token_label: slot.token.label.clone(),
            protected_path: slot.token.protected_authentication_path,
            pin_status: slot.token.pin_status,
        };
        let (res, protected_path) = match self.pin_provider.acquire_pin(&prompt)? {
            PinSecret::Pin(pin) => (session.login(Some(&pin)), false),
            PinSecret::ProtectedPath => (session.login(None), true),
        };

        match res {
            Ok(()) => {
                debug!("Logged in to token in slot {}", slot.id);
                Ok(())
            }
            Err(err) if protected_path && !err.is_pin_failure() => {
                Err(Error::PinUnavailable(format!(
                    "eID client did not supply the PIN for slot {}: {}",
                    slot.id, err
                )))
            }
            Err(err) => {
                let remaining = self
                    .module
                    .token_details(slot.id)
                    .ok()
                    .and_then(|token| token.pin_status.remaining_attempts());
                Err(Error::login_failed(slot.id, err, remaining))
            }
        }
    }

    /// Returns the certificates visible in the session.
    ///
    /// Objects that do not hold a valid X.509 certificate are skipped with
    /// a warning.
    pub fn list_certificates_in(&self, session: &Pkcs11Session) -> Result<Vec<TokenCertificate>, Error> {
        let mut res = Vec::new();
        for raw in session.find_certificates()? {
            match CardCertificate::from_der(raw.value) {
                Ok(certificate) => res.push(TokenCertificate {
                    slot: session.slot(),
                    id: raw.id,
                    label: raw.label,
                    certificate,
                }),
                Err(err) => warn!(
                    "Skipping certificate object '{}' in slot {}: {}",
                    raw.label,
                    session.slot(),
                    err
                ),
            }
        }
        Ok(res)
    }

    /// Returns the private key objects visible in the session.
    pub fn list_key_objects(&self, session: &Pkcs11Session) -> Result<Vec<RawPrivateKey>, Error> {
        Ok(session.find_private_keys()?)
    }

    /// Finds every certificate on every token that has a private key.
    ///
    /// Each slot gets its own session and login. A slot that fails is
    /// reported as a warning and the next one is tried.
    pub fn signing_certificates(&self) -> Result<Vec<SigningCertificate>, Error> {
        let mut res = Vec::new();
        for slot in self.list_slots_with_token()? {
            match self.signing_certificates_in(&slot) {
                Ok(found) => {
                    debug!("Found {} signing certificate(s) in {}", found.len(), slot);
                    res.extend(found)
                }
                Err(err) => warn!("Skipping slot {}: {}", slot.id, err),
            }
        }
        Ok(res)
    }

    fn signing_certificates_in(&self, slot: &Slot) -> Result<Vec<SigningCertificate>, Error> {
        let session = self.open_session(slot)?;
        self.login(&session, slot)?;
        let certificates = self.list_certificates_in(&session)?;
        let keys = self.list_key_objects(&session)?;
        Ok(resolver::correlate(&session, certificates, &keys))
    }

    /// Returns the one signing certificate available.
    pub fn signing_certificate(&self) -> Result<SigningCertificate, Error> {
        resolver::resolve_single(self.signing_certificates()?)
    }

    /// Lists the certificates on all tokens.
    ///
    /// This uses public sessions. Only when a token shows no certificates
    /// that way and says it needs a login, we log in and look again.
    pub fn list_certificates(&self) -> Result<Vec<TokenCertificate>, Error> {
        let mut res = Vec::new();
        for slot in self.list_slots_with_token()? {
            match self.list_certificates_for(&slot) {
                Ok(found) => res.extend(found),
                Err(err) => warn!("Skipping slot {}: {}", slot.id, err),
            }
        }
        Ok(res)
    }

    fn list_certificates_for(&self, slot: &Slot) -> Result<Vec<TokenCertificate>, Error> {
        let session = self.open_session(slot)?;
        let found = self.list_certificates_in(&session)?;
        if !found.is_empty() || !slot.token.login_required {
            return Ok(found);
        }
        debug!("No public certificates in {}, logging in", slot);
        self.login(&session, slot)?;
        self.list_certificates_in(&session)
    }

    /// Closes all sessions, newest first, then finalizes the module.
    ///
    /// Failures are logged. Calling this again does nothing.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let sessions: Vec<_> = self.sessions.borrow_mut().drain(..).collect();
        for session in sessions.iter().rev() {
            if let Err(err) = session.close() {
                warn!("Failed to close PKCS#11 session with slot {}: {}", session.slot(), err);
            }
        }
        if let Err(err) = self.module.finalize() {
            warn!("Failed to finalize PKCS#11 library: {}", err);
        }
        debug!("PKCS#11 library released");
    }
}

impl Drop for CardDeviceController {
    fn drop(&mut self) {
        self.dispose()
    }
}


//------------ Tests ---------------------------------------------------------
