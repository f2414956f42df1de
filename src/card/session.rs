use std::{cell::Cell, fmt, rc::Rc};

use log::{trace, warn};
use secrecy::SecretString;

use super::module::{
    ModuleError, ObjectHandle, Pkcs11Module, RawCertificate, RawPrivateKey, SessionHandle,
    SignMechanism, SlotId,
};


//------------ Pkcs11Session -------------------------------------------------

/// An open session with the token in a slot.
///
/// The session keeps the module alive. It is closed exactly once: either
/// explicitly through [`close`][Self::close] or when dropped.
pub struct Pkcs11Session {
    module: Rc<dyn Pkcs11Module>,
    handle: SessionHandle,
    slot: SlotId,
    logged_in: Cell<bool>,
    closed: Cell<bool>,
}

impl Pkcs11Session {
    pub fn open(module: Rc<dyn Pkcs11Module>, slot: SlotId) -> Result<Self, ModuleError> {
        let handle = module.open_session(slot)?;
        trace!("PKCS#11: opened session {} with slot {}", handle, slot);
        Ok(Pkcs11Session {
            module,
            handle,
            slot,
            logged_in: Cell::new(false),
            closed: Cell::new(false),
        })
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn check_open(&self) -> Result<(), ModuleError> {
        if self.closed.get() {
            Err(ModuleError::SessionInvalid)
        } else {
            Ok(())
        }
    }

    /// Logs the user in. A session that already is logged in is left alone.
    pub fn login(&self, pin: Option<&SecretString>) -> Result<(), ModuleError> {
        self.check_open()?;
        if self.logged_in.get() {
            return Ok(());
        }
        match self.module.login(self.handle, pin) {
            Ok(()) | Err(ModuleError::AlreadyLoggedIn) => {
                self.logged_in.set(true);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn find_certificates(&self) -> Result<Vec<RawCertificate>, ModuleError> {
        self.check_open()?;
        self.module.find_certificates(self.handle)
    }

    pub fn find_private_keys(&self) -> Result<Vec<RawPrivateKey>, ModuleError> {
        self.check_open()?;
        self.module.find_private_keys(self.handle)
    }

    // Note: keys with CKA_ALWAYS_AUTHENTICATE would need a context specific
    // login right before signing. The eID signing keys leave that to the
    // vendor module, so we don't do it here.
    pub fn sign(&self, key: ObjectHandle, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        self.check_open()?;
        self.module.sign(self.handle, key, mechanism, data)
    }

    /// Closes the session. Calling this again does nothing.
    ///
    /// Closing the last session also logs the user out, so we never call
    /// C_Logout ourselves.
    pub fn close(&self) -> Result<(), ModuleError> {
        if self.closed.replace(true) {
            return Ok(());
        }
        self.logged_in.set(false);
        trace!("PKCS#11: closing session {} with slot {}", self.handle, self.slot);
        self.module.close_session(self.handle)
    }
}

impl Drop for Pkcs11Session {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Failed to close PKCS#11 session with slot {}: {}", self.slot, err);
        }
    }
}

impl fmt::Debug for Pkcs11Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pkcs11Session")
            .field("handle", &self.handle)
            .field("slot", &self.slot)
            .field("logged_in", &self.logged_in.get())
            .field("closed", &self.closed.get())
            .finish()
    }
}


//------------ Tests ---------------------------------------------------------
