//! The native PKCS#11 module, loaded at runtime from a file.

use std::{cell::RefCell, collections::HashMap, path::Path};

use log::{debug, trace};
use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CryptokiError, RvError},
    mechanism::Mechanism,
    object::{Attribute, AttributeType, CertificateType, KeyType, ObjectClass},
    session::{Session, UserType},
    slot::Slot,
    types::AuthPin,
};
use secrecy::{ExposeSecret, SecretString};

use super::module::{
    KeyKind, LibraryDetails, ModuleError, ObjectHandle, PinStatus, Pkcs11Module, RawCertificate,
    RawPrivateKey, SessionHandle, SignMechanism, SlotId, TokenDetails,
};
use crate::error::Error;


//------------ CryptokiModule ------------------------------------------------

/// A PKCS#11 library loaded through `cryptoki`.
///
/// The `cryptoki` types for sessions and objects are not plain numbers, so
/// this keeps them in tables and hands out numeric handles instead. Object
/// handles are only valid for the session that found them.
pub struct CryptokiModule {
    lib_name: String,
    context: RefCell<Option<Pkcs11>>,
    slots: RefCell<Vec<Slot>>,
    sessions: RefCell<HashMap<u64, OpenSession>>,
    next_session: RefCell<u64>,
}

struct OpenSession {
    session: Session,
    objects: Vec<cryptoki::object::ObjectHandle>,
}

impl CryptokiModule {
    /// Loads and initializes the library at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let lib_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let context = Pkcs11::new(path).map_err(|err| Error::LibraryLoad {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|err| Error::LibraryLoad {
                path: path.to_path_buf(),
                reason: format!("C_Initialize failed: {}", err),
            })?;

        debug!("PKCS#11: loaded and initialized library '{}'", lib_name);

        Ok(CryptokiModule {
            lib_name,
            context: RefCell::new(Some(context)),
            slots: RefCell::new(Vec::new()),
            sessions: RefCell::new(HashMap::new()),
            next_session: RefCell::new(1),
        })
    }

    fn with_context<T>(&self, op: impl FnOnce(&Pkcs11) -> Result<T, CryptokiError>) -> Result<T, ModuleError> {
        match self.context.borrow().as_ref() {
            Some(context) => op(context).map_err(classify),
            None => Err(ModuleError::Other(format!(
                "library '{}' has been finalized",
                self.lib_name
            ))),
        }
    }

    fn slot(&self, slot: SlotId) -> Result<Slot, ModuleError> {
        if let Some(found) = self.slots.borrow().iter().find(|s| s.id() == slot.0) {
            return Ok(*found);
        }

        // Not seen yet, refresh the list.
        let slots = self.with_context(|ctx| ctx.get_slots_with_token())?;
        let found = slots.iter().find(|s| s.id() == slot.0).copied();
        *self.slots.borrow_mut() = slots;
        found.ok_or(ModuleError::DeviceRemoved)
    }

    fn with_session<T>(
        &self,
        handle: SessionHandle,
        op: impl FnOnce(&mut OpenSession) -> Result<T, CryptokiError>,
    ) -> Result<T, ModuleError> {
        let mut sessions = self.sessions.borrow_mut();
        let open = sessions.get_mut(&handle.0).ok_or(ModuleError::SessionInvalid)?;
        op(open).map_err(classify)
    }

    /// Remembers an object handle in its session and returns our number
    /// for it.
    fn register(open: &mut OpenSession, object: cryptoki::object::ObjectHandle) -> ObjectHandle {
        open.objects.push(object);
        ObjectHandle(open.objects.len() as u64 - 1)
    }

    fn label_attr(attrs: &[Attribute]) -> String {
        attrs
            .iter()
            .find_map(|attr| match attr {
                Attribute::Label(bytes) => Some(String::from_utf8_lossy(bytes).trim_end().to_string()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn id_attr(attrs: &[Attribute]) -> Vec<u8> {
        attrs
            .iter()
            .find_map(|attr| match attr {
                Attribute::Id(id) => Some(id.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

impl Pkcs11Module for CryptokiModule {
    fn library_details(&self) -> Result<LibraryDetails, ModuleError> {
        let info = self.with_context(|ctx| ctx.get_library_info())?;
        let version = info.cryptoki_version();
        Ok(LibraryDetails {
            manufacturer: info.manufacturer_id().trim().to_string(),
            description: info.library_description().trim().to_string(),
            cryptoki_version: (version.major(), version.minor()),
        })
    }

    fn slots_with_token(&self) -> Result<Vec<SlotId>, ModuleError> {
        let slots = self.with_context(|ctx| ctx.get_slots_with_token())?;
        trace!("PKCS#11: C_GetSlotList() returned {} slot(s) with a token", slots.len());
        let ids = slots.iter().map(|slot| SlotId(slot.id())).collect();
        *self.slots.borrow_mut() = slots;
        Ok(ids)
    }

    fn token_details(&self, slot: SlotId) -> Result<TokenDetails, ModuleError> {
        let slot = self.slot(slot)?;
        let info = self.with_context(|ctx| ctx.get_token_info(slot))?;
        Ok(TokenDetails {
            label: info.label().trim().to_string(),
            manufacturer: info.manufacturer_id().trim().to_string(),
            model: info.model().trim().to_string(),
            serial_number: info.serial_number().trim().to_string(),
            protected_authentication_path: info.protected_authentication_path(),
            login_required: info.login_required(),
            pin_status: PinStatus {
                count_low: info.user_pin_count_low(),
                final_try: info.user_pin_final_try(),
                locked: info.user_pin_locked(),
            },
        })
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, ModuleError> {
        let slot = self.slot(slot)?;
        let session = self.with_context(|ctx| ctx.open_ro_session(slot))?;

        let mut next = self.next_session.borrow_mut();
        let handle = SessionHandle(*next);
        *next += 1;

        self.sessions.borrow_mut().insert(
            handle.0,
            OpenSession {
                session,
                objects: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), ModuleError> {
        // cryptoki keeps its own secrecy version for the PIN.
        let pin = pin.map(|pin| AuthPin::new(pin.expose_secret().to_string()));
        self.with_session(session, |open| open.session.login(UserType::User, pin.as_ref()))
    }

    fn find_certificates(&self, session: SessionHandle) -> Result<Vec<RawCertificate>, ModuleError> {
        self.with_session(session, |open| {
            let template = [
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::CertificateType(CertificateType::X_509),
            ];
            let found = open.session.find_objects(&template)?;

            let mut res = Vec::with_capacity(found.len());
            for object in found {
                let attrs = open.session.get_attributes(
                    object,
                    &[AttributeType::Id, AttributeType::Label, AttributeType::Value],
                )?;
                let value = attrs
                    .iter()
                    .find_map(|attr| match attr {
                        Attribute::Value(value) => Some(value.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                let id = Self::id_attr(&attrs);
                let label = Self::label_attr(&attrs);
                res.push(RawCertificate {
                    handle: Self::register(open, object),
                    id,
                    label,
                    value,
                });
            }
            Ok(res)
        })
    }

    fn find_private_keys(&self, session: SessionHandle) -> Result<Vec<RawPrivateKey>, ModuleError> {
        self.with_session(session, |open| {
            let found = open
                .session
                .find_objects(&[Attribute::Class(ObjectClass::PRIVATE_KEY)])?;

            let mut res = Vec::with_capacity(found.len());
            for object in found {
                let attrs = open.session.get_attributes(
                    object,
                    &[AttributeType::Id, AttributeType::Label, AttributeType::KeyType],
                )?;
                let kind = attrs
                    .iter()
                    .find_map(|attr| match attr {
                        Attribute::KeyType(key_type) if *key_type == KeyType::RSA => Some(KeyKind::Rsa),
                        Attribute::KeyType(key_type) if *key_type == KeyType::EC => Some(KeyKind::Ec),
                        _ => None,
                    })
                    .unwrap_or(KeyKind::Other);
                let id = Self::id_attr(&attrs);
                let label = Self::label_attr(&attrs);
                res.push(RawPrivateKey {
                    handle: Self::register(open, object),
                    id,
                    label,
                    kind,
                });
            }
            Ok(res)
        })
    }

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError> {
        let mechanism = match mechanism {
            SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
            SignMechanism::Ecdsa => Mechanism::Ecdsa,
        };

        let mut sessions = self.sessions.borrow_mut();
        let open = sessions.get_mut(&session.0).ok_or(ModuleError::SessionInvalid)?;
        let object = *open
            .objects
            .get(key.0 as usize)
            .ok_or_else(|| ModuleError::Other(format!("unknown key handle {}", key)))?;
        open.session.sign(&mechanism, object, data).map_err(classify)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), ModuleError> {
        match self.sessions.borrow_mut().remove(&session.0) {
            Some(open) => {
                open.session.close();
                Ok(())
            }
            None => Err(ModuleError::SessionInvalid),
        }
    }

    fn finalize(&self) -> Result<(), ModuleError> {
        // Sessions hold on to the context, so they must go first.
        self.sessions.borrow_mut().clear();
        match self.context.borrow_mut().take() {
            Some(context) => {
                // Dropping the last reference calls C_Finalize.
                drop(context);
                debug!("PKCS#11: finalized library '{}'", self.lib_name);
                Ok(())
            }
            None => Ok(()),
        }
    }
}


//------------ Error classification ------------------------------------------

/// Maps the return values we treat specially. Everything else is passed on
/// as text.
fn classify(err: CryptokiError) -> ModuleError {
    match err {
        CryptokiError::Pkcs11(rv, _) => match rv {
            RvError::PinIncorrect => ModuleError::PinIncorrect,
            RvError::PinLocked => ModuleError::PinLocked,
            RvError::DeviceRemoved | RvError::TokenNotPresent | RvError::TokenNotRecognized => {
                ModuleError::DeviceRemoved
            }
            RvError::SessionHandleInvalid | RvError::SessionClosed => ModuleError::SessionInvalid,
            RvError::UserNotLoggedIn => ModuleError::NotLoggedIn,
            RvError::UserAlreadyLoggedIn => ModuleError::AlreadyLoggedIn,
            other => ModuleError::Other(other.to_string()),
        },
        other => ModuleError::Other(other.to_string()),
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use cryptoki::context::Function;

    use super::*;

    fn rv(rv: RvError, function: Function) -> ModuleError {
        classify(CryptokiError::Pkcs11(rv, function))
    }

    #[test]
    fn login_return_values_are_classified() {
        assert_eq!(rv(RvError::PinIncorrect, Function::Login), ModuleError::PinIncorrect);
        assert_eq!(rv(RvError::PinLocked, Function::Login), ModuleError::PinLocked);
        assert_eq!(
            rv(RvError::UserAlreadyLoggedIn, Function::Login),
            ModuleError::AlreadyLoggedIn
        );
        assert_eq!(rv(RvError::UserNotLoggedIn, Function::Sign), ModuleError::NotLoggedIn);
    }

    #[test]
    fn lost_cards_and_sessions_are_classified() {
        for removed in [
            RvError::DeviceRemoved,
            RvError::TokenNotPresent,
            RvError::TokenNotRecognized,
        ] {
            assert_eq!(rv(removed, Function::OpenSession), ModuleError::DeviceRemoved);
        }
        assert_eq!(
            rv(RvError::SessionHandleInvalid, Function::Sign),
            ModuleError::SessionInvalid
        );
        assert_eq!(rv(RvError::SessionClosed, Function::Sign), ModuleError::SessionInvalid);
        assert!(matches!(
            rv(RvError::FunctionFailed, Function::Sign),
            ModuleError::Other(_)
        ));
    }

    #[test]
    fn garbage_library_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libpkcs11_fake.so");
        fs::write(&path, b"not a shared object").unwrap();

        match CryptokiModule::load(&path) {
            Err(Error::LibraryLoad { path: failed, reason }) => {
                assert_eq!(failed, path);
                assert!(!reason.is_empty());
            }
            Err(err) => panic!("unexpected error: {}", err),
            Ok(_) => panic!("garbage loaded as a PKCS#11 library"),
        }
    }

    #[test]
    fn missing_library_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.so");
        assert!(matches!(
            CryptokiModule::load(&path),
            Err(Error::LibraryLoad { .. })
        ));
    }
}
