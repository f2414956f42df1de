//! Pairing certificates with the private keys that can sign for them.

use std::{fmt, rc::Rc};

use log::{debug, trace};
use super::{
    certificate::CardCertificate,
    module::{KeyKind, ObjectHandle, RawPrivateKey, SlotId},
    session::Pkcs11Session,
};
use crate::error::Error;


//------------ TokenCertificate ----------------------------------------------

/// A certificate object that parsed correctly, with its CKA_ID.
#[derive(Clone, Debug)]
pub struct TokenCertificate {
    pub slot: SlotId,
    pub id: Vec<u8>,
    pub label: String,
    pub certificate: CardCertificate,
}


//------------ SigningCertificate --------------------------------------------

/// A certificate whose private key is available in an open session.
///
/// The certificate object and the key object were found in the same
/// session and carry the same non-empty CKA_ID.
pub struct SigningCertificate {
    certificate: CardCertificate,
    key: RawPrivateKey,
    session: Rc<Pkcs11Session>,
}

impl SigningCertificate {
    pub fn certificate(&self) -> &CardCertificate {
        &self.certificate
    }

    pub fn key_handle(&self) -> ObjectHandle {
        self.key.handle
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key.kind
    }

    pub fn key_id(&self) -> &[u8] {
        &self.key.id
    }

    pub fn session(&self) -> &Pkcs11Session {
        &self.session
    }

    pub fn slot(&self) -> SlotId {
        self.session.slot()
    }
}

impl fmt::Debug for SigningCertificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SigningCertificate")
            .field("subject", &self.certificate.subject())
            .field("key_id", &hex::encode(&self.key.id))
            .field("key_kind", &self.key.kind)
            .field("slot", &self.session.slot())
            .finish()
    }
}


//------------ Correlation ---------------------------------------------------

/// Returns a signing certificate for every certificate and key pair with
/// identical IDs, in certificate order.
///
/// Empty IDs never match. A certificate matching several keys is returned
/// several times.
pub fn correlate(
    session: &Rc<Pkcs11Session>,
    certificates: Vec<TokenCertificate>,
    keys: &[RawPrivateKey],
) -> Vec<SigningCertificate> {
    let mut res = Vec::new();
    for cert in certificates {
        if cert.id.is_empty() {
            debug!(
                "Certificate '{}' in slot {} has no ID, it cannot be matched to a key",
                cert.certificate.subject(),
                cert.slot
            );
            continue;
        }
        for key in keys.iter().filter(|key| key.id == cert.id) {
            trace!(
                "Certificate '{}' matches key '{}' (ID {})",
                cert.certificate.subject(),
                key.label,
                hex::encode(&key.id)
            );
            res.push(SigningCertificate {
                certificate: cert.certificate.clone(),
                key: key.clone(),
                session: session.clone(),
            });
        }
    }
    res
}

/// Picks the only signing certificate there is.
///
/// Fails if there is none or more than one, rather than guessing.
pub fn resolve_single(mut candidates: Vec<SigningCertificate>) -> Result<SigningCertificate, Error> {
    match candidates.len() {
        1 => candidates.pop().ok_or(Error::AmbiguousOrMissingSigningCertificate { found: 0 }),
        found => Err(Error::AmbiguousOrMissingSigningCertificate { found }),
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::mock::{rsa_credentials, MockModule, MockToken};

    fn session() -> Rc<Pkcs11Session> {
        let mock = Rc::new(MockModule::new().with_token(MockToken::new("T", "1234")));
        Rc::new(Pkcs11Session::open(mock, SlotId(0)).unwrap())
    }

    fn cert(id: &[u8], certificate: &CardCertificate) -> TokenCertificate {
        TokenCertificate {
            slot: SlotId(0),
            id: id.to_vec(),
            label: String::new(),
            certificate: certificate.clone(),
        }
    }

    fn key(handle: u64, id: &[u8]) -> RawPrivateKey {
        RawPrivateKey {
            handle: ObjectHandle(handle),
            id: id.to_vec(),
            label: String::new(),
            kind: KeyKind::Rsa,
        }
    }

    fn certificate() -> CardCertificate {
        let (der, _) = rsa_credentials("Resolver").unwrap();
        CardCertificate::from_der(der).unwrap()
    }

    #[test]
    fn no_matching_pair_fails() {
        let session = session();
        let c = certificate();

        let cases: Vec<(Vec<TokenCertificate>, Vec<RawPrivateKey>)> = vec![
            (vec![], vec![]),
            (vec![cert(b"A1", &c)], vec![]),
            (vec![], vec![key(1, b"A1")]),
            (vec![cert(b"A1", &c)], vec![key(1, b"A2")]),
            (vec![cert(b"A1", &c)], vec![key(1, b"a1")]),
            (vec![cert(b"", &c)], vec![key(1, b"")]),
        ];

        for (certs, keys) in cases {
            let found = correlate(&session, certs, &keys);
            assert!(matches!(
                resolve_single(found),
                Err(Error::AmbiguousOrMissingSigningCertificate { found: 0 })
            ));
        }
    }

    #[test]
    fn exactly_one_pair_resolves() {
        let session = session();
        let c = certificate();

        let found = correlate(
            &session,
            vec![cert(b"B2", &c), cert(b"A1", &c)],
            &[key(7, b"A1"), key(8, b"C3")],
        );
        let signing = resolve_single(found).unwrap();
        assert_eq!(signing.key_handle(), ObjectHandle(7));
        assert_eq!(signing.key_id(), b"A1");
        assert_eq!(signing.slot(), SlotId(0));
    }

    #[test]
    fn two_pairs_are_ambiguous() {
        let session = session();
        let c = certificate();

        let found = correlate(
            &session,
            vec![cert(b"A1", &c), cert(b"B2", &c)],
            &[key(1, b"B2"), key(2, b"A1")],
        );
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].key_handle(), ObjectHandle(2));
        assert!(matches!(
            resolve_single(found),
            Err(Error::AmbiguousOrMissingSigningCertificate { found: 2 })
        ));

        let found = correlate(&session, vec![cert(b"A1", &c)], &[key(1, b"A1"), key(2, b"A1")]);
        assert!(matches!(
            resolve_single(found),
            Err(Error::AmbiguousOrMissingSigningCertificate { found: 2 })
        ));
    }
}
