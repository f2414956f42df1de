//! Signing with a key that never leaves the card.

use std::{fmt, str::FromStr};

use log::debug;
use der::{asn1::UintRef, Encode};
use openssl::hash::MessageDigest;
use serde::{de, Deserialize, Deserializer};
use spki::ObjectIdentifier;

use crate::card::module::{KeyKind, SignMechanism};
use crate::card::SigningCertificate;
use crate::error::Error;


//------------ DigestAlgorithm -----------------------------------------------

/// The hash used for the document and the signed attributes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

// DER encoded DigestInfo up to and including the OCTET STRING header.
const SHA256_DIGEST_INFO: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];
const SHA384_DIGEST_INFO: &[u8] = &[
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05,
    0x00, 0x04, 0x30,
];
const SHA512_DIGEST_INFO: &[u8] = &[
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05,
    0x00, 0x04, 0x40,
];

impl DigestAlgorithm {
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha256 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1"),
            DigestAlgorithm::Sha384 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2"),
            DigestAlgorithm::Sha512 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3"),
        }
    }

    /// The length of a digest in bytes.
    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// The DigestInfo header that goes before the digest for RSA PKCS#1
    /// v1.5 signatures.
    pub fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Sha256 => SHA256_DIGEST_INFO,
            DigestAlgorithm::Sha384 => SHA384_DIGEST_INFO,
            DigestAlgorithm::Sha512 => SHA512_DIGEST_INFO,
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    /// Hashes `data`.
    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        openssl::hash::hash(self.message_digest(), data)
            .map(|digest| digest.to_vec())
            .map_err(|e| Error::signing(format!("cannot compute {} digest: {}", self, e)))
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
            DigestAlgorithm::Sha384 => write!(f, "sha384"),
            DigestAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "sha384" | "sha-384" => Ok(DigestAlgorithm::Sha384),
            "sha512" | "sha-512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(format!(
                "expected \"sha256\", \"sha384\" or \"sha512\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for DigestAlgorithm {
    fn deserialize<D>(d: D) -> Result<DigestAlgorithm, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        DigestAlgorithm::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ KeyAlgorithm --------------------------------------------------

/// The public key algorithm of the signing key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

impl KeyAlgorithm {
    /// The OID of the signature algorithm for the given digest, as it
    /// appears in a SignerInfo.
    pub fn signature_oid(self, digest: DigestAlgorithm) -> ObjectIdentifier {
        match (self, digest) {
            // PKCS#7 signers traditionally give rsaEncryption here.
            (KeyAlgorithm::Rsa, _) => ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1"),
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha256) => ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2"),
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha384) => ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3"),
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha512) => ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4"),
        }
    }
}


//------------ ExternalSignature ---------------------------------------------

/// Something that turns a digest into a signature without handing out the
/// private key.
pub trait ExternalSignature {
    /// The digest algorithm the signer expects.
    fn digest_algorithm(&self) -> DigestAlgorithm;

    fn key_algorithm(&self) -> KeyAlgorithm;

    /// Signs a digest computed with `algorithm`.
    ///
    /// RSA signatures are PKCS#1 v1.5, ECDSA signatures are DER encoded.
    fn sign(&self, digest: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>, Error>;
}


//------------ Pkcs11ExternalSignature ---------------------------------------

/// Signs with a private key on a token, in the session the key was found
/// in.
///
/// The session must already be logged in. There is no second login here.
pub struct Pkcs11ExternalSignature<'a> {
    signing: &'a SigningCertificate,
    digest_algorithm: DigestAlgorithm,
    key_algorithm: KeyAlgorithm,
}

impl<'a> Pkcs11ExternalSignature<'a> {
    pub fn new(signing: &'a SigningCertificate, digest_algorithm: DigestAlgorithm) -> Result<Self, Error> {
        let key_algorithm = match signing.key_kind() {
            KeyKind::Rsa => KeyAlgorithm::Rsa,
            KeyKind::Ec => KeyAlgorithm::Ecdsa,
            KeyKind::Other => {
                return Err(Error::signing(format!(
                    "key for '{}' is of an unsupported type",
                    signing.certificate().subject()
                )));
            }
        };
        Ok(Pkcs11ExternalSignature {
            signing,
            digest_algorithm,
            key_algorithm,
        })
    }

    pub fn signing_certificate(&self) -> &SigningCertificate {
        self.signing
    }
}

impl ExternalSignature for Pkcs11ExternalSignature<'_> {
    fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    fn sign(&self, digest: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>, Error> {
        if digest.len() != algorithm.output_len() {
            return Err(Error::signing(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.output_len(),
                digest.len()
            )));
        }

        let session = self.signing.session();
        let key = self.signing.key_handle();
        debug!(
            "Signing {} digest with {:?} key in slot {}",
            algorithm,
            self.key_algorithm,
            session.slot()
        );

        match self.key_algorithm {
            KeyAlgorithm::Rsa => {
                let mut data = Vec::with_capacity(algorithm.digest_info_prefix().len() + digest.len());
                data.extend_from_slice(algorithm.digest_info_prefix());
                data.extend_from_slice(digest);
                session
                    .sign(key, SignMechanism::RsaPkcs, &data)
                    .map_err(|e| Error::signing(format!("token refused to sign: {}", e)))
            }
            KeyAlgorithm::Ecdsa => {
                let raw = session
                    .sign(key, SignMechanism::Ecdsa, digest)
                    .map_err(|e| Error::signing(format!("token refused to sign: {}", e)))?;
                ecdsa_raw_to_der(&raw)
            }
        }
    }
}


//------------ ECDSA encoding ------------------------------------------------

/// ECDSA-Sig-Value from RFC 3279.
#[derive(der::Sequence)]
struct EcdsaSigValue<'a> {
    r: UintRef<'a>,
    s: UintRef<'a>,
}

/// Converts the `r || s` output of CKM_ECDSA to its DER form.
fn ecdsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, Error> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(Error::signing(format!(
            "unexpected ECDSA signature length {}",
            raw.len()
        )));
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let value = EcdsaSigValue {
        r: UintRef::new(r).map_err(Error::signing)?,
        s: UintRef::new(s).map_err(Error::signing)?,
    };
    value.to_der().map_err(Error::signing)
}


//------------ Tests ---------------------------------------------------------
