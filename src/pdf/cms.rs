//! The detached CMS SignedData that goes into `/Contents`.

use std::time::SystemTime;

use cms::{
    cert::{CertificateChoices, IssuerAndSerialNumber},
    content_info::{CmsVersion, ContentInfo},
    signed_data::{
        CertificateSet, EncapsulatedContentInfo, SignedAttributes, SignedData, SignerIdentifier,
        SignerInfo, SignerInfos,
    },
};
use der::{
    asn1::{Any, OctetString, SetOfVec, UtcTime},
    Decode, Encode,
};
use spki::{AlgorithmIdentifierOwned, ObjectIdentifier};
use x509_cert::{attr::Attribute, Certificate};

use super::PdfError;
use crate::{
    card::CardCertificate,
    error::Error,
    signing::{ExternalSignature, KeyAlgorithm},
};

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const ID_CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
const ID_SIGNING_TIME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");


//------------ DetachedSignature ---------------------------------------------

/// Builds a SignedData over content that is not included.
pub struct DetachedSignature<'a> {
    certificate: &'a CardCertificate,
    signer: &'a dyn ExternalSignature,
    signing_time: SystemTime,
}

impl<'a> DetachedSignature<'a> {
    pub fn new(certificate: &'a CardCertificate, signer: &'a dyn ExternalSignature, signing_time: SystemTime) -> Self {
        DetachedSignature {
            certificate,
            signer,
            signing_time,
        }
    }

    /// Returns the DER encoded ContentInfo for the given content digest.
    ///
    /// The signer signs the digest of the DER encoded signed attributes,
    /// which carry `content_digest` as the message digest.
    pub fn encode(&self, content_digest: &[u8]) -> Result<Vec<u8>, Error> {
        let digest_algorithm = self.signer.digest_algorithm();
        let certificate = Certificate::from_der(self.certificate.raw()).map_err(Error::malformed)?;

        let digest_alg = AlgorithmIdentifierOwned {
            oid: digest_algorithm.oid(),
            parameters: None,
        };

        let signed_attrs = self.signed_attributes(content_digest)?;
        let signed_attrs_der = signed_attrs.to_der().map_err(PdfError::cms)?;
        let attrs_digest = digest_algorithm.digest(&signed_attrs_der)?;
        let signature = self.signer.sign(&attrs_digest, digest_algorithm)?;

        let signature_algorithm = match self.signer.key_algorithm() {
            KeyAlgorithm::Rsa => AlgorithmIdentifierOwned {
                oid: KeyAlgorithm::Rsa.signature_oid(digest_algorithm),
                parameters: Some(Any::null()),
            },
            KeyAlgorithm::Ecdsa => AlgorithmIdentifierOwned {
                oid: KeyAlgorithm::Ecdsa.signature_oid(digest_algorithm),
                parameters: None,
            },
        };

        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: certificate.tbs_certificate.issuer.clone(),
                serial_number: certificate.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_alg.clone(),
            signed_attrs: Some(signed_attrs),
            signature_algorithm,
            signature: OctetString::new(signature).map_err(PdfError::cms)?,
            unsigned_attrs: None,
        };

        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms: SetOfVec::try_from(vec![digest_alg]).map_err(PdfError::cms)?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: ID_DATA,
                econtent: None,
            },
            certificates: Some(CertificateSet(
                SetOfVec::try_from(vec![CertificateChoices::Certificate(certificate)]).map_err(PdfError::cms)?,
            )),
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info]).map_err(PdfError::cms)?),
        };

        let content_info = ContentInfo {
            content_type: ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data).map_err(PdfError::cms)?,
        };
        Ok(content_info.to_der().map_err(PdfError::cms)?)
    }

    fn signed_attributes(&self, content_digest: &[u8]) -> Result<SignedAttributes, PdfError> {
        let signing_time = UtcTime::from_system_time(self.signing_time).map_err(PdfError::cms)?;
        let message_digest = OctetString::new(content_digest).map_err(PdfError::cms)?;

        SetOfVec::try_from(vec![
            attribute(ID_CONTENT_TYPE, Any::encode_from(&ID_DATA).map_err(PdfError::cms)?)?,
            attribute(ID_SIGNING_TIME, Any::encode_from(&signing_time).map_err(PdfError::cms)?)?,
            attribute(ID_MESSAGE_DIGEST, Any::encode_from(&message_digest).map_err(PdfError::cms)?)?,
        ])
        .map_err(PdfError::cms)
    }
}

fn attribute(oid: ObjectIdentifier, value: Any) -> Result<Attribute, PdfError> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value]).map_err(PdfError::cms)?,
    })
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    use openssl::{
        pkcs7::{Pkcs7, Pkcs7Flags},
        pkey::{PKey, Private},
        stack::Stack,
        x509::store::X509StoreBuilder,
    };

    use crate::card::mock::{ec_credentials, rsa_credentials};
    use crate::signing::DigestAlgorithm;

    /// Signs with a key in memory, the way a token would.
    struct SoftSigner {
        key: PKey<Private>,
        algorithm: KeyAlgorithm,
        calls: Cell<usize>,
    }

    impl ExternalSignature for SoftSigner {
        fn digest_algorithm(&self) -> DigestAlgorithm {
            DigestAlgorithm::Sha256
        }

        fn key_algorithm(&self) -> KeyAlgorithm {
            self.algorithm
        }

        fn sign(&self, digest: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>, Error> {
            self.calls.set(self.calls.get() + 1);
            match self.algorithm {
                KeyAlgorithm::Rsa => {
                    let rsa = self.key.rsa().map_err(Error::signing)?;
                    let mut data = algorithm.digest_info_prefix().to_vec();
                    data.extend_from_slice(digest);
                    let mut out = vec![0; rsa.size() as usize];
                    let len = rsa
                        .private_encrypt(&data, &mut out, openssl::rsa::Padding::PKCS1)
                        .map_err(Error::signing)?;
                    out.truncate(len);
                    Ok(out)
                }
                KeyAlgorithm::Ecdsa => {
                    let ec = self.key.ec_key().map_err(Error::signing)?;
                    openssl::ecdsa::EcdsaSig::sign(digest, &ec)
                        .and_then(|sig| sig.to_der())
                        .map_err(Error::signing)
                }
            }
        }
    }

    fn verify(der: &[u8], cert_der: &[u8], content: &[u8]) {
        let pkcs7 = Pkcs7::from_der(der).unwrap();
        let store = X509StoreBuilder::new().unwrap().build();
        let certs = Stack::new().unwrap();
        let mut out = Vec::new();
        pkcs7
            .verify(
                &certs,
                &store,
                Some(content),
                Some(&mut out),
                Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
            )
            .unwrap();

        let signers = pkcs7.signers(&certs, Pkcs7Flags::empty()).unwrap();
        assert_eq!(signers.len(), 1);
        assert_eq!(signers.get(0).unwrap().to_der().unwrap(), cert_der);
    }

    #[test]
    fn rsa_signed_data_verifies() {
        let (cert_der, key) = rsa_credentials("CMS RSA").unwrap();
        let certificate = CardCertificate::from_der(cert_der.clone()).unwrap();
        let signer = SoftSigner {
            key,
            algorithm: KeyAlgorithm::Rsa,
            calls: Cell::new(0),
        };

        let content = b"the signed part of a document";
        let digest = DigestAlgorithm::Sha256.digest(content).unwrap();
        let der = DetachedSignature::new(&certificate, &signer, SystemTime::now())
            .encode(&digest)
            .unwrap();

        assert_eq!(signer.calls.get(), 1);
        verify(&der, &cert_der, content);
    }

    #[test]
    fn ecdsa_signed_data_verifies() {
        let (cert_der, key) = ec_credentials("CMS EC").unwrap();
        let certificate = CardCertificate::from_der(cert_der.clone()).unwrap();
        let signer = SoftSigner {
            key,
            algorithm: KeyAlgorithm::Ecdsa,
            calls: Cell::new(0),
        };

        let content = b"another document";
        let digest = DigestAlgorithm::Sha256.digest(content).unwrap();
        let der = DetachedSignature::new(&certificate, &signer, SystemTime::now())
            .encode(&digest)
            .unwrap();
        verify(&der, &cert_der, content);
    }

    #[test]
    fn tampered_content_fails() {
        let (cert_der, key) = rsa_credentials("CMS Tamper").unwrap();
        let certificate = CardCertificate::from_der(cert_der).unwrap();
        let signer = SoftSigner {
            key,
            algorithm: KeyAlgorithm::Rsa,
            calls: Cell::new(0),
        };

        let digest = DigestAlgorithm::Sha256.digest(b"original").unwrap();
        let der = DetachedSignature::new(&certificate, &signer, SystemTime::now())
            .encode(&digest)
            .unwrap();

        let pkcs7 = Pkcs7::from_der(&der).unwrap();
        let store = X509StoreBuilder::new().unwrap().build();
        let certs = Stack::new().unwrap();
        assert!(pkcs7
            .verify(
                &certs,
                &store,
                Some(b"changed"),
                None,
                Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
            )
            .is_err());
    }
}
