//! X.509 certificates read from a token.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::{
    hash::MessageDigest,
    nid::Nid,
    x509::{X509, X509NameRef},
};

use crate::error::Error;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";
const PEM_LINE_LEN: usize = 64;


//------------ CardCertificate -----------------------------------------------

/// A parsed certificate together with the exact bytes it was read from.
#[derive(Clone)]
pub struct CardCertificate {
    raw: Vec<u8>,
    x509: X509,
    thumbprint: String,
    subject: String,
    issuer: String,
}

impl CardCertificate {
    /// Parses a DER encoded certificate.
    pub fn from_der(raw: Vec<u8>) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::malformed("empty certificate value"));
        }
        let x509 = X509::from_der(&raw).map_err(Error::malformed)?;
        let thumbprint = x509
            .digest(MessageDigest::sha1())
            .map(|digest| hex::encode_upper(&*digest))
            .map_err(Error::malformed)?;
        let subject = format_name(x509.subject_name());
        let issuer = format_name(x509.issuer_name());

        Ok(CardCertificate {
            raw,
            x509,
            thumbprint,
            subject,
            issuer,
        })
    }

    /// The DER encoding as found on the token.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    /// The SHA-1 hash of the DER encoding in upper case hex.
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// The subject as a distinguished name, most specific part first.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The common name of the subject, if it has one.
    pub fn common_name(&self) -> Option<String> {
        self.x509
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().to_string().ok())
    }

    /// The thumbprint, subject and issuer lines shown by `list`.
    pub fn description(&self) -> String {
        format!(
            "Thumbprint: {}\nSubject: {}\nIssuer: {}\n",
            self.thumbprint, self.subject, self.issuer
        )
    }

    /// Encodes the certificate as a PEM block with 64 character lines.
    pub fn to_pem(&self) -> String {
        encode_pem(&self.raw)
    }

    /// Reads all certificates from PEM text.
    ///
    /// This is the inverse of [`to_pem`][Self::to_pem] and turns `list
    /// --output-format pem` output back into certificates.
    pub fn from_pem(pem: &str) -> Result<Vec<Self>, Error> {
        let mut reader = pem.as_bytes();
        rustls_pemfile::certs(&mut reader)
            .map(|res| {
                let der = res.map_err(Error::malformed)?;
                CardCertificate::from_der(der.to_vec())
            })
            .collect()
    }
}

impl fmt::Debug for CardCertificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CardCertificate")
            .field("thumbprint", &self.thumbprint)
            .field("subject", &self.subject)
            .finish()
    }
}

impl PartialEq for CardCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for CardCertificate {}


//------------ Helpers -------------------------------------------------------

/// Formats a name as `CN=..., O=..., C=...`.
///
/// Entries are listed in reverse encoding order, which puts the most
/// specific one first.
fn format_name(name: &X509NameRef) -> String {
    let mut parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let key = entry
                .object()
                .nid()
                .short_name()
                .map(ToString::to_string)
                .unwrap_or_else(|_| entry.object().to_string());
            let value = entry
                .data()
                .to_string()
                .unwrap_or_else(|_| hex::encode_upper(entry.data().as_slice()));
            format!("{}={}", key, value)
        })
        .collect();
    parts.reverse();
    parts.join(", ")
}

fn encode_pem(der: &[u8]) -> String {
    let b64 = BASE64.encode(der);
    let mut pem = String::with_capacity(b64.len() + b64.len() / PEM_LINE_LEN + 64);
    pem.push_str(PEM_BEGIN);
    pem.push('\n');
    for line in b64.as_bytes().chunks(PEM_LINE_LEN) {
        // base64 output is plain ASCII
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_END);
    pem.push('\n');
    pem
}


//------------ Tests ---------------------------------------------------------
