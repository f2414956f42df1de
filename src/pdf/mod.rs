//! Embedding a detached PKCS#7 signature into a PDF.
//!
//! The document object model is handled by `lopdf`. This module adds the
//! signature dictionary and an invisible signature field, writes the
//! document out and fills in the signature over the resulting bytes.

pub mod byterange;
pub mod cms;

use std::{collections::HashSet, fmt, fs, path::Path, time::SystemTime};

use log::{debug, info};
use chrono::{DateTime, Local};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, StringFormat};
use openssl::error::ErrorStack;

use self::byterange::PreparedDocument;
use self::cms::DetachedSignature;
use crate::card::CardCertificate;
use crate::config::SignatureConfig;
use crate::constants::{DEFAULT_SIGNATURE_PLACEHOLDER_SIZE, SIGNATURE_FIELD_PREFIX};
use crate::error::Error;
use crate::signing::ExternalSignature;

/// Print flag plus locked, as used for invisible signature widgets.
const WIDGET_FLAGS: i64 = 132;

/// SignaturesExist and AppendOnly.
const SIG_FLAGS: i64 = 3;


//------------ SignatureOptions ----------------------------------------------

/// What goes into the signature dictionary besides the signature itself.
#[derive(Clone, Debug)]
pub struct SignatureOptions {
    pub reason: Option<String>,
    pub location: Option<String>,
    pub contact_info: Option<String>,

    /// Bytes reserved for the DER encoded CMS structure.
    pub placeholder_size: usize,

    pub signing_time: SystemTime,
}

impl SignatureOptions {
    pub fn from_config(config: &SignatureConfig) -> Self {
        SignatureOptions {
            reason: config.reason.clone(),
            location: config.location.clone(),
            contact_info: config.contact_info.clone(),
            placeholder_size: config.placeholder_size,
            signing_time: SystemTime::now(),
        }
    }
}

impl Default for SignatureOptions {
    fn default() -> Self {
        SignatureOptions {
            reason: None,
            location: None,
            contact_info: None,
            placeholder_size: DEFAULT_SIGNATURE_PLACEHOLDER_SIZE,
            signing_time: SystemTime::now(),
        }
    }
}


//------------ Signing -------------------------------------------------------

/// Signs the PDF at `source` and writes the result to `destination`.
///
/// Nothing is written unless signing succeeded.
pub fn sign_file(
    source: &Path,
    destination: &Path,
    certificate: &CardCertificate,
    signer: &dyn ExternalSignature,
    options: &SignatureOptions,
) -> Result<(), Error> {
    let input = fs::read(source).map_err(|e| Error::io(format!("cannot read '{}'", source.display()), e))?;
    let signed = sign_document(&input, certificate, signer, options)?;
    fs::write(destination, signed)
        .map_err(|e| Error::io(format!("cannot write '{}'", destination.display()), e))?;
    info!("Wrote signed document to {}", destination.display());
    Ok(())
}

/// Returns a copy of the PDF in `input` carrying one more signature.
pub fn sign_document(
    input: &[u8],
    certificate: &CardCertificate,
    signer: &dyn ExternalSignature,
    options: &SignatureOptions,
) -> Result<Vec<u8>, Error> {
    if options.placeholder_size == 0 {
        return Err(PdfError::Structure("signature placeholder size must not be zero".to_string()).into());
    }

    let mut doc = Document::load_mem(input).map_err(PdfError::Parse)?;
    let field_name = add_signature_field(&mut doc, certificate, options)?;
    debug!("Added signature field '{}'", field_name);

    let mut data = Vec::new();
    doc.save_to(&mut data).map_err(|e| PdfError::Write(e.to_string()))?;

    let prepared = PreparedDocument::prepare(data, options.placeholder_size)?;
    let digest = prepared.digest(signer.digest_algorithm())?;
    let cms = DetachedSignature::new(certificate, signer, options.signing_time).encode(&digest)?;
    debug!(
        "CMS signature is {} bytes of {} reserved",
        cms.len(),
        options.placeholder_size
    );
    Ok(prepared.embed(&cms)?)
}

/// Adds the signature dictionary and its field, returning the field name.
fn add_signature_field(
    doc: &mut Document,
    certificate: &CardCertificate,
    options: &SignatureOptions,
) -> Result<String, PdfError> {
    let page = doc
        .get_pages()
        .values()
        .next()
        .copied()
        .ok_or_else(|| PdfError::Structure("document has no pages".to_string()))?;
    let catalog = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(|_| PdfError::Structure("document has no catalog".to_string()))?;

    let acro_form = acro_form(doc, catalog)?;
    let field_name = next_field_name(doc, acro_form);

    let name = certificate
        .common_name()
        .unwrap_or_else(|| certificate.subject().to_string());
    let mut signature = dictionary! {
        "Type" => "Sig",
        "Filter" => "Adobe.PPKLite",
        "SubFilter" => "adbe.pkcs7.detached",
        "ByteRange" => byterange::byte_range_placeholder(),
        "Contents" => byterange::contents_placeholder(options.placeholder_size),
        "M" => Object::string_literal(pdf_date(options.signing_time)),
        "Name" => text_string(&name),
    };
    if let Some(reason) = &options.reason {
        signature.set("Reason", text_string(reason));
    }
    if let Some(location) = &options.location {
        signature.set("Location", text_string(location));
    }
    if let Some(contact_info) = &options.contact_info {
        signature.set("ContactInfo", text_string(contact_info));
    }
    let signature = doc.add_object(signature);

    let widget = doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Sig",
        "T" => text_string(&field_name),
        "V" => signature,
        "F" => WIDGET_FLAGS,
        "Rect" => vec![0.into(), 0.into(), 0.into(), 0.into()],
        "P" => page,
    });

    append_to_array(doc, page, b"Annots", widget.into())?;
    append_to_array(doc, acro_form, b"Fields", widget.into())?;
    doc.get_object_mut(acro_form)
        .and_then(Object::as_dict_mut)
        .map_err(PdfError::Parse)?
        .set("SigFlags", SIG_FLAGS);

    Ok(field_name)
}

/// Returns the interactive form dictionary, making it an indirect object.
fn acro_form(doc: &mut Document, catalog: ObjectId) -> Result<ObjectId, PdfError> {
    let existing = doc
        .get_object(catalog)
        .and_then(Object::as_dict)
        .map_err(PdfError::Parse)?
        .get(b"AcroForm")
        .ok()
        .cloned();

    let form = match existing {
        Some(Object::Reference(id)) => return Ok(id),
        Some(Object::Dictionary(dict)) => dict,
        Some(_) => return Err(PdfError::Structure("/AcroForm is not a dictionary".to_string())),
        None => Dictionary::new(),
    };
    let id = doc.add_object(form);
    doc.get_object_mut(catalog)
        .and_then(Object::as_dict_mut)
        .map_err(PdfError::Parse)?
        .set("AcroForm", id);
    Ok(id)
}

/// Picks `Signature1`, `Signature2`, ... whichever is not taken yet.
fn next_field_name(doc: &Document, acro_form: ObjectId) -> String {
    let mut taken = HashSet::new();
    let fields = doc
        .get_object(acro_form)
        .and_then(Object::as_dict)
        .and_then(|form| form.get(b"Fields"))
        .and_then(|fields| resolve(doc, fields))
        .and_then(Object::as_array);
    if let Ok(fields) = fields {
        for field in fields {
            let title = resolve(doc, field)
                .and_then(Object::as_dict)
                .and_then(|field| field.get(b"T"));
            if let Ok(Object::String(bytes, _)) = title {
                taken.insert(bytes.clone());
            }
        }
    }

    (1..)
        .map(|n| format!("{}{}", SIGNATURE_FIELD_PREFIX, n))
        .find(|name| !taken.contains(name.as_bytes()))
        .unwrap_or_else(|| SIGNATURE_FIELD_PREFIX.to_string())
}

/// Adds `item` to the array under `key` in the dictionary `owner`.
///
/// The array may be inline, indirect or missing.
fn append_to_array(doc: &mut Document, owner: ObjectId, key: &[u8], item: Object) -> Result<(), PdfError> {
    let existing = doc
        .get_object(owner)
        .and_then(Object::as_dict)
        .map_err(PdfError::Parse)?
        .get(key)
        .ok()
        .cloned();

    match existing {
        Some(Object::Reference(id)) => {
            doc.get_object_mut(id)
                .and_then(Object::as_array_mut)
                .map_err(PdfError::Parse)?
                .push(item);
        }
        Some(Object::Array(_)) => {
            doc.get_object_mut(owner)
                .and_then(Object::as_dict_mut)
                .and_then(|dict| dict.get_mut(key))
                .and_then(Object::as_array_mut)
                .map_err(PdfError::Parse)?
                .push(item);
        }
        Some(_) => {
            return Err(PdfError::Structure(format!(
                "/{} is not an array",
                String::from_utf8_lossy(key)
            )));
        }
        None => {
            doc.get_object_mut(owner)
                .and_then(Object::as_dict_mut)
                .map_err(PdfError::Parse)?
                .set(key.to_vec(), Object::Array(vec![item]));
        }
    }
    Ok(())
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> lopdf::Result<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id),
        other => Ok(other),
    }
}

/// Formats a time as a PDF date, `D:YYYYMMDDHHmmSS+HH'mm'`.
fn pdf_date(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    let offset = local.format("%z").to_string();
    let (hours, minutes) = offset.split_at(offset.len().min(3));
    format!("D:{}{}'{}'", local.format("%Y%m%d%H%M%S"), hours, minutes)
}

/// Encodes a PDF text string, using UTF-16BE for anything beyond ASCII.
fn text_string(text: &str) -> Object {
    if text.is_ascii() {
        Object::string_literal(text)
    } else {
        let mut bytes = vec![0xfe, 0xff];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        Object::String(bytes, StringFormat::Literal)
    }
}


//------------ PdfError ------------------------------------------------------

#[derive(Debug)]
pub enum PdfError {
    /// The document could not be read or lacks an expected object.
    Parse(lopdf::Error),

    /// The document could not be written.
    Write(String),

    /// The document does not have the shape needed for signing.
    Structure(String),

    Crypto(ErrorStack),

    /// The CMS structure could not be encoded.
    Cms(der::Error),

    /// The signature does not fit into the reserved space.
    SignatureTooLarge { needed: usize, available: usize },
}

impl PdfError {
    pub fn crypto(e: ErrorStack) -> Self {
        PdfError::Crypto(e)
    }

    pub fn cms(e: der::Error) -> Self {
        PdfError::Cms(e)
    }
}

impl fmt::Display for PdfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PdfError::Parse(e) => write!(f, "cannot parse document: {}", e),
            PdfError::Write(e) => write!(f, "cannot write document: {}", e),
            PdfError::Structure(s) => s.fmt(f),
            PdfError::Crypto(e) => write!(f, "cannot hash document: {}", e),
            PdfError::Cms(e) => write!(f, "cannot encode CMS signature: {}", e),
            PdfError::SignatureTooLarge { needed, available } => write!(
                f,
                "signature needs {} bytes but only {} are reserved, increase placeholder_size",
                needed, available
            ),
        }
    }
}

impl std::error::Error for PdfError {}

impl From<lopdf::Error> for PdfError {
    fn from(e: lopdf::Error) -> Self {
        PdfError::Parse(e)
    }
}


//------------ Tests ---------------------------------------------------------
