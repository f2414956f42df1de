#![allow(dead_code)] // Different tests use different parts.

use std::cell::Cell;
use std::rc::Rc;

use eidsign::card::mock::{rsa_credentials, MockModule, MockToken};
use eidsign::card::CardDeviceController;
use eidsign::error::Error;
use eidsign::pin::{PinPrompt, PinProvider, PinSecret};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use openssl::pkey::{PKey, Private};
use secrecy::SecretString;


//------------ CountingPin ---------------------------------------------------

/// Answers every prompt with the same PIN and counts how often it was
/// asked.
pub struct CountingPin {
    pin: String,
    asked: Rc<Cell<u32>>,
}

impl CountingPin {
    pub fn new(pin: &str) -> (Self, Rc<Cell<u32>>) {
        let asked = Rc::new(Cell::new(0));
        (
            CountingPin {
                pin: pin.to_string(),
                asked: asked.clone(),
            },
            asked,
        )
    }
}

impl PinProvider for CountingPin {
    fn acquire_pin(&self, _prompt: &PinPrompt) -> Result<PinSecret, Error> {
        self.asked.set(self.asked.get() + 1);
        Ok(PinSecret::Pin(SecretString::from(self.pin.clone())))
    }
}


//------------ Card setups ---------------------------------------------------

pub const PIN: &str = "1234";

/// Mints a certificate and key for `common_name`.
pub fn credentials(common_name: &str) -> (Vec<u8>, PKey<Private>) {
    rsa_credentials(common_name).unwrap()
}

/// One slot, one token with PIN 1234 and one certificate and key with ID
/// "A1".
pub fn single_pair_card(common_name: &str) -> (Rc<MockModule>, Vec<u8>) {
    let (der, key) = credentials(common_name);
    let mock = Rc::new(MockModule::new().with_token(MockToken::new("SIG_EP", PIN).with_pair(b"A1", der.clone(), key)));
    (mock, der)
}

/// A controller over `mock` that answers with `pin`.
pub fn controller(mock: &Rc<MockModule>, pin: &str) -> (CardDeviceController, Rc<Cell<u32>>) {
    let (provider, asked) = CountingPin::new(pin);
    (CardDeviceController::new(mock.clone(), Box::new(provider)), asked)
}

/// Checks that all sessions were closed once and the module finalized.
pub fn assert_released(mock: &MockModule) {
    assert_eq!(mock.open_sessions(), 0);
    assert!(mock.is_finalized());
    assert!(mock.violations().is_empty(), "{:?}", mock.violations());
}


//------------ PDF documents -------------------------------------------------

/// A one page PDF with a line of text.
pub fn sample_pdf() -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 24.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
            Operation::new("Tj", vec![Object::string_literal("Signed with an eID card")]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut data = Vec::new();
    doc.save_to(&mut data).unwrap();
    data
}


//------------ Signature inspection ------------------------------------------

/// What we find about one signature in a signed PDF.
pub struct EmbeddedSignature {
    pub byte_range: Vec<usize>,
    pub cms: Vec<u8>,
    pub name: Vec<u8>,
    pub field_name: Vec<u8>,
}

impl EmbeddedSignature {
    /// The bytes the signature covers.
    pub fn signed_bytes(&self, pdf: &[u8]) -> Vec<u8> {
        let [a, b, c, d] = [self.byte_range[0], self.byte_range[1], self.byte_range[2], self.byte_range[3]];
        let mut res = pdf[a..a + b].to_vec();
        res.extend_from_slice(&pdf[c..c + d]);
        res
    }
}

/// Returns all signatures reachable through the form fields.
pub fn embedded_signatures(pdf: &[u8]) -> Vec<EmbeddedSignature> {
    let doc = Document::load_mem(pdf).unwrap();
    let catalog = doc.trailer.get(b"Root").and_then(Object::as_reference).unwrap();
    let catalog = doc.get_object(catalog).and_then(Object::as_dict).unwrap();
    let form = catalog.get(b"AcroForm").and_then(Object::as_reference).unwrap();
    let form = doc.get_object(form).and_then(Object::as_dict).unwrap();
    assert_eq!(form.get(b"SigFlags").and_then(Object::as_i64).unwrap(), 3);

    form.get(b"Fields")
        .and_then(Object::as_array)
        .unwrap()
        .iter()
        .map(|field| {
            let field = doc
                .get_object(field.as_reference().unwrap())
                .and_then(Object::as_dict)
                .unwrap();
            assert_eq!(field.get(b"FT").and_then(Object::as_name).unwrap(), b"Sig");
            let sig = doc
                .get_object(field.get(b"V").and_then(Object::as_reference).unwrap())
                .and_then(Object::as_dict)
                .unwrap();
            assert_eq!(sig.get(b"SubFilter").and_then(Object::as_name).unwrap(), b"adbe.pkcs7.detached");

            let byte_range = sig
                .get(b"ByteRange")
                .and_then(Object::as_array)
                .unwrap()
                .iter()
                .map(|n| n.as_i64().unwrap() as usize)
                .collect();
            EmbeddedSignature {
                byte_range,
                cms: der_prefix(string_bytes(sig.get(b"Contents").unwrap())),
                name: string_bytes(sig.get(b"Name").unwrap()),
                field_name: string_bytes(field.get(b"T").unwrap()),
            }
        })
        .collect()
}

fn string_bytes(object: &Object) -> Vec<u8> {
    match object {
        Object::String(bytes, _) => bytes.clone(),
        other => panic!("expected a string, found {:?}", other),
    }
}

/// Cuts the zero padding after a DER encoded value.
fn der_prefix(mut bytes: Vec<u8>) -> Vec<u8> {
    assert_eq!(bytes[0], 0x30);
    let len = if bytes[1] < 0x80 {
        2 + bytes[1] as usize
    } else {
        let n = (bytes[1] & 0x7f) as usize;
        let len = bytes[2..2 + n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        2 + n + len
    };
    bytes.truncate(len);
    bytes
}
