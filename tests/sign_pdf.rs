//! The `sign` command against a mock card.

mod common;

use std::fs;
use std::rc::Rc;

use eidsign::card::mock::{ec_credentials, FnIdx, MockModule, MockToken};
use eidsign::cli::sign_pdf;
use eidsign::error::Error;
use eidsign::pdf::{PdfError, SignatureOptions};
use eidsign::signing::DigestAlgorithm;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;

fn verify(pdf: &[u8], signature: &common::EmbeddedSignature) -> X509 {
    let pkcs7 = Pkcs7::from_der(&signature.cms).unwrap();
    let store = X509StoreBuilder::new().unwrap().build();
    let certs = Stack::new().unwrap();
    pkcs7
        .verify(
            &certs,
            &store,
            Some(&signature.signed_bytes(pdf)),
            None,
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )
        .unwrap();
    let signers = pkcs7.signers(&certs, Pkcs7Flags::empty()).unwrap();
    assert_eq!(signers.len(), 1);
    signers.get(0).unwrap().to_owned()
}

#[test]
fn sign_with_single_pair() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("contract.pdf");
    let destination = dir.path().join("contract-signed.pdf");
    fs::write(&source, common::sample_pdf()).unwrap();

    let (mock, der) = common::single_pair_card("Jozef Mrkvicka");
    let (controller, asked) = common::controller(&mock, common::PIN);

    let options = SignatureOptions {
        reason: Some("Agreement".to_string()),
        ..Default::default()
    };
    let mut out: Vec<u8> = Vec::new();
    sign_pdf(
        &controller,
        &source,
        &destination,
        DigestAlgorithm::Sha256,
        &options,
        &mut out,
    )
    .unwrap();
    controller.dispose();

    let out = String::from_utf8(out).unwrap();
    assert_eq!(
        out,
        format!(
            "Signing certificate with subject: CN=Jozef Mrkvicka, C=SK\ncontract.pdf signed and saved to {}\n",
            destination.display()
        )
    );
    assert_eq!(asked.get(), 1);
    assert_eq!(mock.calls(FnIdx::Sign), 1);
    common::assert_released(&mock);

    let signed = fs::read(&destination).unwrap();
    let signatures = common::embedded_signatures(&signed);
    assert_eq!(signatures.len(), 1);

    let signature = &signatures[0];
    assert_eq!(signature.field_name, b"Signature1");
    assert_eq!(signature.name, b"Jozef Mrkvicka");
    assert_eq!(signature.byte_range[0], 0);
    assert_eq!(
        signature.byte_range[2] + signature.byte_range[3],
        signed.len()
    );

    let signer = verify(&signed, signature);
    assert_eq!(signer.to_der().unwrap(), der);
    assert!(String::from_utf8_lossy(&signed).contains("(Agreement)"));
}

#[test]
fn sign_with_ec_key_and_sha384() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("in.pdf");
    let destination = dir.path().join("out.pdf");
    fs::write(&source, common::sample_pdf()).unwrap();

    let (der, key) = ec_credentials("EC Holder").unwrap();
    let mock = Rc::new(MockModule::new().with_token(MockToken::new("SIG_EP", common::PIN).with_pair(b"A1", der.clone(), key)));
    let (controller, _) = common::controller(&mock, common::PIN);

    let mut out: Vec<u8> = Vec::new();
    sign_pdf(
        &controller,
        &source,
        &destination,
        DigestAlgorithm::Sha384,
        &SignatureOptions::default(),
        &mut out,
    )
    .unwrap();
    drop(controller);
    common::assert_released(&mock);

    let signed = fs::read(&destination).unwrap();
    let signatures = common::embedded_signatures(&signed);
    assert_eq!(signatures.len(), 1);
    assert_eq!(verify(&signed, &signatures[0]).to_der().unwrap(), der);
}

#[test]
fn signing_twice_adds_second_field() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("in.pdf");
    let once = dir.path().join("once.pdf");
    let twice = dir.path().join("twice.pdf");
    fs::write(&source, common::sample_pdf()).unwrap();

    let (mock, _) = common::single_pair_card("Twice");
    let (controller, _) = common::controller(&mock, common::PIN);
    let options = SignatureOptions::default();
    let mut out: Vec<u8> = Vec::new();
    sign_pdf(&controller, &source, &once, DigestAlgorithm::Sha256, &options, &mut out).unwrap();
    sign_pdf(&controller, &once, &twice, DigestAlgorithm::Sha256, &options, &mut out).unwrap();
    controller.dispose();
    common::assert_released(&mock);

    let signed = fs::read(&twice).unwrap();
    let signatures = common::embedded_signatures(&signed);
    let names: Vec<&[u8]> = signatures.iter().map(|s| s.field_name.as_slice()).collect();
    assert_eq!(names, vec![b"Signature1".as_slice(), b"Signature2".as_slice()]);

    // The document is rewritten, so only the newest signature covers it.
    verify(&signed, &signatures[1]);
}

#[test]
fn two_pairs_are_ambiguous() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("in.pdf");
    let destination = dir.path().join("out.pdf");
    fs::write(&source, common::sample_pdf()).unwrap();

    let (der_a, key_a) = common::credentials("First");
    let (der_b, key_b) = common::credentials("Second");
    let mock = Rc::new(
        MockModule::new().with_token(
            MockToken::new("SIG_EP", common::PIN)
                .with_pair(b"A1", der_a, key_a)
                .with_pair(b"B2", der_b, key_b),
        ),
    );
    let (controller, _) = common::controller(&mock, common::PIN);

    let mut out: Vec<u8> = Vec::new();
    let res = sign_pdf(
        &controller,
        &source,
        &destination,
        DigestAlgorithm::Sha256,
        &SignatureOptions::default(),
        &mut out,
    );
    assert!(matches!(
        res,
        Err(Error::AmbiguousOrMissingSigningCertificate { found: 2 })
    ));
    assert!(out.is_empty());
    assert!(!destination.exists());
    assert_eq!(mock.calls(FnIdx::Sign), 0);

    controller.dispose();
    common::assert_released(&mock);
}

#[test]
fn certificate_without_key_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("in.pdf");
    let destination = dir.path().join("out.pdf");
    fs::write(&source, common::sample_pdf()).unwrap();

    let (der, _) = common::credentials("No Key");
    let mock = Rc::new(MockModule::new().with_token(MockToken::new("SIG_EP", common::PIN).with_certificate(b"A1", der)));
    let (controller, _) = common::controller(&mock, common::PIN);

    let res = sign_pdf(
        &controller,
        &source,
        &destination,
        DigestAlgorithm::Sha256,
        &SignatureOptions::default(),
        &mut Vec::<u8>::new(),
    );
    assert!(matches!(
        res,
        Err(Error::AmbiguousOrMissingSigningCertificate { found: 0 })
    ));
    assert!(!destination.exists());
}

#[test]
fn too_small_placeholder_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("in.pdf");
    let destination = dir.path().join("out.pdf");
    fs::write(&source, common::sample_pdf()).unwrap();

    let (mock, _) = common::single_pair_card("Small");
    let (controller, _) = common::controller(&mock, common::PIN);
    let options = SignatureOptions {
        placeholder_size: 64,
        ..Default::default()
    };

    let res = sign_pdf(
        &controller,
        &source,
        &destination,
        DigestAlgorithm::Sha256,
        &options,
        &mut Vec::<u8>::new(),
    );
    assert!(matches!(
        res,
        Err(Error::Pdf(PdfError::SignatureTooLarge { .. }))
    ));
    assert!(!destination.exists());
}

#[test]
fn wrong_pin_skips_the_card() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("in.pdf");
    let destination = dir.path().join("out.pdf");
    fs::write(&source, common::sample_pdf()).unwrap();

    let (mock, _) = common::single_pair_card("Wrong PIN");
    let (controller, asked) = common::controller(&mock, "0000");

    let res = sign_pdf(
        &controller,
        &source,
        &destination,
        DigestAlgorithm::Sha256,
        &SignatureOptions::default(),
        &mut Vec::<u8>::new(),
    );
    assert!(matches!(
        res,
        Err(Error::AmbiguousOrMissingSigningCertificate { found: 0 })
    ));
    assert_eq!(asked.get(), 1);
    assert!(!destination.exists());
}
