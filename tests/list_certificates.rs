//! The `list` command against a mock card.

mod common;

use std::rc::Rc;

use eidsign::card::mock::{FnIdx, MockModule, MockToken};
use eidsign::card::CardCertificate;
use eidsign::cli::list_certificates;
use eidsign::cli::report::ReportFormat;

#[test]
fn description_of_single_certificate() {
    let (mock, der) = common::single_pair_card("Jozef Mrkvicka");
    let (controller, asked) = common::controller(&mock, common::PIN);

    let mut out: Vec<u8> = Vec::new();
    list_certificates(&controller, ReportFormat::Description, &mut out).unwrap();
    controller.dispose();

    let expected = CardCertificate::from_der(der).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(
        out,
        format!(
            "Certificates:\n\nThumbprint: {}\nSubject: CN=Jozef Mrkvicka, C=SK\nIssuer: CN=Jozef Mrkvicka, C=SK\n\n",
            expected.thumbprint()
        )
    );
    assert_eq!(out.matches("Thumbprint: ").count(), 1);

    // Certificates are public, so no PIN was needed.
    assert_eq!(asked.get(), 0);
    assert_eq!(mock.calls(FnIdx::Login), 0);
    common::assert_released(&mock);
}

#[test]
fn pem_output_round_trips() {
    let (mock, der) = common::single_pair_card("PEM Holder");
    let (controller, _) = common::controller(&mock, common::PIN);

    let mut out: Vec<u8> = Vec::new();
    list_certificates(&controller, ReportFormat::Pem, &mut out).unwrap();
    controller.dispose();

    let out = String::from_utf8(out).unwrap();
    let pem = out.strip_prefix("Certificates:\n\n").unwrap();
    assert!(pem.ends_with("-----END CERTIFICATE-----\n\n"));
    let decoded = CardCertificate::from_pem(pem).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].raw(), der.as_slice());
    common::assert_released(&mock);
}

#[test]
fn private_certificates_need_login() {
    let (der, key) = common::credentials("Private");
    let mock = Rc::new(MockModule::new().with_token(
        MockToken::new("SIG_EP", common::PIN)
            .with_pair(b"A1", der, key)
            .with_private_certificates(),
    ));
    let (controller, asked) = common::controller(&mock, common::PIN);

    let mut out: Vec<u8> = Vec::new();
    list_certificates(&controller, ReportFormat::Description, &mut out).unwrap();
    controller.dispose();

    assert_eq!(String::from_utf8(out).unwrap().matches("Subject: CN=Private, C=SK").count(), 1);
    assert_eq!(asked.get(), 1);
    assert_eq!(mock.calls(FnIdx::Login), 1);
    common::assert_released(&mock);
}

#[test]
fn failing_slot_is_skipped() {
    let (broken_der, broken_key) = common::credentials("Broken");
    let (good_der, good_key) = common::credentials("Good");
    let mock = Rc::new(
        MockModule::new()
            .with_token(
                MockToken::new("BROKEN", common::PIN)
                    .with_pair(b"A1", broken_der, broken_key)
                    .with_failing_open(),
            )
            .with_empty_slot()
            .with_token(MockToken::new("GOOD", common::PIN).with_pair(b"B2", good_der, good_key)),
    );
    let (controller, _) = common::controller(&mock, common::PIN);

    let mut out: Vec<u8> = Vec::new();
    list_certificates(&controller, ReportFormat::Description, &mut out).unwrap();
    drop(controller);

    let out = String::from_utf8(out).unwrap();
    assert_eq!(out.matches("Thumbprint: ").count(), 1);
    assert!(out.contains("Subject: CN=Good, C=SK"));
    common::assert_released(&mock);
}

#[test]
fn no_card_lists_nothing() {
    let mock = Rc::new(MockModule::new().with_empty_slot());
    let (controller, _) = common::controller(&mock, common::PIN);

    let mut out: Vec<u8> = Vec::new();
    list_certificates(&controller, ReportFormat::Description, &mut out).unwrap();
    controller.dispose();

    assert_eq!(String::from_utf8(out).unwrap(), "Certificates:\n\n");
    common::assert_released(&mock);
}
