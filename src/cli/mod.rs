//! The `list` and `sign` commands.

pub mod options;
pub mod report;

use std::{io::Write, path::Path};

use log::{debug, info};
use self::report::{Report, ReportFormat};
use crate::{
    card::{CardCertificate, CardDeviceController},
    error::Error,
    pdf::{self, SignatureOptions},
    pin::PinSource,
    signing::{DigestAlgorithm, Pkcs11ExternalSignature},
};

pub use self::options::Options;

/// Prints the certificates on all tokens.
pub fn list_certificates(
    controller: &CardDeviceController,
    format: ReportFormat,
    out: &mut dyn Write,
) -> Result<(), Error> {
    writeln!(out, "Certificates:").and_then(|_| writeln!(out)).map_err(output_error)?;
    let certificates: Vec<CardCertificate> = controller
        .list_certificates()?
        .into_iter()
        .map(|found| found.certificate)
        .collect();
    info!("Found {} certificate(s)", certificates.len());
    out.write_all(certificates.report(format).as_bytes()).map_err(output_error)
}

/// Signs `source` with the only signing certificate there is and writes the
/// result to `destination`.
pub fn sign_pdf(
    controller: &CardDeviceController,
    source: &Path,
    destination: &Path,
    digest: DigestAlgorithm,
    options: &SignatureOptions,
    out: &mut dyn Write,
) -> Result<(), Error> {
    let signing = controller.signing_certificate()?;
    writeln!(
        out,
        "Signing certificate with subject: {}",
        signing.certificate().subject()
    )
    .map_err(output_error)?;

    let signer = Pkcs11ExternalSignature::new(&signing, digest)?;
    pdf::sign_file(source, destination, signing.certificate(), &signer, options)?;

    let name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.display().to_string());
    writeln!(out, "{} signed and saved to {}", name, destination.display()).map_err(output_error)
}

fn print_library(out: &mut dyn Write, library: &Path) -> Result<(), Error> {
    writeln!(out, "Load: {}", library.display()).map_err(output_error)
}

fn open_controller(library: &Path, pin_source: PinSource) -> Result<CardDeviceController, Error> {
    debug!("PINs come from the {} source", pin_source);
    CardDeviceController::open(library, pin_source.provider())
}

fn output_error(e: std::io::Error) -> Error {
    Error::io("cannot write output", e)
}
