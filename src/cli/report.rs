//! Rendering certificates for the `list` command.

use std::{error, fmt, str::FromStr};

use crate::card::CardCertificate;


//------------ ReportFormat --------------------------------------------------

/// How `list` prints each certificate.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReportFormat {
    /// Thumbprint, subject and issuer lines.
    #[default]
    Description,

    /// The certificate itself as a PEM block.
    Pem,
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, ReportError> {
        match s.to_ascii_lowercase().as_str() {
            "description" => Ok(ReportFormat::Description),
            "pem" => Ok(ReportFormat::Pem),
            _ => Err(ReportError::UnrecognisedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportFormat::Description => write!(f, "description"),
            ReportFormat::Pem => write!(f, "pem"),
        }
    }
}


//------------ Report --------------------------------------------------------

/// Something that can be shown in the `list` output.
pub trait Report {
    fn report(&self, format: ReportFormat) -> String;
}

impl Report for CardCertificate {
    fn report(&self, format: ReportFormat) -> String {
        let mut res = match format {
            ReportFormat::Description => self.description(),
            ReportFormat::Pem => self.to_pem(),
        };
        res.push('\n');
        res
    }
}

impl<T: Report> Report for [T] {
    fn report(&self, format: ReportFormat) -> String {
        self.iter().map(|item| item.report(format)).collect()
    }
}


//------------ ReportError ---------------------------------------------------

#[derive(Debug)]
pub enum ReportError {
    UnrecognisedFormat(String),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportError::UnrecognisedFormat(s) => write!(
                f,
                "Unrecognised output format '{}', expected 'description' or 'pem'",
                s
            ),
        }
    }
}

impl error::Error for ReportError {}


//------------ Tests ---------------------------------------------------------
