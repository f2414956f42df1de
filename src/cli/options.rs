//! The command line options.

use std::{io::Write, path::PathBuf};

use log::LevelFilter;

use super::report::ReportFormat;
use crate::{
    config::Config,
    constants::{EIDSIGN_ENV_CONFIG, EIDSIGN_ENV_PKCS11_LIB},
    discovery,
    error::Error,
    pdf::SignatureOptions,
    pin::PinSource,
    signing::DigestAlgorithm,
};


//------------ Options -------------------------------------------------------

/// The command line options for eidsign.
#[derive(clap::Parser)]
#[command(
    version,
    about = "Lists the certificates of an eID card and signs PDF documents with it.",
)]
pub struct Options {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(subcommand)]
    pub command: Command,
}


//------------ GeneralOptions ------------------------------------------------

/// The options shared by all commands.
#[derive(clap::Args)]
pub struct GeneralOptions {
    /// Read settings from this TOML file.
    #[arg(short, long, global = true, env = EIDSIGN_ENV_CONFIG, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The log level: off, error, warn, info, debug or trace.
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<LevelFilter>,
}


//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// List the certificates on all inserted cards.
    List(List),

    /// Sign a PDF document with the card's signing key.
    Sign(Sign),
}

impl Command {
    pub fn run(self, config: &Config, out: &mut dyn Write) -> Result<(), Error> {
        match self {
            Self::List(cmd) => cmd.run(config, out),
            Self::Sign(cmd) => cmd.run(config, out),
        }
    }
}


//------------ Device --------------------------------------------------------

/// Which module to load and how to get the PIN.
#[derive(clap::Args)]
pub struct Device {
    /// Path to the PKCS#11 library of the eID client.
    #[arg(
        short = 'l',
        long = "pkcs11-lib",
        alias = "pkcs11Lib",
        env = EIDSIGN_ENV_PKCS11_LIB,
        value_name = "PATH"
    )]
    pub pkcs11_lib: Option<PathBuf>,

    /// Let the eID client ask for the PIN.
    #[arg(short = 'e', long = "use-eid-client", alias = "useEidClient")]
    pub use_eid_client: bool,
}

impl Device {
    /// The library path from the command line, the config file or probing.
    pub fn library(&self, config: &Config) -> Result<PathBuf, Error> {
        discovery::resolve_library(self.pkcs11_lib.as_deref().or(config.pkcs11_lib.as_deref()))
    }

    pub fn pin_source(&self, config: &Config) -> PinSource {
        if self.use_eid_client {
            PinSource::EidClient
        } else {
            config.pin_source
        }
    }
}


//------------ List ----------------------------------------------------------

#[derive(clap::Parser)]
pub struct List {
    #[command(flatten)]
    device: Device,

    /// Print a description or PEM for each certificate.
    #[arg(
        short = 'f',
        long = "output-format",
        alias = "outputFormat",
        default_value = "description",
        value_name = "FORMAT"
    )]
    format: ReportFormat,
}

impl List {
    pub fn run(self, config: &Config, out: &mut dyn Write) -> Result<(), Error> {
        let library = self.device.library(config)?;
        super::print_library(out, &library)?;
        let controller = super::open_controller(&library, self.device.pin_source(config))?;
        let res = super::list_certificates(&controller, self.format, out);
        controller.dispose();
        res
    }
}


//------------ Sign ----------------------------------------------------------

#[derive(clap::Parser)]
pub struct Sign {
    #[command(flatten)]
    device: Device,

    /// The PDF document to sign.
    #[arg(short = 's', long = "source", alias = "sourcePdf", value_name = "PDF")]
    source: PathBuf,

    /// Where to write the signed document.
    #[arg(short = 'd', long = "destination", alias = "destinationPdf", value_name = "PDF")]
    destination: PathBuf,

    /// The reason for signing, stored in the signature.
    #[arg(long)]
    reason: Option<String>,

    /// The place of signing, stored in the signature.
    #[arg(long)]
    location: Option<String>,

    /// The digest algorithm: sha256, sha384 or sha512.
    #[arg(long, value_name = "ALGORITHM")]
    digest: Option<DigestAlgorithm>,
}

impl Sign {
    pub fn run(self, config: &Config, out: &mut dyn Write) -> Result<(), Error> {
        let mut options = SignatureOptions::from_config(&config.signature);
        if self.reason.is_some() {
            options.reason = self.reason;
        }
        if self.location.is_some() {
            options.location = self.location;
        }
        let digest = self.digest.unwrap_or(config.signature.digest_algorithm);

        let library = self.device.library(config)?;
        super::print_library(out, &library)?;
        let controller = super::open_controller(&library, self.device.pin_source(config))?;
        let res = super::sign_pdf(
            &controller,
            &self.source,
            &self.destination,
            digest,
            &options,
            out,
        );
        controller.dispose();
        res
    }
}


//------------ Tests ---------------------------------------------------------
