//! Finding the vendor PKCS#11 module on disk.

use std::path::{Path, PathBuf};

use log::{debug, trace};
use crate::constants::vendor_library_candidates;
use crate::error::Error;

/// Returns the library to load.
///
/// An explicitly configured path is used as is, without probing, so that
/// loading it reports a proper error if it is wrong. Otherwise the known
/// install locations are probed in order.
pub fn resolve_library(explicit: Option<&Path>) -> Result<PathBuf, Error> {
    match explicit {
        Some(path) => {
            debug!("Using configured PKCS#11 library {}", path.display());
            Ok(path.to_path_buf())
        }
        None => find_library(vendor_library_candidates()),
    }
}

/// Returns the first candidate that is an absolute path to an existing
/// file.
pub fn find_library<I, P>(candidates: I) -> Result<PathBuf, Error>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let mut probed = Vec::new();
    for candidate in candidates {
        let candidate = candidate.into();
        if probe(&candidate) {
            debug!("Found PKCS#11 library at {}", candidate.display());
            return Ok(candidate);
        }
        probed.push(candidate);
    }
    Err(Error::LibraryNotFound(probed))
}

fn probe(path: &Path) -> bool {
    if !path.is_absolute() {
        trace!("Skipping relative library path {}", path.display());
        return false;
    }
    match path.metadata() {
        Ok(meta) => meta.is_file(),
        Err(e) => {
            trace!("Cannot use {}: {}", path.display(), e);
            false
        }
    }
}


//------------ Tests ---------------------------------------------------------
