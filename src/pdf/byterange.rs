//! Reserving and filling the signature value in a serialized PDF.
//!
//! The signature dictionary is written with a `/Contents` hex string of
//! zeros and a `/ByteRange` array of fixed-width sentinel numbers. After
//! serialization we look both up, patch the real byte range in place and
//! hash everything except the `/Contents` value. The CMS blob then goes
//! into the zeros, so no other byte moves.
//!
//! ```text
//! [0, a, b, len - b]    where data[a..b] == "<00...00>"
//! ```

use std::ops::Range;

use log::debug;
use lopdf::{Object, StringFormat};
use openssl::hash::Hasher;

use super::PdfError;
use crate::signing::DigestAlgorithm;

/// Stand-ins for the last three ByteRange numbers. Ten digits each, so any
/// file below 10 GB fits.
const SENTINELS: [i64; 3] = [1_111_111_111, 2_222_222_222, 3_333_333_333];
const SENTINEL_WIDTH: usize = 10;


//------------ Placeholders --------------------------------------------------

/// The `/Contents` value reserving `size` bytes.
pub fn contents_placeholder(size: usize) -> Object {
    Object::String(vec![0; size], StringFormat::Hexadecimal)
}

/// The `/ByteRange` value to patch later.
pub fn byte_range_placeholder() -> Object {
    Object::Array(vec![
        Object::Integer(0),
        Object::Integer(SENTINELS[0]),
        Object::Integer(SENTINELS[1]),
        Object::Integer(SENTINELS[2]),
    ])
}


//------------ PreparedDocument ----------------------------------------------

/// A serialized PDF with its byte range filled in and the signature value
/// still empty.
#[derive(Debug)]
pub struct PreparedDocument {
    data: Vec<u8>,
    contents: Range<usize>,
}

impl PreparedDocument {
    /// Finds the placeholders in `data` and patches the byte range.
    ///
    /// `size` is the number of bytes the `/Contents` placeholder reserves.
    pub fn prepare(mut data: Vec<u8>, size: usize) -> Result<Self, PdfError> {
        let contents = find_contents(&data, size)?;
        let byte_range = [0, contents.start, contents.end, data.len() - contents.end];

        // The signature dictionary writes /ByteRange before /Contents.
        let key = rfind(&data[..contents.start], b"/ByteRange")
            .ok_or_else(|| PdfError::Structure("signature has no /ByteRange".to_string()))?;
        for (sentinel, value) in SENTINELS.iter().zip(&byte_range[1..]) {
            let text = sentinel.to_string();
            let pos = find_number(&data, text.as_bytes(), key)
                .ok_or_else(|| PdfError::Structure("/ByteRange placeholder not found".to_string()))?;
            let patched = format!("{:<width$}", value, width = SENTINEL_WIDTH);
            if patched.len() != SENTINEL_WIDTH {
                return Err(PdfError::Structure(format!("document too large: {} bytes", data.len())));
            }
            data[pos..pos + SENTINEL_WIDTH].copy_from_slice(patched.as_bytes());
        }

        debug!(
            "Signature byte range [0 {} {} {}]",
            byte_range[1], byte_range[2], byte_range[3]
        );
        Ok(PreparedDocument { data, contents })
    }

    /// The byte range as written into the document.
    pub fn byte_range(&self) -> [usize; 4] {
        [
            0,
            self.contents.start,
            self.contents.end,
            self.data.len() - self.contents.end,
        ]
    }

    /// Hashes everything but the `/Contents` value.
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Result<Vec<u8>, PdfError> {
        let mut hasher = Hasher::new(algorithm.message_digest()).map_err(PdfError::crypto)?;
        hasher.update(&self.data[..self.contents.start]).map_err(PdfError::crypto)?;
        hasher.update(&self.data[self.contents.end..]).map_err(PdfError::crypto)?;
        Ok(hasher.finish().map_err(PdfError::crypto)?.to_vec())
    }

    /// Writes the signature into the placeholder and returns the final
    /// document.
    pub fn embed(mut self, signature: &[u8]) -> Result<Vec<u8>, PdfError> {
        let hex = hex::encode_upper(signature);
        // Without the angle brackets
        let available = self.contents.len() - 2;
        if hex.len() > available {
            return Err(PdfError::SignatureTooLarge {
                needed: signature.len(),
                available: available / 2,
            });
        }
        let start = self.contents.start + 1;
        self.data[start..start + hex.len()].copy_from_slice(hex.as_bytes());
        Ok(self.data)
    }
}


//------------ Helpers -------------------------------------------------------

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

/// Finds `digits` as a whole number, not as part of a longer one.
fn find_number(haystack: &[u8], digits: &[u8], from: usize) -> Option<usize> {
    let mut start = from;
    while let Some(pos) = find(haystack, digits, start) {
        let before = pos.checked_sub(1).map(|i| haystack[i]);
        let after = haystack.get(pos + digits.len()).copied();
        if !before.is_some_and(|b| b.is_ascii_digit()) && !after.is_some_and(|b| b.is_ascii_digit()) {
            return Some(pos);
        }
        start = pos + 1;
    }
    None
}

/// Returns the range of the `<00...00>` placeholder including its brackets.
fn find_contents(data: &[u8], size: usize) -> Result<Range<usize>, PdfError> {
    let mut needle = Vec::with_capacity(size * 2 + 2);
    needle.push(b'<');
    needle.resize(size * 2 + 1, b'0');
    needle.push(b'>');

    let start = find(data, &needle, 0)
        .ok_or_else(|| PdfError::Structure("/Contents placeholder not found".to_string()))?;
    if find(data, &needle, start + 1).is_some() {
        return Err(PdfError::Structure("more than one /Contents placeholder".to_string()));
    }
    Ok(start..start + needle.len())
}


//------------ Tests ---------------------------------------------------------
