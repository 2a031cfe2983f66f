//! Character encoding detection and transcoding for delimited text.
//!
//! Detection order:
//!
//! 1. A byte-order mark (UTF-8, UTF-16LE, UTF-16BE) decides, and is stripped.
//! 2. A caller-forced encoding.
//! 3. Valid UTF-8.
//! 4. Windows-1252, which covers every printable Latin-1 character.
//!
//! NUL bytes without a BOM, undecodable sequences, and control characters in the decoded text
//! all mean the encoding cannot be determined; that is an error, never a guess.

use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

use crate::error::NormalizeFailure;

/// Decoded text and how it was decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub encoding: &'static Encoding,
    pub had_bom: bool,
}

/// Decode `bytes` into UTF-8 text.
pub fn decode(
    bytes: &[u8],
    forced: Option<&'static Encoding>,
) -> Result<Decoded, NormalizeFailure> {
    let (encoding, body, had_bom) = match Encoding::for_bom(bytes) {
        Some((encoding, bom_len)) => (encoding, &bytes[bom_len..], true),
        None => match forced {
            Some(encoding) => (encoding, bytes, false),
            None if bytes.contains(&0) => {
                return Err(NormalizeFailure::UnknownEncoding {
                    reason: "NUL bytes without a byte-order mark (binary data or BOM-less UTF-16)"
                        .to_string(),
                });
            }
            None if std::str::from_utf8(bytes).is_ok() => (UTF_8, bytes, false),
            None => (WINDOWS_1252, bytes, false),
        },
    };

    let text: Cow<'_, str> = encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or_else(|| NormalizeFailure::UnknownEncoding {
            reason: format!("input is not valid {}", encoding.name()),
        })?;

    if let Some(c) = text.chars().find(|c| is_disallowed_control(*c)) {
        return Err(NormalizeFailure::UnknownEncoding {
            reason: format!(
                "control character U+{:04X} after decoding as {}",
                c as u32,
                encoding.name()
            ),
        });
    }

    Ok(Decoded {
        text: text.into_owned(),
        encoding,
        had_bom,
    })
}

fn is_disallowed_control(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r' | '\u{c}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_bom_is_stripped() {
        let d = decode(b"\xEF\xBB\xBFname\nZ\xC3\xBCrich\n", None).unwrap();
        assert_eq!(d.encoding, UTF_8);
        assert!(d.had_bom);
        assert_eq!(d.text, "name\nZürich\n");
    }

    #[test]
    fn utf16le_bom_is_transcoded() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "a;b\n1;ü\n".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let d = decode(&bytes, None).unwrap();
        assert_eq!(d.encoding, encoding_rs::UTF_16LE);
        assert_eq!(d.text, "a;b\n1;ü\n");
    }

    #[test]
    fn latin1_round_trips_through_utf8() {
        let original = "name,city\nJosé,Málaga\nFrançois,Besançon\n";
        let (latin1, _, unmappable) = WINDOWS_1252.encode(original);
        assert!(!unmappable);
        assert!(std::str::from_utf8(&latin1).is_err());

        let first = decode(&latin1, None).unwrap();
        assert_eq!(first.encoding, WINDOWS_1252);
        assert_eq!(first.text, original);

        let (again, _, _) = WINDOWS_1252.encode(&first.text);
        assert_eq!(decode(&again, None).unwrap().text, original);
    }

    #[test]
    fn nul_bytes_without_bom_are_rejected() {
        let err = decode(b"a\x00b\x00", None).unwrap_err();
        assert!(matches!(err, NormalizeFailure::UnknownEncoding { .. }));
    }

    #[test]
    fn undefined_windows_1252_bytes_are_rejected() {
        // 0x81 has no Windows-1252 mapping and decodes to a C1 control.
        let err = decode(b"a,b\n\x81,c\n", None).unwrap_err();
        assert!(err.to_string().contains("U+0081"));
    }

    #[test]
    fn forced_encoding_applies_without_bom() {
        let d = decode(b"caf\xE9", Some(WINDOWS_1252)).unwrap();
        assert_eq!(d.text, "café");
        let err = decode(b"caf\xE9", Some(UTF_8)).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }
}
