//! Body text decoding.
//!
//! Bytes are decoded with, in order:
//!
//! 1. the charset declared on the part's content type
//! 2. the encoding guessed from the bytes themselves
//! 3. UTF-8 with replacement characters
//!
//! A tier is used only if it decodes without a single malformed sequence.
//! Decoding never fails.

use encoding_rs::Encoding;

/// Which tier produced a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeSource {
    /// The declared charset, by canonical encoding name.
    Declared(&'static str),
    /// A detected encoding, by canonical encoding name.
    Detected(&'static str),
    /// Forced UTF-8 with replacement.
    LossyUtf8,
}

/// Decoded body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBody {
    pub text: String,
    pub source: DecodeSource,
}

/// Decodes body bytes, preferring `declared` (a charset label such as
/// `"iso-8859-1"`).
pub fn decode_body(bytes: &[u8], declared: Option<&str>) -> DecodedBody {
    let declared = declared.and_then(|label| {
        let encoding = Encoding::for_label(label.trim().as_bytes());
        if encoding.is_none() {
            tracing::debug!(charset = label, "unknown declared charset");
        }
        encoding
    });
    decode_in_order(bytes, declared, Some(detect(bytes)))
}

fn detect(bytes: &[u8]) -> &'static Encoding {
    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

fn strict(bytes: &[u8], encoding: &'static Encoding) -> Option<String> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
}

fn decode_in_order(
    bytes: &[u8],
    declared: Option<&'static Encoding>,
    detected: Option<&'static Encoding>,
) -> DecodedBody {
    if let Some(encoding) = declared {
        if let Some(text) = strict(bytes, encoding) {
            return DecodedBody {
                text,
                source: DecodeSource::Declared(encoding.name()),
            };
        }
    }

    if let Some(encoding) = detected {
        if let Some(text) = strict(bytes, encoding) {
            return DecodedBody {
                text,
                source: DecodeSource::Detected(encoding.name()),
            };
        }
    }

    tracing::warn!(
        declared = ?declared.map(Encoding::name),
        detected = ?detected.map(Encoding::name),
        len = bytes.len(),
        "body did not decode cleanly, falling back to lossy UTF-8"
    );
    DecodedBody {
        text: String::from_utf8_lossy(bytes).into_owned(),
        source: DecodeSource::LossyUtf8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_8, WINDOWS_1252};

    fn latin1(text: &str) -> Vec<u8> {
        let (bytes, _, unmappable) = WINDOWS_1252.encode(text);
        assert!(!unmappable);
        bytes.into_owned()
    }

    #[test]
    fn declared_charset_wins_when_it_decodes() {
        let decoded = decode_body(&latin1("Grüße aus Köln"), Some("ISO-8859-1"));
        assert_eq!(decoded.text, "Grüße aus Köln");
        assert_eq!(decoded.source, DecodeSource::Declared("windows-1252"));
    }

    #[test]
    fn utf8_without_declaration_is_detected() {
        let decoded = decode_body("naïve café".as_bytes(), None);
        assert_eq!(decoded.text, "naïve café");
        assert_eq!(decoded.source, DecodeSource::Detected("UTF-8"));
    }

    #[test]
    fn wrong_declared_charset_falls_back_to_detection() {
        let text = "Le café était très réputé à Besançon. Nous espérons que vous \
                    passerez une excellente soirée, et à très bientôt pour la réunion \
                    de l'équipe où nous présenterons les résultats de l'été.";
        let bytes = latin1(text);

        let decoded = decode_body(&bytes, Some("utf-8"));

        assert!(matches!(decoded.source, DecodeSource::Detected(_)));
        assert!(!decoded.text.contains('\u{FFFD}'));
        assert_ne!(decoded.text, String::from_utf8_lossy(&bytes));
        assert!(decoded.text.starts_with("Le caf"));
    }

    #[test]
    fn unknown_charset_label_is_ignored() {
        let decoded = decode_body(b"plain ascii", Some("x-made-up"));
        assert_eq!(decoded.text, "plain ascii");
        assert!(matches!(decoded.source, DecodeSource::Detected(_)));
    }

    #[test]
    fn invalid_bytes_are_replaced_as_last_resort() {
        let bytes = [b'o', b'k', 0xff, 0xfe, b'!'];
        let decoded = decode_in_order(&bytes, Some(UTF_8), Some(UTF_8));
        assert_eq!(decoded.source, DecodeSource::LossyUtf8);
        assert!(decoded.text.starts_with("ok"));
        assert!(decoded.text.contains('\u{FFFD}'));
    }

    #[test]
    fn empty_body_decodes_to_empty_text() {
        assert_eq!(decode_body(b"", None).text, "");
    }
}
