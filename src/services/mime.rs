//! MIME part classification.
//!
//! A remote payload is decoded once into a [`MimePart`] tree; everything
//! downstream matches on the variant instead of probing the raw part for
//! optional keys.

use crate::providers::email::{decode_base64url, RemotePart};

/// Where an attachment's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    /// Bytes were inlined in the payload.
    Data(Vec<u8>),
    /// Bytes must be fetched by attachment id.
    Remote(String),
}

/// A decoded text or HTML body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    /// Raw bytes, still in the declared charset.
    pub bytes: Vec<u8>,
    /// `charset` parameter of the part's content type, when declared.
    pub charset: Option<String>,
}

/// An attachment candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    /// Part id within the message, used for synthesized filenames.
    pub part_id: String,
    /// Filename as sent, if any.
    pub filename: Option<String>,
    /// Content type, lowercased.
    pub mime_type: String,
    /// `Content-ID` without angle brackets.
    pub content_id: Option<String>,
    /// Whether `Content-Disposition` says `inline`.
    pub disposition_inline: bool,
    /// Size reported by the remote.
    pub size: u64,
    /// Where to get the bytes.
    pub source: AttachmentSource,
}

/// One node of a message's MIME tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimePart {
    /// A file carried by the message.
    Attachment(AttachmentPart),
    /// A `text/html` body.
    HtmlBody(BodyPart),
    /// A `text/plain` body.
    TextBody(BodyPart),
    /// A container of child parts.
    Multipart(Vec<MimePart>),
}

fn is_attachment_type(mime_type: &str) -> bool {
    mime_type == "text/css"
        || mime_type == "application/octet-stream"
        || mime_type.starts_with("image/")
}

fn content_type(part: &RemotePart) -> (String, Option<String>) {
    match part.header("Content-Type") {
        Some(value) => {
            let parsed = mailparse::parse_content_type(value);
            let mime_type = if part.mime_type.is_empty() {
                parsed.mimetype
            } else {
                part.mime_type.to_ascii_lowercase()
            };
            (mime_type, parsed.params.get("charset").cloned())
        }
        None => (part.mime_type.to_ascii_lowercase(), None),
    }
}

impl MimePart {
    /// Classifies a remote part and its children.
    ///
    /// Returns `None` for leaves that carry neither data nor an attachment id,
    /// and for undecodable data.
    pub fn from_remote(part: &RemotePart) -> Option<MimePart> {
        let (mime_type, charset) = content_type(part);

        if !part.parts.is_empty() || mime_type.starts_with("multipart/") {
            let children = part.parts.iter().filter_map(MimePart::from_remote).collect();
            return Some(MimePart::Multipart(children));
        }

        let data = match part.body.data.as_deref() {
            Some(encoded) => match decode_base64url(encoded) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(part_id = %part.part_id, error = %e, "undecodable part data, skipping");
                    return None;
                }
            },
            None => None,
        };

        let has_filename = !part.filename.trim().is_empty();
        let is_body = mime_type == "text/html" || mime_type == "text/plain";

        if !is_body || has_filename || data.is_none() {
            if !is_body && !is_attachment_type(&mime_type) && !has_filename && data.is_some() {
                tracing::warn!(
                    part_id = %part.part_id,
                    mime_type = %mime_type,
                    "unexpected MIME type, storing as attachment"
                );
            }
            let source = match (data, &part.body.attachment_id) {
                (Some(bytes), _) => AttachmentSource::Data(bytes),
                (None, Some(id)) => AttachmentSource::Remote(id.clone()),
                (None, None) => return None,
            };
            return Some(MimePart::Attachment(AttachmentPart {
                part_id: part.part_id.clone(),
                filename: has_filename.then(|| part.filename.trim().to_string()),
                mime_type,
                content_id: part
                    .header("Content-ID")
                    .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string())
                    .filter(|v| !v.is_empty()),
                disposition_inline: part.header("Content-Disposition").is_some_and(|v| {
                    matches!(
                        mailparse::parse_content_disposition(v).disposition,
                        mailparse::DispositionType::Inline
                    )
                }),
                size: part.body.size,
                source,
            }));
        }

        let body = BodyPart {
            bytes: data.unwrap_or_default(),
            charset,
        };
        Some(if mime_type == "text/html" {
            MimePart::HtmlBody(body)
        } else {
            MimePart::TextBody(body)
        })
    }

    /// Leaves of the tree in document order.
    pub fn into_leaves(self) -> Vec<MimePart> {
        match self {
            MimePart::Multipart(children) => children
                .into_iter()
                .flat_map(MimePart::into_leaves)
                .collect(),
            leaf => vec![leaf],
        }
    }
}
