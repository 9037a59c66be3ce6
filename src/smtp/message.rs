//! Decomposition of a raw RFC 822 message into a structured record.

use mailparse::{
    addrparse_header, parse_mail, DispositionType, MailAddr, MailHeaderMap, MailParseError,
    ParsedMail,
};
use std::collections::BTreeMap;
use tracing::warn;

/// One parsed mailbox entry; the display name may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub name: String,
    pub address: String,
}

/// One attachment or embedded part.
#[derive(Debug, Clone)]
pub struct MailPart {
    pub mime_type: String,
    pub filename: String,
    pub data: Vec<u8>,
}

/// The structured form of one DATA payload. Every field is independently
/// optional except the header map; the caller adds the raw content row.
#[derive(Debug, Clone, Default)]
pub struct DecomposedEmail {
    pub from: Vec<AddressEntry>,
    pub to: Vec<AddressEntry>,
    pub cc: Vec<AddressEntry>,
    pub bcc: Vec<AddressEntry>,
    pub subject: String,
    /// Header name to the ordered list of all values under that name.
    pub headers: BTreeMap<String, Vec<String>>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<MailPart>,
    pub embedded: Vec<MailPart>,
}

/// Parse the complete raw bytes of one message.
///
/// Failure here means the message is stored raw-only with its parse-error
/// flag set; a failure decoding a single part's body only skips that part.
pub fn decompose(raw: &[u8]) -> Result<DecomposedEmail, MailParseError> {
    let parsed = parse_mail(raw)?;
    let mut out = DecomposedEmail::default();

    for header in &parsed.headers {
        out.headers
            .entry(header.get_key())
            .or_default()
            .push(header.get_value());
    }

    out.subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default();

    out.from = address_list(&parsed, "From")?;
    out.to = address_list(&parsed, "To")?;
    out.cc = address_list(&parsed, "Cc")?;
    out.bcc = address_list(&parsed, "Bcc")?;

    collect_parts(&parsed, &mut out);
    Ok(out)
}

/// All entries of every header named `key`, group syntax flattened.
fn address_list(parsed: &ParsedMail<'_>, key: &str) -> Result<Vec<AddressEntry>, MailParseError> {
    let mut entries = Vec::new();
    for header in parsed.headers.get_all_headers(key) {
        for addr in addrparse_header(header)?.iter() {
            match addr {
                MailAddr::Single(info) => entries.push(AddressEntry {
                    name: info.display_name.clone().unwrap_or_default(),
                    address: info.addr.clone(),
                }),
                MailAddr::Group(group) => {
                    for info in &group.addrs {
                        entries.push(AddressEntry {
                            name: info.display_name.clone().unwrap_or_default(),
                            address: info.addr.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(entries)
}

/// Walk the MIME tree, classifying leaf parts into bodies, attachments and
/// embedded files.
fn collect_parts(part: &ParsedMail<'_>, out: &mut DecomposedEmail) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, out);
        }
        return;
    }

    let mime_type = part.ctype.mimetype.clone();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned()
        .unwrap_or_default();
    let content_id = part.headers.get_first_value("Content-ID");

    let is_body_candidate = (mime_type == "text/plain" || mime_type == "text/html")
        && disposition.disposition != DispositionType::Attachment
        && content_id.is_none()
        && filename.is_empty();

    if is_body_candidate {
        match part.get_body() {
            Ok(body) => {
                if mime_type == "text/html" {
                    out.html.get_or_insert(body);
                } else {
                    out.text.get_or_insert(body);
                }
            }
            Err(e) => warn!("failed to decode {} body: {}", mime_type, e),
        }
        return;
    }

    let data = match part.get_body_raw() {
        Ok(data) => data,
        Err(e) => {
            warn!("failed to read {} part: {}", mime_type, e);
            return;
        }
    };

    // Parts referenced by Content-ID are embedded; they never keep a
    // filename. Everything else is an attachment.
    if content_id.is_some() {
        out.embedded.push(MailPart {
            mime_type,
            filename: String::new(),
            data,
        });
    } else {
        out.attachments.push(MailPart {
            mime_type,
            filename,
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = concat!(
        "From: Alice Sender <alice@example.test>\r\n",
        "To: bob@example.test, Carol <carol@example.test>\r\n",
        "Cc: dave@example.test\r\n",
        "Subject: Kitchen sink\r\n",
        "X-Tag: one\r\n",
        "X-Tag: two\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/mixed; boundary=OUTER\r\n",
        "\r\n",
        "--OUTER\r\n",
        "Content-Type: multipart/alternative; boundary=INNER\r\n",
        "\r\n",
        "--INNER\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "plain body\r\n",
        "--INNER\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<p>html body</p>\r\n",
        "--INNER--\r\n",
        "--OUTER\r\n",
        "Content-Type: application/pdf\r\n",
        "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
        "\r\n",
        "PDFDATA\r\n",
        "--OUTER\r\n",
        "Content-Type: image/png\r\n",
        "Content-ID: <logo@local>\r\n",
        "Content-Disposition: inline\r\n",
        "\r\n",
        "PNGDATA\r\n",
        "--OUTER--\r\n",
    );

    #[test]
    fn kitchen_sink_decomposes_fully() {
        let email = decompose(FIXTURE.as_bytes()).unwrap();

        assert_eq!(email.subject, "Kitchen sink");
        assert_eq!(email.from.len(), 1);
        assert_eq!(email.from[0].name, "Alice Sender");
        assert_eq!(email.from[0].address, "alice@example.test");
        assert_eq!(email.to.len(), 2);
        assert_eq!(email.to[0].name, "");
        assert_eq!(email.to[1].name, "Carol");
        assert_eq!(email.cc.len(), 1);
        assert!(email.bcc.is_empty());

        assert_eq!(email.text.as_deref().map(str::trim_end), Some("plain body"));
        assert_eq!(
            email.html.as_deref().map(str::trim_end),
            Some("<p>html body</p>")
        );

        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].filename, "report.pdf");
        assert_eq!(email.attachments[0].mime_type, "application/pdf");
        assert!(email.attachments[0].data.starts_with(b"PDFDATA"));

        assert_eq!(email.embedded.len(), 1);
        assert_eq!(email.embedded[0].filename, "");
        assert_eq!(email.embedded[0].mime_type, "image/png");
        assert!(email.embedded[0].data.starts_with(b"PNGDATA"));
    }

    #[test]
    fn repeated_headers_keep_every_value_in_order() {
        let email = decompose(FIXTURE.as_bytes()).unwrap();
        assert_eq!(
            email.headers.get("X-Tag"),
            Some(&vec!["one".to_string(), "two".to_string()])
        );
    }

    #[test]
    fn bare_text_message_has_only_a_text_body() {
        let email =
            decompose(b"From: a@b.test\r\nSubject: hi\r\n\r\njust text\r\n").unwrap();
        assert_eq!(email.text.as_deref().map(str::trim_end), Some("just text"));
        assert!(email.html.is_none());
        assert!(email.attachments.is_empty());
        assert!(email.embedded.is_empty());
    }

    #[test]
    fn missing_subject_is_empty() {
        let email = decompose(b"From: a@b.test\r\n\r\nbody\r\n").unwrap();
        assert_eq!(email.subject, "");
    }
}
