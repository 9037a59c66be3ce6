//! Stateless command-line parsing.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use super::error::SmtpError;

/// Split a raw line into an upper-cased verb and the remaining argument
/// text. The split happens at the first run of whitespace.
pub fn parse_command(line: &str) -> (String, String) {
    let trimmed = line.trim_end_matches([' ', '\t', '\r', '\n']);
    match trimmed.split_once(|c: char| c.is_whitespace()) {
        Some((verb, rest)) => (verb.to_uppercase(), rest.trim_start().to_string()),
        None => (trimmed.to_uppercase(), String::new()),
    }
}

/// Parse a `KEYWORD:<address>` argument as used by MAIL and RCPT.
///
/// Whitespace is tolerated around the colon and inside the angle brackets;
/// the keyword comes back upper-cased so callers can match on `FROM`/`TO`.
/// The address must contain `@`.
pub fn parse_email_args(args: &str) -> Result<(String, String), SmtpError> {
    let (keyword, rest) = args.split_once(':').ok_or(SmtpError::InvalidSyntax)?;

    let keyword = keyword.trim();
    if keyword.is_empty() || !keyword.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(SmtpError::InvalidSyntax);
    }

    let start = rest.find('<').ok_or(SmtpError::InvalidSyntax)?;
    let end = rest.rfind('>').ok_or(SmtpError::InvalidSyntax)?;
    if end < start {
        return Err(SmtpError::InvalidSyntax);
    }

    let addr = rest[start + 1..end].trim();
    if !addr.contains('@') {
        return Err(SmtpError::InvalidSyntax);
    }

    Ok((keyword.to_uppercase(), addr.to_string()))
}

/// Decode an AUTH PLAIN payload: base64 of `authzid NUL user NUL pass`.
/// The authorization identity is ignored.
pub fn parse_plain_creds(payload: &str) -> Result<(String, String), SmtpError> {
    let text = decode_base64(payload)?;
    let parts: Vec<&str> = text.splitn(3, '\0').collect();
    if parts.len() != 3 {
        return Err(SmtpError::CredentialDecode);
    }
    Ok((parts[1].to_string(), parts[2].to_string()))
}

/// Decode one base64 credential token into UTF-8.
pub fn decode_base64(payload: &str) -> Result<String, SmtpError> {
    let decoded = B64
        .decode(payload.trim())
        .map_err(|_| SmtpError::CredentialDecode)?;
    String::from_utf8(decoded).map_err(|_| SmtpError::CredentialDecode)
}
