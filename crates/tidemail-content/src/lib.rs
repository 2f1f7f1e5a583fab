use anyhow::Result;
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, ISO_8859_15, WINDOWS_1250, WINDOWS_1252};
use mailparse::{MailHeaderMap, ParsedMail, msgidparse};

#[derive(Debug, Clone, Default)]
pub struct ExtractedContent {
    pub body_text: Option<String>,
    pub references: Vec<String>,
}

/// Decodes a header-declared charset into UTF-8 text. Unknown labels fall
/// back to the WHATWG registry, a missing label to statistical detection,
/// and anything still unresolved passes the bytes through lossily.
pub fn decode_text(charset: Option<&str>, bytes: &[u8]) -> String {
    let label = charset.map(str::trim).filter(|s| !s.is_empty());
    let Some(label) = label else {
        return detect_and_decode(bytes);
    };

    match label.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "us-ascii" | "ascii" => String::from_utf8_lossy(bytes).into_owned(),
        "windows-1252" | "iso-8859-1" | "latin1" => decode_with(WINDOWS_1252, bytes),
        "iso-8859-15" => decode_with(ISO_8859_15, bytes),
        "windows-1250" => decode_with(WINDOWS_1250, bytes),
        other => match Encoding::for_label(other.as_bytes()) {
            Some(encoding) => decode_with(encoding, bytes),
            None => {
                tracing::debug!(charset = %label, "unknown charset, passing bytes through");
                String::from_utf8_lossy(bytes).into_owned()
            }
        },
    }
}

pub fn extract_content(raw: &[u8]) -> Result<ExtractedContent> {
    let parsed = mailparse::parse_mail(raw)?;
    let references = header_msg_ids(&parsed, "References");

    let mut chunks: Vec<String> = Vec::new();
    collect_inline_text(&parsed, &mut chunks)?;

    let body_text = if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n"))
    };

    Ok(ExtractedContent {
        body_text,
        references,
    })
}

fn decode_with(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

fn detect_and_decode(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    decode_with(detector.guess(None, true), bytes)
}

fn collect_inline_text(parsed: &ParsedMail, out: &mut Vec<String>) -> Result<()> {
    if parsed.subparts.is_empty() {
        let ctype = parsed.ctype.mimetype.to_lowercase();
        let disposition = parsed.get_content_disposition();
        let is_attachment = matches!(
            disposition.disposition,
            mailparse::DispositionType::Attachment
        ) || disposition.params.contains_key("filename");

        if ctype == "text/plain" && !is_attachment {
            let body = parsed.get_body_raw()?;
            let charset = parsed.ctype.params.get("charset").map(String::as_str);
            out.push(decode_text(charset, &body));
        }
        return Ok(());
    }

    for part in &parsed.subparts {
        collect_inline_text(part, out)?;
    }
    Ok(())
}

fn header_msg_ids(parsed: &ParsedMail, name: &str) -> Vec<String> {
    let Some(value) = parsed.headers.get_first_value(name) else {
        return Vec::new();
    };
    match msgidparse(&value) {
        Ok(ids) => ids.iter().cloned().collect(),
        Err(_) => Vec::new(),
    }
}
