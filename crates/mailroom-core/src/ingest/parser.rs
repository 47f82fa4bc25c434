use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{HeaderValue, Message, MessageParser, MimeHeaders, PartType};
use regex::Regex;

use crate::ingest::sanitize::sanitize_html;

/// Case-preserving header multimap: one entry per distinct header name,
/// holding every value for that name in appearance order.
pub type HeaderMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttachment {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
    pub is_inline: bool,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEmail {
    pub rfc_message_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub subject_norm: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub reply_to_emails: Vec<String>,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub headers: HeaderMap,
    pub body_text: Option<String>,
    pub body_html_sanitized: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<ParsedAttachment>,
}

static SUBJECT_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(re|fw|fwd)\s*:\s*").expect("subject prefix regex"));

/// Strip reply/forward prefixes ("Re:", "Fw:", "Fwd:") until the subject is
/// stable. Empty results collapse to None.
pub fn normalize_subject(subject: Option<&str>) -> Option<String> {
    let mut current = subject?.trim().to_string();
    loop {
        let stripped = SUBJECT_PREFIX_RE.replace(&current, "").trim().to_string();
        if stripped == current {
            break;
        }
        current = stripped;
    }
    if current.is_empty() { None } else { Some(current) }
}

/// Parse an RFC 822 byte string into the projection the pipeline stores.
/// Parsing never fails: undecodable input yields an empty projection, and
/// body parts with broken charsets decode with replacement characters.
pub fn parse_raw_email(raw: &[u8]) -> ParsedEmail {
    let Some(msg) = MessageParser::default().parse(raw) else {
        return ParsedEmail::default();
    };

    let subject = msg.subject().map(|s| s.to_string());
    let subject_norm = normalize_subject(subject.as_deref());

    let (from_email, from_name) = extract_from(&msg);
    let reply_to_emails = extract_address_list(msg.reply_to());
    let to_emails = extract_address_list(msg.to());
    let cc_emails = extract_address_list(msg.cc());

    let rfc_message_id = msg
        .message_id()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let date = msg
        .date()
        .and_then(|dt| Utc.timestamp_opt(dt.to_timestamp(), 0).single());

    let in_reply_to = match msg.in_reply_to() {
        HeaderValue::Text(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        HeaderValue::TextList(list) => list
            .first()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()),
        _ => None,
    };

    let references = match msg.header("References") {
        Some(HeaderValue::Text(text)) => text
            .split_whitespace()
            .map(|id| id.to_string())
            .collect(),
        Some(HeaderValue::TextList(list)) => list
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    let body_text = collect_text_bodies(&msg);
    let body_html = collect_html_bodies(&msg);
    let body_html_sanitized = sanitize_html(body_html.as_deref());

    let attachments = collect_attachments(&msg);

    let mut headers: HeaderMap = BTreeMap::new();
    for header in msg.headers() {
        if let Some(value) = header_value_to_string(&header.value) {
            headers
                .entry(header.name.as_str().to_string())
                .or_default()
                .push(value);
        }
    }

    ParsedEmail {
        rfc_message_id,
        date,
        subject,
        subject_norm,
        from_email,
        from_name,
        reply_to_emails,
        to_emails,
        cc_emails,
        headers,
        body_text,
        body_html_sanitized,
        in_reply_to,
        references,
        attachments,
    }
}

fn extract_from(msg: &Message<'_>) -> (Option<String>, Option<String>) {
    let Some(first) = msg.from().and_then(|address| address.first()) else {
        return (None, None);
    };
    let email = first
        .address()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty());
    let name = first
        .name()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    (email, name)
}

fn extract_address_list(address: Option<&mail_parser::Address<'_>>) -> Vec<String> {
    let Some(address) = address else {
        return Vec::new();
    };
    address
        .iter()
        .filter_map(|addr| addr.address())
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect()
}

// Only true text/plain (or text/html) parts count: mail-parser's body lists
// fall back to converting the other body kind when one is missing, and that
// conversion must not leak into the stored projection.
fn collect_text_bodies(msg: &Message<'_>) -> Option<String> {
    let mut collected = Vec::new();
    for part in msg.text_bodies() {
        if let PartType::Text(text) = &part.body {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                collected.push(trimmed.to_string());
            }
        }
    }
    join_bodies(collected)
}

fn collect_html_bodies(msg: &Message<'_>) -> Option<String> {
    let mut collected = Vec::new();
    for part in msg.html_bodies() {
        if let PartType::Html(html) = &part.body {
            let trimmed = html.trim();
            if !trimmed.is_empty() {
                collected.push(trimmed.to_string());
            }
        }
    }
    join_bodies(collected)
}

fn join_bodies(collected: Vec<String>) -> Option<String> {
    if collected.is_empty() {
        None
    } else {
        Some(collected.join("\n\n"))
    }
}

fn collect_attachments(msg: &Message<'_>) -> Vec<ParsedAttachment> {
    let mut attachments = Vec::new();
    for part in msg.attachments() {
        let disposition = part
            .content_disposition()
            .map(|ct| ct.ctype().to_ascii_lowercase());
        let is_inline = disposition.as_deref() == Some("inline");
        let is_attachment = disposition.as_deref() == Some("attachment");
        if !(is_inline || is_attachment) {
            continue;
        }
        let Some(filename) = part.attachment_name() else {
            continue;
        };

        let content_type = part.content_type().map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype).to_lowercase(),
            None => ct.ctype().to_lowercase(),
        });
        let content_id = part
            .content_id()
            .map(|cid| cid.trim().trim_matches(|c| c == '<' || c == '>').to_string())
            .filter(|cid| !cid.is_empty());

        attachments.push(ParsedAttachment {
            filename: Some(filename.to_string()),
            content_type,
            payload: part.contents().to_vec(),
            is_inline,
            content_id,
        });
    }
    attachments
}

fn header_value_to_string(value: &HeaderValue<'_>) -> Option<String> {
    match value {
        HeaderValue::Text(text) => Some(text.to_string()),
        HeaderValue::TextList(list) => Some(list.join(", ")),
        HeaderValue::Address(address) => {
            let rendered: Vec<String> = address
                .iter()
                .filter_map(|addr| match (addr.name(), addr.address()) {
                    (Some(name), Some(email)) => Some(format!("{name} <{email}>")),
                    (None, Some(email)) => Some(email.to_string()),
                    (Some(name), None) => Some(name.to_string()),
                    (None, None) => None,
                })
                .collect();
            if rendered.is_empty() {
                None
            } else {
                Some(rendered.join(", "))
            }
        }
        HeaderValue::DateTime(dt) => Some(dt.to_rfc3339()),
        HeaderValue::ContentType(ct) => Some(match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_email() -> &'static [u8] {
        b"Message-ID: <msg-1@example.com>\r\n\
          Date: Mon, 6 Jul 2026 10:30:00 +0200\r\n\
          Subject: Re: Fwd: Printer on fire\r\n\
          From: Ann Example <Ann@Example.com>\r\n\
          Reply-To: ticket+tkt-abc@support.example.com\r\n\
          To: Support <support@acme.test>, second@acme.test\r\n\
          Cc: watcher@acme.test\r\n\
          In-Reply-To: <root@example.com>\r\n\
          References: <root@example.com> <mid@example.com>\r\n\
          X-Gm-Original-To: support@acme.test\r\n\
          Content-Type: text/plain; charset=utf-8\r\n\
          \r\n\
          The printer is on fire.\r\n"
    }

    #[test]
    fn parses_core_fields() {
        let parsed = parse_raw_email(sample_email());

        assert_eq!(parsed.rfc_message_id.as_deref(), Some("msg-1@example.com"));
        assert_eq!(parsed.subject.as_deref(), Some("Re: Fwd: Printer on fire"));
        assert_eq!(parsed.subject_norm.as_deref(), Some("Printer on fire"));
        assert_eq!(parsed.from_email.as_deref(), Some("ann@example.com"));
        assert_eq!(parsed.from_name.as_deref(), Some("Ann Example"));
        assert_eq!(
            parsed.reply_to_emails,
            vec!["ticket+tkt-abc@support.example.com"]
        );
        assert_eq!(parsed.to_emails, vec!["support@acme.test", "second@acme.test"]);
        assert_eq!(parsed.cc_emails, vec!["watcher@acme.test"]);
        assert_eq!(parsed.body_text.as_deref(), Some("The printer is on fire."));
        assert!(parsed.body_html_sanitized.is_none());

        let date = parsed.date.expect("date parses");
        assert_eq!(date.to_rfc3339(), "2026-07-06T08:30:00+00:00");
    }

    #[test]
    fn threading_references_are_captured_in_order() {
        let parsed = parse_raw_email(sample_email());
        assert_eq!(parsed.in_reply_to.as_deref(), Some("root@example.com"));
        assert_eq!(
            parsed.references,
            vec!["root@example.com", "mid@example.com"]
        );
    }

    #[test]
    fn headers_multimap_preserves_all_values() {
        let parsed = parse_raw_email(
            b"Delivered-To: a@acme.test\r\n\
              Delivered-To: b@acme.test\r\n\
              Subject: hi\r\n\
              \r\n\
              body\r\n",
        );

        let delivered = parsed.headers.get("Delivered-To").expect("header present");
        assert_eq!(delivered, &vec!["a@acme.test".to_string(), "b@acme.test".to_string()]);
    }

    #[test]
    fn multipart_attachments_require_disposition_and_filename() {
        let raw = b"Subject: files\r\n\
            From: a@x.com\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"B\"\r\n\
            \r\n\
            --B\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            See attached.\r\n\
            --B\r\n\
            Content-Type: application/pdf\r\n\
            Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            JVBERi0xLjQ=\r\n\
            --B\r\n\
            Content-Type: image/png\r\n\
            Content-Disposition: inline; filename=\"logo.png\"\r\n\
            Content-ID: <logo-1>\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            iVBORw0KGgo=\r\n\
            --B--\r\n";

        let parsed = parse_raw_email(raw);

        assert_eq!(parsed.body_text.as_deref(), Some("See attached."));
        assert_eq!(parsed.attachments.len(), 2);

        let pdf = &parsed.attachments[0];
        assert_eq!(pdf.filename.as_deref(), Some("report.pdf"));
        assert_eq!(pdf.content_type.as_deref(), Some("application/pdf"));
        assert!(!pdf.is_inline);
        assert_eq!(pdf.payload, b"%PDF-1.4");

        let logo = &parsed.attachments[1];
        assert_eq!(logo.filename.as_deref(), Some("logo.png"));
        assert!(logo.is_inline);
        assert_eq!(logo.content_id.as_deref(), Some("logo-1"));
    }

    #[test]
    fn multiple_text_parts_join_with_blank_line() {
        let raw = b"Subject: multi\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"B\"\r\n\
            \r\n\
            --B\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            first part\r\n\
            --B\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            second part\r\n\
            --B--\r\n";

        let parsed = parse_raw_email(raw);
        assert_eq!(parsed.body_text.as_deref(), Some("first part\n\nsecond part"));
    }

    #[test]
    fn html_body_is_sanitized() {
        let raw = b"Subject: html\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <p>hello <script>alert(1)</script><a href=\"javascript:x\">bad</a>\
            <a href=\"https://ok.test\">ok</a></p>\r\n";

        let parsed = parse_raw_email(raw);
        let html = parsed.body_html_sanitized.expect("html body");
        assert!(!html.contains("script"));
        assert!(!html.contains("javascript:"));
        assert!(html.contains("https://ok.test"));
        assert!(parsed.body_text.is_none());
    }

    #[test]
    fn garbage_input_yields_empty_projection() {
        let parsed = parse_raw_email(&[0x00, 0xff, 0xfe]);
        assert!(parsed.rfc_message_id.is_none());
        assert!(parsed.body_text.is_none());
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn subject_prefixes_strip_iteratively() {
        assert_eq!(
            normalize_subject(Some("Re: re:  FWD: Hello")).as_deref(),
            Some("Hello")
        );
        assert_eq!(normalize_subject(Some("Re:")), None);
        assert_eq!(normalize_subject(Some("  Plain  ")).as_deref(), Some("Plain"));
        assert_eq!(normalize_subject(None), None);
        assert_eq!(
            normalize_subject(Some("Reminder: lunch")).as_deref(),
            Some("Reminder: lunch"),
            "only whole re/fw/fwd tokens strip"
        );
    }
}
