use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ingest::parser::{HeaderMap, ParsedEmail};

pub const FINGERPRINT_VERSION: i64 = 1;

pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn sha256_hex(data: &[u8]) -> String {
    hex_encode(&sha256_bytes(data))
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn canonical_sha256(value: &serde_json::Value) -> [u8; 32] {
    // serde_json maps are ordered, so this is the canonical sorted-key form.
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&encoded)
}

/// Equivalence class for "the same message delivered to multiple mailboxes or
/// folders": sender, normalized subject, calendar date, body prefix hash, and
/// attachment shape.
pub fn compute_fingerprint_v1(parsed: &ParsedEmail, attachment_sha256: &[[u8; 32]]) -> [u8; 32] {
    let body_text = parsed.body_text.as_deref().unwrap_or("").trim();
    let body_hash = sha256_hex(body_text.as_bytes());

    let payload = json!({
        "from": parsed.from_email,
        "subject_norm": parsed.subject_norm,
        "date": parsed.date.map(|d| d.date_naive().to_string()),
        "body_hash_prefix": &body_hash[..16],
        "attachment_count": attachment_sha256.len(),
        "attachment_sha_prefixes": attachment_sha256
            .iter()
            .take(10)
            .map(|sha| hex_encode(sha)[..16].to_string())
            .collect::<Vec<_>>(),
    });
    canonical_sha256(&payload)
}

/// Distinguishes otherwise identical-looking messages: exact recipients,
/// full timestamp, full body, and every attachment digest.
pub fn compute_signature_v1(parsed: &ParsedEmail, attachment_sha256: &[[u8; 32]]) -> [u8; 32] {
    let body_text = parsed.body_text.as_deref().unwrap_or("").trim();

    let mut to = parsed.to_emails.clone();
    to.sort();
    let mut cc = parsed.cc_emails.clone();
    cc.sort();
    let mut reply_to = parsed.reply_to_emails.clone();
    reply_to.sort();

    let payload = json!({
        "rfc_message_id": parsed.rfc_message_id,
        "date": parsed.date.map(|d| d.to_rfc3339()),
        "from": parsed.from_email,
        "to": to,
        "cc": cc,
        "reply_to": reply_to,
        "subject_norm": parsed.subject_norm,
        "body_text": body_text,
        "attachment_sha": attachment_sha256
            .iter()
            .map(|sha| hex_encode(sha))
            .collect::<Vec<_>>(),
    });
    canonical_sha256(&payload)
}

/// Read a typed UUID header ("X-OSS-Message-ID", "X-OSS-Ticket-ID"). Matching
/// is case-insensitive; an undecodable value reads as absent.
pub fn extract_uuid_header(headers: &HeaderMap, header_name: &str) -> Option<Uuid> {
    let values = headers.get(header_name).or_else(|| {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(header_name))
            .map(|(_, values)| values)
    })?;
    let raw = values.first()?.trim();
    if raw.is_empty() {
        return None;
    }
    Uuid::parse_str(raw).ok()
}
