pub mod fingerprint;
pub mod parser;
pub mod recipient;
pub mod sanitize;

pub use fingerprint::{
    compute_fingerprint_v1, compute_signature_v1, extract_uuid_header, sha256_bytes,
};
pub use parser::{HeaderMap, ParsedAttachment, ParsedEmail, normalize_subject, parse_raw_email};
pub use recipient::{RecipientConfidence, RecipientResolution, RecipientSource, resolve_original_recipient};
pub use sanitize::sanitize_html;
