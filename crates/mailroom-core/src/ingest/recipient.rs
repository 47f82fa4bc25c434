use serde::Serialize;
use serde_json::{Value, json};

use crate::ingest::parser::HeaderMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSource {
    WorkspaceHeader,
    DeliveredTo,
    XOriginalTo,
    ToCcScan,
    Unknown,
}

impl RecipientSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientSource::WorkspaceHeader => "workspace_header",
            RecipientSource::DeliveredTo => "delivered_to",
            RecipientSource::XOriginalTo => "x_original_to",
            RecipientSource::ToCcScan => "to_cc_scan",
            RecipientSource::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientConfidence {
    High,
    Medium,
    Low,
}

impl RecipientConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientConfidence::High => "high",
            RecipientConfidence::Medium => "medium",
            RecipientConfidence::Low => "low",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecipientResolution {
    pub recipient: Option<String>,
    pub source: RecipientSource,
    pub confidence: RecipientConfidence,
    pub evidence: Value,
}

/// Resolve the address the provider originally delivered to. Precedence is
/// strict: X-Gm-Original-To, then Delivered-To, then X-Original-To, then the
/// first To address, then the first Cc address. The evidence object records
/// every candidate seen so the decision can be audited later.
pub fn resolve_original_recipient(
    headers: &HeaderMap,
    to_emails: &[String],
    cc_emails: &[String],
) -> RecipientResolution {
    let x_gm_values = header_candidates(headers, "x-gm-original-to");
    let delivered_values = header_candidates(headers, "delivered-to");
    let x_original_values = header_candidates(headers, "x-original-to");

    let to_candidates = clean_list(to_emails);
    let cc_candidates = clean_list(cc_emails);

    let mut selected: Option<String> = None;
    let mut selected_from: Option<&'static str> = None;
    let mut source = RecipientSource::Unknown;
    let mut confidence = RecipientConfidence::Low;

    if let Some(first) = x_gm_values.first() {
        selected = Some(first.clone());
        selected_from = Some("X-Gm-Original-To");
        source = RecipientSource::WorkspaceHeader;
        confidence = RecipientConfidence::High;
    } else if let Some(first) = delivered_values.first() {
        selected = Some(first.clone());
        selected_from = Some("Delivered-To");
        source = RecipientSource::DeliveredTo;
        confidence = RecipientConfidence::Medium;
    } else if let Some(first) = x_original_values.first() {
        selected = Some(first.clone());
        selected_from = Some("X-Original-To");
        source = RecipientSource::XOriginalTo;
        confidence = RecipientConfidence::Medium;
    } else if let Some(first) = to_candidates.first() {
        selected = Some(first.clone());
        selected_from = Some("to");
        source = RecipientSource::ToCcScan;
    } else if let Some(first) = cc_candidates.first() {
        selected = Some(first.clone());
        selected_from = Some("cc");
        source = RecipientSource::ToCcScan;
    }

    let evidence = json!({
        "selected_from": selected_from,
        "selected_value": selected,
        "x_gm_original_to_candidates": x_gm_values,
        "delivered_to_candidates": delivered_values,
        "x_original_to_candidates": x_original_values,
        "to_candidates": to_candidates,
        "cc_candidates": cc_candidates,
    });

    RecipientResolution {
        recipient: selected,
        source,
        confidence,
        evidence,
    }
}

/// Collect every address carried by a header (case-insensitive name match),
/// lowercased, deduplicated, order preserved.
fn header_candidates(headers: &HeaderMap, header_name_lc: &str) -> Vec<String> {
    let mut emails: Vec<String> = Vec::new();
    for (name, values) in headers {
        if !name.eq_ignore_ascii_case(header_name_lc) {
            continue;
        }
        for raw in values {
            for candidate in parse_address_list(raw) {
                if !emails.contains(&candidate) {
                    emails.push(candidate);
                }
            }
        }
    }
    emails
}

/// Pull addresses out of a header value that may be a bare address, a
/// display-name form, or a comma-separated list of either.
fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|piece| {
            let piece = piece.trim();
            let addr = match (piece.find('<'), piece.find('>')) {
                (Some(open), Some(close)) if close > open => &piece[open + 1..close],
                _ => piece,
            };
            let addr = addr.trim().to_lowercase();
            if addr.is_empty() { None } else { Some(addr) }
        })
        .collect()
}

fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}
