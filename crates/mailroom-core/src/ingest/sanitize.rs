use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use ammonia::Builder;
use linkify::{LinkFinder, LinkKind};

const ALLOWED_TAGS: &[&str] = &[
    "a", "p", "br", "div", "span", "strong", "em", "b", "i", "ul", "ol", "li", "blockquote",
    "code", "pre", "h1", "h2", "h3", "h4", "h5", "h6", "table", "thead", "tbody", "tr", "td",
    "th", "hr", "img",
];

fn build_cleaner() -> Builder<'static> {
    let mut tag_attributes: HashMap<&str, HashSet<&str>> = HashMap::new();
    tag_attributes.insert("a", ["href", "rel", "target"].into_iter().collect());
    tag_attributes.insert("img", ["src"].into_iter().collect());

    let mut builder = Builder::default();
    builder
        .tags(ALLOWED_TAGS.iter().copied().collect())
        .generic_attributes(["title", "alt"].into_iter().collect())
        .tag_attributes(tag_attributes)
        .url_schemes(["http", "https", "mailto", "cid"].into_iter().collect())
        .link_rel(None)
        .attribute_filter(|element, attribute, value| match (element, attribute) {
            ("a", "href") => {
                let v = value.trim();
                if v.starts_with("http://") || v.starts_with("https://") || v.starts_with("mailto:")
                {
                    Some(Cow::Owned(v.to_string()))
                } else {
                    None
                }
            }
            ("img", "src") => {
                let v = value.trim();
                if v.starts_with("cid:") {
                    Some(Cow::Owned(v.to_string()))
                } else {
                    None
                }
            }
            _ => Some(Cow::Borrowed(value)),
        });
    builder
}

/// Reduce untrusted HTML to the allowlisted tag/attribute set, then turn
/// bare URLs in text runs into anchors. Empty results collapse to None.
pub fn sanitize_html(html: Option<&str>) -> Option<String> {
    let html = html?;
    let cleaned = build_cleaner().clean(html).to_string();
    let linked = linkify_outside_anchors(&cleaned);
    if linked.trim().is_empty() {
        None
    } else {
        Some(linked)
    }
}

/// Wrap bare http(s) URLs in `<a rel="nofollow">` anchors. Runs over the
/// already-sanitized markup, so it only needs to skip tag bodies and the
/// inside of existing anchor elements.
fn linkify_outside_anchors(html: &str) -> String {
    let mut finder = LinkFinder::new();
    finder.kinds(&[LinkKind::Url]);

    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    let mut anchor_depth: usize = 0;

    while !rest.is_empty() {
        match rest.find('<') {
            Some(tag_start) => {
                let text = &rest[..tag_start];
                append_text(&mut out, text, anchor_depth, &finder);

                let Some(tag_len) = rest[tag_start..].find('>') else {
                    out.push_str(&rest[tag_start..]);
                    break;
                };
                let tag = &rest[tag_start..tag_start + tag_len + 1];
                let lowered = tag.to_ascii_lowercase();
                if lowered.starts_with("<a ") || lowered.starts_with("<a>") {
                    anchor_depth += 1;
                } else if lowered.starts_with("</a") {
                    anchor_depth = anchor_depth.saturating_sub(1);
                }
                out.push_str(tag);
                rest = &rest[tag_start + tag_len + 1..];
            }
            None => {
                append_text(&mut out, rest, anchor_depth, &finder);
                break;
            }
        }
    }

    out
}

fn append_text(out: &mut String, text: &str, anchor_depth: usize, finder: &LinkFinder) {
    if text.is_empty() {
        return;
    }
    if anchor_depth > 0 {
        out.push_str(text);
        return;
    }

    let mut cursor = 0;
    for link in finder.links(text) {
        let url = link.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            continue;
        }
        out.push_str(&text[cursor..link.start()]);
        out.push_str(&format!("<a href=\"{url}\" rel=\"nofollow\">{url}</a>"));
        cursor = link.end();
    }
    out.push_str(&text[cursor..]);
}
