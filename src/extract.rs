//! Per-revision text features.
//!
//! All extractors are total: absent or odd input gives a neutral value (`None` or `0`) instead
//! of an error, so a single broken revision never takes the whole dataset down.

use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use memchr::memmem;
use quick_xml::escape::resolve_html5_entity;
use regex::{Captures, Regex};

use crate::lexicon::Term;

static REGEX_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
// only things a browser would treat as a tag: `<ref name="x">`, `</ref>`, `<br/>`, not `a < b`
static REGEX_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[A-Za-z][^<>]*>").unwrap());
static REGEX_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[xX][0-9A-Fa-f]+|#[0-9]+|[A-Za-z][A-Za-z0-9]*);").unwrap());

static LINK_MARKERS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    // template and wiki-link openers; the closing halves are not counted
    let aho_corasick = AhoCorasick::new(["{{", "[["]).unwrap();
    tracing::debug!(
        "built aho-corasick successfully, kind: {:?}",
        aho_corasick.kind()
    );
    aho_corasick
});

fn decode_entity(caps: &Captures) -> String {
    let whole = &caps[0];
    let name = &caps[1];

    let numeric = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        Some(u32::from_str_radix(hex, 16).ok())
    } else {
        name.strip_prefix('#').map(|dec| dec.parse::<u32>().ok())
    };

    match numeric {
        Some(code) => code
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| whole.to_string()),
        None => resolve_html5_entity(name)
            .map(str::to_string)
            .unwrap_or_else(|| whole.to_string()),
    }
}

/// Strip HTML comments and tags, decode character references, turn newlines into spaces and
/// lowercase the result.
///
/// Unknown entities are kept verbatim. `None` in, `None` out.
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    let raw = raw?;

    let text = REGEX_COMMENT.replace_all(raw, "");
    let text = REGEX_TAG.replace_all(&text, "");
    let text = REGEX_ENTITY.replace_all(&text, decode_entity);
    let text = text.replace('\n', " ");

    Some(text.to_lowercase())
}

/// Number of non-overlapping matches of the term's pattern.
pub fn count_mentions(term: &Term, text: Option<&str>) -> usize {
    text.map_or(0, |text| term.pattern().find_iter(text).count())
}

/// Position of the first literal occurrence of the term, as a percentage of the text length
/// (both in characters).
///
/// `Some(0.0)` means the very top of the page. `None` if the term does not occur, or if
/// there is no text to search in.
pub fn first_location_percent(term: &Term, text: Option<&str>) -> Option<f64> {
    let text = text?;
    let byte_index = memmem::find(text.as_bytes(), term.phrase().as_bytes())?;

    let total = text.chars().count();
    if total == 0 {
        return None;
    }
    let before = text[..byte_index].chars().count();

    Some(100.0 * before as f64 / total as f64)
}

/// Count `{{` and `[[` markers (templates and wiki links).
pub fn count_links(text: Option<&str>) -> usize {
    text.map_or(0, |text| LINK_MARKERS.find_iter(text).count())
}
