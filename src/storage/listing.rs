//! Parsing of the blob service's `List Blobs` XML response.
//!
//! Only blob names and the continuation marker are needed.

use regex::Regex;
use std::sync::OnceLock;

use crate::model::ObjectPage;

fn blob_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<Blob>.*?<Name>(.*?)</Name>").expect("blob name pattern is valid")
    })
}

fn next_marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<NextMarker>(.*?)</NextMarker>").expect("marker pattern is valid")
    })
}

/// Extract object names and the continuation marker from one listing page
pub fn parse_list_response(xml: &str) -> ObjectPage {
    let names = blob_name_pattern()
        .captures_iter(xml)
        .map(|c| unescape(&c[1]))
        .collect();

    // An empty <NextMarker/> means the listing is complete
    let continuation = next_marker_pattern()
        .captures(xml)
        .map(|c| unescape(c[1].trim()))
        .filter(|marker| !marker.is_empty());

    ObjectPage { names, continuation }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
