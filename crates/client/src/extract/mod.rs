//! Stylesheet extraction from HTML documents.
//!
//! ### Sources
//! - `<style>` elements, in document order (non-CSS `type`s and empty blocks skipped)
//! - `<link rel="stylesheet" href>` elements, emitted as `@import url("…");`
//!   with the href resolved against the document URL
//!
//! Inline `style="…"` attributes are declarations, not rules, and are ignored.
//!
//! ### Stable Abstraction
//! - Callers depend on the [`CssParser`] trait, so the HTML engine can be swapped.

pub mod minify;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use csx_core::Error;

pub use minify::minify;

/// Bytes inspected for NUL when deciding whether input is text at all.
const SNIFF_BYTES: usize = 1024;

static STYLE_SOURCES: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("style, link[href]").expect("invalid selector"));

/// Turns a fetched or local document into CSS blocks.
pub trait CssParser: Send + Sync {
    /// CSS blocks in document order. `base_url` resolves relative stylesheet links.
    fn parse(&self, input: &[u8], base_url: Option<&Url>) -> Result<Vec<String>, Error>;
}

/// scraper-based parser for HTML documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlStyleParser;

impl CssParser for HtmlStyleParser {
    fn parse(&self, input: &[u8], base_url: Option<&Url>) -> Result<Vec<String>, Error> {
        let text = decode_text(input)?;
        let document = Html::parse_document(&text);

        let blocks = document
            .select(&STYLE_SOURCES)
            .filter_map(|el| match el.value().name() {
                "style" => style_block(el),
                "link" => link_import(el, base_url),
                _ => None,
            })
            .collect();

        Ok(blocks)
    }
}

/// Decode bytes as text, replacing invalid UTF-8.
///
/// # Errors
///
/// `ParseError` if a NUL byte appears near the start, i.e. the input is binary.
pub fn decode_text(input: &[u8]) -> Result<String, Error> {
    if input[..input.len().min(SNIFF_BYTES)].contains(&0) {
        return Err(Error::ParseError("input looks binary (NUL byte in the first 1 KiB)".into()));
    }
    Ok(String::from_utf8_lossy(input).into_owned())
}

fn style_block(el: ElementRef<'_>) -> Option<String> {
    if let Some(kind) = el.value().attr("type") {
        let kind = kind.split(';').next().unwrap_or_default().trim();
        if !kind.is_empty() && !kind.eq_ignore_ascii_case("text/css") {
            return None;
        }
    }

    let css: String = el.text().collect();
    let css = css.trim();
    (!css.is_empty()).then(|| css.to_string())
}

fn link_import(el: ElementRef<'_>, base_url: Option<&Url>) -> Option<String> {
    let is_stylesheet = el
        .value()
        .attr("rel")
        .is_some_and(|rel| rel.split_ascii_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")));
    if !is_stylesheet {
        return None;
    }

    let href = el.value().attr("href")?.trim();
    if href.is_empty() {
        return None;
    }

    let resolved = base_url.and_then(|base| base.join(href).ok()).map_or_else(|| href.to_string(), String::from);
    Some(format!("@import url(\"{}\");", resolved.replace('"', "%22")))
}

/// Number of top-level statements: rule blocks plus at-rule statements such as `@import`.
pub fn count_rules(css: &str) -> usize {
    let mut depth = 0usize;
    let mut count = 0;
    let mut pending = false;
    let mut quote: Option<char> = None;
    let mut chars = css.chars();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' {
                chars.next();
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                pending |= depth == 0;
            }
            '{' => {
                if depth == 0 {
                    count += 1;
                    pending = false;
                }
                depth += 1;
            }
            '}' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => {
                if pending {
                    count += 1;
                }
                pending = false;
            }
            c if depth == 0 && !c.is_whitespace() => pending = true,
            _ => {}
        }
    }

    count
}
