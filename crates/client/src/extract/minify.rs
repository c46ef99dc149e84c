//! Whitespace and comment minification.
//!
//! `@charset` and `@import` statements are moved to the front, where CSS
//! requires them, since concatenated `<style>` blocks can leave them mid-sheet.

use std::sync::LazyLock;

use regex::Regex;

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/\*[\s\S]*?\*/").expect("invalid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("invalid regex"));
static AROUND_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*([{};,>])\s*").expect("invalid regex"));
static AFTER_COLON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\s+").expect("invalid regex"));
static HOISTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)@(charset|import)\s*("[^"]*"|'[^']*'|[^;{}])*;"#).expect("invalid regex"));

pub fn minify(css: &str) -> String {
    let css = COMMENT.replace_all(css, "");
    let css = WHITESPACE.replace_all(&css, " ");
    let css = AROUND_PUNCT.replace_all(&css, "$1");
    let css = AFTER_COLON.replace_all(&css, ":");
    let css = css.replace(";}", "}");
    hoist_imports(css.trim())
}

fn hoist_imports(css: &str) -> String {
    let mut charset = None;
    let mut imports = Vec::new();

    for m in HOISTED.find_iter(css) {
        let statement = m.as_str();
        if statement[1..].to_ascii_lowercase().starts_with("charset") {
            charset.get_or_insert(statement);
        } else {
            imports.push(statement);
        }
    }

    if charset.is_none() && imports.is_empty() {
        return css.to_string();
    }

    let rest = HOISTED.replace_all(css, "");
    let mut out = String::with_capacity(css.len());
    out.extend(charset);
    out.extend(imports);
    out.push_str(rest.trim());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minify_basic() {
        let css = "body {\n    margin : 0;\n    color: red;\n}\n\na ,  b > c { padding: 1px 2px }";
        assert_eq!(minify(css), "body{margin :0;color:red}a,b>c{padding:1px 2px}");
    }

    #[test]
    fn test_minify_strips_comments() {
        assert_eq!(minify("/* header */a{/* inner */color:blue;}/**/"), "a{color:blue}");
    }

    #[test]
    fn test_descendant_pseudo_selector_kept() {
        assert_eq!(minify("div :first-child { x: y }"), "div :first-child{x:y}");
        assert_eq!(minify("a:hover { x: y }"), "a:hover{x:y}");
    }

    #[test]
    fn test_imports_and_charset_hoisted() {
        let css = "a { color: red }\n@import url(\"b.css\");\n@charset \"utf-8\";\n@import 'c.css';";
        assert_eq!(minify(css), "@charset \"utf-8\";@import url(\"b.css\");@import 'c.css';a{color:red}");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(minify("  \n /* only a comment */ "), "");
    }
}
