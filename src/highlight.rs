//! Query-term highlighting that never corrupts HTML markup.
//!
//! One alternation does the work: the first branch swallows whole HTML tags
//! and emits them unchanged, the remaining branches are the query tokens,
//! longest first so a short token cannot shadow a longer one. ASCII tokens
//! require word boundaries; CJK tokens match as substrings.

use regex::Regex;

/// Wraps every query-token occurrence in the HTML in `<mark>…</mark>`.
pub fn highlight_html(tokens: &[String], html: &str) -> String {
    let mut tokens: Vec<&str> = tokens.iter().map(String::as_str).collect();
    tokens.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
    tokens.dedup();
    if tokens.is_empty() {
        return html.to_string();
    }

    let alternation = tokens
        .iter()
        .map(|token| {
            let escaped = regex::escape(token);
            if token.is_ascii() {
                format!(r"\b{escaped}\b")
            } else {
                escaped
            }
        })
        .collect::<Vec<_>>()
        .join("|");

    let pattern = format!("(?i)(<[^>]*>)|{alternation}");
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return html.to_string(),
    };

    re.replace_all(html, |caps: &regex::Captures| {
        if let Some(tag) = caps.get(1) {
            tag.as_str().to_string()
        } else {
            format!("<mark>{}</mark>", &caps[0])
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn wraps_ascii_words() {
        let html = "<p>rust is fun</p>";
        let out = highlight_html(&tokens(&["rust"]), html);
        assert_eq!(out, "<p><mark>rust</mark> is fun</p>");
    }

    #[test]
    fn leaves_html_tags_alone() {
        let html = r#"<p class="strong">strong</p>"#;
        let out = highlight_html(&tokens(&["strong"]), html);
        assert_eq!(out, r#"<p class="strong"><mark>strong</mark></p>"#);
    }

    #[test]
    fn ascii_needs_word_boundaries() {
        let out = highlight_html(&tokens(&["cat"]), "<p>cat concatenate</p>");
        assert_eq!(out, "<p><mark>cat</mark> concatenate</p>");
    }

    #[test]
    fn cjk_matches_inside_runs() {
        let out = highlight_html(&tokens(&["测试"]), "<p>这是测试文档</p>");
        assert_eq!(out, "<p>这是<mark>测试</mark>文档</p>");
    }

    #[test]
    fn longer_tokens_win() {
        let out = highlight_html(&tokens(&["数据", "数据科学"]), "<p>数据科学</p>");
        assert_eq!(out, "<p><mark>数据科学</mark></p>");
    }

    #[test]
    fn matching_is_case_insensitive() {
        let out = highlight_html(&tokens(&["rust"]), "<p>Rust</p>");
        assert_eq!(out, "<p><mark>Rust</mark></p>");
    }
}
