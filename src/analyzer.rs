//! Bilingual text analysis: raw post HTML in, normalized token stream out.
//!
//! The pipeline strips HTML tags, folds ASCII and CJK punctuation into
//! spaces, segments with jieba in search mode (so compound CJK terms also
//! emit their subwords), lowercases, and drops stop words. Duplicate tokens
//! are kept because the index needs term frequencies.

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;
use regex::Regex;

const PUNCTUATION_CN: &str = "，、；：。？！‘’“”（）「」【】《》……";

// Most common words in English plus the usual Chinese particles.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "for", "from", "have", "if", "in",
    "is", "it", "may", "not", "of", "on", "or", "tbd", "that", "the", "this", "to", "us", "we",
    "when", "will", "with", "yet", "you", "your", "的", "了", "和", "着", "与",
];

fn html_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").unwrap())
}

fn segmenter() -> &'static Jieba {
    static JIEBA: OnceLock<Jieba> = OnceLock::new();
    JIEBA.get_or_init(Jieba::new)
}

fn stop_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

/// Replaces every HTML tag with a space.
fn strip_html(text: &str) -> String {
    html_tag_pattern().replace_all(text, " ").into_owned()
}

/// Replaces ASCII punctuation and the CJK punctuation set with spaces.
fn fold_punctuation(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_punctuation() || PUNCTUATION_CN.contains(c) {
                ' '
            } else {
                c
            }
        })
        .collect()
}

/// Runs the full analysis pipeline. Order matters: tags must go before
/// punctuation folding, stop words are matched after lowercasing.
pub fn analyze(text: &str) -> Vec<String> {
    let text = strip_html(text);
    let text = fold_punctuation(&text);

    segmenter()
        .cut_for_search(&text, true)
        .into_iter()
        .filter(|token| !token.trim().is_empty())
        .map(str::to_lowercase)
        .filter(|token| !stop_words().contains(token.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_ascii_words_and_numbers() {
        assert_eq!(analyze("Hello, World! 42"), vec!["hello", "world", "42"]);
    }

    #[test]
    fn drops_stop_words() {
        assert_eq!(analyze("this is a test"), vec!["test"]);
        assert_eq!(analyze("书，的"), vec!["书"]);
    }

    #[test]
    fn strips_html_tags() {
        let tokens = analyze("<p>rust<strong>lang</strong></p>");
        assert_eq!(tokens, vec!["rust", "lang"]);
    }

    #[test]
    fn punctuation_only_text_yields_nothing() {
        assert!(analyze("!@#$%^&*()").is_empty());
        assert!(analyze("，。？！……").is_empty());
    }

    #[test]
    fn segments_chinese_text() {
        let tokens = analyze("<p>这是一个<strong>测试</strong>文档</p>");
        assert!(tokens.iter().any(|t| t == "测试"));
        assert!(tokens.iter().any(|t| t == "文档"));
    }

    #[test]
    fn mixed_language_query() {
        let tokens = analyze("Python 数据");
        assert!(tokens.contains(&"python".to_string()));
        assert!(tokens.contains(&"数据".to_string()));
    }

    #[test]
    fn analysis_is_idempotent_over_space_joined_output() {
        let text = "Running Tests, quickly & THOROUGHLY (twice)";
        let once = analyze(text);
        let twice = analyze(&once.join(" "));
        assert_eq!(once, twice);
    }
}
