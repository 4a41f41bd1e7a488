//! General-purpose fenced-code-block extractor, parameterized by tag name
//! and reused for `sql`, `python`, and `json`.

use regex::Regex;

/// Returns every fenced block's inner text tagged with `tag`, in document
/// order. Callers take the first.
pub fn extract_fenced_blocks(text: &str, tag: &str) -> Vec<String> {
    let pattern = format!(
        r"(?is)(`{{3,}})\s*{}(?:\r?\n)?(.*?)\1",
        regex::escape(tag)
    );
    let re = Regex::new(&pattern).expect("fence pattern is always valid");
    re.captures_iter(text)
        .map(|caps| caps[2].to_string())
        .collect()
}
