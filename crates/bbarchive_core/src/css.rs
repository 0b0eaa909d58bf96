use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

static CSS_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(url\(['"]?)(.*?)(['"]?\))"#).expect("static regex"));

/// Rewrite every `url(...)` reference in a stylesheet.
///
/// `resolve` receives the trimmed reference and returns its replacement, or
/// `None` to leave that occurrence exactly as it was.
pub fn rewrite_css_urls<F>(css: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut output = String::with_capacity(css.len());
    let mut last = 0;
    for captures in CSS_URL.captures_iter(css) {
        let (Some(whole), Some(open), Some(target), Some(close)) = (
            captures.get(0),
            captures.get(1),
            captures.get(2),
            captures.get(3),
        ) else {
            continue;
        };
        output.push_str(&css[last..whole.start()]);
        match resolve(target.as_str().trim())? {
            Some(replacement) => {
                output.push_str(open.as_str());
                output.push_str(&replacement);
                output.push_str(close.as_str());
            }
            None => output.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    output.push_str(&css[last..]);
    Ok(output)
}
