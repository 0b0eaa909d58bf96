use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::warn;

use crate::dom::{
    Document, Handle, Selector, append, attr, create_element, detach, prepend, set_text,
    text_content,
};

/// Substrings of `src` that mark vendor scripts the offline pages still need.
pub const ALLOWED_SCRIPT_SOURCES: [&str; 18] = [
    "cdn.js",
    "fastinit.js",
    "prototype.js",
    "actionPanel.js",
    "coursemenu.js",
    "globalNavigation.js",
    "lightbox.js",
    "page.js",
    "tree.js",
    "mygrades.js",
    "effects.js",
    "grade_assignment.js",
    "inline-grading",
    "discussionboard/js",
    "stream.js",
    "scrollbar.js",
    "livepipe.js",
    "slider.js",
];

/// Inline scripts containing any of these are dropped whole.
pub const BLOCKED_INLINE_KEYWORDS: [&str; 1] = ["streamName"];

/// Inline script lines containing any of these survive filtering.
pub const ALLOWED_INLINE_KEYWORDS: [&str; 8] = [
    "page.bundle.addKey",
    "PageMenuToggler",
    "PaletteController",
    "mygrades",
    "gradeAssignment",
    "collapsiblelist",
    "postInit",
    "var courseId",
];

static DOWNLOAD_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"("downloadUrl":")(.*?)(",)"#).expect("static regex"));
static STREAM_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"stream\.js").expect("static regex"));

const FAKE_DWR: &str = r#"
var UserDataDWRFacade = {
    getStringPermScope: function(){},
    setStringPermScope: function(){},
    getStringTempScope: function(){},
    setStringTempScope: function(){}
}
"#;

const STREAM_INIT: &str = r#"window.addEventListener("load", function() { window.stream.fitScrollableRegionToBrowser(); }, false); "#;

const SELECT_TARGET: &str = r#"function selectTarget(event) {
    var elements = $("currentAttempt_submissionList").getElementsByClassName("selected");
    for(var i = 0; i < elements.length; i++) {
        elements[i].classList.remove("selected");
    }
    event.currentTarget.classList.add("selected");
}
"#;

const WINDOW_HEIGHT: &str = r#"function getWindowHeight() {
    var winH;
    if ( window.innerHeight ) {
        winH = window.innerHeight;
    } else if ( window.document.documentElement && window.document.documentElement.clientHeight ) {
        winH = window.document.documentElement.clientHeight;
    } else {
        winH = document.body.offsetHeight;
    }
    return winH - globalNavigation.getNavDivHeight();
}
"#;

const CLICK_GRADE: &str = r#"function clickGrade(e) {
    var elements = $("left_stream_mygrades").getElementsByTagName("div");
    for(var i = 0; i < elements.length; i++) {
        elements[i].setAttribute("aria_selected", "false");
        elements[i].classList.remove("active_stream_item");
    }
    e.currentTarget.setAttribute("aria_selected", "true");
    e.currentTarget.classList.add("active_stream_item");
    $("right_stream_mygrades").src = e.currentTarget.dataset.path;
}
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptFilterStats {
    pub kept_external: usize,
    pub removed_external: usize,
    pub trimmed_inline: usize,
    pub removed_inline: usize,
}

pub fn filter_inline_script(text: &str) -> Option<Vec<&str>> {
    if contains_keyword(text, &BLOCKED_INLINE_KEYWORDS) {
        return None;
    }
    if !contains_keyword(text, &ALLOWED_INLINE_KEYWORDS) {
        return None;
    }
    Some(
        text.split('\n')
            .filter(|line| contains_keyword(line, &ALLOWED_INLINE_KEYWORDS))
            .map(str::trim)
            .collect(),
    )
}

/// Strip scripts that would break or phone home offline, then inject the
/// helpers the remaining vendor code expects.
///
/// `rewrite_init_line` receives every kept `gradeAssignment.init` line so its
/// download URLs can point at local copies.
pub fn filter_scripts<F>(doc: &Document, mut rewrite_init_line: F) -> Result<ScriptFilterStats>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut stats = ScriptFilterStats::default();
    for script in doc.find_all(&Selector::tag("script")) {
        if let Some(src) = attr(&script, "src") {
            if ALLOWED_SCRIPT_SOURCES.iter().any(|name| src.contains(name)) {
                stats.kept_external += 1;
            } else {
                detach(&script);
                stats.removed_external += 1;
            }
            continue;
        }

        let text = text_content(&script);
        match filter_inline_script(&text) {
            Some(lines) => {
                let mut kept = Vec::with_capacity(lines.len());
                for line in lines {
                    if line.contains("gradeAssignment.init") {
                        kept.push(rewrite_init_line(line)?);
                    } else {
                        kept.push(line.to_string());
                    }
                }
                set_text(&script, &kept.join("\n"));
                stats.trimmed_inline += 1;
            }
            None => {
                detach(&script);
                stats.removed_inline += 1;
            }
        }
    }
    add_fake_dwr(doc);
    add_streams_init(doc);
    Ok(stats)
}

pub fn rewrite_download_urls<F>(line: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut output = String::with_capacity(line.len());
    let mut last = 0;
    for captures in DOWNLOAD_URL.captures_iter(line) {
        let (Some(whole), Some(open), Some(url), Some(close)) = (
            captures.get(0),
            captures.get(1),
            captures.get(2),
            captures.get(3),
        ) else {
            continue;
        };
        output.push_str(&line[last..whole.start()]);
        output.push_str(open.as_str());
        output.push_str(&resolve(&url.as_str().replace("\\/", "/"))?);
        output.push_str(close.as_str());
        last = whole.end();
    }
    output.push_str(&line[last..]);
    Ok(output)
}

fn contains_keyword(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| text.contains(keyword))
}

fn script_element(source: &str) -> Handle {
    let script = create_element("script", &[]);
    set_text(&script, source);
    script
}

fn append_to_body(doc: &Document, source: &str) {
    match doc.body() {
        Some(body) => append(&body, script_element(source)),
        None => warn!("page has no <body>; skipping injected script"),
    }
}

/// Stub for the DWR user-data bridge so vendor scripts do not throw offline.
pub fn add_fake_dwr(doc: &Document) {
    match doc.head() {
        Some(head) => prepend(&head, script_element(FAKE_DWR)),
        None => warn!("page has no <head>; skipping DWR stub"),
    }
}

pub fn add_streams_init(doc: &Document) {
    let stream_script = Selector::tag("script").with_attr_pattern("src", STREAM_SCRIPT.clone());
    if doc.find_first(&stream_script).is_some() {
        append_to_body(doc, STREAM_INIT);
    }
}

pub fn add_select_target_script(doc: &Document) {
    append_to_body(doc, SELECT_TARGET);
}

pub fn add_window_height_script(doc: &Document, iframe_id: &str) {
    let source = format!(
        "{WINDOW_HEIGHT}window.onload = $(\"{iframe_id}\").style.height = getWindowHeight() + \"px\";"
    );
    append_to_body(doc, &source);
}

pub fn add_click_grade_script(doc: &Document) {
    append_to_body(doc, CLICK_GRADE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;

    const PAGE: &str = r#"<html><head><script src="/javascript/prototype.js"></script>
<script src="/tracking/analytics.js"></script></head>
<body>
<script>
  page.bundle.addKey('a', 'b');
  trackUser();
  var courseId = '_12_1';
</script>
<script>var streamName = 'mygrades'; mygrades.init();</script>
<script>console.log('unrelated');</script>
<script>
  gradeAssignment.init({"downloadUrl":"\/webapps\/assignment\/download?attempt_id=_3_1&fileName=a.pdf","x":1});
</script>
<script src="/webapps/streamViewer/js/stream.js"></script>
</body></html>"#;

    #[test]
    fn inline_filter_keeps_allowed_lines_only() {
        assert_eq!(
            filter_inline_script("a();\n  PageMenuToggler.init();\nb();"),
            Some(vec!["PageMenuToggler.init();"])
        );
        assert_eq!(filter_inline_script("streamName = 1; mygrades();"), None);
        assert_eq!(filter_inline_script("other();"), None);
    }

    #[test]
    fn filter_scripts_trims_removes_and_injects() {
        let doc = Document::parse(PAGE);
        let mut rewritten = Vec::new();
        let stats = filter_scripts(&doc, |line| {
            rewrite_download_urls(line, |url| {
                rewritten.push(url.to_string());
                Ok("../Course/3 - a.pdf".to_string())
            })
        })
        .expect("filter");

        assert_eq!(stats.kept_external, 2);
        assert_eq!(stats.removed_external, 1);
        assert_eq!(stats.trimmed_inline, 2);
        assert_eq!(stats.removed_inline, 2);
        assert_eq!(
            rewritten,
            vec!["/webapps/assignment/download?attempt_id=_3_1&fileName=a.pdf"]
        );

        let html = doc.to_html().expect("serialize");
        assert!(!html.contains("analytics.js"));
        assert!(!html.contains("trackUser"));
        assert!(!html.contains("streamName"));
        assert!(html.contains("page.bundle.addKey('a', 'b');\nvar courseId = '_12_1';"));
        assert!(html.contains(r#""downloadUrl":"../Course/3 - a.pdf","#));
        assert!(html.contains("UserDataDWRFacade"));
        assert!(html.contains("fitScrollableRegionToBrowser"));

        let head = doc.head().expect("head");
        let first = head.children.borrow().first().cloned().expect("first child");
        assert!(text_content(&first).contains("UserDataDWRFacade"));
    }

    #[test]
    fn stream_init_is_only_added_when_stream_script_remains() {
        let doc = Document::parse("<html><head></head><body><p>x</p></body></html>");
        filter_scripts(&doc, |line| Ok(line.to_string())).expect("filter");
        let html = doc.to_html().expect("serialize");
        assert!(!html.contains("fitScrollableRegionToBrowser"));
    }

    #[test]
    fn window_height_script_targets_the_iframe() {
        let doc = Document::parse("<html><head></head><body></body></html>");
        add_window_height_script(&doc, "mybbCanvas");
        let html = doc.to_html().expect("serialize");
        assert!(html.contains(r#"$("mybbCanvas").style.height = getWindowHeight() + "px";"#));
    }
}
