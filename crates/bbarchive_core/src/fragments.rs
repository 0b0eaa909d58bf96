use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, warn};

use crate::dom::{
    Document, Handle, Selector, append, attr, clear_children, parse_fragment_nodes,
    remove_attr, replace_with, text_content, unescape_html,
};
use crate::session::Transport;
use crate::urls::{QueryUrl, absolute_url, parse_query, query_pairs};

pub const TAB_ACTION_PATH: &str = "/webapps/portal/execute/tabs/tabAction";
pub const COURSE_INFORMATION_SCRIPT: &str =
    "/webapps/utnl-OsirisCursusinformatie-bb_bb60/showCourseInformationJsAsync.do";

static TAB_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\('([^']*)'\)").expect("static regex"));
static TAB_PARAMETERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"parameters: '([^,']*)',").expect("static regex"));
static TAB_CONTENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<contents[^>]*>(.*)</contents>").expect("static regex"));
static COURSE_INFORMATION_HTML: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"var html = '(.*)';").expect("static regex"));
static TREE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"var treeUrl = "([^"]*)";"#).expect("static regex"));
static MESSAGE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"var messageUrl = "([^"]*)";"#).expect("static regex"));
static MESSAGE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"message_(.*)").expect("static regex"));

fn inline_scripts(doc: &Document) -> Vec<String> {
    doc.find_all(&Selector::tag("script"))
        .into_iter()
        .filter(|script| attr(script, "src").is_none())
        .map(|script| text_content(&script))
        .filter(|text| !text.is_empty())
        .collect()
}

fn capture<'a>(pattern: &Regex, text: &'a str) -> Option<&'a str> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str())
}

fn replace_div(doc: &Document, id: &str, nodes: Vec<Handle>) -> bool {
    match doc.find_first(&Selector::tag("div").with_id(id)) {
        Some(div) => {
            replace_with(&div, nodes);
            true
        }
        None => {
            warn!("fragment target div#{id} not found");
            false
        }
    }
}

/// Markup inside the `<contents>` element of a tab module response.
pub fn tab_contents(response: &str) -> Option<String> {
    let inner = capture(&TAB_CONTENTS, response)?.trim();
    match inner
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
    {
        Some(markup) => Some(markup.to_string()),
        None => Some(unescape_html(inner)),
    }
}

/// Load portal tab modules that the page would fetch via `tabAction`.
pub fn load_tabs<T: Transport>(transport: &mut T, base_url: &str, doc: &Document) -> Result<usize> {
    let full_url = format!("{base_url}{TAB_ACTION_PATH}");
    let mut loaded = 0usize;
    for script in inline_scripts(doc) {
        if !script.contains(TAB_ACTION_PATH) {
            continue;
        }
        let (Some(div_id), Some(parameters)) = (
            capture(&TAB_TARGET, &script),
            capture(&TAB_PARAMETERS, &script),
        ) else {
            warn!("tab loader script without target or parameters");
            continue;
        };
        let form = query_pairs(&parse_query(parameters));
        let response = transport.post_form(&full_url, &form)?.text()?;
        let Some(markup) = tab_contents(&response) else {
            warn!("tab module for div#{div_id} returned no <contents>");
            continue;
        };
        if replace_div(doc, div_id, parse_fragment_nodes(&markup)) {
            loaded += 1;
        }
    }
    debug!("loaded {loaded} tab modules");
    Ok(loaded)
}

/// Decode a single-quoted JavaScript string literal body.
pub fn unescape_js_string(source: &str) -> String {
    let mut output = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            output.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => output.push('\n'),
            Some('t') => output.push('\t'),
            Some('r') => output.push('\r'),
            Some('b') => output.push('\u{8}'),
            Some('f') => output.push('\u{c}'),
            Some('0') => output.push('\0'),
            Some('u') => push_code_unit(&mut output, &mut chars, 4),
            Some('x') => push_code_unit(&mut output, &mut chars, 2),
            Some(other) => output.push(other),
            None => output.push('\\'),
        }
    }
    output
}

fn push_code_unit<I>(output: &mut String, chars: &mut std::iter::Peekable<I>, digits: usize)
where
    I: Iterator<Item = char>,
{
    let mut hex = String::with_capacity(digits);
    for _ in 0..digits {
        match chars.peek() {
            Some(c) if c.is_ascii_hexdigit() => {
                hex.push(*c);
                chars.next();
            }
            _ => break,
        }
    }
    match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
        Some(decoded) if hex.len() == digits => output.push(decoded),
        _ => {
            output.push(if digits == 4 { 'u' } else { 'x' });
            output.push_str(&hex);
        }
    }
}

/// Inline the course information block that is normally injected by an
/// asynchronous script.
pub fn load_course_information<T: Transport>(
    transport: &mut T,
    base_url: &str,
    doc: &Document,
) -> Result<usize> {
    let mut loaded = 0usize;
    for script in doc.find_all(&Selector::tag("script").with_attr("src")) {
        let Some(src) = attr(&script, "src") else {
            continue;
        };
        if !src.contains(COURSE_INFORMATION_SCRIPT) {
            continue;
        }
        let source = transport.get(&absolute_url(base_url, &src))?.text()?;
        let Some(literal) = capture(&COURSE_INFORMATION_HTML, &source) else {
            warn!("course information script did not contain markup");
            continue;
        };
        let markup = unescape_js_string(literal);
        if replace_div(doc, "osirisCursusInformatie_contentDiv", parse_fragment_nodes(&markup)) {
            loaded += 1;
        }
    }
    Ok(loaded)
}

/// Expand the discussion board tree and fill every thread message.
pub fn load_discussion_board<T: Transport>(
    transport: &mut T,
    base_url: &str,
    doc: &Document,
) -> Result<usize> {
    let mut messages = 0usize;
    for script in inline_scripts(doc) {
        if !script.contains("treeUrl") {
            continue;
        }
        let Some(tree_path) = capture(&TREE_URL, &script) else {
            warn!("discussion board script without treeUrl");
            continue;
        };
        let tree = transport
            .get(&absolute_url(base_url, tree_path))?
            .text()?;
        replace_div(doc, "tree", parse_fragment_nodes(&tree));

        let Some(message_path) = capture(&MESSAGE_URL, &script) else {
            warn!("discussion board script without messageUrl");
            continue;
        };
        let mut message_url = QueryUrl::parse(&absolute_url(base_url, message_path));
        for div in doc.find_all(&Selector::tag("div").with_class("dbThreadMessage")) {
            let Some(message_id) = attr(&div, "id")
                .as_deref()
                .and_then(|id| capture(&MESSAGE_ID, id))
                .map(str::to_string)
            else {
                warn!("thread message without message_ id");
                continue;
            };
            message_url.set("message_id", &message_id);
            let message = transport.get(&message_url.to_url())?.text()?;
            clear_children(&div);
            for node in parse_fragment_nodes(&message) {
                append(&div, node);
            }
            remove_attr(&div, "style");
            messages += 1;
        }
    }
    Ok(messages)
}
