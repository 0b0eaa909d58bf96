use std::collections::BTreeMap;
use std::sync::LazyLock;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use regex::Regex;
use sha2::{Digest, Sha256};

/// Pages written by the overview pass; links to them are never fetched.
pub const SEEDED_PAGES: [&str; 3] = ["Courses.html", "Organisations.html", "Grades.html"];

/// Longest file or directory name most filesystems accept, in bytes.
pub const MAX_SEGMENT_BYTES: usize = 255;

const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

const NON_LOCAL_PREFIXES: [&str; 8] = [
    "#",
    "%",
    "mailto:",
    "ftp:",
    "data:",
    "javascript:",
    "http:",
    "https:",
];

static ATTEMPT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"attempt_id=_(.*?)_1").expect("static regex"));
static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"fileName=([^&]*)").expect("static regex"));

pub fn strip_base_url<'a>(base_url: &str, url: &'a str) -> &'a str {
    url.strip_prefix(base_url).unwrap_or(url)
}

pub fn is_local_url(base_url: &str, url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    if lowered.starts_with(&base_url.to_ascii_lowercase()) {
        return true;
    }
    lowered != "none" && !NON_LOCAL_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix))
}

pub fn absolute_url(base_url: &str, url: &str) -> String {
    let lowered = url.to_ascii_lowercase();
    if lowered.starts_with("http:") || lowered.starts_with("https:") {
        url.to_string()
    } else if url.starts_with('/') {
        format!("{base_url}{url}")
    } else {
        format!("{base_url}/{url}")
    }
}

/// Strip the base URL and split off the fragment; URLs with a query are sanitized.
pub fn split_url(base_url: &str, url: &str) -> (String, String) {
    let url = strip_base_url(base_url, url);
    let (url, fragment) = match url.find('#') {
        Some(index) if index > 0 => (&url[..index], &url[index..]),
        _ => (url, ""),
    };
    let url = if url.contains('?') {
        sanitize_url_params(url)
    } else {
        url.to_string()
    };
    (url, fragment.to_string())
}

/// Normalize the query so equivalent portal URLs share one memo key.
pub fn sanitize_url_params(url: &str) -> String {
    let mut parsed = QueryUrl::parse(url);
    parsed.params.remove("toggle_mode");
    if parsed
        .params
        .get("mode")
        .and_then(|values| values.first())
        .is_some_and(|mode| matches!(mode.as_str(), "reset" | "view" | "cpview"))
    {
        parsed.params.remove("mode");
    }
    if let Some(values) = parsed.params.get_mut("nav")
        && let Some(index) = values
            .iter()
            .position(|value| value == "discussion_board_entry")
    {
        values.remove(index);
        values.push("discussion_board".to_string());
    }
    parsed.to_url()
}

/// URL split into the part before the query, the decoded parameters and the fragment.
///
/// Parameters without `=` or with an empty value are dropped, and keys come
/// back sorted when the URL is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryUrl {
    pub head: String,
    pub params: BTreeMap<String, Vec<String>>,
    pub fragment: String,
}

impl QueryUrl {
    pub fn parse(url: &str) -> Self {
        let (rest, fragment) = match url.find('#') {
            Some(index) => (&url[..index], &url[index..]),
            None => (url, ""),
        };
        let (head, query) = match rest.find('?') {
            Some(index) => (&rest[..index], &rest[index + 1..]),
            None => (rest, ""),
        };
        Self {
            head: head.to_string(),
            params: parse_query(query),
            fragment: fragment.to_string(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.params
            .insert(key.to_string(), vec![value.to_string()]);
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn to_url(&self) -> String {
        let query = encode_query(&self.params);
        let mut url = self.head.clone();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        url.push_str(&self.fragment);
        url
    }
}

pub fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        params
            .entry(decode_query_component(key))
            .or_default()
            .push(decode_query_component(value));
    }
    params
}

pub fn query_pairs(params: &BTreeMap<String, Vec<String>>) -> Vec<(String, String)> {
    params
        .iter()
        .flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.clone(), value.clone()))
        })
        .collect()
}

fn encode_query(params: &BTreeMap<String, Vec<String>>) -> String {
    query_pairs(params)
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(key, QUERY_VALUE),
                utf8_percent_encode(value, QUERY_VALUE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn decode_query_component(value: &str) -> String {
    percent_decode_str(&value.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

pub fn url_dir(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    posix_dirname(path)
}

fn posix_dirname(path: &str) -> String {
    let head = match path.rfind('/') {
        Some(index) => &path[..=index],
        None => "",
    };
    if !head.is_empty() && head.chars().any(|c| c != '/') {
        head.trim_end_matches('/').to_string()
    } else {
        head.to_string()
    }
}

pub fn join_url_path(dir: &str, url: &str) -> String {
    let (path, suffix) = match url.find(['?', '#']) {
        Some(index) => (&url[..index], &url[index..]),
        None => (url, ""),
    };
    let joined = if path.starts_with('/') || dir.is_empty() {
        path.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{path}")
    } else {
        format!("{dir}/{path}")
    };
    format!("{}{}", normalize_path(&joined), suffix)
}

pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Relative path from directory `start` to `path`, both rooted at the website root.
///
/// A leading `..` segment (files stored next to the website directory) is kept
/// as a real parent step.
pub fn relative_path(path: &str, start: &str) -> String {
    let target: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    let base: Vec<&str> = start
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(left, right)| left == right)
        .count();
    let mut parts: Vec<&str> = vec![".."; base.len() - common];
    parts.extend_from_slice(&target[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Map a sanitized portal URL to a local path.
///
/// Paths starting with `/../` live in `folder` next to the website directory;
/// every other path is relative to the website root.
pub fn url_to_path(url: &str, content_type: Option<&str>, folder: &str) -> String {
    let path = if url.contains("/webapps/assignment/download") {
        let file_name = FILE_NAME
            .captures(url)
            .and_then(|captures| captures.get(1))
            .map(|value| value.as_str().to_string())
            .unwrap_or_else(|| basename(url.split('?').next().unwrap_or(url)).to_string());
        match ATTEMPT_ID
            .captures(url)
            .and_then(|captures| captures.get(1))
        {
            Some(attempt) => format!("/../{folder}/{} - {file_name}", attempt.as_str()),
            None => format!("/../{folder}/{file_name}"),
        }
    } else {
        let path = url.split(['#', '?']).next().unwrap_or_default();
        if path.contains("bbcswebdav") && path.contains("dt-content-rid") {
            format!("/../{folder}/{}", basename(path))
        } else {
            path.to_string()
        }
    };

    let mut path = percent_decode_str(&path).decode_utf8_lossy().into_owned();
    if let Some(extension) = content_type.and_then(image_extension) {
        let lowered = path.to_ascii_lowercase();
        let present = if extension == ".jpg" {
            lowered.ends_with(".jpg") || lowered.ends_with(".jpeg")
        } else {
            lowered.ends_with(extension)
        };
        if !present {
            path.push_str(extension);
        }
    }
    shorten_long_segments(&path)
}

fn image_extension(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "image/svg+xml" => Some(".svg"),
        "image/png" => Some(".png"),
        "image/jpeg" => Some(".jpg"),
        "image/gif" => Some(".gif"),
        _ => None,
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn shorten_long_segments(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.len() <= MAX_SEGMENT_BYTES {
                segment.to_string()
            } else {
                shorten_segment(segment)
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Truncate a name to fit [`MAX_SEGMENT_BYTES`], keeping its extension and
/// appending a digest of the full name so distinct names stay distinct.
fn shorten_segment(segment: &str) -> String {
    let digest = Sha256::digest(segment.as_bytes());
    let tag: String = digest.iter().take(4).map(|byte| format!("{byte:02x}")).collect();
    let extension = match segment.rfind('.') {
        Some(index) if segment.len() - index <= 16 => &segment[index..],
        _ => "",
    };
    let budget = MAX_SEGMENT_BYTES - extension.len() - tag.len() - 1;
    let stem = &segment[..segment.len() - extension.len()];
    let cut = floor_char_boundary(stem, budget);
    format!("{}~{tag}{extension}", &stem[..cut])
}

pub(crate) fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut cut = index;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

/// Remove characters that are illegal in file names; folder names also lose dots.
pub fn clean_path_component(value: &str, strip_dots: bool) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !(strip_dots && *c == '.'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://blackboard.utwente.nl";

    #[test]
    fn local_url_detection() {
        assert!(is_local_url(BASE, "https://blackboard.utwente.nl/webapps/x"));
        assert!(is_local_url(BASE, "/webapps/x"));
        assert!(is_local_url(BASE, "page.jsp"));
        for url in [
            "None", "#top", "%20", "mailto:a@b", "FTP:host", "data:image/png;base64,x",
            "javascript:void(0)", "http://other.org", "https://other.org",
        ] {
            assert!(!is_local_url(BASE, url), "{url}");
        }
    }

    #[test]
    fn split_url_strips_base_and_keeps_fragment() {
        assert_eq!(
            split_url(BASE, "https://blackboard.utwente.nl/a/b.html#top"),
            ("/a/b.html".to_string(), "#top".to_string())
        );
        assert_eq!(split_url(BASE, "#only"), ("#only".to_string(), String::new()));
    }

    #[test]
    fn sanitize_drops_view_state_and_sorts_keys() {
        assert_eq!(
            sanitize_url_params(
                "/webapps/x?mode=reset&course_id=_5_1&toggle_mode=edit&content_id=&b=a/b c"
            ),
            "/webapps/x?b=a/b%20c&course_id=_5_1"
        );
        assert_eq!(
            sanitize_url_params("/webapps/x?mode=quick&nav=discussion_board_entry"),
            "/webapps/x?mode=quick&nav=discussion_board"
        );
        assert_eq!(sanitize_url_params("/webapps/x?mode=view"), "/webapps/x");
    }

    #[test]
    fn query_url_updates_parameters() {
        let mut url = QueryUrl::parse("https://h/m?conf_id=_1_1&message_id=old#frag");
        url.set("message_id", "_9_1");
        assert_eq!(url.first("conf_id"), Some("_1_1"));
        assert_eq!(url.to_url(), "https://h/m?conf_id=_1_1&message_id=_9_1#frag");
    }

    #[test]
    fn path_helpers_follow_posix_rules() {
        assert_eq!(url_dir("/webapps/portal/execute/tabs/tabAction?x=/y"), "/webapps/portal/execute/tabs");
        assert_eq!(url_dir("/page"), "/");
        assert_eq!(url_dir("page"), "");
        assert_eq!(join_url_path("/a/b", "../c/./d.png?v=1"), "/a/c/d.png?v=1");
        assert_eq!(join_url_path("/a", "/abs.css"), "/abs.css");
        assert_eq!(normalize_path("/../x"), "/x");
        assert_eq!(relative_path("/images/x.png", "/css/theme"), "../../images/x.png");
        assert_eq!(relative_path("/../Course/a.png", "/css"), "../../Course/a.png");
        assert_eq!(relative_path("/style/a.png", "/"), "style/a.png");
    }

    #[test]
    fn url_to_path_handles_downloads_and_content_types() {
        assert_eq!(
            url_to_path(
                "/webapps/assignment/download?course_id=_1_1&attempt_id=_42_1&fileName=Report%20v2.pdf",
                Some("application/pdf"),
                "Course/Assignments"
            ),
            "/../Course/Assignments/42 - Report v2.pdf"
        );
        assert_eq!(
            url_to_path("/bbcswebdav/pid-1-dt-content-rid-2_1/xid-2_1?x=1", None, "Files"),
            "/../Files/xid-2_1"
        );
        assert_eq!(url_to_path("/images/logo", Some("image/png"), "Files"), "/images/logo.png");
        assert_eq!(url_to_path("/images/photo.JPEG", Some("image/jpeg"), "Files"), "/images/photo.JPEG");
        assert_eq!(url_to_path("/images/photo", Some("image/jpeg; q=1"), "Files"), "/images/photo.jpg");
        assert_eq!(url_to_path("/a%20b/c.css#x", Some("text/css"), "Files"), "/a b/c.css");
    }

    #[test]
    fn long_segments_are_shortened_deterministically() {
        let long = format!("/dir/{}.pdf", "é".repeat(200));
        let first = url_to_path(&long, None, "Files");
        let second = url_to_path(&long, None, "Files");
        assert_eq!(first, second);
        let name = first.rsplit('/').next().expect("name");
        assert!(name.len() <= MAX_SEGMENT_BYTES);
        assert!(name.ends_with(".pdf"));
        assert!(first.starts_with("/dir/"));
    }

    #[test]
    fn clean_path_component_removes_illegal_characters() {
        assert_eq!(clean_path_component(r#"a<b>:c"d/e\f|g?h*i.j"#, false), "abcdefghi.j");
        assert_eq!(clean_path_component("Week 1. Intro", true), "Week 1 Intro");
    }
}
