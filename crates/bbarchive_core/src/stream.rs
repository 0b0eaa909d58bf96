use std::fmt::Display;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Local, TimeZone};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::dom::{Handle, append, create_element, create_text, unescape_html};
use crate::session::Transport;

pub const STREAM_VIEWER_PATH: &str = "/webapps/streamViewer/streamViewer";
const AREA_MARKER: &str = "@@X@@AREA@@X@@";
const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamResponse {
    #[serde(rename = "sv_streamEntries", default)]
    pub entries: Vec<StreamEntry>,
    #[serde(rename = "sv_extras", default)]
    pub extras: StreamExtras,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamExtras {
    #[serde(rename = "sx_courses", default)]
    pub courses: Vec<StreamCourse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamCourse {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEntry {
    #[serde(rename = "se_id")]
    pub id: String,
    #[serde(rename = "se_rhs")]
    pub rhs: String,
    #[serde(rename = "se_timestamp", default)]
    pub timestamp: i64,
    #[serde(rename = "se_context", default)]
    pub context: String,
    #[serde(rename = "se_details", default)]
    pub details: String,
    #[serde(rename = "se_bottomContext", default)]
    pub bottom_context: String,
    #[serde(rename = "se_courseId", default)]
    pub course_id: Option<String>,
    #[serde(rename = "se_orgId", default)]
    pub org_id: Option<String>,
    #[serde(rename = "extraAttribs", default)]
    pub extra: ExtraAttribs,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtraAttribs {
    /// JSON document encoded as a string.
    #[serde(default)]
    pub grd_grade: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GradeInfo {
    #[serde(default)]
    pub grade_icon: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub grade: Option<Value>,
}

impl StreamEntry {
    pub fn area_id(&self) -> &str {
        self.course_id
            .as_deref()
            .or(self.org_id.as_deref())
            .unwrap_or_default()
    }

    pub fn grade(&self) -> Result<GradeInfo> {
        match &self.extra.grd_grade {
            Some(raw) => serde_json::from_str(raw)
                .with_context(|| format!("failed to parse grade of stream entry {}", self.id)),
            None => Ok(GradeInfo::default()),
        }
    }
}

impl GradeInfo {
    pub fn grade_text(&self) -> String {
        match &self.grade {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPolling {
    pub interval: Duration,
    pub limit: usize,
}

impl Default for StreamPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1_000),
            limit: 60,
        }
    }
}

/// Ask the stream viewer to build a stream and poll until it has entries.
pub fn load_stream_entries<T: Transport>(
    transport: &mut T,
    base_url: &str,
    stream_name: &str,
    polling: &StreamPolling,
) -> Result<StreamResponse> {
    let url = format!("{base_url}{STREAM_VIEWER_PATH}");
    let mut form = vec![
        ("cmd".to_string(), "loadStream".to_string()),
        ("streamName".to_string(), stream_name.to_string()),
        ("forOverview".to_string(), "False".to_string()),
    ];
    let mut response: StreamResponse = transport.post_form(&url, &form)?.json()?;
    form.push(("retrieveOnly".to_string(), "True".to_string()));

    let mut polls = 0usize;
    while response.entries.is_empty() {
        if polls >= polling.limit {
            bail!("stream {stream_name} returned no entries after {polls} polls");
        }
        sleep(polling.interval);
        polls += 1;
        debug!("polling stream {stream_name} ({polls}/{})", polling.limit);
        response = transport.post_form(&url, &form)?.json()?;
    }
    Ok(response)
}

/// Chronological when every entry has a timestamp, otherwise grouped by course.
pub fn sort_entries(entries: &mut [StreamEntry]) {
    if entries.iter().all(|entry| entry.timestamp >= 0) {
        entries.sort_by_key(|entry| entry.timestamp);
    } else {
        entries.sort_by(|left, right| left.area_id().cmp(right.area_id()));
    }
}

/// Gradebook icon path and the label suffix for a grade status.
pub fn grade_icon(icon: &str) -> Option<(&'static str, &'static str)> {
    match icon {
        "completed" => Some(("/images/ci/gradebook/grade_completed_large.png", " completed")),
        "needs_grading" => Some(("/images/ci/gradebook/needs_grading_large.png", " needs grading")),
        "in_progress" => Some((
            "/images/ci/gradebook/grading_in_progress_large.png",
            " in progress",
        )),
        "exempt" => Some(("/images/ci/gradebook/exempt_large.png", " exempt")),
        _ => None,
    }
}

/// Millisecond timestamp in local time; negative timestamps mean "no date".
pub fn format_timestamp(millis: i64) -> Option<String> {
    format_timestamp_in(millis, &Local)
}

fn format_timestamp_in<Tz>(millis: i64, zone: &Tz) -> Option<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if millis < 0 {
        return None;
    }
    zone.timestamp_millis_opt(millis)
        .single()
        .map(|moment| moment.format(TIMESTAMP_FORMAT).to_string())
}

pub fn course_name<'a>(courses: &'a [StreamCourse], id: &str) -> &'a str {
    courses
        .iter()
        .find(|course| course.id == id)
        .map(|course| course.name.as_str())
        .unwrap_or_default()
}

/// Local paths an entry links to, resolved by the caller.
#[derive(Debug, Clone, Default)]
pub struct EntryLinks {
    pub detail_path: String,
    pub icon_path: Option<String>,
}

pub fn build_entry_element(
    entry: &StreamEntry,
    grade: &GradeInfo,
    courses: &[StreamCourse],
    links: &EntryLinks,
) -> Handle {
    let item = create_element(
        "div",
        &[
            ("id", entry.id.as_str()),
            ("class", "stream_item"),
            ("bb:rhs", entry.rhs.as_str()),
            ("data-path", links.detail_path.as_str()),
            ("onclick", "clickGrade(event);"),
            ("aria_controls", "right_stream_mygrades"),
            ("role", "tab"),
            ("aria_selected", "false"),
            ("tabindex", "-1"),
        ],
    );

    let wrapper = create_element("div", &[("class", "grade-value-wrapper u_floatThis-left")]);
    let value = create_element("div", &[("class", "grade-value"), ("tabindex", "0")]);
    let icon = grade.grade_icon.as_deref().and_then(grade_icon);
    match (icon, links.icon_path.as_deref()) {
        (Some((_, suffix)), Some(icon_path)) => {
            let label = format!("{}{suffix}", grade.name);
            append(
                &value,
                create_element(
                    "img",
                    &[
                        ("src", icon_path),
                        ("class", "largeIcon"),
                        ("alt", label.as_str()),
                        ("title", label.as_str()),
                        ("border", "0"),
                    ],
                ),
            );
        }
        _ => append(&value, create_text(&grade.grade_text())),
    }
    append(&wrapper, value);
    append(&item, wrapper);

    let datestamp = create_element("span", &[("class", "stream_datestamp")]);
    if let Some(formatted) = format_timestamp(entry.timestamp) {
        append(&datestamp, create_text(&formatted));
    }
    append(&item, datestamp);

    append(&item, text_div("stream_context", &unescape_html(&entry.context)));
    append(&item, text_div("stream_details", &entry.details));

    let bottom = text_div(
        "stream_context_bottom",
        &entry.bottom_context.replace(AREA_MARKER, ""),
    );
    let area = create_element("span", &[("class", "stream_area_name")]);
    append(&area, create_text(course_name(courses, entry.area_id())));
    append(&bottom, area);
    append(&item, bottom);
    item
}

fn text_div(class: &str, text: &str) -> Handle {
    let div = create_element("div", &[("class", class)]);
    if !text.is_empty() {
        append(&div, create_text(text));
    }
    div
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::dom::outer_html;
    use crate::session::mock::{MockResponse, MockTransport};

    const BASE: &str = "https://bb.example.edu";

    const RESPONSE: &str = r#"{
  "sv_streamEntries": [
    {
      "se_id": "mygrades:_5_1",
      "se_rhs": "/webapps/bb-mygrades-bb_bb60/myGrades?course_id=_5_1",
      "se_timestamp": 1600000000000,
      "se_context": "Calculus &amp; Algebra",
      "se_details": "Final exam",
      "se_bottomContext": "@@X@@AREA@@X@@",
      "se_courseId": "_5_1",
      "extraAttribs": {"grd_grade": "{\"grade\": \"7.5\", \"name\": \"Exam\"}"}
    },
    {
      "se_id": "mygrades:_6_1",
      "se_rhs": "/webapps/bb-mygrades-bb_bb60/myGrades?course_id=_6_1",
      "se_timestamp": 1500000000000,
      "se_orgId": "_6_1",
      "extraAttribs": {"grd_grade": "{\"grade_icon\": \"needs_grading\", \"name\": \"Essay\"}"}
    }
  ],
  "sv_extras": {"sx_courses": [{"id": "_5_1", "name": "Calculus"}, {"id": "_6_1", "name": "Study Association"}]}
}"#;

    fn polling() -> StreamPolling {
        StreamPolling {
            interval: Duration::ZERO,
            limit: 3,
        }
    }

    #[test]
    fn polls_until_entries_arrive() {
        let url = format!("{BASE}{STREAM_VIEWER_PATH}");
        let mut transport = MockTransport::default();
        transport
            .route(&url, MockResponse::with_type("application/json", br#"{"sv_streamEntries": []}"#))
            .route(&url, MockResponse::with_type("application/json", RESPONSE.as_bytes()));

        let response = load_stream_entries(&mut transport, BASE, "mygrades", &polling()).expect("stream");
        assert_eq!(response.entries.len(), 2);
        assert_eq!(response.extras.courses.len(), 2);

        assert_eq!(transport.requests.len(), 2);
        let first = &transport.requests[0].form;
        assert!(first.contains(&("cmd".to_string(), "loadStream".to_string())));
        assert!(first.contains(&("forOverview".to_string(), "False".to_string())));
        assert!(!first.iter().any(|(key, _)| key == "retrieveOnly"));
        let second = &transport.requests[1].form;
        assert!(second.contains(&("retrieveOnly".to_string(), "True".to_string())));
    }

    #[test]
    fn polling_gives_up_after_limit() {
        let mut transport = MockTransport::default();
        transport.route(
            &format!("{BASE}{STREAM_VIEWER_PATH}"),
            MockResponse::with_type("application/json", br#"{"sv_streamEntries": []}"#),
        );
        let error = load_stream_entries(&mut transport, BASE, "mygrades_d", &polling())
            .expect_err("empty stream");
        assert!(error.to_string().contains("after 3 polls"));
        assert_eq!(transport.requests.len(), 4);
    }

    #[test]
    fn entries_sort_by_time_or_by_course() {
        let mut response: StreamResponse = serde_json::from_str(RESPONSE).expect("json");
        sort_entries(&mut response.entries);
        assert_eq!(response.entries[0].id, "mygrades:_6_1");

        response.entries[0].timestamp = -1;
        sort_entries(&mut response.entries);
        assert_eq!(response.entries[0].area_id(), "_5_1");
        assert_eq!(response.entries[1].area_id(), "_6_1");
    }

    #[test]
    fn timestamps_format_like_the_portal() {
        assert_eq!(
            format_timestamp_in(0, &Utc),
            Some("Thu, 01 Jan 1970 00:00:00".to_string())
        );
        assert_eq!(
            format_timestamp_in(1_600_000_000_000, &Utc),
            Some("Sun, 13 Sep 2020 12:26:40".to_string())
        );
        assert_eq!(format_timestamp(-1), None);
        assert!(format_timestamp(0).is_some());
    }

    #[test]
    fn entry_with_plain_grade() {
        let response: StreamResponse = serde_json::from_str(RESPONSE).expect("json");
        let entry = &response.entries[0];
        let grade = entry.grade().expect("grade");
        assert_eq!(grade.grade_text(), "7.5");

        let links = EntryLinks {
            detail_path: "Calculus - My Grades.html".to_string(),
            icon_path: None,
        };
        let html = outer_html(&build_entry_element(entry, &grade, &response.extras.courses, &links))
            .expect("serialize");
        assert!(html.starts_with(r#"<div id="mygrades:_5_1" class="stream_item""#));
        assert!(html.contains(r#"data-path="Calculus - My Grades.html""#));
        assert!(html.contains(r#"<div class="grade-value" tabindex="0">7.5</div>"#));
        assert!(html.contains(r#"<div class="stream_context">Calculus &amp; Algebra</div>"#));
        assert!(html.contains(r#"<div class="stream_details">Final exam</div>"#));
        assert!(html.contains(
            r#"<div class="stream_context_bottom"><span class="stream_area_name">Calculus</span></div>"#
        ));
    }

    #[test]
    fn entry_with_status_icon() {
        let response: StreamResponse = serde_json::from_str(RESPONSE).expect("json");
        let entry = &response.entries[1];
        let grade = entry.grade().expect("grade");
        assert_eq!(
            grade_icon("needs_grading"),
            Some(("/images/ci/gradebook/needs_grading_large.png", " needs grading"))
        );

        let links = EntryLinks {
            detail_path: "x.html".to_string(),
            icon_path: Some("images/ci/gradebook/needs_grading_large.png".to_string()),
        };
        let html = outer_html(&build_entry_element(entry, &grade, &response.extras.courses, &links))
            .expect("serialize");
        assert!(html.contains(r#"alt="Essay needs grading""#));
        assert!(html.contains(r#"class="largeIcon""#));
        assert!(html.contains("Study Association"));
    }
}
