use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use crate::archive::{Archiver, write_text};
use crate::dom::{
    Document, Handle, Selector, append, create_element, create_text, detach, find_all,
    set_attr, set_text,
};
use crate::fragments::TAB_ACTION_PATH;
use crate::scripts::{add_click_grade_script, add_window_height_script};
use crate::session::Transport;
use crate::stream::{
    EntryLinks, STREAM_VIEWER_PATH, build_entry_element, grade_icon, load_stream_entries,
    sort_entries,
};

pub const CDN_IMAGES: [&str; 1] = ["/images/ci/mybb/x_btn.png"];
pub const GRADES_PAGE_PATH: &str =
    "/webapps/bb-social-learning-bb_bb60/execute/mybb?cmd=display&toolId=MyGradesOnMyBb_____MyGradesTool";
pub const STREAM_PAGE_PATH: &str =
    "/webapps/streamViewer/streamViewer?cmd=view&streamName=mygrades&globalNavigation=false";
pub const INDEX_CONTENT: &str = r#"<meta http-equiv="Refresh" content="0; url=website/Courses.html"/>"#;
const OVERVIEW_STYLE: &str = "#column0{width: 100%;}";

/// Which parts of the portal a full mirror visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorOptions {
    pub courses: bool,
    pub organisations: bool,
    pub grades: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            courses: true,
            organisations: true,
            grades: true,
        }
    }
}

impl<T: Transport> Archiver<T> {
    /// Mirror every selected overview page and everything reachable from it.
    pub fn archive_all(&mut self, options: &MirrorOptions) -> Result<()> {
        for image in CDN_IMAGES {
            self.download_local_file(image)?;
        }
        if options.courses {
            self.archive_overview_page("Courses", "_2_1")?;
        }
        if options.organisations {
            self.archive_overview_page("Organisations", "_3_1")?;
        }
        if options.grades {
            self.archive_grades()?;
        }
        self.write_index_page()?;
        Ok(())
    }

    /// Archive a single entry URL, such as a course home page.
    pub fn archive_course(&mut self, url: &str) -> Result<String> {
        info!("archiving {url}");
        self.download_local_file(url)
    }

    pub fn archive_overview_page(&mut self, name: &str, tab_group_id: &str) -> Result<PathBuf> {
        info!("Retrieving {name} page");
        let (doc, page_dir) =
            self.fetch_page(&format!("{TAB_ACTION_PATH}?tab_tab_group_id={tab_group_id}"))?;
        match doc.find_first(&Selector::tag("div").with_id("column1")) {
            Some(column) => detach(&column),
            None => warn!("{name} page has no second column"),
        }
        self.process_page(&doc, &page_dir)?;
        let style = doc
            .find_first(&Selector::tag("div").with_id("content"))
            .and_then(|content| find_all(&content, &Selector::tag("style")).into_iter().next());
        match style {
            Some(style) => set_text(&style, OVERVIEW_STYLE),
            None => warn!("{name} page has no content stylesheet"),
        }
        let path = self.write_website_page(name, &doc)?;
        info!("Stored {name} page");
        Ok(path)
    }

    pub fn archive_grades(&mut self) -> Result<()> {
        self.archive_grades_page("Grades", "mygrades")?;
        self.archive_grades_page("Grades individual", "mygrades_d")
    }

    fn archive_grades_page(&mut self, name: &str, stream_name: &str) -> Result<()> {
        info!("Retrieving {name} page");
        let (doc, page_dir) = self.fetch_page(GRADES_PAGE_PATH)?;
        self.process_page(&doc, &page_dir)?;

        set_attr_by_id(&doc, "Support", "class", "active");
        set_attr_by_id(&doc, "iframe_wrap", "style", "left: 0px;");
        add_window_height_script(&doc, "mybbCanvas");
        let inner_name = format!("{name} inner");
        set_attr_by_id(&doc, "mybbCanvas", "src", &format!("{inner_name}.html"));
        self.write_website_page(name, &doc)?;

        self.archive_grades_inner(&inner_name, stream_name)
    }

    fn archive_grades_inner(&mut self, name: &str, stream_name: &str) -> Result<()> {
        let (doc, page_dir) = self.fetch_page(STREAM_PAGE_PATH)?;
        self.process_page(&doc, &page_dir)?;
        add_window_height_script(&doc, "right_stream_mygrades");

        match doc.find_by_id("filter_by_mygrades") {
            Some(filters) => {
                append(&filters, grade_filter("Courses", "Grades", name == "Grades inner"));
                append(
                    &filters,
                    grade_filter(
                        "Individual grades",
                        "Grades individual",
                        name == "Grades individual inner",
                    ),
                );
            }
            None => warn!("{name} page has no grade filter list"),
        }
        add_click_grade_script(&doc);

        let empty = format!("{STREAM_VIEWER_PATH}?cmd=emptyRhs");
        let rhs = self.local_reference(&empty, &empty);
        set_attr_by_id(&doc, "right_stream_mygrades", "src", &rhs);

        let base_url = self.base_url().to_string();
        let polling = self.polling();
        let mut stream = load_stream_entries(self.transport_mut(), &base_url, stream_name, &polling)?;
        sort_entries(&mut stream.entries);

        let Some(grade_list) = doc.find_by_id("left_stream_mygrades") else {
            warn!("{name} page has no grade list");
            self.write_website_page(name, &doc)?;
            return Ok(());
        };
        for entry in &stream.entries {
            let grade = match entry.grade() {
                Ok(grade) => grade,
                Err(error) => {
                    warn!("skipping stream entry: {error:#}");
                    continue;
                }
            };
            let detail_path = self.local_reference(&entry.rhs, &entry.rhs);
            let icon_path = grade
                .grade_icon
                .as_deref()
                .and_then(grade_icon)
                .map(|(icon, _)| self.local_reference(icon, icon));
            let links = EntryLinks {
                detail_path,
                icon_path,
            };
            append(
                &grade_list,
                build_entry_element(entry, &grade, &stream.extras.courses, &links),
            );
        }
        info!("{name}: {} grade entries", stream.entries.len());
        self.write_website_page(name, &doc)?;
        Ok(())
    }

    pub fn write_index_page(&self) -> Result<()> {
        info!("Creating index page");
        write_text(self.index_path(), INDEX_CONTENT)
    }
}

fn set_attr_by_id(doc: &Document, id: &str, name: &str, value: &str) {
    match doc.find_by_id(id) {
        Some(element) => set_attr(&element, name, value),
        None => warn!("page has no #{id}"),
    }
}

fn grade_filter(label: &str, page: &str, active: bool) -> Handle {
    let item = create_element("li", &[("class", "stream_filterlinks")]);
    let href = format!("{page}.html");
    let link = create_element("a", &[("href", href.as_str()), ("target", "_top")]);
    if active {
        set_attr(&link, "class", "active");
    }
    append(&link, create_text(label));
    append(&item, link);
    item
}
