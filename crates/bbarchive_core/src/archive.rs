use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::checksum::ChecksumManifest;
use crate::cleanup::{cleanup_page, replace_navbar, replace_redirects};
use crate::css::rewrite_css_urls;
use crate::dom::{Document, Selector, attr, set_attr, set_text, stripped_strings, text_content};
use crate::fragments::{load_course_information, load_discussion_board, load_tabs};
use crate::runtime::ResolvedPaths;
use crate::scripts::{add_select_target_script, filter_scripts, rewrite_download_urls};
use crate::session::{FetchedResponse, Transport};
use crate::stream::StreamPolling;
use crate::urls::{
    MAX_SEGMENT_BYTES, SEEDED_PAGES, absolute_url, clean_path_component, floor_char_boundary,
    is_local_url, join_url_path, relative_path, split_url, strip_base_url, url_dir,
    url_to_path,
};

/// Folder for course files found outside any breadcrumb.
pub const DEFAULT_FOLDER: &str = "Files";
pub const NOT_FOUND_PAGE: &str = "/404.html";
const EDIT_MODE_MARKER: &str = "listContentEditable.jsp";
const HEADER_ID: &str = "streamDetailHeaderRightClickable";

static LOAD_CONTENT_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"loadContentFrame\('(.*)'\)").expect("static regex"));
static INLINE_VIEW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"gradeAssignment\.inlineView(?:GroupFile)?\(.*?, *'(.*?)', *'(.*?)' *\)")
        .expect("static regex")
});
static COURSE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"var *courseId *= *'(.*?)'").expect("static regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub pages: usize,
    pub files: usize,
    pub stylesheets: usize,
    pub bytes: u64,
    pub reused: usize,
    pub not_found: usize,
    pub failed: usize,
    pub request_count: usize,
}

pub struct Archiver<T: Transport> {
    transport: T,
    base_url: String,
    download_dir: PathBuf,
    website_dir: PathBuf,
    index_path: PathBuf,
    /// Sanitized URL (base stripped) to local path with a leading `/`.
    memo: HashMap<String, String>,
    /// Local page path to the digest of its cleaned markup.
    fingerprints: HashMap<String, String>,
    navigation: Vec<String>,
    checksums: Option<ChecksumManifest>,
    polling: StreamPolling,
    report: ArchiveReport,
}

impl<T: Transport> Archiver<T> {
    pub fn new(transport: T, base_url: &str, paths: &ResolvedPaths) -> Self {
        let memo = SEEDED_PAGES
            .iter()
            .map(|page| (page.to_string(), format!("/{page}")))
            .collect();
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            download_dir: paths.download_dir.clone(),
            website_dir: paths.website_dir.clone(),
            index_path: paths.index_path.clone(),
            memo,
            fingerprints: HashMap::new(),
            navigation: Vec::new(),
            checksums: None,
            polling: StreamPolling::default(),
            report: ArchiveReport::default(),
        }
    }

    pub fn with_checksums(mut self, manifest: ChecksumManifest) -> Self {
        self.checksums = Some(manifest);
        self
    }

    pub fn with_stream_polling(mut self, polling: StreamPolling) -> Self {
        self.polling = polling;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn report(&self) -> ArchiveReport {
        ArchiveReport {
            request_count: self.transport.request_count(),
            ..self.report.clone()
        }
    }

    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub(crate) fn polling(&self) -> StreamPolling {
        self.polling
    }

    pub(crate) fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Where a local path lives on disk: `/../x` under the download
    /// directory, everything else under the website directory.
    pub fn full_path(&self, local_path: &str) -> PathBuf {
        let (mut path, rest) = match local_path.strip_prefix("/../") {
            Some(rest) => (self.download_dir.clone(), rest),
            None => (self.website_dir.clone(), local_path.trim_start_matches('/')),
        };
        for segment in rest.split('/') {
            if matches!(segment, "" | "." | "..") {
                continue;
            }
            path.push(segment);
        }
        path
    }

    fn current_folder(&self) -> String {
        self.navigation
            .last()
            .cloned()
            .unwrap_or_else(|| DEFAULT_FOLDER.to_string())
    }

    fn remember(&mut self, local_path: &str, url: &str, redirects: &[String]) {
        self.memo.insert(url.to_string(), local_path.to_string());
        for redirect in redirects {
            self.memo.insert(redirect.clone(), local_path.to_string());
        }
    }

    /// Undo `remember` for a download that did not finish.
    fn forget(&mut self, url: &str, redirects: &[String]) {
        self.memo.remove(url);
        for redirect in redirects {
            self.memo.remove(redirect);
        }
    }

    /// Archive `full_url` (and everything it links to) and return its local
    /// path with a leading `/`, followed by the URL fragment if any.
    pub fn download_local_file(&mut self, full_url: &str) -> Result<String> {
        let (url, fragment) = split_url(&self.base_url, full_url);
        if let Some(path) = self.memo.get(&url) {
            self.report.reused += 1;
            return Ok(format!("{path}{fragment}"));
        }

        let folder = self.current_folder();
        let local_path = url_to_path(&url, None, &folder);
        if self.full_path(&local_path).is_file() {
            self.remember(&local_path, &url, &[]);
            self.report.reused += 1;
            return Ok(format!("{local_path}{fragment}"));
        }

        let response = self.transport.get(&absolute_url(&self.base_url, &url))?;
        let (final_url, final_fragment) = split_url(&self.base_url, &response.url);
        let fragment = if final_fragment.is_empty() {
            fragment
        } else {
            final_fragment
        };
        let mut redirects: Vec<String> = response
            .redirects
            .iter()
            .map(|redirect| split_url(&self.base_url, redirect).0)
            .collect();
        redirects.push(url);

        let known = self
            .memo
            .get(&final_url)
            .or_else(|| redirects.iter().find_map(|redirect| self.memo.get(redirect)))
            .cloned();
        if let Some(path) = known {
            self.remember(&path, &final_url, &redirects);
            self.report.reused += 1;
            return Ok(format!("{path}{fragment}"));
        }

        let not_found = response.status == 404;
        let mut local_path = if not_found {
            NOT_FOUND_PAGE.to_string()
        } else {
            url_to_path(&final_url, Some(&response.content_type), &folder)
        };
        if self.full_path(&local_path).is_file() {
            self.remember(&local_path, &final_url, &redirects);
            self.report.reused += 1;
            return Ok(format!("{local_path}{fragment}"));
        }

        if response.content_type.contains("html") {
            let text = response.text()?;
            if !not_found {
                let (path, exists) = self.title_path(&text)?;
                if exists {
                    debug!("duplicate page {path} for {final_url}");
                    self.remember(&path, &final_url, &redirects);
                    self.report.reused += 1;
                    return Ok(format!("{path}{fragment}"));
                }
                local_path = path;
            }
            info!("Retrieving: {local_path}");
            self.remember(&local_path, &final_url, &redirects);
            let doc = Document::parse(&text);
            if let Err(error) = self.store_page(&doc, &local_path, &url_dir(&final_url)) {
                self.forget(&final_url, &redirects);
                if !not_found {
                    self.fingerprints.remove(&local_path);
                }
                return Err(error);
            }
            if not_found {
                self.report.not_found += 1;
            }
        } else {
            info!("Retrieving: {local_path}");
            self.remember(&local_path, &final_url, &redirects);
            let full_path = self.full_path(&local_path);
            if let Err(error) = self.store_file(response, &full_path, &final_url, &local_path) {
                self.forget(&final_url, &redirects);
                if full_path.is_file() {
                    let _ = fs::remove_file(&full_path);
                }
                return Err(error);
            }
        }
        Ok(format!("{local_path}{fragment}"))
    }

    fn store_file(
        &mut self,
        response: FetchedResponse,
        full_path: &Path,
        final_url: &str,
        local_path: &str,
    ) -> Result<()> {
        create_parent(full_path)?;
        if has_css_extension(full_path) {
            let css = response.text()?;
            let rewritten = self.replace_css_urls(&css, &url_dir(final_url), &url_dir(local_path))?;
            fs::write(full_path, rewritten)
                .with_context(|| format!("failed to write {}", full_path.display()))?;
            self.report.stylesheets += 1;
            return Ok(());
        }
        let file = File::create(full_path)
            .with_context(|| format!("failed to create {}", full_path.display()))?;
        let mut writer = BufWriter::new(file);
        let bytes = response.copy_to(&mut writer)?;
        writer
            .flush()
            .with_context(|| format!("failed to write {}", full_path.display()))?;
        self.report.files += 1;
        self.report.bytes += bytes;
        if let Some(manifest) = &self.checksums {
            manifest.record(full_path)?;
        }
        Ok(())
    }

    fn store_page(&mut self, doc: &Document, local_path: &str, page_dir: &str) -> Result<()> {
        let breadcrumb = doc.find_first(&breadcrumb_selector()).map(|nav| {
            stripped_strings(&nav)
                .iter()
                .map(|part| clean_path_component(part, true))
                .collect::<Vec<_>>()
                .join("/")
        });
        let pushed = breadcrumb.is_some();
        if let Some(folder) = breadcrumb {
            self.navigation.push(folder);
        }
        let processed = self.process_page(doc, page_dir);
        if pushed {
            self.navigation.pop();
        }
        processed?;

        let full_path = self.full_path(local_path);
        write_text(&full_path, &doc.to_html()?)?;
        self.report.pages += 1;
        Ok(())
    }

    fn title_path(&mut self, html: &str) -> Result<(String, bool)> {
        let doc = Document::parse(html);
        let title = page_title(&doc);
        filter_scripts(&doc, |line| Ok(line.to_string()))?;
        cleanup_page(&doc);
        let fingerprint = fingerprint(&doc.to_html()?);

        let mut counter = 0usize;
        loop {
            let suffix = if counter == 0 {
                ".html".to_string()
            } else {
                format!(" ({counter}).html")
            };
            let budget = MAX_SEGMENT_BYTES - 1 - suffix.len();
            let stem = &title[..floor_char_boundary(&title, budget)];
            let path = format!("/{stem}{suffix}");
            match self.fingerprints.get(&path) {
                Some(existing) if *existing == fingerprint => return Ok((path, true)),
                Some(_) => counter += 1,
                None => {
                    self.fingerprints.insert(path.clone(), fingerprint);
                    return Ok((path, false));
                }
            }
        }
    }

    /// Splice dynamic fragments into a fetched page, strip what cannot work
    /// offline and archive everything it references.
    pub fn process_page(&mut self, doc: &Document, page_dir: &str) -> Result<()> {
        load_tabs(&mut self.transport, &self.base_url, doc)?;
        load_course_information(&mut self.transport, &self.base_url, doc)?;
        load_discussion_board(&mut self.transport, &self.base_url, doc)?;
        let stats = filter_scripts(doc, |line| {
            rewrite_download_urls(line, |url| Ok(self.local_reference(url, url)))
        })?;
        debug!("scripts {stats:?}");
        cleanup_page(doc);
        replace_navbar(doc);
        replace_redirects(doc);
        self.replace_local_urls(doc, "img", "src", page_dir)?;
        self.replace_local_urls(doc, "script", "src", page_dir)?;
        self.replace_local_urls(doc, "link", "href", page_dir)?;
        self.replace_style_tags(doc, page_dir)?;
        self.replace_local_urls(doc, "a", "href", page_dir)?;
        self.replace_onclick(doc)?;
        Ok(())
    }

    /// Archive `url` and return its path relative to the website root; on
    /// failure the failure is counted and `fallback` is returned.
    pub(crate) fn local_reference(&mut self, url: &str, fallback: &str) -> String {
        match self.download_local_file(url) {
            Ok(path) => path
                .strip_prefix('/')
                .map(str::to_string)
                .unwrap_or(path),
            Err(error) => {
                warn!("failed to archive {url}: {error:#}");
                self.report.failed += 1;
                fallback.to_string()
            }
        }
    }

    fn replace_local_urls(
        &mut self,
        doc: &Document,
        tag: &str,
        attr_name: &str,
        page_dir: &str,
    ) -> Result<()> {
        for element in doc.find_all(&Selector::tag(tag).with_attr(attr_name)) {
            let Some(raw) = attr(&element, attr_name) else {
                continue;
            };
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let url = strip_base_url(&self.base_url, raw);
            if !is_local_url(&self.base_url, url) {
                continue;
            }
            let url = if !url.starts_with('/') && !SEEDED_PAGES.contains(&url) {
                join_url_path(page_dir, url)
            } else {
                url.to_string()
            };
            let path = self.local_reference(&url, raw);
            set_attr(&element, attr_name, &path);
        }
        Ok(())
    }

    fn replace_style_tags(&mut self, doc: &Document, page_dir: &str) -> Result<()> {
        for style in doc.find_all(&Selector::tag("style").with_attr_value("type", "text/css")) {
            let css = text_content(&style);
            let rewritten = self.replace_css_urls(&css, page_dir, "/")?;
            if rewritten != css {
                set_text(&style, &rewritten);
            }
        }
        for element in doc.find_all(&Selector::any().with_attr("style")) {
            let Some(css) = attr(&element, "style") else {
                continue;
            };
            let rewritten = self.replace_css_urls(&css, page_dir, "/")?;
            set_attr(&element, "style", &rewritten);
        }
        Ok(())
    }

    fn replace_css_urls(&mut self, css: &str, css_dir: &str, local_dir: &str) -> Result<String> {
        rewrite_css_urls(css, |raw| {
            let url = strip_base_url(&self.base_url, raw).to_string();
            if !is_local_url(&self.base_url, &url) {
                return Ok(None);
            }
            let full_url = join_url_path(css_dir, &url);
            match self.download_local_file(&full_url) {
                Ok(path) => Ok(Some(relative_path(&path, local_dir))),
                Err(error) => {
                    warn!("failed to archive stylesheet reference {full_url}: {error:#}");
                    self.report.failed += 1;
                    Ok(None)
                }
            }
        })
    }

    fn replace_onclick(&mut self, doc: &Document) -> Result<()> {
        let course_id = doc
            .find_all(&Selector::tag("script"))
            .iter()
            .find_map(|script| {
                COURSE_ID
                    .captures(&text_content(script))
                    .and_then(|captures| captures.get(1))
                    .map(|id| id.as_str().to_string())
            });

        let mut grading = false;
        for element in doc.find_all(&Selector::any().with_attr("onclick")) {
            let Some(onclick) = attr(&element, "onclick") else {
                continue;
            };
            if onclick.contains("loadContentFrame") {
                let Some(target) = LOAD_CONTENT_FRAME
                    .captures(&onclick)
                    .and_then(|captures| captures.get(1))
                else {
                    warn!("unrecognised loadContentFrame handler: {onclick}");
                    continue;
                };
                let path = self.local_reference(target.as_str(), target.as_str());
                let handler = format!("window.top.location='{path}';");
                set_attr(&element, "onclick", &handler);
                if attr(&element, "id").as_deref() == Some("goToCourseContent")
                    && let Some(header) = doc.find_by_id(HEADER_ID)
                {
                    set_attr(&header, "onclick", &handler);
                }
            } else if onclick.contains("gradeAssignment.inlineView") {
                grading = true;
                let Some(captures) = INLINE_VIEW.captures(&onclick) else {
                    warn!("unrecognised inline view handler: {onclick}");
                    continue;
                };
                let file_id = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
                let attempt_id = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
                let mut handler = String::from("selectTarget(event);gradeAssignment.hideAllViews();");
                if file_id == "submissionText" {
                    handler.push_str(r#"$(gradeAssignment.getViewContainerId("submissionText")).show();"#);
                } else {
                    let Some(course_id) = course_id.as_deref() else {
                        warn!("inline view without a courseId script");
                        continue;
                    };
                    let mut url = format!(
                        "/webapps/assignment/inlineView?course_id={course_id}&file_id={file_id}&attempt_id={attempt_id}"
                    );
                    if onclick.contains("gradeAssignment.inlineViewGroupFile") {
                        url.push_str("&group=true");
                    }
                    let response = match self
                        .transport
                        .get(&absolute_url(&self.base_url, &url))
                        .and_then(|response| response.text())
                    {
                        Ok(response) => response,
                        Err(error) => {
                            warn!("failed to load inline view {url}: {error:#}");
                            self.report.failed += 1;
                            continue;
                        }
                    };
                    handler.push_str(&format!("gradeAssignment.handleInlineViewResponse({response});"));
                }
                set_attr(&element, "onclick", &handler);
            }
        }
        if grading {
            add_select_target_script(doc);
        }
        Ok(())
    }

    pub(crate) fn fetch_page(&mut self, url: &str) -> Result<(Document, String)> {
        let response = self.transport.get(&absolute_url(&self.base_url, url))?;
        let final_url = response.url.clone();
        let text = response.text()?;
        let page_dir = url_dir(strip_base_url(&self.base_url, &final_url));
        Ok((Document::parse(&text), page_dir))
    }

    pub(crate) fn write_website_page(&mut self, name: &str, doc: &Document) -> Result<PathBuf> {
        let path = self.website_dir.join(format!("{name}.html"));
        write_text(&path, &doc.to_html()?)?;
        self.report.pages += 1;
        Ok(path)
    }
}

fn breadcrumb_selector() -> Selector {
    Selector::tag("div")
        .with_class("path")
        .with_attr_value("role", "navigation")
}

/// File name stem for a page: breadcrumb, stream header or `<title>`.
pub fn page_title(doc: &Document) -> String {
    let edit_mode = doc
        .leading_comments()
        .iter()
        .any(|comment| comment.contains(EDIT_MODE_MARKER));

    let title = if let Some(nav) = doc.find_first(&breadcrumb_selector()) {
        stripped_strings(&nav).join(" - ")
    } else if let Some(header) = doc.find_by_id(HEADER_ID) {
        text_content(&header)
    } else if let Some(title) = doc.find_first(&Selector::tag("title")) {
        text_content(&title)
    } else {
        String::new()
    };
    let mut title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        title = "unknown".to_string();
    }
    if edit_mode {
        title.push_str(" (edit mode)");
    }
    clean_path_component(&title, false)
}

fn fingerprint(html: &str) -> String {
    let digest = Sha256::digest(html.as_bytes());
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn has_css_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("css"))
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub(crate) fn write_text(path: &Path, content: &str) -> Result<()> {
    create_parent(path)?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}
