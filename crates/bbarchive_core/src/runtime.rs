use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

pub const STATE_DIR_NAME: &str = ".bbarchive";
pub const WEBSITE_DIR_NAME: &str = "website";
pub const CHECKSUM_FILENAME: &str = "checksums.sha256";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub output_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub home_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let home_dir = env::var_os("HOME")
            .or_else(|| env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .filter(|path| !path.as_os_str().is_empty());
        Ok(Self { cwd, home_dir })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub download_dir: PathBuf,
    pub website_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub index_path: PathBuf,
    pub checksum_path: PathBuf,
    pub output_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Layout rooted at `download_dir` with every location at its default.
    pub fn rooted_at(download_dir: &Path) -> Self {
        let state_dir = download_dir.join(STATE_DIR_NAME);
        Self {
            download_dir: download_dir.to_path_buf(),
            website_dir: download_dir.join(WEBSITE_DIR_NAME),
            config_path: state_dir.join("config.toml"),
            state_dir,
            index_path: download_dir.join("index.html"),
            checksum_path: download_dir.join(CHECKSUM_FILENAME),
            output_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "download_dir={} ({})\nwebsite_dir={}\nstate_dir={}\nconfig_path={} ({})\nindex_path={}\nchecksum_path={}",
            normalize_for_display(&self.download_dir),
            self.output_source.as_str(),
            normalize_for_display(&self.website_dir),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.index_path),
            normalize_for_display(&self.checksum_path),
        )
    }
}

#[derive(Debug, Clone)]
pub struct LayoutStatus {
    pub download_dir_exists: bool,
    pub website_dir_exists: bool,
    pub config_exists: bool,
    pub index_exists: bool,
    pub checksum_exists: bool,
    pub html_pages: usize,
    pub other_files: usize,
    pub total_bytes: u64,
    pub warnings: Vec<String>,
}

pub fn inspect_layout(paths: &ResolvedPaths) -> Result<LayoutStatus> {
    let download_dir_exists = paths.download_dir.exists();
    let website_dir_exists = paths.website_dir.exists();
    let config_exists = paths.config_path.exists();
    let index_exists = paths.index_path.exists();
    let checksum_exists = paths.checksum_path.exists();

    let mut html_pages = 0usize;
    let mut other_files = 0usize;
    let mut total_bytes = 0u64;
    if download_dir_exists {
        for entry in WalkDir::new(&paths.download_dir)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != STATE_DIR_NAME)
        {
            let entry = entry.with_context(|| {
                format!("failed to walk {}", paths.download_dir.display())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path == paths.index_path || path == paths.checksum_path {
                continue;
            }
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed to inspect {}", path.display()))?;
            total_bytes += metadata.len();
            let is_html = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("html"));
            if is_html {
                html_pages += 1;
            } else {
                other_files += 1;
            }
        }
    }

    let mut warnings = Vec::new();
    if !download_dir_exists {
        warnings.push("download directory is missing; run `bbarchive init`".to_string());
    }
    if download_dir_exists && !index_exists {
        warnings.push("index.html is missing; the last mirror did not finish".to_string());
    }

    Ok(LayoutStatus {
        download_dir_exists,
        website_dir_exists,
        config_exists,
        index_exists,
        checksum_exists,
        html_pages,
        other_files,
        total_bytes,
        warnings,
    })
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (download_dir, output_source) = if let Some(path) = overrides.output_dir.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup_env("BBARCHIVE_OUTPUT_DIR")
        && !value.trim().is_empty()
    {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else {
        let home = context.home_dir.as_deref().unwrap_or(&context.cwd);
        (
            home.join("Documents").join("Blackboard"),
            ValueSource::Default,
        )
    };

    let mut paths = ResolvedPaths::rooted_at(&download_dir);
    paths.output_source = output_source;

    if let Some(path) = overrides.config.as_deref() {
        paths.config_path = absolutize(path, &context.cwd);
        paths.config_source = ValueSource::Flag;
    } else if let Some(value) = lookup_env("BBARCHIVE_CONFIG")
        && !value.trim().is_empty()
    {
        paths.config_path = absolutize(Path::new(value.trim()), &context.cwd);
        paths.config_source = ValueSource::Env;
    }

    Ok(paths)
}

pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let required_dirs = [
        paths.download_dir.clone(),
        paths.website_dir.clone(),
        paths.state_dir.clone(),
    ];

    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, &render_materialized_config(), force)?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config() -> String {
    format!(
        "# bbarchive configuration (materialized by `bbarchive init`)\n# Credentials are never read from this file; use BB_USERNAME / BB_PASSWORD.\n\n[blackboard]\nbase_url = \"{}\"\n# user_agent = \"Mozilla/5.0 ...\"\n\n[http]\n# timeout_ms = 60000\n# rate_limit_ms = 150\n# retries = 2\n# retry_delay_ms = 500\n# max_redirects = 10\n\n[stream]\n# poll_interval_ms = 1000\n# poll_limit = 60\n",
        crate::config::DEFAULT_BASE_URL
    )
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        PathOverrides, ResolutionContext, ValueSource, init_layout, inspect_layout,
        resolve_paths_with_lookup,
    };
    use crate::config::load_config;

    fn context(cwd: &std::path::Path) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
            home_dir: Some(cwd.join("home")),
        }
    }

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let from_flag = temp.path().join("flag-out");
        let overrides = PathOverrides {
            output_dir: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([(
            "BBARCHIVE_OUTPUT_DIR".to_string(),
            temp.path().join("env-out").to_string_lossy().to_string(),
        )]);

        let resolved =
            resolve_paths_with_lookup(&context(temp.path()), &overrides, |key| env.get(key).cloned())
                .expect("resolve paths");
        assert_eq!(resolved.download_dir, from_flag);
        assert_eq!(resolved.website_dir, from_flag.join("website"));
        assert_eq!(resolved.output_source, ValueSource::Flag);
        assert_eq!(resolved.config_source, ValueSource::Default);
    }

    #[test]
    fn resolve_paths_defaults_to_documents_folder() {
        let temp = tempdir().expect("tempdir");
        let resolved =
            resolve_paths_with_lookup(&context(temp.path()), &PathOverrides::default(), |_| None)
                .expect("resolve paths");
        assert_eq!(
            resolved.download_dir,
            temp.path().join("home").join("Documents").join("Blackboard")
        );
        assert!(resolved.config_path.ends_with(".bbarchive/config.toml"));
        assert_eq!(resolved.output_source, ValueSource::Default);
    }

    #[test]
    fn resolve_paths_reads_relative_config_from_env() {
        let temp = tempdir().expect("tempdir");
        let env = HashMap::from([("BBARCHIVE_CONFIG".to_string(), "custom.toml".to_string())]);
        let resolved = resolve_paths_with_lookup(
            &context(temp.path()),
            &PathOverrides::default(),
            |key| env.get(key).cloned(),
        )
        .expect("resolve paths");
        assert_eq!(resolved.config_path, temp.path().join("custom.toml"));
        assert_eq!(resolved.config_source, ValueSource::Env);
    }

    #[test]
    fn init_layout_creates_dirs_and_loadable_config() {
        let temp = tempdir().expect("tempdir");
        let overrides = PathOverrides {
            output_dir: Some(temp.path().join("out")),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context(temp.path()), &overrides, |_| None)
            .expect("resolve");

        let report = init_layout(&paths, false).expect("init");
        assert_eq!(report.created_dirs.len(), 3);
        assert!(report.wrote_config);
        assert!(paths.website_dir.exists());

        let config = load_config(&paths.config_path).expect("load materialized config");
        assert_eq!(
            config.blackboard.base_url.as_deref(),
            Some(crate::config::DEFAULT_BASE_URL)
        );

        let again = init_layout(&paths, false).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
    }

    #[test]
    fn inspect_layout_counts_pages_and_files() {
        let temp = tempdir().expect("tempdir");
        let overrides = PathOverrides {
            output_dir: Some(temp.path().join("out")),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context(temp.path()), &overrides, |_| None)
            .expect("resolve");
        init_layout(&paths, false).expect("init");
        fs::write(paths.website_dir.join("Courses.html"), "<html></html>").expect("page");
        fs::create_dir_all(paths.download_dir.join("Course A")).expect("course dir");
        fs::write(paths.download_dir.join("Course A").join("slides.pdf"), "pdf").expect("file");

        let status = inspect_layout(&paths).expect("inspect");
        assert!(status.website_dir_exists);
        assert_eq!(status.html_pages, 1);
        assert_eq!(status.other_files, 1);
        assert_eq!(status.total_bytes, 16);
        assert!(!status.index_exists);
        assert!(!status.warnings.is_empty());
    }
}
