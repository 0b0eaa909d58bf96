use std::env;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bbarchive_core::archive::{ArchiveReport, Archiver};
use bbarchive_core::checksum::{ChecksumManifest, verify_manifest};
use bbarchive_core::config::{ArchiveConfig, SessionConfig, load_config};
use bbarchive_core::overview::MirrorOptions;
use bbarchive_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_layout,
    normalize_for_display, resolve_paths,
};
use bbarchive_core::session::{HttpSession, Transport, login};
use bbarchive_core::stream::StreamPolling;
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "bbarchive",
    version,
    about = "Mirror a Blackboard portal into a browsable offline copy"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "NAME", help = "Portal username (or BB_USERNAME)")]
    username: Option<String>,
    #[arg(long, global = true, help = "Read the password from the first line of stdin")]
    password_stdin: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log debug output")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    output_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    username: Option<String>,
    password_stdin: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            output_dir: cli.output_dir.clone(),
            config: cli.config.clone(),
            username: cli.username.clone(),
            password_stdin: cli.password_stdin,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the output layout and a commented config file")]
    Init(InitArgs),
    #[command(about = "Check that the credentials are accepted")]
    Login,
    #[command(about = "Mirror the course, organisation and grade overviews")]
    Mirror(MirrorArgs),
    #[command(about = "Mirror a single course or page URL")]
    Course(CourseArgs),
    #[command(about = "Show what the output directory currently holds")]
    Status,
    #[command(about = "Re-hash downloaded files against the checksum manifest")]
    Verify,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct MirrorArgs {
    #[arg(long, help = "Skip the Courses overview")]
    no_courses: bool,
    #[arg(long, help = "Skip the Organisations overview")]
    no_organisations: bool,
    #[arg(long, help = "Skip the grade pages")]
    no_grades: bool,
}

#[derive(Debug, Args)]
struct CourseArgs {
    url: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Login) => run_login(&runtime),
        Some(Commands::Mirror(args)) => run_mirror(&runtime, args),
        Some(Commands::Course(CourseArgs { url })) => run_course(&runtime, &url),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Verify) => run_verify(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized bbarchive output layout");
    println!("download_dir: {}", normalize_for_display(&paths.download_dir));
    println!("website_dir: {}", normalize_for_display(&paths.website_dir));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_login(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let session = open_session(runtime, &config)?;

    println!("login");
    println!("base_url: {}", config.base_url());
    println!("user_agent: {}", config.user_agent());
    println!("requests: {}", session.request_count());
    println!("status: ok");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_mirror(runtime: &RuntimeOptions, args: MirrorArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let options = MirrorOptions {
        courses: !args.no_courses,
        organisations: !args.no_organisations,
        grades: !args.no_grades,
    };
    if !(options.courses || options.organisations || options.grades) {
        bail!("nothing to mirror: every section was disabled");
    }

    let mut archiver = build_archiver(runtime, &config, &paths)?;
    archiver.archive_all(&options)?;

    println!("mirror");
    println!("download_dir: {}", normalize_for_display(&paths.download_dir));
    println!("index: {}", normalize_for_display(&paths.index_path));
    print_archive_report("report", &archiver.report());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_course(runtime: &RuntimeOptions, url: &str) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        bail!("course requires a non-empty URL");
    }
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;

    let mut archiver = build_archiver(runtime, &config, &paths)?;
    let local_path = archiver.archive_course(url)?;
    let local_path = local_path.split('#').next().unwrap_or_default();

    println!("course");
    println!("url: {url}");
    println!(
        "local_path: {}",
        normalize_for_display(&archiver.full_path(local_path))
    );
    print_archive_report("report", &archiver.report());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_layout(&paths)?;

    println!("output status");
    println!("download_dir: {}", normalize_for_display(&paths.download_dir));
    println!("download_dir_exists: {}", format_flag(status.download_dir_exists));
    println!("website_dir_exists: {}", format_flag(status.website_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("index_exists: {}", format_flag(status.index_exists));
    println!("checksums_exists: {}", format_flag(status.checksum_exists));
    println!("html_pages: {}", status.html_pages);
    println!("other_files: {}", status.other_files);
    println!("total_bytes: {}", status.total_bytes);
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_verify(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    if !paths.checksum_path.is_file() {
        bail!(
            "no checksum manifest at {} (run `bbarchive mirror` first)",
            normalize_for_display(&paths.checksum_path)
        );
    }
    let report = verify_manifest(&paths.download_dir, &paths.checksum_path)?;

    println!("verify");
    println!("manifest: {}", normalize_for_display(&paths.checksum_path));
    println!("ok: {}", report.ok);
    println!("mismatched.count: {}", report.mismatched.len());
    for path in &report.mismatched {
        println!("mismatched.path: {path}");
    }
    println!("missing.count: {}", report.missing.len());
    for path in &report.missing {
        println!("missing.path: {path}");
    }
    print_diagnostics(runtime, &paths);

    if !report.is_clean() {
        bail!(
            "{} archived files no longer match the manifest",
            report.mismatched.len() + report.missing.len()
        );
    }
    Ok(())
}

fn build_archiver(
    runtime: &RuntimeOptions,
    config: &ArchiveConfig,
    paths: &ResolvedPaths,
) -> Result<Archiver<HttpSession>> {
    let session = open_session(runtime, config)?;
    let polling = StreamPolling {
        interval: Duration::from_millis(config.stream_poll_interval_ms()),
        limit: config.stream_poll_limit(),
    };
    Ok(Archiver::new(session, &config.base_url(), paths)
        .with_checksums(ChecksumManifest::new(&paths.checksum_path, &paths.download_dir))
        .with_stream_polling(polling))
}

fn open_session(runtime: &RuntimeOptions, config: &ArchiveConfig) -> Result<HttpSession> {
    let (username, password) = read_credentials(runtime)?;
    let mut session = HttpSession::new(SessionConfig::from_config(config))?;
    login(&mut session, &config.base_url(), &username, &password)?;
    Ok(session)
}

fn read_credentials(runtime: &RuntimeOptions) -> Result<(String, String)> {
    let username = runtime
        .username
        .clone()
        .or_else(|| env::var("BB_USERNAME").ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .context("no username given (use --username or BB_USERNAME)")?;

    let password = if runtime.password_stdin {
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read password from stdin")?;
        line.trim_end_matches(['\r', '\n']).to_string()
    } else {
        env::var("BB_PASSWORD").unwrap_or_default()
    };
    if password.is_empty() {
        bail!("no password given (use --password-stdin or BB_PASSWORD)");
    }
    Ok((username, password))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        output_dir: runtime.output_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let output_env = initial.state_dir.join(".env");
    if output_env.exists() {
        let _ = dotenvy::from_path_override(&output_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_archive_report(prefix: &str, report: &ArchiveReport) {
    println!("{prefix}.pages: {}", report.pages);
    println!("{prefix}.files: {}", report.files);
    println!("{prefix}.stylesheets: {}", report.stylesheets);
    println!("{prefix}.bytes: {}", report.bytes);
    println!("{prefix}.reused: {}", report.reused);
    println!("{prefix}.not_found: {}", report.not_found);
    println!("{prefix}.failed: {}", report.failed);
    println!("{prefix}.requests: {}", report.request_count);
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
