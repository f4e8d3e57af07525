use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tab_vision::browser::BrowserSurface;
use tab_vision::config::{self, Config};
use tab_vision::settings::{
    KEY_FULL_PAGE_SCREENSHOT, KEY_LEGACY_ACCOUNT_ID, KEY_LEGACY_API_KEY, KEY_MATCH_LEVEL,
    KEY_VIEWPORT_SIZE,
};
use tab_vision::{
    Collaborators, HttpSitemapSource, MemoryStore, Session, SessionCheck, SimulatedBrowser, Size,
    StaticAccountDirectory, TabId, TestReport, TestRunCoordinator,
};
use tracing_subscriber::EnvFilter;

/// Tab Vision - visual-regression test orchestration for browser tabs
#[derive(Parser, Debug)]
#[command(
    name = "tab-vision",
    about = "Visual-regression test orchestration for browser tabs (simulated browser, local checks)",
    after_help = "ENVIRONMENT VARIABLES:\n\
        TAB_VISION_RESIZE_SETTLE_MS      Wait after each window resize (ms)\n\
        TAB_VISION_RESIZE_ATTEMPTS       Total resize attempts\n\
        TAB_VISION_PAGE_SETTLE_MS        Wait after loading a crawled page (ms)\n\
        TAB_VISION_SITEMAP_TIMEOUT_SECS  Sitemap request timeout (s)\n\
        TAB_VISION_CRAWL_TABS            Parallel crawl tabs\n\
        TAB_VISION_CRAWL_MAX_URLS        Maximum URLs taken from a sitemap\n\
        TAB_VISION_SESSION_DIR           Base directory for capture sessions\n\
        TAB_VISION_SERVER_URL            Default main server URL\n\
        TAB_VISION_API_URL               Default API server URL\n\
        RUST_LOG                         Log filter (default: info)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Args, Debug)]
struct Common {
    /// Viewport (content area) to test at, WxH
    #[arg(long, default_value = "800x600")]
    viewport: String,

    /// Match level: strict, content, layout or exact
    #[arg(long, default_value = "strict")]
    match_level: String,

    /// Capture the whole page instead of the visible viewport
    #[arg(long)]
    full_page: bool,

    /// Account the local checks are recorded under
    #[arg(long, default_value = "local")]
    account_id: String,

    /// Output directory for captures (default: auto-generated in session dir)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep captures after completion (default: cleanup unless --output is specified)
    #[arg(long, short = 'k')]
    keep: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Test one page
    Run {
        /// Page loaded in the tab under test
        #[arg(short, long)]
        url: String,

        /// Initial outer window size, WxH
        #[arg(short, long, default_value = "1024x768")]
        window: String,

        /// Additional tabs sharing the window (forces a dedicated test window)
        #[arg(long, default_value = "0")]
        extra_tabs: usize,

        #[command(flatten)]
        common: Common,
    },

    /// Test every page listed in a site's sitemap.xml
    Crawl {
        /// Start page; its origin's /sitemap.xml is fetched
        #[arg(short, long)]
        url: String,

        /// Initial outer window size, WxH
        #[arg(short, long, default_value = "1024x768")]
        window: String,

        /// Wait after loading each page (ms)
        #[arg(long, env = "TAB_VISION_PAGE_SETTLE_MS")]
        settle_ms: Option<u64>,

        /// Parallel crawl tabs
        #[arg(long, env = "TAB_VISION_CRAWL_TABS")]
        tabs: Option<usize>,

        #[command(flatten)]
        common: Common,
    },

    /// Run one test per line of a steps file
    Steps {
        /// File with one step name per line
        #[arg(short, long)]
        file: PathBuf,

        /// Page loaded in the tab under test
        #[arg(short, long)]
        url: String,

        /// Initial outer window size, WxH
        #[arg(short, long, default_value = "1024x768")]
        window: String,

        #[command(flatten)]
        common: Common,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Run {
            url,
            window,
            extra_tabs,
            common,
        }) => {
            let window_size = parse_size(&window)?;
            let mut urls = vec![url.as_str()];
            urls.extend(std::iter::repeat_n("about:blank", extra_tabs));

            let harness = setup(&common, config::get().clone(), window_size, &urls)?;
            let watcher = harness.coordinator.spawn_removal_watcher();

            let report = harness.coordinator.run_single_test().await;
            watcher.abort();
            let report = report?;

            if common.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
                let tab = harness.browser.get_tab(harness.tab_id).await?;
                let restored = harness.browser.get_window(tab.window_id).await?;
                println!("  Window restored to {}", restored.size);
            }
            print_session(&harness, &common);
        }

        Some(Commands::Crawl {
            url,
            window,
            settle_ms,
            tabs,
            common,
        }) => {
            let window_size = parse_size(&window)?;
            let mut config = config::get().clone();
            if let Some(ms) = settle_ms {
                config.crawl.page_settle = Duration::from_millis(ms);
            }
            if let Some(tabs) = tabs {
                config.crawl.tabs = tabs.max(1);
            }
            let source = HttpSitemapSource::from_settings(&config.crawl)?;

            let harness = setup(&common, config, window_size, &[url.as_str()])?;
            let report = harness.coordinator.crawl(&source).await?;

            if common.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Crawl completed: {} discovered, {} tested, {} failed, {} interrupted",
                    report.discovered.len(),
                    report.tested.len(),
                    report.failed.len(),
                    report.interrupted.len()
                );
                for tested in &report.tested {
                    print_report(tested);
                }
                for failure in &report.failed {
                    println!("  FAILED {}: {}", failure.url, failure.error);
                }
                for skipped in &report.interrupted {
                    println!("  NOT TESTED {}: {}", skipped.url, skipped.error);
                }
            }
            print_session(&harness, &common);
        }

        Some(Commands::Steps {
            file,
            url,
            window,
            common,
        }) => {
            let window_size = parse_size(&window)?;
            let raw = std::fs::read_to_string(&file)?;

            let harness = setup(&common, config::get().clone(), window_size, &[url.as_str()])?;
            let count = harness.coordinator.set_steps(&raw);
            if count == 0 {
                return Err(format!("No steps found in {}", file.display()).into());
            }

            let mut reports = Vec::with_capacity(count);
            for _ in 0..count {
                reports.push(harness.coordinator.run_single_test().await?);
            }

            if common.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                println!("Steps completed: {} tests", reports.len());
                for report in &reports {
                    print_report(report);
                }
            }
            print_session(&harness, &common);
        }

        None => {
            println!("Tab Vision - visual-regression test orchestration for browser tabs");
            println!();
            println!("Usage: tab-vision <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run    Test one page");
            println!("  crawl  Test every page listed in a site's sitemap.xml");
            println!("  steps  Run one test per line of a steps file");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

struct Harness {
    browser: Arc<SimulatedBrowser>,
    tab_id: TabId,
    coordinator: Arc<TestRunCoordinator>,
    session_dir: PathBuf,
}

/// A simulated browser with one window holding `urls`, and a coordinator
/// checking into a local session.
fn setup(common: &Common, config: Config, window: Size, urls: &[&str]) -> Result<Harness, Box<dyn Error>> {
    let viewport = parse_size(&common.viewport)?;
    tab_vision::MatchLevel::parse(&common.match_level)
        .ok_or_else(|| format!("Invalid match level '{}'", common.match_level))?;

    let session = match &common.output {
        Some(dir) => Session::in_dir(dir),
        None => Session::in_base(&config.session.base_dir).keep(common.keep),
    };
    session.init()?;
    let session_dir = session.dir.clone();

    let browser = Arc::new(SimulatedBrowser::new());
    let (_, tabs) = browser.open_window(window, urls);
    let tab_id = tabs.first().copied().ok_or("no tab to test")?;

    let store = MemoryStore::new()
        .with(KEY_VIEWPORT_SIZE, viewport.to_string())
        .with(KEY_MATCH_LEVEL, common.match_level.as_str())
        .with(KEY_FULL_PAGE_SCREENSHOT, common.full_page)
        .with(KEY_LEGACY_API_KEY, "local")
        .with(KEY_LEGACY_ACCOUNT_ID, common.account_id.as_str());

    let coordinator = TestRunCoordinator::new(
        Collaborators {
            browser: browser.clone(),
            store: Arc::new(store),
            accounts: Arc::new(StaticAccountDirectory::unsupported()),
            check: Arc::new(SessionCheck::new(session)),
        },
        config,
    );
    Ok(Harness {
        browser,
        tab_id,
        coordinator: Arc::new(coordinator),
        session_dir,
    })
}

fn parse_size(raw: &str) -> Result<Size, Box<dyn Error>> {
    Size::parse(raw).ok_or_else(|| format!("Invalid size '{}'. Use WxH (e.g., 800x600)", raw).into())
}

fn print_report(report: &TestReport) {
    println!(
        "  {} {} [{}]: {:?}",
        report.parameters.app_name,
        report.parameters.test_name,
        report.parameters.viewport_size,
        report.status
    );
    if let Some(url) = &report.result_url {
        println!("    Result: {}", url);
    }
}

fn print_session(harness: &Harness, common: &Common) {
    if common.json {
        return;
    }
    for entry in harness.coordinator.logs() {
        if entry.level != tab_vision::LogLevel::Info {
            println!("  [{:?}] {}", entry.level, entry.message);
        }
    }
    if common.keep || common.output.is_some() {
        println!("\nSession: {}", harness.session_dir.display());
    }
}
