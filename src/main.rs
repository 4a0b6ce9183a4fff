use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use mailrpa::attempt::Attempt;
use mailrpa::browser::{ChromeLauncher, SessionExecutor};
use mailrpa::config::Config;
use mailrpa::database::{ResultStore, SqliteStore};
use mailrpa::email::{ImapMailbox, MailSource};
use mailrpa::link_extractor::{self, ExtractionResult};
use mailrpa::orchestrator::{Orchestrator, OrchestratorSettings, TokioClock};

#[derive(Parser)]
#[command(name = "mailrpa")]
#[command(about = "Poll a mailbox, follow the link of matching messages in a browser, record every attempt")]
#[command(version)]
struct Args {
    /// Run a single cycle then exit
    #[arg(long)]
    once: bool,

    /// Poll and extract only: no browser, no database, messages stay unseen
    #[arg(short, long)]
    dry_run: bool,

    /// Validate the configuration without connecting
    #[arg(long)]
    check_config: bool,

    /// Print the N most recent attempts and failures, then exit
    #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "10")]
    report: Option<u32>,

    /// JSON output for --report
    #[arg(long, requires = "report")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();

    // Logging needs the level from the config, errors are reported after init
    let config = Config::new();
    init_logging(
        config
            .as_ref()
            .map(|c| c.log_level)
            .unwrap_or(log::LevelFilter::Info),
    );
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {:#}", e);
            return Err(e);
        }
    };

    if args.check_config {
        print_config(&config);
        return Ok(());
    }

    if let Some(limit) = args.report {
        return run_report(&config, limit, args.json).await;
    }

    if args.dry_run {
        info!("🧪 Starting in DRY-RUN mode");
        return run_dry_run(&config).await;
    }

    info!("🚀 Starting mailrpa");
    run_pipeline(config, args.once).await
}

fn init_logging(level: log::LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn print_config(config: &Config) {
    println!("✅ Configuration valid!");
    println!(
        "📧 IMAP: {}@{}:{} ({}), timeout {}s, {} message(s) per cycle, mark seen: {}",
        config.imap.username,
        config.imap.server,
        config.imap.port,
        config.imap.mailbox,
        config.imap.timeout.as_secs(),
        config.imap.fetch_limit,
        config.imap.mark_seen
    );
    println!(
        "🔎 Sender filter: '{}' ({:?}), include pattern: {}",
        config.filter.sender,
        config.filter.sender_match,
        config
            .filter
            .include
            .as_ref()
            .map(|re| re.as_str())
            .unwrap_or("none")
    );
    println!(
        "🎯 Target rule: {} (subject fallback: {})",
        config.extraction.as_str(),
        config.extraction.search_subject
    );
    println!("🖱️  Selectors:");
    for selector in &config.action.selectors {
        println!("   - {}", selector);
    }
    println!(
        "🌐 Browser: headless {}, binary {}, preflight {}, timeouts {}s/{}s/{}s",
        config.browser.headless,
        config
            .browser
            .chrome_bin
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "auto-detect".to_string()),
        config.action.preflight,
        config.action.page_load_timeout.as_secs(),
        config.action.element_timeout.as_secs(),
        config.action.action_timeout.as_secs()
    );
    println!(
        "⏱️  Poll interval: {}s, retries: {} (base delay {}s)",
        config.scheduler.poll_interval.as_secs(),
        config.retry.max_retries,
        config.retry.base_delay.as_secs()
    );
    println!("🗄️  Database: {}", config.database.path.display());
}

#[derive(Serialize)]
struct Report {
    total: u64,
    recent: Vec<Attempt>,
    failures: Vec<Attempt>,
}

async fn run_report(config: &Config, limit: u32, json: bool) -> Result<()> {
    let store = SqliteStore::open(&config.database.path).await?;
    let report = Report {
        total: store.count().await?,
        recent: store.recent(limit).await?,
        failures: store.failures(limit).await?,
    };
    store.close().await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Unable to serialize report")?
        );
        return Ok(());
    }

    println!("📊 {} attempt(s) recorded", report.total);
    println!("\nRecent attempts:");
    for attempt in &report.recent {
        print_attempt(attempt);
    }
    println!("\nRecent failures:");
    for attempt in &report.failures {
        print_attempt(attempt);
    }
    Ok(())
}

fn print_attempt(attempt: &Attempt) {
    println!(
        "  {} {} [{}] {} | {}",
        attempt.timestamp.format("%Y-%m-%d %H:%M:%S"),
        attempt.process_id,
        attempt.status,
        attempt.subject,
        attempt
            .detailed_error
            .as_deref()
            .or(attempt.final_result.as_deref())
            .unwrap_or("-")
    );
}

async fn run_dry_run(config: &Config) -> Result<()> {
    let mailbox = ImapMailbox::new(config.imap.clone()).peek_only();
    let messages = mailbox
        .fetch_candidates(&config.filter)
        .await
        .context("Unable to poll the mailbox")?;

    info!("📧 {} candidate message(s)", messages.len());
    for message in &messages {
        match link_extractor::extract(message, &config.extraction) {
            ExtractionResult::Target(target) => {
                info!("🎯 {} '{}' -> {}", message.id, message.subject, target)
            }
            ExtractionResult::NoMatch => {
                info!("∅ {} '{}' -> no target", message.id, message.subject)
            }
        }
    }
    info!("✅ Dry-run finished, nothing was recorded");
    Ok(())
}

async fn run_pipeline(config: Config, once: bool) -> Result<()> {
    // Wire the pipeline components
    let store = SqliteStore::open(&config.database.path).await?;
    let executor = SessionExecutor::new(
        ChromeLauncher::new(config.browser.clone()),
        config.action.clone(),
    );
    let mailbox = ImapMailbox::new(config.imap.clone());

    let mut orchestrator = Orchestrator::new(
        mailbox,
        executor,
        store,
        TokioClock,
        OrchestratorSettings::from_config(&config),
    );

    // SIGINT/SIGTERM only stop the loop once the current message is recorded
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    if once {
        let report = orchestrator.run_cycle(&shutdown).await;
        report.log_summary();
    } else {
        orchestrator.run(shutdown).await;
    }

    orchestrator.store().close().await;
    info!("👋 Bye");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Termination signal received, finishing the current message");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable, only Ctrl+C stops the loop: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Ctrl+C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Ctrl+C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
