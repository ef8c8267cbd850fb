use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use caremap::types::JobStatus;
use caremap::{
    ChromeLauncher, CrawlService, Crawler, CrawlerConfig, KakaoGeocoder, ServiceError,
    SqliteStore, StagingArea, StatusBoard,
};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

type Service = CrawlService<ChromeLauncher, SqliteStore, KakaoGeocoder>;

#[derive(Parser)]
#[command(name = "caremap")]
#[command(about = "Crawl the long-term-care institution registry and keep a local history of it", long_about = None)]
struct Cli {
    #[arg(
        short = 'l',
        long = "log-level",
        value_enum,
        default_value = "info",
        global = true,
        help = "Set the logging level"
    )]
    log_level: LogLevel,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "SQLite database file (overrides CAREMAP_DATABASE)"
    )]
    database: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Directory for status.json and staged crawl data (overrides CAREMAP_STATE_DIR)"
    )]
    state_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Show the browser window while crawling")]
    headful: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the registry listing and stage the results for import
    Crawl {
        #[arg(
            long,
            default_value_t = 1,
            help = "Maximum number of result pages to visit",
            value_parser = clap::value_parser!(u32).range(1..)
        )]
        max_pages: u32,

        #[arg(long, help = "Identifier recorded on the crawl job")]
        crawler_id: Option<String>,

        #[arg(long, help = "Import the staged records once the crawl completes")]
        import: bool,
    },
    /// Load the first listing page and report how many pages the registry has
    Estimate,
    /// Reconcile the last staged crawl into the database
    Import,
    /// Clear a crawl left running by a process that is no longer alive
    Stop,
    /// Show the crawl status surface
    Status {
        #[arg(
            short = 'o',
            long = "output",
            value_enum,
            default_value = "text",
            help = "Output format"
        )]
        format: OutputFormat,
    },
    /// List crawl jobs, newest first
    Jobs {
        #[arg(long, value_parser = parse_job_status, help = "Filter by job status")]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 10, help = "Maximum number of jobs to list")]
        limit: usize,

        #[arg(
            short = 'o',
            long = "output",
            value_enum,
            default_value = "text",
            help = "Output format"
        )]
        format: OutputFormat,
    },
    /// Show an institution together with its recorded prior states
    History {
        #[arg(help = "Institution code, e.g. LTCO_000001")]
        institution_code: String,

        #[arg(
            short = 'o',
            long = "output",
            value_enum,
            default_value = "text",
            help = "Output format"
        )]
        format: OutputFormat,
    },
    /// Geocode stored institutions that have no coordinates yet
    BackfillCoordinates {
        #[arg(long, default_value_t = 50, help = "Maximum number of institutions to geocode")]
        limit: usize,
    },
}

fn parse_job_status(s: &str) -> Result<JobStatus, String> {
    JobStatus::from_str(s).map_err(|e| e.to_string())
}

fn serialize_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log::error!("Error serializing to JSON: {}", e);
            process::exit(1);
        }
    }
}

/// Busy gets its own exit code so scripts can retry instead of alerting.
fn fail(context: &str, e: ServiceError) -> ! {
    log::error!("{}: {}", context, e);
    match e {
        ServiceError::Busy { .. } => process::exit(2),
        _ => process::exit(1),
    }
}

fn build_service(config: &CrawlerConfig) -> Service {
    let store = SqliteStore::open(&config.database_path).unwrap_or_else(|e| {
        log::error!("Error opening database: {}", e);
        process::exit(1);
    });
    let geocoder = KakaoGeocoder::new(config.kakao_api_key.clone()).unwrap_or_else(|e| {
        log::error!("Error creating geocoder: {}", e);
        process::exit(1);
    });
    let board = StatusBoard::persistent(&config.state_dir).unwrap_or_else(|e| {
        log::error!("Error opening status board: {}", e);
        process::exit(1);
    });
    let staging = StagingArea::new(&config.state_dir).unwrap_or_else(|e| {
        log::error!("Error opening staging area: {}", e);
        process::exit(1);
    });

    CrawlService::new(
        Crawler::new(
            ChromeLauncher::new(config.browser.clone()),
            config.crawl_settings(),
        ),
        Arc::new(store),
        geocoder,
        Arc::new(board),
        staging,
        config.service_settings(),
    )
}

fn require_api_key(config: &CrawlerConfig) {
    if config.kakao_api_key.is_none() {
        log::error!("KAKAO_REST_API_KEY must be set to geocode addresses");
        process::exit(1);
    }
}

async fn run_import(service: &Service) {
    let summary = service
        .import_staged()
        .await
        .unwrap_or_else(|e| fail("Error importing staged crawl", e));
    println!("{}", summary);
}

async fn run_crawl(service: &Service, max_pages: u32, crawler_id: Option<String>) -> bool {
    let started = service
        .start(max_pages, crawler_id)
        .unwrap_or_else(|e| fail("Error starting crawl", e));
    log::info!("Crawl job {} started; press Ctrl-C to stop", started.job_id);

    let mut handle = started.handle;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_message = String::new();
    loop {
        tokio::select! {
            joined = &mut handle => {
                if let Err(e) = joined {
                    log::error!("Crawl task ended abnormally: {}", e);
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Interrupt received, stopping crawl");
                if let Err(e) = service.stop() {
                    log::error!("Error stopping crawl: {}", e);
                }
            }
            _ = ticker.tick() => {
                if let Some(progress) = service.status().progress {
                    let line = progress.to_string();
                    if line != last_message {
                        println!("{}", line);
                        last_message = line;
                    }
                }
            }
        }
    }

    let status = service.status();
    println!("{}", status);
    match status.error {
        Some(error) => {
            log::error!("Crawl did not complete: {}", error);
            false
        }
        None => true,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.clone().into())
        .init();

    let mut config = CrawlerConfig::from_env().unwrap_or_else(|e| {
        log::error!("Invalid configuration: {}", e);
        process::exit(1);
    });
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    if cli.headful {
        config.browser.headless = false;
    }

    match cli.command {
        Commands::Crawl {
            max_pages,
            crawler_id,
            import,
        } => {
            if import {
                require_api_key(&config);
            }
            let service = build_service(&config);
            let completed = run_crawl(&service, max_pages, crawler_id).await;
            if !completed {
                process::exit(1);
            }
            if import {
                run_import(&service).await;
            }
        }

        Commands::Estimate => {
            log::info!("Estimating total pages at {}", config.target_url);
            let total = build_service(&config)
                .estimate_total_pages()
                .await
                .unwrap_or_else(|e| fail("Error estimating total pages", e));
            println!("Total pages: {}", total);
        }

        Commands::Import => {
            require_api_key(&config);
            run_import(&build_service(&config)).await;
        }

        Commands::Stop => {
            build_service(&config)
                .stop()
                .unwrap_or_else(|e| fail("Error stopping crawl", e));
            println!("Crawl status reset.");
        }

        Commands::Status { format } => {
            let status = StatusBoard::read_persisted(&config.state_dir).unwrap_or_else(|e| {
                log::error!("Error reading crawl status: {}", e);
                process::exit(1);
            });
            match format {
                OutputFormat::Json => serialize_json(&status),
                OutputFormat::Text => println!("{}", status),
            }
        }

        Commands::Jobs {
            status,
            limit,
            format,
        } => {
            let listing = build_service(&config)
                .jobs(status, limit)
                .unwrap_or_else(|e| fail("Error listing jobs", e));
            match format {
                OutputFormat::Json => serialize_json(&listing),
                OutputFormat::Text => {
                    if listing.jobs.is_empty() {
                        println!("No jobs to display.");
                    } else {
                        for job in &listing.jobs {
                            println!("{}", job);
                        }
                        println!("Showing {} of {} job(s)", listing.jobs.len(), listing.total);
                    }
                    if let Some(current) = &listing.current {
                        println!("Running: job #{}", current.id);
                    }
                }
            }
        }

        Commands::History {
            institution_code,
            format,
        } => {
            let timeline = build_service(&config)
                .history(&institution_code)
                .unwrap_or_else(|e| fail("Error loading history", e));
            match format {
                OutputFormat::Json => serialize_json(&timeline),
                OutputFormat::Text => {
                    println!("{}", timeline.institution);
                    if timeline.history.is_empty() {
                        println!("No recorded changes.");
                    }
                    for entry in &timeline.history {
                        println!("  {}", entry);
                    }
                }
            }
        }

        Commands::BackfillCoordinates { limit } => {
            require_api_key(&config);
            let summary = build_service(&config)
                .backfill_coordinates(limit)
                .await
                .unwrap_or_else(|e| fail("Error backfilling coordinates", e));
            println!("{}", summary);
        }
    }
}
