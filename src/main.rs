use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scraper::Html;
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use blogwatch::config::Config;
use blogwatch::feed::{check_feed_health, discover_feeds};
use blogwatch::fetch::{Fetch, FetchRequest, HostLimiter, HttpFetcher};
use blogwatch::model::{Post, SelectorTriple};
use blogwatch::monitor::{initialize, run_all, Baseline, LogSink, MonitorContext};
use blogwatch::scrape::{detect, extract_posts, SelectorCandidate};
use blogwatch::storage::{Database, DatabaseError};
use blogwatch::util::validate_url;

/// Get the config directory path (~/.config/blogwatch/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("blogwatch"))
}

#[derive(Parser, Debug)]
#[command(name = "blogwatch", about = "Detect new posts on blogs, with or without feeds")]
struct Args {
    /// Config file (default: ~/.config/blogwatch/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// State database (default: ~/.config/blogwatch/state.db)
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check every configured blog and print the run summary as JSON
    Check,
    /// Record the current newest post of each blog without reporting anything
    Init {
        /// Re-baseline every blog, marking unreported posts as read
        #[arg(long)]
        mark_read: bool,
    },
    /// Propose post selectors for a page
    Detect { url: String },
    /// Show what a selector triple extracts from a page
    TestSelector {
        url: String,
        container: String,
        /// Title selector (default: first heading or link)
        title: Option<String>,
        /// Link selector (default: first link)
        link: Option<String>,
    },
    /// List feed candidates for a site, best first
    Discover { url: String },
    /// Fetch a feed once and report its health
    ValidateFeed { url: String },
    /// Print the stored state of every blog
    Status,
    /// Delete stored state of blogs no longer in the config
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.validate().context("Invalid configuration")?;

    match &args.command {
        Command::Check => {
            let db = open_database(&args, &config_dir).await?;
            check(&config, &db).await
        }
        Command::Init { mark_read } => {
            let db = open_database(&args, &config_dir).await?;
            let baseline = if *mark_read {
                Baseline::MarkAllRead
            } else {
                Baseline::Missing
            };
            init(&config, &db, baseline).await
        }
        Command::Detect { url } => detect_selectors(&config, url).await,
        Command::TestSelector {
            url,
            container,
            title,
            link,
        } => {
            let mut triple = SelectorTriple::with_container(container.as_str());
            if let Some(title) = title {
                triple.title = title.clone();
            }
            if let Some(link) = link {
                triple.link = link.clone();
            }
            test_selector(&config, url, &triple).await
        }
        Command::Discover { url } => discover(&config, url).await,
        Command::ValidateFeed { url } => validate_feed(&config, url).await,
        Command::Status => {
            let db = open_database(&args, &config_dir).await?;
            let states = db
                .list_blog_states()
                .await
                .context("Failed to read blog states")?;
            println!("{}", serde_json::to_string_pretty(&states)?);
            Ok(())
        }
        Command::Prune => {
            let db = open_database(&args, &config_dir).await?;
            prune(&config, &db).await
        }
    }
}

async fn open_database(args: &Args, config_dir: &std::path::Path) -> Result<Database> {
    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => {
            std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
            config_dir.join("state.db")
        }
    };
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    match Database::open(db_path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

fn fetcher(config: &Config) -> Result<HttpFetcher> {
    HttpFetcher::new(&config.user_agent, config.timeout()).context("Failed to build HTTP client")
}

fn monitor_context(config: &Config) -> Result<MonitorContext> {
    let fetcher: Arc<dyn Fetch> = Arc::new(fetcher(config)?);
    Ok(MonitorContext::new(fetcher, config.monitor_settings())
        .with_overrides(config.override_store()))
}

async fn check(config: &Config, db: &Database) -> Result<()> {
    if config.blogs.is_empty() {
        eprintln!("No blogs configured. Add [[blogs]] entries to your config file.");
        return Ok(());
    }

    let ctx = monitor_context(config)?;
    let summary = run_all(&ctx, &config.blogs, db, &LogSink)
        .await
        .context("Run aborted")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn init(config: &Config, db: &Database, baseline: Baseline) -> Result<()> {
    let ctx = monitor_context(config)?;
    let summary = initialize(&ctx, &config.blogs, db, baseline)
        .await
        .context("Initialization aborted")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn prune(config: &Config, db: &Database) -> Result<()> {
    let keep: Vec<String> = config.blogs.iter().map(|b| b.name.clone()).collect();
    let stale: Vec<String> = db
        .list_blog_states()
        .await
        .context("Failed to read blog states")?
        .into_iter()
        .map(|s| s.blog_name)
        .filter(|name| !keep.contains(name))
        .collect();

    let removed = db
        .retain_blogs(&keep)
        .await
        .context("Failed to prune blog states")?;
    for name in &stale {
        println!("Removed {name}");
    }
    println!("Removed state for {} blog(s) no longer configured", removed);
    Ok(())
}

/// Fetches a page the user named on the command line.
async fn fetch_page(config: &Config, url: &str) -> Result<(Url, String)> {
    let url = validate_url(url).context("Refusing to fetch URL")?;
    let response = fetcher(config)?
        .fetch(&FetchRequest::get(url.clone()))
        .await
        .with_context(|| format!("Failed to fetch {url}"))?;
    if !response.status.is_success() {
        anyhow::bail!("{url} answered HTTP {}", response.status);
    }
    let html = String::from_utf8_lossy(&response.body).into_owned();
    Ok((url, html))
}

async fn detect_selectors(config: &Config, url: &str) -> Result<()> {
    let (url, html) = fetch_page(config, url).await?;
    let candidates = candidates_for(&html, &url);
    if candidates.is_empty() {
        eprintln!("No repeated post structure found on {url}");
    }
    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}

fn candidates_for(html: &str, page_url: &Url) -> Vec<SelectorCandidate> {
    detect(&Html::parse_document(html), page_url)
}

async fn test_selector(config: &Config, url: &str, triple: &SelectorTriple) -> Result<()> {
    let (url, html) = fetch_page(config, url).await?;
    let posts = posts_for(&html, &url, triple)
        .with_context(|| format!("Selectors {triple} extracted nothing usable"))?;
    eprintln!("{} post(s) extracted with {triple}", posts.len());
    println!("{}", serde_json::to_string_pretty(&posts)?);
    Ok(())
}

fn posts_for(html: &str, page_url: &Url, triple: &SelectorTriple) -> Result<Vec<Post>> {
    let posts = extract_posts(&Html::parse_document(html), page_url, triple, "test-selector")?;
    Ok(posts)
}

async fn validate_feed(config: &Config, url: &str) -> Result<()> {
    let url = validate_url(url).context("Refusing to fetch URL")?;
    let health = check_feed_health(&fetcher(config)?, &url).await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    if !health.is_healthy() {
        anyhow::bail!("{url} is not a healthy feed");
    }
    Ok(())
}

async fn discover(config: &Config, url: &str) -> Result<()> {
    let site = validate_url(url).context("Refusing to fetch URL")?;
    let fetcher = fetcher(config)?;
    let limiter = HostLimiter::new(config.monitor_settings().request_delay);

    let candidates = discover_feeds(&fetcher, &limiter, &site).await;
    if candidates.is_empty() {
        eprintln!("No feed found for {site}");
    }
    let listed: Vec<serde_json::Value> = candidates
        .iter()
        .map(|c| {
            serde_json::json!({
                "url": c.url.as_str(),
                "title": c.title,
                "tier": c.tier.to_string(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&listed)?);
    Ok(())
}
