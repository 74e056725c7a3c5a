//! Signalbot CLI
//!
//! Scans markets for multi-timeframe confluence, manages the approval
//! lifecycle of generated signals, and runs the live position session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::info;

use signalbot::lifecycle::TransitionOutcome;
use signalbot::logging::init_tracing;
use signalbot::models::{Regime, SignalStatus, Timeframe};
use signalbot::{Bot, EngineConfig};

const DEFAULT_DATABASE: &str = "sqlite:./signalbot.db?mode=rwc";

/// Leveraged-trading decision engine CLI.
#[derive(Parser)]
#[command(name = "signalbot")]
#[command(about = "Multi-timeframe signal engine with human-approved trade proposals", long_about = None)]
struct Cli {
    /// Database URL (defaults to SIGNALBOT_DATABASE, then ./signalbot.db)
    #[arg(short, long)]
    database: Option<String>,

    /// JSON configuration file
    #[arg(short, long, env = "SIGNALBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Read market data from a JSON fixture file instead of the HTTP services
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan symbols and show fused signals and proposals
    Scan {
        /// Symbols to scan (comma separated, defaults to config)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Timeframes to analyze, e.g. 15m,1h,4h,1d
        #[arg(short, long, value_delimiter = ',')]
        timeframes: Vec<Timeframe>,

        /// Persist a PENDING signal for every proposal
        #[arg(short, long)]
        generate: bool,
    },

    /// Run the live session until Ctrl+C
    Run {
        /// Line-delimited position stream, '-' for stdin
        #[arg(short, long)]
        feed: Option<String>,

        /// Scan and generate signals every N seconds
        #[arg(long)]
        scan_every: Option<u64>,
    },

    /// Replay a recorded position stream through the engine
    Replay {
        /// Line-delimited position stream file
        file: PathBuf,
    },

    /// List signals
    Signals {
        /// Only signals with this status
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of signals to show
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Approve a PENDING signal
    Approve {
        id: String,

        #[arg(short, long)]
        actor: String,
    },

    /// Reject a PENDING signal
    Reject {
        id: String,

        #[arg(short, long)]
        actor: String,

        #[arg(short, long)]
        reason: String,
    },

    /// Mark an APPROVED signal as executed
    Execute {
        id: String,

        #[arg(short, long)]
        actor: String,
    },

    /// Expire PENDING signals older than the TTL
    Expire,

    /// Show the weight profile for each regime
    Weights {
        /// Only this regime
        #[arg(short, long)]
        regime: Option<String>,
    },

    /// Run one learning cycle and show the learned statistics
    Learn,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level)?;

    let config = EngineConfig::load(cli.config.as_deref())?;

    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let database = cli
        .database
        .clone()
        .or_else(|| config.database_url.clone())
        .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
    let bot = Bot::connect(config, &database, cli.fixtures.as_deref()).await?;

    match cli.command {
        Commands::Scan {
            symbols,
            timeframes,
            generate,
        } => {
            if generate {
                let outcomes = bot.scan_and_generate(&symbols, &timeframes).await?;
                print_scan(outcomes.iter().map(|o| (&o.result, o.signal.as_ref().map(|s| s.id.as_str()))));
            } else {
                let results = bot.scan(&symbols, &timeframes).await;
                print_scan(results.iter().map(|r| (r, None)));
            }
        }

        Commands::Run { feed, scan_every } => {
            let reader = match feed.as_deref() {
                Some(path) => Some(open_feed(path).await?),
                None => None,
            };

            println!("\n=== Signalbot ===");
            println!("Symbols:        {}", bot.config().scan.symbols.join(", "));
            println!("Feed:           {}", feed.as_deref().unwrap_or("none"));
            match scan_every {
                Some(secs) => println!("Scan interval:  {secs}s"),
                None => println!("Scan interval:  off"),
            }
            println!("\nPress Ctrl+C to stop.\n");

            let bot = Arc::new(bot);
            bot.clone().run(reader, scan_every.map(Duration::from_secs)).await?;

            let open = bot.get_all_positions().into_iter().filter(|p| p.is_open()).count();
            println!("\nOpen positions at shutdown: {open}");
        }

        Commands::Replay { file } => {
            let reader = open_file(&file).await?;
            let summary = bot.replay(reader).await?;

            println!("\n=== Replay: {} ===", file.display());
            println!("Lines:      {}", summary.feed.lines);
            println!("Applied:    {}", summary.feed.applied);
            println!("Stale:      {}", summary.feed.stale);
            println!("Malformed:  {}", summary.feed.malformed);

            if !summary.actions.is_empty() {
                println!("\n--- Exit Actions ({}) ---", summary.actions.len());
                for action in &summary.actions {
                    println!("  {action:?}");
                }
            }
            if !summary.recorded.is_empty() {
                println!("\n--- Recorded Outcomes ({}) ---", summary.recorded.len());
                for r in &summary.recorded {
                    println!("  {:<12} {:<10} {:>12} {}", r.symbol, r.outcome.as_str(), r.pnl, r.key);
                }
            }

            println!("\n--- Positions ---");
            for pos in bot.get_all_positions() {
                println!(
                    "  {:<12} {:<6} size {:<12} entry {:<12} stop {}",
                    pos.symbol,
                    pos.side.as_str(),
                    pos.size,
                    pos.entry_price,
                    pos.strategy_stop_price.map(|s| s.to_string()).unwrap_or_else(|| "-".into())
                );
            }
        }

        Commands::Signals { status, limit } => {
            let status = status
                .as_deref()
                .map(str::parse::<SignalStatus>)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let signals = bot.list_signals(status, limit).await?;

            if signals.is_empty() {
                println!("No signals found. Use 'signalbot scan --generate' to create some.");
                return Ok(());
            }

            println!(
                "\n{:<36} {:<12} {:<5} {:<9} {:>12} {:>4} {:>6} {:<10}",
                "ID", "SYMBOL", "TYPE", "STATUS", "ENTRY", "LEV", "CONF", "BY"
            );
            println!("{}", "-".repeat(104));
            for s in signals {
                println!(
                    "{:<36} {:<12} {:<5} {:<9} {:>12} {:>3}x {:>5.1}% {:<10}",
                    s.id,
                    truncate(&s.symbol, 12),
                    s.signal_type.as_str(),
                    s.status.as_str(),
                    s.entry_price,
                    s.leverage,
                    s.confidence * 100.0,
                    truncate(s.processed_by.as_deref().unwrap_or("-"), 10)
                );
            }

            let counts = bot.database().count_by_status().await?;
            let summary: Vec<String> = counts.iter().map(|(s, n)| format!("{s}: {n}")).collect();
            println!("\nTotals: {}", summary.join(", "));
        }

        Commands::Approve { id, actor } => {
            report(&id, bot.approve(&id, &actor).await?);
        }

        Commands::Reject { id, actor, reason } => {
            report(&id, bot.reject(&id, &actor, &reason).await?);
        }

        Commands::Execute { id, actor } => {
            report(&id, bot.execute(&id, &actor).await?);
        }

        Commands::Expire => {
            let expired = bot.expire_stale().await?;
            println!("Expired {} signal(s)", expired.len());
            for s in expired {
                println!("  {} {} generated {}", s.id, s.symbol, s.generated_at.to_rfc3339());
            }
        }

        Commands::Weights { regime } => {
            let regimes = match regime {
                Some(r) => vec![r.parse::<Regime>().map_err(anyhow::Error::msg)?],
                None => Regime::ALL.to_vec(),
            };

            println!(
                "\n{:<12} {:>10} {:>10} {:>10} {:>8}",
                "REGIME", "TECHNICAL", "AI", "SENTIMENT", "VERSION"
            );
            println!("{}", "-".repeat(54));
            for regime in regimes {
                let w = bot.current_weights(regime);
                println!(
                    "{:<12} {:>10.3} {:>10.3} {:>10.3} {:>8}",
                    regime.as_str(),
                    w.technical(),
                    w.ai(),
                    w.sentiment(),
                    w.version()
                );
            }
        }

        Commands::Learn => {
            let snapshot = bot.run_learning_cycle().await?;
            info!(version = snapshot.version, "Learning cycle complete");

            println!("\n=== Performance Snapshot v{} ===", snapshot.version);

            let mut keys: Vec<_> = snapshot.by_key.iter().collect();
            keys.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
            println!("\n{:<36} {:>8} {:>6} {:>6} {:>12}", "KEY", "SAMPLES", "WINS", "WIN%", "P&L");
            println!("{}", "-".repeat(72));
            for (key, stats) in keys {
                println!(
                    "{:<36} {:>8} {:>6} {:>5.1}% {:>12}",
                    truncate(&key.to_string(), 36),
                    stats.samples,
                    stats.wins,
                    stats.win_rate * 100.0,
                    stats.total_pnl
                );
            }

            println!("\n--- Strategies ---");
            for (name, s) in &snapshot.strategies {
                println!("{name}:");
                println!("  Samples:        {}", s.samples);
                println!("  Win Prob:       {:.1}%", s.win_probability * 100.0);
                println!("  Payoff Ratio:   {:.2}", s.payoff_ratio);
                println!("  Profit Factor:  {:.2}", s.profit_factor);
                println!("  Sharpe Ratio:   {:.2}", s.sharpe_ratio);
            }
        }

        Commands::Config => {}
    }

    Ok(())
}

fn print_scan<'a>(rows: impl Iterator<Item = (&'a signalbot::trading::ScanResult, Option<&'a str>)>) {
    println!(
        "\n{:<12} {:<8} {:<10} {:>7} {:>6} {:>10} {:>4} {:<36}",
        "SYMBOL", "DIR", "REGIME", "CONFL", "CONF", "QTY", "LEV", "SIGNAL"
    );
    println!("{}", "-".repeat(100));

    let mut notes = Vec::new();
    for (r, signal_id) in rows {
        match &r.fused {
            Some(f) => {
                let (qty, lev) = r
                    .proposal
                    .as_ref()
                    .map(|p| (p.quantity.to_string(), format!("{}x", p.leverage)))
                    .unwrap_or_else(|| ("-".into(), "-".into()));
                println!(
                    "{:<12} {:<8} {:<10} {:>6.1}% {:>5.1}% {:>10} {:>4} {:<36}",
                    r.symbol,
                    f.direction.to_string(),
                    f.regime.as_str(),
                    f.confluence_ratio * 100.0,
                    f.confidence * 100.0,
                    qty,
                    lev,
                    signal_id.unwrap_or("-")
                );
            }
            None => println!("{:<12} {:<8}", r.symbol, "-"),
        }
        for note in &r.notes {
            notes.push(format!("{}: {note}", r.symbol));
        }
        if let Some(p) = &r.proposal {
            notes.push(format!("{}: {}", r.symbol, p.rationale));
        }
    }

    if !notes.is_empty() {
        println!("\n--- Notes ---");
        for note in notes {
            println!("  {note}");
        }
    }
}

fn report(id: &str, outcome: TransitionOutcome) {
    match outcome {
        TransitionOutcome::Applied(s) => println!(
            "{} -> {} by {}",
            s.id,
            s.status,
            s.processed_by.as_deref().unwrap_or("-")
        ),
        TransitionOutcome::Conflict { current } => {
            println!("{id}: not applied, signal is already {current}")
        }
        TransitionOutcome::Illegal { from, to } => {
            println!("{id}: {from} -> {to} is not a valid transition")
        }
        TransitionOutcome::NotFound => println!("{id}: no such signal"),
    }
}

type FeedReader = Box<dyn AsyncBufRead + Unpin + Send>;

async fn open_feed(path: &str) -> Result<FeedReader> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    open_file(Path::new(path)).await
}

async fn open_file(path: &Path) -> Result<FeedReader> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
