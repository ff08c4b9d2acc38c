use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use proxy_watch::{
    orchestrator::{Api, SessionOptions},
    proxy::{GeoLocator, HttpProber, Probe, ProberConfig, ProxyParser, ProxyScheme, ProxyStatus},
    store::{ProxyStore, SqliteProxyStore, Store},
    tui::SessionMonitorApp,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Proxy pool health dashboard with a parallel check orchestrator
#[derive(Parser)]
#[command(name = "proxy-watch")]
#[command(about = "Track proxy pool health and run parallel check sessions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Database file path
    #[arg(short, long, default_value = "proxywatch.db")]
    database: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a check run and watch it in the interactive TUI
    Watch {
        /// Only check proxies currently recorded as offline
        #[arg(short, long)]
        offline_only: bool,
        /// Concurrency cap on batch workers
        #[arg(short = 'n', long)]
        max_processes: Option<u32>,
        /// Proxies per batch
        #[arg(short, long)]
        batch_size: Option<u32>,
    },
    /// Start a check session and print its id as JSON
    Start {
        /// Only check proxies currently recorded as offline
        #[arg(short, long)]
        offline_only: bool,
        /// Concurrency cap on batch workers
        #[arg(short = 'n', long)]
        max_processes: Option<u32>,
        /// Proxies per batch
        #[arg(short, long)]
        batch_size: Option<u32>,
    },
    /// Poll a session's progress once and print it as JSON
    Progress {
        /// Session ID
        session_id: String,
    },
    /// Cancel a running session
    Cancel {
        /// Session ID
        session_id: String,
    },
    /// Start a check run and poll it to completion, printing progress
    Run {
        /// Only check proxies currently recorded as offline
        #[arg(short, long)]
        offline_only: bool,
        /// Concurrency cap on batch workers
        #[arg(short = 'n', long)]
        max_processes: Option<u32>,
        /// Proxies per batch
        #[arg(short, long)]
        batch_size: Option<u32>,
    },
    /// Check one or a few proxies right now, without a session
    Check {
        /// Proxies to check: stored proxy ids, or ad-hoc IP:PORT lines
        #[arg(required = true)]
        targets: Vec<String>,
        /// Proxy scheme for ad-hoc targets (http, https, socks4, socks5)
        #[arg(short = 't', long, default_value = "http")]
        scheme: String,
        /// Timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        /// URL to fetch through the proxy
        #[arg(long, default_value = "http://httpbin.org/ip")]
        test_url: String,
    },
    /// Import proxies from a text file into the store
    Import {
        /// Input file containing proxies, one per line
        input: PathBuf,
        /// Default scheme for lines without one (http, https, socks4, socks5)
        #[arg(short = 't', long, default_value = "http")]
        scheme: String,
        /// MMDB file for country annotation
        #[arg(long)]
        mmdb: Option<PathBuf>,
    },
    /// List stored proxies and their health
    List {
        /// Show only online proxies
        #[arg(long)]
        online: bool,
        /// Show only offline proxies
        #[arg(long)]
        offline: bool,
    },
    /// List proxies that failed at least N checks in a row
    Failing {
        /// Consecutive-failure threshold
        #[arg(short = 'c', long, default_value = "3")]
        threshold: u32,
    },
}

fn session_options(
    offline_only: bool,
    max_processes: Option<u32>,
    batch_size: Option<u32>,
) -> SessionOptions {
    let mut opts = if offline_only {
        SessionOptions::offline_only()
    } else {
        SessionOptions::full_run()
    };
    if let Some(max_processes) = max_processes {
        opts = opts.with_max_processes(max_processes);
    }
    if let Some(batch_size) = batch_size {
        opts = opts.with_batch_size(batch_size);
    }
    opts
}

fn parse_scheme(s: &str) -> Result<ProxyScheme> {
    ProxyScheme::parse(s)
        .ok_or_else(|| anyhow!("Invalid proxy scheme: {}. Use: http, https, socks4, socks5", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let store = Store::open(&cli.database).await?;
    store.migrate().await?;
    let pool = store.pool().clone();

    match cli.command {
        Some(Commands::Watch {
            offline_only,
            max_processes,
            batch_size,
        }) => {
            let api = Api::new(pool, Arc::new(HttpProber::new()));
            let opts = session_options(offline_only, max_processes, batch_size);
            let mut app = SessionMonitorApp::new(api, opts);
            app.run().await?;
        }
        None => {
            // Default to watching a full run
            let api = Api::new(pool, Arc::new(HttpProber::new()));
            let mut app = SessionMonitorApp::new(api, SessionOptions::full_run());
            app.run().await?;
        }
        Some(Commands::Start {
            offline_only,
            max_processes,
            batch_size,
        }) => {
            let api = Api::new(pool, Arc::new(HttpProber::new()));
            let reply = api
                .start(session_options(offline_only, max_processes, batch_size))
                .await;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Some(Commands::Progress { session_id }) => {
            let api = Api::new(pool, Arc::new(HttpProber::new()));
            let reply = api.progress(&session_id).await;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Some(Commands::Cancel { session_id }) => {
            let api = Api::new(pool, Arc::new(HttpProber::new()));
            let reply = api.cancel(&session_id).await;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Some(Commands::Run {
            offline_only,
            max_processes,
            batch_size,
        }) => {
            let api = Api::new(pool, Arc::new(HttpProber::new()));
            let reply = api
                .start(session_options(offline_only, max_processes, batch_size))
                .await;
            if !reply.success {
                return Err(anyhow!(
                    "start failed: {}",
                    reply.error.unwrap_or_else(|| "unknown error".to_string())
                ));
            }
            let Some(session_id) = reply.session_id else {
                println!("No matching proxies to check.");
                return Ok(());
            };

            println!(
                "Session {}: {} proxies in {} batches",
                session_id, reply.total_proxies, reply.total_batches
            );

            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let reply = api.progress(&session_id).await;
                let Some(view) = reply.progress else {
                    return Err(anyhow!(
                        "progress failed: {}",
                        reply.error.unwrap_or_else(|| "unknown error".to_string())
                    ));
                };

                println!(
                    "{:>3}% | checked {}/{} | online {} | offline {} | batches {}/{} ({} active)",
                    view.overall_progress,
                    view.total_checked,
                    view.total_proxies,
                    view.total_online,
                    view.total_offline,
                    view.completed_batches,
                    view.total_batches,
                    view.active_batches,
                );

                if view.is_finished {
                    if view.is_complete {
                        println!("Run complete.");
                    } else if view.cancelled {
                        println!("Run cancelled.");
                    } else {
                        println!("Run finished; {} batches failed.", view.failed_batches);
                    }
                    break;
                }
            }
        }
        Some(Commands::Check {
            targets,
            scheme,
            timeout,
            test_url,
        }) => {
            let proxies = SqliteProxyStore::new(pool);
            let config = ProberConfig::new()
                .with_timeout(Duration::from_secs(timeout))
                .with_test_url(test_url);
            let prober = HttpProber::with_config(config);
            let default_scheme = parse_scheme(&scheme)?;

            // A bare integer is a stored proxy id; anything else is an
            // ad-hoc proxy line. Ad-hoc results are not persisted.
            let mut resolved = Vec::with_capacity(targets.len());
            let mut stored_ids = std::collections::HashSet::new();
            for (n, raw) in targets.iter().enumerate() {
                match raw.parse::<i64>() {
                    Ok(id) => {
                        let record = proxies
                            .get(id)
                            .await?
                            .ok_or_else(|| anyhow!("No proxy with id {}", id))?;
                        stored_ids.insert(id);
                        resolved.push(record.target());
                    }
                    Err(_) => {
                        let parsed = ProxyParser::parse_line(raw, default_scheme)
                            .ok_or_else(|| anyhow!("Could not parse proxy: {}", raw))?;
                        // Negative ids keep ad-hoc targets distinct from rows
                        resolved.push(proxy_watch::ProxyTarget {
                            id: -(n as i64) - 1,
                            host: parsed.host,
                            port: parsed.port,
                            scheme: parsed.scheme,
                            auth: parsed.auth,
                        });
                    }
                }
            }

            let addrs: std::collections::HashMap<i64, String> =
                resolved.iter().map(|t| (t.id, t.addr())).collect();

            println!("Checking {} proxies ...", resolved.len());
            let results = prober.probe_many(resolved).await;

            for result in results {
                if stored_ids.contains(&result.proxy_id) {
                    proxies.record_result(&result).await?;
                }
                let addr = addrs
                    .get(&result.proxy_id)
                    .map(String::as_str)
                    .unwrap_or("?");
                match result.status {
                    ProxyStatus::Online => println!(
                        "{addr}  online ({}ms)",
                        result.response_time_ms.unwrap_or_default()
                    ),
                    _ => println!(
                        "{addr}  offline: {}",
                        result.error.unwrap_or_else(|| "unknown error".to_string())
                    ),
                }
            }
        }
        Some(Commands::Import {
            input,
            scheme,
            mmdb,
        }) => {
            let proxies = SqliteProxyStore::new(pool);
            let parsed = ProxyParser::parse_file(&input, parse_scheme(&scheme)?)?;
            println!("Parsed {} proxies from {:?}", parsed.len(), input);

            let added = proxies.import(&parsed).await?;
            println!("Added {} new proxies ({} duplicates)", added, parsed.len() as u64 - added);

            if let Some(mmdb_path) = mmdb {
                let locator = GeoLocator::open(&mmdb_path)?;
                let mut annotated = 0;
                for record in proxies.list(None).await? {
                    if record.country_code.is_some() {
                        continue;
                    }
                    if let Some(info) = locator.lookup(&record.host)? {
                        if let Some(country) = info.country_code {
                            proxies.set_country(record.id, &country).await?;
                            annotated += 1;
                        }
                    }
                }
                println!("Annotated {} proxies with a country", annotated);
            }
        }
        Some(Commands::List { online, offline }) => {
            let proxies = SqliteProxyStore::new(pool);
            let status = if online {
                Some(ProxyStatus::Online)
            } else if offline {
                Some(ProxyStatus::Offline)
            } else {
                None
            };

            let records = proxies.list(status).await?;
            if records.is_empty() {
                println!("No proxies found.");
            } else {
                for record in records {
                    let latency = record
                        .response_time_ms
                        .map(|ms| format!("{}ms", ms))
                        .unwrap_or_else(|| "-".to_string());
                    let country = record.country_code.as_deref().unwrap_or("--");
                    println!(
                        "{:>5}  {:<21} {:<7} {:<9} {:>7}  {}",
                        record.id,
                        format!("{}:{}", record.host, record.port),
                        record.scheme.as_str(),
                        record.status.as_str(),
                        latency,
                        country,
                    );
                }
            }
        }
        Some(Commands::Failing { threshold }) => {
            let proxies = SqliteProxyStore::new(pool);
            let records = proxies.failing_consecutively(threshold).await?;
            if records.is_empty() {
                println!("No proxies failing {} checks in a row.", threshold);
            } else {
                for record in records {
                    println!(
                        "{:>5}  {}:{}  {} consecutive failures  last error: {}",
                        record.id,
                        record.host,
                        record.port,
                        record.consecutive_failures,
                        record.last_error.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
    }

    Ok(())
}
