use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlshield::{
    config::Config, seed::seed_users_from_path, DataAccess, FailurePolicy, Query, QueryRunner,
    Schedule, SqliteConnector, Value,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run SQL against SQLite with retries, transactions and caching.")]
struct Cli {
    /// SQLite database file. Overrides DATABASE_PATH.
    #[arg(long, value_name = "PATH", global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one statement and print its rows as JSON.
    Query {
        sql: String,
        /// Positional parameters bound to `?` placeholders.
        params: Vec<String>,
    },
    /// Execute independent statements concurrently; results keep input order.
    Batch {
        #[arg(required = true)]
        sql: Vec<String>,
        /// Cancel the remaining statements on the first failure.
        #[arg(long)]
        fail_fast: bool,
        /// Run each statement as its own task on the worker pool.
        #[arg(long)]
        spawned: bool,
    },
    /// Load users from a CSV file with name,email,age columns.
    Seed { csv: PathBuf },
    /// Stream rows in batches, printing one JSON array per batch.
    Stream {
        sql: String,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut env_map: HashMap<String, String> = std::env::vars().collect();
    if let Some(database) = cli.database {
        env_map.insert("DATABASE_PATH".to_string(), database);
    }
    let config = Config::from_env_map(env_map).context("Configuration error")?;
    let access = DataAccess::<SqliteConnector>::from_config(&config)
        .context("Failed to open audit log")?;

    match cli.command {
        Command::Query { sql, params } => {
            let query = Query::with_params(sql, params.iter().map(|p| parse_param(p)).collect());
            let rows = access.execute(&query).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Batch {
            sql,
            fail_fast,
            spawned,
        } => {
            let runner = QueryRunner::new(Arc::new(access))
                .max_in_flight(config.max_concurrency)
                .failure_policy(if fail_fast {
                    FailurePolicy::FailFast
                } else {
                    FailurePolicy::FailTogether
                })
                .schedule(if spawned {
                    Schedule::Spawned
                } else {
                    Schedule::Cooperative
                });
            let results = runner
                .run_all(sql.into_iter().map(Query::new).collect())
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Seed { csv } => {
            let report = seed_users_from_path(&access, &csv)
                .await
                .with_context(|| format!("Failed to seed from {}", csv.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stream { sql, batch_size } => {
            let mut write_error = None;
            let delivered = access
                .stream_batches(&Query::new(sql), batch_size, |batch| {
                    if write_error.is_none() {
                        match serde_json::to_string(&batch) {
                            Ok(line) => println!("{}", line),
                            Err(e) => write_error = Some(e),
                        }
                    }
                })
                .await?;
            if let Some(e) = write_error {
                return Err(e.into());
            }
            tracing::info!(rows = delivered, "Stream finished");
        }
    }
    Ok(())
}

/// Integers, then floats, then `null`; anything else binds as text.
fn parse_param(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Real(f)
    } else if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else {
        Value::Text(raw.to_string())
    }
}
