//! sqt: run SQL against PostgreSQL from the terminal
//!
//! # Usage
//!
//! ```bash
//! # Blocking execute
//! sqt "select * from users" -c "host=localhost user=app" -d shop
//!
//! # Offloaded execute, Ctrl+C cancels
//! sqt "select * from big_table" --async
//!
//! # Parameters
//! sqt "select * from users where id = \$1" --bind 42
//!
//! # Wait for notifications
//! sqt listen jobs
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use sqt::config::Config;
use sqt::prelude::*;
use sqt::types::Alignment;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqt")]
#[command(author = "sqt contributors")]
#[command(version)]
#[command(about = "Asynchronous PostgreSQL client", long_about = None)]
#[command(after_help = "EXAMPLES:
    sqt 'select now()' -c 'host=/var/run/postgresql'
    sqt 'select * from orders where user_id = $1' --bind 42 --limit 10
    sqt 'select pg_sleep(60)' --async
    sqt info -p prod")]
struct Cli {
    /// The SQL command to run
    query: Option<String>,

    /// Connection string (key=value pairs or postgres:// URI)
    #[arg(short, long, env = "SQT_CONNECTION")]
    conn: Option<String>,

    /// Connection profile from the configuration file
    #[arg(short, long)]
    profile: Option<String>,

    /// Database to connect to
    #[arg(short, long)]
    database: Option<String>,

    /// Run the command on a worker task and stream progress
    #[arg(long = "async")]
    run_async: bool,

    /// Append a row limit to the command
    #[arg(short, long)]
    limit: Option<u32>,

    /// Parameter bindings ($1, $2, etc.)
    #[arg(short, long, value_delimiter = ',')]
    bind: Vec<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show server version and settings
    Info,
    /// LISTEN on a channel and print notifications until Ctrl+C
    Listen {
        /// Channel name
        channel: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "sqt=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Connection string and database from flags, environment and profile.
fn resolve_target(cli: &Cli) -> Result<(String, String)> {
    let config = Config::load().context("loading configuration")?;
    let profile = config.profile(cli.profile.as_deref())?;

    let conn_str = cli
        .conn
        .clone()
        .or_else(|| profile.map(|p| p.conninfo.clone()))
        .unwrap_or_default();
    let database = cli
        .database
        .clone()
        .or_else(|| profile.and_then(|p| p.database.clone()))
        .unwrap_or_default();
    Ok((conn_str, database))
}

async fn run(cli: &Cli) -> Result<bool> {
    let (conn_str, database) = resolve_target(cli)?;
    if cli.verbose {
        let shown = if conn_str.is_empty() { "(defaults)" } else { conn_str.as_str() };
        eprintln!("{} {}", "Connecting to:".dimmed(), shown);
    }
    let conn = sqt::connect(Backend::Postgres, &conn_str, &database);

    match &cli.command {
        Some(Commands::Info) => show_info(conn),
        Some(Commands::Listen { channel }) => listen(conn, channel, cli).await,
        None => {
            let Some(query) = &cli.query else {
                println!("{}", "sqt: asynchronous PostgreSQL client".cyan().bold());
                println!();
                println!("Usage: sqt <QUERY> [OPTIONS]");
                println!();
                println!("Try: sqt --help");
                return Ok(true);
            };
            let params = parse_bindings(&cli.bind);
            if cli.run_async {
                execute_offloaded(conn, query, params, cli).await
            } else {
                execute_blocking(conn, query, &params, cli)
            }
        }
    }
}

/// Numbers and booleans are bound as such, everything else as text.
fn parse_bindings(bindings: &[String]) -> Vec<Value> {
    bindings
        .iter()
        .map(|binding| {
            if let Ok(n) = binding.parse::<i64>() {
                Value::BigInt(n)
            } else if let Ok(f) = binding.parse::<f64>() {
                Value::Float(f)
            } else if binding == "true" {
                Value::Bool(true)
            } else if binding == "false" {
                Value::Bool(false)
            } else if binding.eq_ignore_ascii_case("null") {
                Value::Null
            } else {
                Value::Text(binding.clone())
            }
        })
        .collect()
}

fn show_info(mut conn: Box<dyn DbConnection>) -> Result<bool> {
    let mut events = conn.subscribe();
    let opened = conn.open();
    let ok = print_events(&mut events, false);
    if !opened {
        return Ok(false);
    }
    println!("{}", conn.dbms_info());
    println!("{} {}", "Context:".dimmed(), conn.context().cyan());
    println!(
        "{} {}",
        "Comparable version:".dimmed(),
        conn.dbms_comparable_version()
    );
    Ok(ok)
}

fn execute_blocking(
    mut conn: Box<dyn DbConnection>,
    query: &str,
    params: &[Value],
    cli: &Cli,
) -> Result<bool> {
    let mut events = conn.subscribe();
    if !conn.open() {
        print_events(&mut events, cli.verbose);
        return Ok(false);
    }
    let ok = conn.execute(query, params, cli.limit);
    let clean = print_events(&mut events, cli.verbose);
    if ok {
        print_results(&conn.results(), cli.format);
        if cli.verbose {
            eprintln!(
                "{} {}",
                "Elapsed:".dimmed(),
                sqt::driver::format_elapsed(conn.elapsed())
            );
        }
    }
    conn.close();
    Ok(ok && clean)
}

#[cfg(unix)]
async fn execute_offloaded(
    conn: Box<dyn DbConnection>,
    query: &str,
    params: Vec<Value>,
    cli: &Cli,
) -> Result<bool> {
    if cli.limit.is_some() {
        bail!("--limit is only supported for blocking execution");
    }
    let mut session = Session::new(conn);
    let mut events = session.subscribe();
    if !session.open() {
        print_events(&mut events, cli.verbose);
        return Ok(false);
    }

    let params = (!params.is_empty()).then_some(params);
    let cancel = session.cancel_handle();
    session.execute_async(query, params);

    let mut clean = true;
    let mut cancelled = false;
    loop {
        tokio::select! {
            Some(event) = events.recv() => clean &= print_event(event, cli.verbose),
            _ = session.wait() => break,
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                cancel.cancel();
            }
        }
    }
    clean &= print_events(&mut events, cli.verbose);
    print_results(&session.results(), cli.format);
    session.close().await;
    Ok(clean && !cancelled)
}

#[cfg(not(unix))]
async fn execute_offloaded(
    _conn: Box<dyn DbConnection>,
    _query: &str,
    _params: Vec<Value>,
    _cli: &Cli,
) -> Result<bool> {
    bail!("--async needs a Unix socket reactor")
}

#[cfg(unix)]
async fn listen(conn: Box<dyn DbConnection>, channel: &str, cli: &Cli) -> Result<bool> {
    let mut session = Session::new(conn);
    let mut events = session.subscribe();
    let command = format!("LISTEN \"{}\"", channel.replace('"', "\"\""));
    if !session.open() || !session.execute(&command, &[], None) {
        print_events(&mut events, cli.verbose);
        return Ok(false);
    }
    print_events(&mut events, cli.verbose);
    println!(
        "{} {} {}",
        "Listening on".green(),
        channel.cyan(),
        "(Ctrl+C to stop)".dimmed()
    );

    let mut alive = true;
    while alive {
        tokio::select! {
            Some(event) = events.recv() => {
                print_event(event, cli.verbose);
            }
            served = session.process_idle() => alive = served,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    print_events(&mut events, cli.verbose);
    if !alive {
        bail!("connection closed");
    }
    session.close().await;
    Ok(true)
}

#[cfg(not(unix))]
async fn listen(_conn: Box<dyn DbConnection>, _channel: &str, _cli: &Cli) -> Result<bool> {
    bail!("listen needs a Unix socket reactor")
}

/// Print whatever is queued. False if any of it was an error.
fn print_events(events: &mut UnboundedReceiver<ConnectionEvent>, verbose: bool) -> bool {
    let mut clean = true;
    while let Ok(event) = events.try_recv() {
        clean &= print_event(event, verbose);
    }
    clean
}

fn print_event(event: ConnectionEvent, verbose: bool) -> bool {
    match event {
        ConnectionEvent::Message(text) => eprintln!("{}", text.dimmed()),
        ConnectionEvent::Error(text) => {
            eprintln!("{} {}", "Error:".red().bold(), text.trim_end());
            return false;
        }
        ConnectionEvent::Fetched(table) if verbose => {
            eprintln!("{} table {}: {} rows", "→".cyan(), table.index, table.rows);
        }
        ConnectionEvent::QueryStateChanged(state) if verbose => {
            eprintln!("{} {:?}", "state:".dimmed(), state);
        }
        ConnectionEvent::ContextChanged(context) if verbose => {
            eprintln!("{} {}", "context:".dimmed(), context.cyan());
        }
        _ => {}
    }
    true
}

fn print_results(results: &ResultSets, format: OutputFormat) {
    for table in results.snapshot() {
        if table.column_count() == 0 {
            continue;
        }
        match format {
            OutputFormat::Json => print_json(&table),
            OutputFormat::Table => print_table(&table),
        }
    }
}

fn print_json(table: &DataTable) {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = table
        .rows()
        .iter()
        .map(|row| {
            table
                .columns()
                .iter()
                .zip(row)
                .map(|(column, value)| {
                    let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
                    (column.name.clone(), json)
                })
                .collect()
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows).unwrap_or_default());
}

fn print_table(table: &DataTable) {
    if table.row_count() == 0 {
        println!("{}", "(no results)".dimmed());
        return;
    }

    let columns = table.columns();
    let cells: Vec<Vec<String>> = table
        .rows()
        .iter()
        .map(|row| row.iter().map(ToString::to_string).collect())
        .collect();

    let mut widths: Vec<usize> = columns
        .iter()
        .map(|c| c.name.chars().count().max(c.type_name.len()))
        .collect();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:width$}", c.name, width = *w))
        .collect();
    println!("{}", header.join(" │ ").white().bold());
    let types: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:width$}", c.type_name, width = *w))
        .collect();
    println!("{}", types.join(" │ ").dimmed());

    let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    println!("{}", sep.join("─┼─").dimmed());

    for row in &cells {
        let line: Vec<String> = row
            .iter()
            .zip(columns.iter().zip(&widths))
            .map(|(cell, (column, w))| match column.alignment {
                Alignment::Right => format!("{:>width$}", cell, width = *w),
                Alignment::Left => format!("{:width$}", cell, width = *w),
            })
            .collect();
        println!("{}", line.join(" │ "));
    }

    println!();
    println!("{} row(s) returned", table.row_count().to_string().cyan());
}
