use clap::{Args as ClapArgs, Parser, Subcommand};
use netstat_dash::config::{self, Config};
use netstat_dash::{ConnectionFilter, FilterState, Page, Store, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netstat-dash")]
#[command(author, version, about = "Dashboard for netstat connection snapshots")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// YAML config file (default: ./netstat-dash.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (overrides config)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the dashboard server (default)
    Serve {
        /// Address to bind
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of request worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Open the dashboard in a browser
        #[arg(long)]
        open: bool,

        /// Don't create the table if it is missing
        #[arg(long)]
        no_migrate: bool,
    },

    /// Database operations
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

#[derive(Subcommand, Debug)]
enum DbAction {
    /// Create the connections table and its indexes
    Migrate,

    /// Test the connection and the table structure
    Check,

    /// Show distinct values for each filter
    Filters,

    /// List connections, newest first
    List {
        #[command(flatten)]
        filters: FilterArgs,

        /// Page number (1-based)
        #[arg(long, default_value = "1")]
        page: i64,

        /// Rows per page
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Connection counts per remote IP, server and port
    Stats {
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Top (server, remote IP) pairs
    Pairs {
        #[command(flatten)]
        filters: FilterArgs,

        /// Number of pairs to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct FilterArgs {
    /// Server name (repeatable)
    #[arg(long = "server")]
    servers: Vec<String>,

    /// Local IP address
    #[arg(long)]
    local_ip: Option<String>,

    /// Remote IP address
    #[arg(long)]
    remote_ip: Option<String>,

    /// Remote port (repeatable)
    #[arg(long = "port")]
    ports: Vec<String>,

    /// First day to include (YYYY-MM-DD)
    #[arg(long)]
    date_from: Option<String>,

    /// Last day to include (YYYY-MM-DD)
    #[arg(long)]
    date_to: Option<String>,
}

impl FilterArgs {
    /// Build the filter the same way the dashboard's filter bar does.
    fn to_state(&self, page: i64, limit: i64) -> FilterState {
        let mut state = FilterState::default();
        for s in &self.servers {
            state.servers.select(s);
        }
        for p in &self.ports {
            state.ports.select(p);
        }
        if let Some(ref ip) = self.local_ip {
            state.local_ip.set(ip);
        }
        if let Some(ref ip) = self.remote_ip {
            state.remote_ip.set(ip);
        }
        state.date_from = self.date_from.clone();
        state.date_to = self.date_to.clone();
        state.page = page;
        state.limit = limit;
        state
    }

    fn resolve(&self, page: i64, limit: i64) -> (ConnectionFilter, Page) {
        let raw = self.to_state(page, limit).to_raw_query();
        let filter = ConnectionFilter::from_query(&raw).unwrap_or_else(|e| fail(&e.to_string()));
        let page = Page::from_query(&raw, limit).unwrap_or_else(|e| fail(&e.to_string()));
        (filter, page)
    }
}

fn main() {
    let args = Args::parse();

    let mut config = match config::load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(ref db) = args.db {
        config.database.database = db.to_string_lossy().to_string();
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }

    init_logging(&config.log_level);

    let ignored = config.database.ignored_options();
    if !ignored.is_empty() {
        tracing::warn!("sqlite backend ignores database options: {}", ignored.join(", "));
    }

    match args.command {
        Some(Command::Db { action }) => handle_db_action(action, &config),
        Some(Command::Serve { bind, port, workers, open, no_migrate }) => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(workers) = workers {
                config.server.workers = workers;
            }
            serve(&config, open, no_migrate);
        }
        None => serve(&config, false, false),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn serve(config: &Config, open: bool, no_migrate: bool) {
    let store = open_store(config);

    if !no_migrate {
        if let Err(e) = store.migrate() {
            fail(&format!("Migration failed: {}", e));
        }
    }

    eprintln!("\n\x1b[1;32mnetstat-dash\x1b[0m");
    eprintln!("   http://{}", config.server.addr());
    eprintln!("   Database: {}\n", config.database.database);

    if let Err(e) = netstat_dash::serve::start(config, store, open) {
        fail(&format!("Server error: {}", e));
    }
}

fn open_store(config: &Config) -> Store {
    match Store::open(&config.database) {
        Ok(store) => store,
        Err(e) => fail(&format!("Failed to open database: {}", e)),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("{}", message);
    std::process::exit(1);
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(&format!("Error serializing result: {}", e)),
    }
}

fn handle_db_action(action: DbAction, config: &Config) {
    let store = open_store(config);

    match action {
        DbAction::Migrate => match store.migrate() {
            Ok(()) => println!("Migrated {}", config.database.database),
            Err(e) => fail(&format!("Error: {}", e)),
        },

        DbAction::Check => check(&store, config),

        DbAction::Filters => match store.filter_vocabulary() {
            Ok(vocab) => print_json(&vocab),
            Err(e) => fail(&format!("Error: {}", e)),
        },

        DbAction::List { filters, page, limit } => {
            let (filter, page) = filters.resolve(page, limit);
            match store.list_connections(&filter, page) {
                Ok(result) => print_json(&result),
                Err(e) => fail(&format!("Error: {}", e)),
            }
        }

        DbAction::Stats { filters } => {
            let (filter, _) = filters.resolve(1, 1);
            match store.dimension_stats(&filter) {
                Ok(stats) => print_json(&stats),
                Err(e) => fail(&format!("Error: {}", e)),
            }
        }

        DbAction::Pairs { filters, limit } => {
            let (filter, page) = filters.resolve(1, limit);
            match store.pair_stats(&filter, page.limit) {
                Ok(pairs) => print_json(&pairs),
                Err(e) => fail(&format!("Error: {}", e)),
            }
        }
    }
}

fn check(store: &Store, config: &Config) {
    println!("Connection settings:");
    println!("  {}", config.database.describe());
    println!("\nTesting connection...");

    match store.server_version() {
        Ok(version) => println!("OK: connected (SQLite {})", version),
        Err(e) => {
            eprintln!("Error: could not connect: {}", e);
            eprintln!("Hint: check that the path in `database` is readable.");
            std::process::exit(1);
        }
    }

    match store.verify_schema() {
        Ok(()) => println!("OK: table structure"),
        Err(e @ StoreError::Structure { .. }) => {
            eprintln!("Error: {}", e);
            eprintln!("Hint: run `netstat-dash db migrate` to create the table.");
            std::process::exit(1);
        }
        Err(e) => fail(&format!("Error: {}", e)),
    }

    match store.row_count() {
        Ok(n) => println!("OK: {} connection rows", n),
        Err(e) => fail(&format!("Error: {}", e)),
    }
}
