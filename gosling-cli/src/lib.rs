//! Command-line front end for gosling.
//!
//! The `gosling` binary runs SQL migrations only. Applications with code migrations build
//! their own binary around [run], passing the [Registry] their migrations were added to:
//!
//! ```no_run
//! use clap::Parser;
//! use gosling_cli::{init_tracing, run, CliArgs};
//!
//! let mut registry = gosling::Registry::new();
//! // my_app::migrations::register(&mut registry)?;
//! let args = CliArgs::parse();
//! init_tracing(args.verbose);
//! run(args, &registry).unwrap();
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use gosling::{
    Collector, Context, Database, Dialect, Directory, Error, MigrationResult,
    MigrationStatus, Provider, Registry, SessionLocker, SourceKind, State, TableLocker,
    DEFAULT_TABLE_NAME,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gosling", version, about = "Database migrations with SQL files and Rust code")]
pub struct CliArgs {
    /// Database driver: sqlite, postgres or mysql
    #[arg(long, env = "GOSLING_DRIVER", global = true)]
    pub driver: Option<String>,

    /// Connection string passed to the driver
    #[arg(long, env = "GOSLING_DBSTRING", global = true, hide_env_values = true)]
    pub dbstring: Option<String>,

    /// Directory holding the migration files
    #[arg(long, env = "GOSLING_MIGRATION_DIR", default_value = ".", global = true)]
    pub dir: PathBuf,

    /// Name of the version table
    #[arg(long, env = "GOSLING_TABLE", default_value = DEFAULT_TABLE_NAME, global = true)]
    pub table: String,

    /// Apply migrations lower than the current version that were never applied
    #[arg(long, global = true)]
    pub allow_missing: bool,

    /// Lock the database while migrating
    #[arg(long, value_enum, default_value_t = LockMode::None, global = true)]
    pub lock: LockMode,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// More log output (-v info, -vv debug, -vvv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Apply all pending migrations
    Up,
    /// Apply pending migrations up to and including VERSION
    UpTo {
        #[arg(value_name = "VERSION")]
        target: i64,
    },
    /// Apply the next pending migration
    UpByOne,
    /// Roll back the most recently applied migration
    Down,
    /// Roll back migrations down to, but not including, VERSION
    DownTo {
        #[arg(value_name = "VERSION")]
        target: i64,
    },
    /// Roll back and re-apply the most recently applied migration
    Redo,
    /// Show which migrations are applied
    Status,
    /// Print the current database version
    Version,
    /// Create a new migration file in the migration directory
    Create {
        /// Short description, used in the file name
        name: String,
        #[arg(value_enum, default_value_t = Template::Sql)]
        kind: Template,
        /// Use the next sequential version instead of a timestamp
        #[arg(short, long)]
        sequential: bool,
    },
    /// Renumber timestamped migrations to sequential versions
    Fix,
    /// Check migration files without connecting to a database
    Validate,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    /// Advisory lock on the migrating connection (postgres, mysql)
    Session,
    /// Lease row in a lock table, on a second connection
    Table,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Sql,
    /// A Rust code migration
    Rs,
}

/// Installs the log subscriber. Logs go to stderr so that stdout stays parseable.
pub fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Runs the parsed command, printing to stdout.
pub fn run(args: CliArgs, registry: &Registry) -> Result<(), Error> {
    let stdout = std::io::stdout();
    execute(args, registry, &mut stdout.lock())
}

/// Runs the parsed command, printing to `out`.
pub fn execute(args: CliArgs, registry: &Registry, out: &mut dyn Write) -> Result<(), Error> {
    match &args.command {
        Commands::Create {
            name,
            kind,
            sequential,
        } => {
            let kind = match kind {
                Template::Sql => SourceKind::Sql,
                Template::Rs => SourceKind::Code,
            };
            let path = gosling::create(&args.dir, name, kind, *sequential)?;
            return print(out, format_args!("gosling: created new file: {}", path.display()));
        }
        Commands::Fix => {
            let renamed = gosling::fix(&args.dir)?;
            if renamed.is_empty() {
                return print(out, format_args!("gosling: no timestamped migrations to fix"));
            }
            for r in &renamed {
                print(
                    out,
                    format_args!("RENAMED {} => {}", r.from.display(), r.to.display()),
                )?;
            }
            return Ok(());
        }
        Commands::Validate => {
            let sources = gosling::validate(Directory::new(&args.dir), registry)?;
            if args.json {
                return print_json(out, &sources);
            }
            for source in &sources {
                print(
                    out,
                    format_args!("{:<5} {:>14} {}", source.kind, source.version, source.path),
                )?;
            }
            return print(
                out,
                format_args!("gosling: {} migrations are valid", sources.len()),
            );
        }
        _ => {}
    }

    let dialect: Dialect = args
        .driver
        .as_deref()
        .ok_or_else(|| Error::Generic("--driver (or GOSLING_DRIVER) is required".to_string()))?
        .parse()?;
    let dbstring = args
        .dbstring
        .as_deref()
        .ok_or_else(|| Error::Generic("--dbstring (or GOSLING_DBSTRING) is required".to_string()))?;

    let catalog = Collector::new()
        .with_fs(Directory::new(&args.dir))
        .with_registry(registry)
        .collect()?;
    let mut provider = Provider::try_new(dialect, catalog)?
        .with_table_name(args.table.clone())
        .with_allow_missing(args.allow_missing);
    provider = match args.lock {
        LockMode::None => provider,
        LockMode::Session => provider.with_locker(SessionLocker::try_new(dialect)?),
        LockMode::Table => provider.with_locker(TableLocker::new(dialect, open(dialect, dbstring)?)),
    };

    let ctx = match args.timeout {
        Some(secs) => Context::new().with_timeout(Duration::from_secs(secs)),
        None => Context::new(),
    };
    let mut conn = open(dialect, dbstring)?;

    tracing::debug!(%dialect, dir = %args.dir.display(), "Connected");

    run_command(&args, &provider, &ctx, &mut conn, out)
}

fn run_command(
    args: &CliArgs,
    provider: &Provider,
    ctx: &Context,
    db: &mut dyn Database,
    out: &mut dyn Write,
) -> Result<(), Error> {
    match &args.command {
        Commands::Up => {
            let results = report(out, args.json, provider.up(ctx, db))?;
            finish(out, args.json, provider, ctx, db, &results)
        }
        Commands::UpTo { target } => {
            let results = report(out, args.json, provider.up_to(ctx, db, *target))?;
            finish(out, args.json, provider, ctx, db, &results)
        }
        Commands::UpByOne => match provider.up_by_one(ctx, db)? {
            Some(result) => {
                print_results(out, args.json, std::slice::from_ref(&result))?;
                finish(out, args.json, provider, ctx, db, &[result])
            }
            None => no_migrations(out, args.json, provider, ctx, db),
        },
        Commands::Down => match provider.down(ctx, db)? {
            Some(result) => {
                print_results(out, args.json, std::slice::from_ref(&result))?;
                finish(out, args.json, provider, ctx, db, &[result])
            }
            None => no_migrations(out, args.json, provider, ctx, db),
        },
        Commands::DownTo { target } => {
            let results = report(out, args.json, provider.down_to(ctx, db, *target))?;
            finish(out, args.json, provider, ctx, db, &results)
        }
        Commands::Redo => {
            let results = report(out, args.json, provider.redo(ctx, db))?;
            finish(out, args.json, provider, ctx, db, &results)
        }
        Commands::Status => {
            let statuses = provider.status(ctx, db)?;
            print_status(out, args.json, &statuses)
        }
        Commands::Version => {
            let version = provider.get_db_version(ctx, db)?;
            if args.json {
                print_json(out, &serde_json::json!({ "version": version }))
            } else {
                print(out, format_args!("gosling: version {}", version))
            }
        }
        Commands::Create { .. } | Commands::Fix | Commands::Validate => Ok(()),
    }
}

/// Prints what a batch applied, including the completed part of a failed batch.
fn report(
    out: &mut dyn Write,
    json: bool,
    outcome: Result<Vec<MigrationResult>, Error>,
) -> Result<Vec<MigrationResult>, Error> {
    match outcome {
        Ok(results) => {
            print_results(out, json, &results)?;
            Ok(results)
        }
        Err(err) => {
            if let Some(partial) = err.as_partial() {
                print_results(out, json, &partial.applied)?;
            }
            Err(err)
        }
    }
}

fn finish(
    out: &mut dyn Write,
    json: bool,
    provider: &Provider,
    ctx: &Context,
    db: &mut dyn Database,
    results: &[MigrationResult],
) -> Result<(), Error> {
    if json {
        return Ok(());
    }
    if results.is_empty() {
        return no_migrations(out, json, provider, ctx, db);
    }
    let version = provider.get_db_version(ctx, db)?;
    print(
        out,
        format_args!(
            "gosling: successfully migrated database to version: {} ({:.2?})",
            version,
            gosling::total_duration(results)
        ),
    )
}

fn no_migrations(
    out: &mut dyn Write,
    json: bool,
    provider: &Provider,
    ctx: &Context,
    db: &mut dyn Database,
) -> Result<(), Error> {
    if json {
        return print_json(out, &Vec::<MigrationResult>::new());
    }
    let version = provider.get_db_version(ctx, db)?;
    print(
        out,
        format_args!("gosling: no migrations to run. current version: {}", version),
    )
}

fn print_results(out: &mut dyn Write, json: bool, results: &[MigrationResult]) -> Result<(), Error> {
    if json {
        return print_json(out, &results);
    }
    for result in results {
        print(out, format_args!("{}", result))?;
    }
    Ok(())
}

fn print_status(out: &mut dyn Write, json: bool, statuses: &[MigrationStatus]) -> Result<(), Error> {
    if json {
        return print_json(out, &statuses);
    }
    print(out, format_args!("    Applied At                  Migration"))?;
    print(out, format_args!("    ======================================="))?;
    for status in statuses {
        let applied = match (status.state, status.applied_at) {
            (State::Applied, Some(at)) => at.format("%a %b %e %H:%M:%S %Y").to_string(),
            (State::Applied, None) => "Applied".to_string(),
            (State::Pending, _) => "Pending".to_string(),
        };
        print(out, format_args!("    {:<24} -- {}", applied, status.source.path))?;
    }
    Ok(())
}

fn print(out: &mut dyn Write, line: std::fmt::Arguments<'_>) -> Result<(), Error> {
    writeln!(out, "{}", line).map_err(|e| Error::Generic(format!("failed to write output: {}", e)))
}

fn print_json<T: serde::Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Generic(format!("failed to encode JSON: {}", e)))?;
    print(out, format_args!("{}", text))
}

/// Opens a connection for `dialect`.
fn open(dialect: Dialect, dbstring: &str) -> Result<Box<dyn Database + Send>, Error> {
    match dialect {
        #[cfg(feature = "sqlite")]
        Dialect::Sqlite => {
            let conn = rusqlite::Connection::open(dbstring)?;
            conn.busy_timeout(Duration::from_secs(30))?;
            Ok(Box::new(conn))
        }
        #[cfg(feature = "postgres")]
        Dialect::Postgres => Ok(Box::new(postgres::Client::connect(dbstring, postgres::NoTls)?)),
        #[cfg(feature = "mysql")]
        Dialect::Mysql => {
            let opts = mysql::Opts::from_url(dbstring).map_err(|e| Error::Mysql(e.to_string()))?;
            Ok(Box::new(mysql::Conn::new(opts)?))
        }
        #[allow(unreachable_patterns)]
        other => Err(Error::Generic(format!(
            "gosling was built without the {} driver",
            other
        ))),
    }
}
