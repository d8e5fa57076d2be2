//! Command-line driver: discovers input files, wires the recovery engine
//! together, and forwards commits to the selected exporters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use sqlite_scour::commit::VersionHistoryParser;
use sqlite_scour::export::{CommitSink, CsvExporter, ExportContext, TextExporter};
use sqlite_scour::schema::{MasterSchema, MasterSchemaEntry};
use sqlite_scour::signature::Signature;
use sqlite_scour::version::Version;
use sqlite_scour::{companion_paths, Database, RollbackJournal, RollbackJournalCarver, Wal};

#[derive(Parser)]
#[command(name = "sqlite-scour", about = "Recover live and deleted records from SQLite files")]
struct Args {
    /// Database file, or a directory to scan with --directory.
    path: PathBuf,

    /// Treat the positional path as a directory and process every SQLite
    /// file inside it.
    #[arg(long)]
    directory: bool,

    /// Only process files whose name starts with this prefix.
    #[arg(long)]
    file_prefix: Option<String>,

    /// Export formats to produce.
    #[arg(long, value_enum, num_args = 0..)]
    export: Vec<ExportKind>,

    /// Path to a write-ahead log; discovered automatically when omitted.
    #[arg(long)]
    wal: Option<PathBuf>,

    /// Path to a rollback journal; discovered automatically when omitted.
    #[arg(long)]
    rollback_journal: Option<PathBuf>,

    /// Ignore any journal files, even when present next to the database.
    #[arg(long)]
    no_journal: bool,

    /// Tables to skip.
    #[arg(long, value_delimiter = ',')]
    exempted_tables: Vec<String>,

    /// Tables to process; all tables when omitted.
    #[arg(long, value_delimiter = ',')]
    tables: Vec<String>,

    /// Print the master schema.
    #[arg(long)]
    schema: bool,

    /// Report versions in which the master schema changed.
    #[arg(long)]
    schema_history: bool,

    /// Print the per-table serial type signatures.
    #[arg(long)]
    signatures: bool,

    /// Carve deleted records from unallocated space and freeblocks.
    #[arg(long)]
    carve: bool,

    /// Also carve freelist pages.
    #[arg(long)]
    carve_freelists: bool,

    /// Log format violations instead of failing on them.
    #[arg(long)]
    disable_strict_format_checking: bool,

    #[arg(long, value_enum, default_value = "warning")]
    log_level: LogLevel,

    /// Write log output to a file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Force warnings on regardless of the log level.
    #[arg(long)]
    warnings: bool,
}

#[derive(ValueEnum, Clone, Copy, PartialEq, Eq)]
enum ExportKind {
    Text,
    Csv,
}

#[derive(ValueEnum, Clone, Copy)]
enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Off,
}

impl LogLevel {
    fn to_filter(self, force_warnings: bool) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        let filter = match self {
            LogLevel::Critical | LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Off => LevelFilter::OFF,
        };
        if force_warnings && filter < LevelFilter::WARN {
            LevelFilter::WARN
        } else {
            filter
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let files = discover_files(&args)?;
    if files.is_empty() {
        bail!("no SQLite files found under {}", args.path.display());
    }

    let mut failures = 0;
    for file in &files {
        if let Err(e) = process_file(file, &args) {
            // A bad file must not stop the run over the remaining files.
            error!(file = %file.display(), "processing failed: {e:#}");
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{failures} of {} file(s) failed", files.len());
    }
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = args.log_level.to_filter(args.warnings);
    match &args.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_max_level(filter)
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn discover_files(args: &Args) -> Result<Vec<PathBuf>> {
    if !args.directory && !args.path.is_dir() {
        return Ok(vec![args.path.clone()]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&args.path)
        .with_context(|| format!("reading directory {}", args.path.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if let Some(prefix) = &args.file_prefix {
            if !name.starts_with(prefix.as_str()) {
                continue;
            }
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("db" | "sqlite" | "sqlite3") => files.push(path),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}

fn process_file(path: &Path, args: &Args) -> Result<()> {
    let strict = !args.disable_strict_format_checking;
    info!(file = %path.display(), "processing");
    let database = Rc::new(Database::open(path, strict)?);

    let (auto_wal, auto_journal) = if args.no_journal {
        (None, None)
    } else {
        companion_paths(path)
    };
    let wal_path = args.wal.clone().or(auto_wal);
    let journal_path = args.rollback_journal.clone().or(auto_journal);
    if wal_path.is_some() && journal_path.is_some() {
        // A database runs in one journal mode at a time; both files at once
        // point at tampering or copying mistakes.
        bail!("both a WAL and a rollback journal were found; refusing to guess");
    }

    let wal = match &wal_path {
        Some(p) => {
            info!(wal = %p.display(), "using write-ahead log");
            Some(Wal::open(p, strict)?)
        }
        None => None,
    };
    let history = sqlite_scour::version_history(Rc::clone(&database), wal, journal_path.is_some())?;
    let versions = history.versions()?;
    let base = versions.first().expect("the chain always contains version 0");
    let schema = MasterSchema::parse(base, database.text_encoding(), strict)?;

    if args.schema {
        print_schema(&schema);
    }
    if args.schema_history {
        print_schema_history(&versions);
    }

    let entries: Vec<&MasterSchemaEntry> = schema
        .entries
        .iter()
        .filter(|e| e.carvable_table() && !e.internal_schema_object)
        .filter(|e| args.tables.is_empty() || args.tables.contains(&e.name))
        .filter(|e| !args.exempted_tables.contains(&e.name))
        .collect();

    let mut signatures: HashMap<String, Signature> = HashMap::new();
    if args.carve || args.signatures || journal_path.is_some() {
        for entry in &entries {
            match Signature::build(&versions, entry) {
                Ok(sig) => {
                    signatures.insert(entry.name.clone(), sig);
                }
                Err(e) => warn!(table = %entry.name, "failed to build signature: {e}"),
            }
        }
    }
    if args.signatures {
        print_signatures(&signatures);
    }

    let journal = match &journal_path {
        Some(p) => {
            info!(journal = %p.display(), "using rollback journal");
            Some(RollbackJournal::open(p)?)
        }
        None => None,
    };

    export_commits(path, args, &versions, &entries, &signatures, journal.as_ref())
}

fn export_commits(
    path: &Path,
    args: &Args,
    versions: &[Version],
    entries: &[&MasterSchemaEntry],
    signatures: &HashMap<String, Signature>,
    journal: Option<&RollbackJournal>,
) -> Result<()> {
    let exports: Vec<ExportKind> = if args.export.is_empty() {
        vec![ExportKind::Text]
    } else {
        args.export.clone()
    };
    let base = versions.first().expect("the chain always contains version 0");

    for entry in entries {
        let signature = if args.carve || journal.is_some() {
            signatures.get(&entry.name)
        } else {
            None
        };
        let mut commits = Vec::new();
        let parser = VersionHistoryParser::new(
            versions,
            entry,
            signature.filter(|_| args.carve),
            args.carve_freelists,
        )?;
        for commit in parser {
            commits.push(commit?);
        }
        if let (Some(journal), Some(signature)) = (journal, signature) {
            commits.extend(RollbackJournalCarver::carve(journal, base, entry, signature)?);
        }

        let context = ExportContext { text_encoding: base.text_encoding(), entry };
        for kind in &exports {
            // Export failure kills this target only; others still run.
            let result = match kind {
                ExportKind::Text => {
                    let stdout = std::io::stdout();
                    let mut sink = TextExporter::new(stdout.lock());
                    write_all(&mut sink, &context, &commits)
                }
                ExportKind::Csv => {
                    let out_path = csv_path(path, &entry.name);
                    match std::fs::File::create(&out_path) {
                        Ok(file) => {
                            let mut sink = CsvExporter::new(std::io::BufWriter::new(file));
                            write_all(&mut sink, &context, &commits)
                        }
                        Err(e) => Err(sqlite_scour::export::Error::Io(e)),
                    }
                }
            };
            if let Err(e) = result {
                error!(table = %entry.name, "export target failed: {e}");
            }
        }
    }
    Ok(())
}

fn write_all<S: CommitSink>(
    sink: &mut S,
    context: &ExportContext,
    commits: &[sqlite_scour::Commit],
) -> Result<(), sqlite_scour::export::Error> {
    for commit in commits {
        sink.write_commit(context, commit)?;
    }
    sink.finish()
}

fn csv_path(database_path: &Path, table: &str) -> PathBuf {
    let stem = database_path.file_stem().and_then(|s| s.to_str()).unwrap_or("database");
    database_path.with_file_name(format!("{stem}-{table}.csv"))
}

fn print_schema(schema: &MasterSchema) {
    for entry in &schema.entries {
        println!(
            "{} {} (root page {}, table {})",
            entry.row_type, entry.name, entry.root_page, entry.table_name
        );
        for column in &entry.column_definitions {
            println!(
                "  {} {}{}",
                column.name,
                column.declared_type,
                if column.constraints.is_empty() {
                    String::new()
                } else {
                    format!(" {}", column.constraints.join(" "))
                }
            );
        }
    }
}

fn print_schema_history(versions: &[Version]) {
    for version in versions.iter().skip(1) {
        if version.master_schema_modified() {
            println!(
                "master schema modified in version {} (pages {:?})",
                version.version_number(),
                version.pages_modified()
            );
        }
    }
}

fn print_signatures(signatures: &HashMap<String, Signature>) {
    let mut names: Vec<&String> = signatures.keys().collect();
    names.sort();
    for name in names {
        let sig = &signatures[name];
        println!("{} ({} rows observed):", name, sig.rows_observed);
        for (i, column) in sig.effective_signature().iter().enumerate() {
            let types: Vec<String> = column
                .iter()
                .map(|st| match *st {
                    sqlite_scour::serial_type::BLOB_ID => "BLOB".to_string(),
                    sqlite_scour::serial_type::TEXT_ID => "TEXT".to_string(),
                    other => other.to_string(),
                })
                .collect();
            println!("  column {}: {{{}}}", i, types.join(", "));
        }
    }
}
