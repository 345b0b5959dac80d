use blocktree_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

mod db_info;
mod import;
mod verify_tree;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use blocktree_chainstate::{BlockIndexDb, BlockTree, ChainTrust};
use blocktree_consensus::params::{chain_params, hash256_from_hex, hash256_to_hex, Network};
use blocktree_consensus::Hash256;
use blocktree_storage::fjall::{FjallOptions, FjallStore};
use serde_json::json;

const DEFAULT_DATA_DIR: &str = "data";
const INDEX_DIR_NAME: &str = "blockindex";
const DEFAULT_DB_CACHE_MB: u64 = 64;

#[derive(Clone, Debug, Eq, PartialEq)]
enum Command {
    Info,
    Verify,
    Ancestor { hash: Hash256, height: i32 },
    Import { path: PathBuf },
}

#[derive(Clone, Debug)]
struct Config {
    command: Command,
    data_dir: PathBuf,
    network: Network,
    /// `Some(None)` disables the network default.
    assume_valid: Option<Option<Hash256>>,
    json: bool,
    log: logging::LogConfig,
    db_cache_bytes: Option<u64>,
    db_fsync_ms: Option<u16>,
}

impl Config {
    fn index_path(&self) -> PathBuf {
        index_path(&self.data_dir, self.network)
    }
}

#[derive(Debug)]
enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("blocktree {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config),
    }
}

fn index_path(data_dir: &Path, network: Network) -> PathBuf {
    data_dir.join(network.as_str()).join(INDEX_DIR_NAME)
}

fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(config.log);

    let params = chain_params(config.network);
    let mut trust = ChainTrust::new(&params.consensus);
    if let Some(assume_valid) = config.assume_valid {
        trust = trust.with_assume_valid(assume_valid);
    }

    let db_path = config.index_path();
    fs::create_dir_all(&db_path)
        .map_err(|err| format!("failed to create {}: {err}", db_path.display()))?;
    let options = FjallOptions {
        cache_bytes: config.db_cache_bytes,
        memtable_bytes: None,
        fsync_ms: config.db_fsync_ms,
    };
    let store = FjallStore::open_with_options(&db_path, options).map_err(|err| err.to_string())?;
    let db = BlockIndexDb::new(Arc::new(store));

    let started = Instant::now();
    let tree = db.load().map_err(|err| err.to_string())?;
    log_info!(
        "Block index: loaded {} entries from {} in {} ms",
        tree.len().map_err(|err| err.to_string())?,
        db_path.display(),
        started.elapsed().as_millis()
    );

    match &config.command {
        Command::Info => {
            let summary = db_info::collect_index_summary(&tree, &trust, params.network)?;
            if config.json {
                print_json(&summary)?;
            } else {
                print!("{}", summary.render_text());
            }
            Ok(())
        }
        Command::Verify => {
            let report = verify_tree::verify_tree(&tree)?;
            if config.json {
                print_json(&report)?;
            } else {
                print!("{}", report.render_text());
            }
            if report.failures.is_empty() {
                Ok(())
            } else {
                Err(format!("block index has {} integrity failures", report.failures.len()))
            }
        }
        Command::Ancestor { hash, height } => run_ancestor(&tree, hash, *height, config.json),
        Command::Import { path } => {
            let stats = import::import_headers(&tree, path, &params.consensus)?;
            let written = db.flush(&tree).map_err(|err| err.to_string())?;
            log_info!(
                "Import: {} headers read, {} new, {} already known, {} index records written",
                stats.read,
                stats.inserted,
                stats.known,
                written
            );
            if config.json {
                print_json(&stats)?;
            } else {
                println!(
                    "read {} headers: {} new, {} already known",
                    stats.read, stats.inserted, stats.known
                );
            }
            Ok(())
        }
    }
}

fn run_ancestor(tree: &BlockTree, hash: &Hash256, height: i32, as_json: bool) -> Result<(), String> {
    let id = tree
        .lookup(hash)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("block {} is not indexed", hash256_to_hex(hash)))?;
    let reader = tree.reader().map_err(|err| err.to_string())?;
    let Some(ancestor) = reader.ancestor(id, height).map_err(|err| err.to_string())? else {
        return Err(format!(
            "height {height} is outside [0, {}]",
            reader.node(id).map_err(|err| err.to_string())?.height()
        ));
    };
    let node = reader.node(ancestor).map_err(|err| err.to_string())?;
    let median_time_past = reader
        .median_time_past(ancestor)
        .map_err(|err| err.to_string())?;
    if as_json {
        return print_json(&json!({
            "hash": hash256_to_hex(node.hash()),
            "height": node.height(),
            "time": node.time(),
            "mediantime": median_time_past,
            "chainwork": format!("{:064x}", node.chain_work()),
        }));
    }
    println!("{}", reader.describe(ancestor).map_err(|err| err.to_string())?);
    println!("time={} mediantime={median_time_past}", node.time());
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{rendered}");
    Ok(())
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut command: Option<Command> = None;
    let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut network = Network::Mainnet;
    let mut assume_valid: Option<Option<Hash256>> = None;
    let mut json_output = false;
    let mut log = logging::LogConfig::from_env();
    let mut db_cache_mb: u64 = DEFAULT_DB_CACHE_MB;
    let mut db_fsync_ms: Option<u16> = None;
    let mut positional: Vec<String> = Vec::new();
    let mut args = raw_args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" | "help" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" | "version" => return Ok(CliAction::PrintVersion),
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = PathBuf::from(value);
            }
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
            }
            "--testnet" => network = Network::Testnet,
            "--regtest" => network = Network::Regtest,
            "--assume-valid" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --assume-valid\n{}", usage()))?;
                assume_valid = Some(if value.trim() == "0" {
                    None
                } else {
                    Some(
                        hash256_from_hex(&value)
                            .map_err(|err| format!("invalid --assume-valid '{value}': {err}"))?,
                    )
                });
            }
            "--json" => json_output = true,
            "--log-level" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                log.level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
            }
            "--log-format" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                log.format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
            }
            "--log-timestamps" => log.timestamps = true,
            "--no-log-timestamps" => log.timestamps = false,
            "--db-cache-mb" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --db-cache-mb\n{}", usage()))?;
                db_cache_mb = value
                    .parse()
                    .map_err(|_| format!("invalid --db-cache-mb '{value}'\n{}", usage()))?;
            }
            "--db-fsync-ms" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --db-fsync-ms\n{}", usage()))?;
                let parsed: u16 = value
                    .parse()
                    .map_err(|_| format!("invalid --db-fsync-ms '{value}'\n{}", usage()))?;
                db_fsync_ms = (parsed > 0).then_some(parsed);
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option '{other}'\n{}", usage()));
            }
            _ if command.is_none() && positional.is_empty() => {
                command = Some(match arg.as_str() {
                    "info" => Command::Info,
                    "verify" => Command::Verify,
                    "ancestor" | "import" => {
                        positional.push(arg);
                        continue;
                    }
                    other => return Err(format!("unknown command '{other}'\n{}", usage())),
                });
            }
            _ => positional.push(arg),
        }
    }

    let command = match positional.first().map(String::as_str) {
        Some("ancestor") => {
            let [_, hash, height] = positional.as_slice() else {
                return Err(format!("ancestor expects <hash> <height>\n{}", usage()));
            };
            let hash = hash256_from_hex(hash).map_err(|err| format!("invalid hash '{hash}': {err}"))?;
            let height = height
                .parse()
                .map_err(|_| format!("invalid height '{height}'"))?;
            Command::Ancestor { hash, height }
        }
        Some("import") => {
            let [_, path] = positional.as_slice() else {
                return Err(format!("import expects <headers-file>\n{}", usage()));
            };
            Command::Import {
                path: PathBuf::from(path),
            }
        }
        Some(extra) => return Err(format!("unexpected argument '{extra}'\n{}", usage())),
        None => command.unwrap_or(Command::Info),
    };

    Ok(CliAction::Run(Config {
        command,
        data_dir,
        network,
        assume_valid,
        json: json_output,
        log,
        db_cache_bytes: (db_cache_mb > 0).then(|| db_cache_mb.saturating_mul(1024 * 1024)),
        db_fsync_ms,
    }))
}

fn usage() -> String {
    [
        "Usage:",
        "  blocktree [options] [command]",
        "",
        "Commands:",
        "  info                     Summarize the block index (default)",
        "  verify                   Check heights, skip pointers, chain tx counts and median times",
        "  ancestor <hash> <height> Resolve the ancestor of <hash> at <height>",
        "  import <headers-file>    Index a file of concatenated 80-byte headers",
        "  help                     Print this help and exit",
        "  version                  Print version and exit",
        "",
        "Options:",
        "  --data-dir  Base data directory (default: ./data)",
        "  --network  Network (main|test|regtest) (default: main)",
        "  --testnet, --regtest  Shorthand for --network",
        "  --assume-valid  Override the assume-valid block hash (0 disables)",
        "  --json  Print machine-readable output",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --db-cache-mb  Fjall block cache size in MiB (0 keeps the fjall default, default: 64)",
        "  --db-fsync-ms  Fjall async fsync interval in ms (0 disables, optional)",
        "",
        "Environment:",
        "  BLOCKTREE_LOG_LEVEL, BLOCKTREE_LOG_FORMAT  Defaults for --log-level and --log-format",
    ]
    .join("\n")
}
