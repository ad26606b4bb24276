//! scrydbd: index the block files a full node writes and serve watched
//! address history to wallets.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use scrydb_chainstate::{BdmConfig, BlockDataManager, DbType, InitMode};
use scrydb_consensus::{chain_params, ChainParams, Network};
use scrydb_log::{log_error, log_info, log_warn, Format, Level, LogConfig};
use scrydb_primitives::genesis_header;
use scrydb_storage::fjall::FjallStore;

const DB_DIR_NAME: &str = "databases";
const LOCK_FILE_NAME: &str = "scrydbd.lock";
const DEFAULT_RAM_USAGE: u32 = 4;
const UPDATE_POLL_SECS: u64 = 5;

fn main() {
    match run() {
        Ok(()) => {}
        Err(err) => {
            log_error!("{err}");
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<(), String> {
    let config = Config::from_args(std::env::args().skip(1))?;

    scrydb_log::init(LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: true,
    });

    log_info!("block file dir: {}", config.blk_dir.display());
    log_info!("database dir: {}", config.db_dir.display());

    // one process per database directory
    let lock_path = config.db_dir.join(LOCK_FILE_NAME);
    let lock_file =
        File::create(&lock_path).map_err(|err| format!("cannot create {}: {err}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| format!("another process holds {}", lock_path.display()))?;

    let store = FjallStore::open(&config.db_dir)
        .map_err(|err| format!("cannot open database: {err}"))?;

    let params = config.params.clone();
    let manager = Arc::new(BlockDataManager::new(
        BdmConfig {
            genesis: genesis_header(&params),
            params,
            db_type: config.db_type,
            thread_count: config.thread_count,
            ram_usage: config.ram_usage,
            spawn_id: config.spawn_id.clone(),
            check_chain: config.check_chain,
        },
        Arc::new(store),
        config.blk_dir.clone(),
    ));

    manager
        .init(config.init_mode)
        .map_err(|err| format!("initialization failed: {err}"))?;

    if config.check_chain {
        println!("{}", manager.checked_tx_count());
        return Ok(());
    }

    loop {
        if manager.shutdown_requested() {
            log_info!("shutdown requested, exiting");
            return Ok(());
        }
        std::thread::sleep(Duration::from_secs(UPDATE_POLL_SECS));
        match manager.update() {
            Ok(reorg) => {
                if let Some(branch) = reorg.reorg_branch_point {
                    log_warn!("chain reorganized above height {branch}");
                }
            }
            Err(err) => return Err(format!("update failed: {err}")),
        }
    }
}

struct Config {
    params: ChainParams,
    init_mode: InitMode,
    check_chain: bool,
    db_dir: PathBuf,
    blk_dir: PathBuf,
    db_type: DbType,
    ram_usage: u32,
    thread_count: usize,
    spawn_id: String,
    log_level: Level,
    log_format: Format,
}

impl Config {
    fn from_args<I>(raw_args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut network = Network::Mainnet;
        let mut init_mode = InitMode::Normal;
        let mut check_chain = false;
        let mut data_dir: Option<PathBuf> = None;
        let mut db_dir: Option<PathBuf> = None;
        let mut blk_dir: Option<PathBuf> = None;
        let mut db_type = DbType::Full;
        let mut ram_usage = DEFAULT_RAM_USAGE;
        let mut thread_count = default_thread_count();
        let mut spawn_id = String::new();
        let mut log_level = Level::Info;
        let mut log_format = Format::Text;

        for arg in raw_args {
            let (flag, value) = match arg.split_once('=') {
                Some((flag, value)) => (flag.to_string(), Some(strip_quotes(value))),
                None => (arg, None),
            };
            match flag.as_str() {
                "--testnet" => network = Network::Testnet,
                "--regtest" => network = Network::Regtest,
                "--rescan" => init_mode = InitMode::Rescan,
                "--rebuild" => init_mode = InitMode::Rebuild,
                "--rescanSSH" => init_mode = InitMode::RescanBalances,
                "--checkchain" => check_chain = true,
                "--datadir" => data_dir = Some(PathBuf::from(required(&flag, value)?)),
                "--dbdir" => db_dir = Some(PathBuf::from(required(&flag, value)?)),
                "--satoshi-datadir" => blk_dir = Some(PathBuf::from(required(&flag, value)?)),
                "--db-type" => {
                    let raw = required(&flag, value)?;
                    db_type = DbType::parse(&raw)
                        .ok_or_else(|| format!("unknown db type '{raw}'"))?;
                }
                "--ram-usage" => {
                    let raw = required(&flag, value)?;
                    ram_usage = raw
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n >= 1)
                        .ok_or_else(|| format!("--ram-usage needs a number >= 1, got '{raw}'"))?;
                }
                "--thread-count" => {
                    let raw = required(&flag, value)?;
                    thread_count = raw
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n >= 1)
                        .ok_or_else(|| {
                            format!("--thread-count needs a number >= 1, got '{raw}'")
                        })?;
                }
                "--spawnId" => spawn_id = required(&flag, value)?,
                "--log-level" => {
                    let raw = required(&flag, value)?;
                    log_level =
                        Level::parse(&raw).ok_or_else(|| format!("unknown log level '{raw}'"))?;
                }
                "--log-format" => {
                    let raw = required(&flag, value)?;
                    log_format =
                        Format::parse(&raw).ok_or_else(|| format!("unknown log format '{raw}'"))?;
                }
                other => return Err(format!("unknown argument '{other}'")),
            }
        }

        let home = home_dir()?;
        let data_dir = expand_tilde(
            data_dir.unwrap_or_else(|| default_data_dir(network)),
            &home,
        );
        let db_dir = expand_tilde(
            db_dir.unwrap_or_else(|| data_dir.join(DB_DIR_NAME)),
            &home,
        );
        let mut blk_dir = expand_tilde(
            blk_dir.unwrap_or_else(|| default_blk_dir(network)),
            &home,
        );
        if blk_dir.file_name().and_then(|name| name.to_str()) != Some("blocks") {
            blk_dir.push("blocks");
        }

        if !data_dir.is_dir() {
            return Err(format!("{} is not a valid path", data_dir.display()));
        }
        if !db_dir.is_dir() {
            std::fs::create_dir_all(&db_dir)
                .map_err(|err| format!("cannot create {}: {err}", db_dir.display()))?;
        }
        if !blk_dir.is_dir() {
            return Err(format!("{} is not a valid path", blk_dir.display()));
        }

        Ok(Self {
            params: chain_params(network),
            init_mode,
            check_chain,
            db_dir,
            blk_dir,
            db_type,
            ram_usage,
            thread_count,
            spawn_id,
            log_level,
            log_format,
        })
    }
}

fn required(flag: &str, value: Option<String>) -> Result<String, String> {
    value.ok_or_else(|| format!("{flag} needs a value ({flag}=...)"))
}

fn strip_quotes(input: &str) -> String {
    input
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string()
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_data_dir(network: Network) -> PathBuf {
    match network {
        Network::Mainnet => PathBuf::from("~/.scrydb"),
        Network::Testnet => PathBuf::from("~/.scrydb/testnet3"),
        Network::Regtest => PathBuf::from("~/.scrydb/regtest"),
    }
}

fn default_blk_dir(network: Network) -> PathBuf {
    match network {
        Network::Mainnet => PathBuf::from("~/.bitcoin/blocks"),
        Network::Testnet => PathBuf::from("~/.bitcoin/testnet3/blocks"),
        Network::Regtest => PathBuf::from("~/.bitcoin/regtest/blocks"),
    }
}

fn home_dir() -> Result<PathBuf, String> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| "cannot resolve home directory ($HOME unset)".to_string())
}

fn expand_tilde(path: PathBuf, home: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path;
    };
    if text == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = text.strip_prefix("~/") {
        return home.join(rest);
    }
    path
}
