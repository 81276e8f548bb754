#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use log::{info, error, LevelFilter};
use serde::Deserialize;
use std::{env, fs, path::{Path, PathBuf}};
use lazy_static::lazy_static;
use structopt::StructOpt;

use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::utils::{form_utils, errors::Errors};

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Directory and file locations. Unless otherwise noted, all files and directories
// are relative to the root directory.
const ENV_ROOT_DIR             : &str = "FORMSTORE_ROOT_DIR";
const DEFAULT_ROOT_DIR         : &str = ".";
const CONFIG_DIR               : &str = "/config";
const LOG4RS_CONFIG_FILE       : &str = "/log4rs.yml";     // relative to config dir
const FORMSTORE_CONFIG_FILE    : &str = "/formstore.toml"; // relative to config dir

// Used when no log4rs file is installed.
const DEFAULT_LOG_PATTERN      : &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l})} {t} - {m}{n}";

// Networking.
const DEFAULT_HTTP_ADDR        : &str = "127.0.0.1";
const DEFAULT_HTTP_PORT        : u16  = 4000;
const DEFAULT_INGEST_ADDR      : &str = "127.0.0.1";
const DEFAULT_INGEST_PORT      : u16  = 6000;

// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_PAYLOAD : usize = 65_507;

// Content locations.
const DEFAULT_STORE_FILE       : &str = "storage/data.json";
const DEFAULT_PAGES_DIR        : &str = ".";
const DEFAULT_STATIC_DIR       : &str = ".";

const DEFAULT_SHUTDOWN_SECS    : u64  = 5;

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Assign the command line arguments BEFORE RUNTIME_CTX is initialized in main.
lazy_static! {
    pub static ref FORMSTORE_ARGS: FormstoreArgs = init_formstore_args();
}

// Calculate the data directories BEFORE RUNTIME_CTX is initialized in main.
lazy_static! {
    pub static ref FORMSTORE_DIRS: FormstoreDirs = init_formstore_dirs();
}

// ***************************************************************************
//                             Directory Structs
// ***************************************************************************
#[derive(Debug)]
pub struct FormstoreDirs {
    pub root_dir: String,
    pub config_dir: String,
}

// ***************************************************************************
//                               Config Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// FormstoreArgs:
// ---------------------------------------------------------------------------
#[derive(Debug, StructOpt)]
#[structopt(name = "formstore_args", about = "Command line arguments for the form store server.")]
pub struct FormstoreArgs {
    /// Specify the server's root directory.
    ///
    /// Pages, static files, the store document and the optional config
    /// directory are all resolved against this directory.  The root is
    /// chosen using the following priority order:
    ///
    ///   1. If set, the value of the FORMSTORE_ROOT_DIR environment,
    ///
    ///   2. Otherwise, if set, the value of this argument,
    ///
    ///   3. Otherwise, the current working directory.
    ///
    #[structopt(short, long)]
    pub root_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Parms:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct Parms {
    pub config_file: String,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// RuntimeCtx:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct RuntimeCtx {
    pub parms: Parms,
    pub args: &'static FormstoreArgs,
    pub dirs: &'static FormstoreDirs,
}

impl RuntimeCtx {
    /// Absolute path of the store document.
    pub fn store_path(&self) -> PathBuf {
        resolve_path(&self.dirs.root_dir, &self.parms.config.store_file)
    }

    pub fn pages_dir(&self) -> PathBuf {
        resolve_path(&self.dirs.root_dir, &self.parms.config.pages_dir)
    }

    pub fn static_dir(&self) -> PathBuf {
        resolve_path(&self.dirs.root_dir, &self.parms.config.static_dir)
    }
}

// ---------------------------------------------------------------------------
// Transport:
// ---------------------------------------------------------------------------
/** How submissions travel from the web front to the ingest listener. */
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// One loopback datagram per submission.
    Udp,
    /// In-process bounded queue, no socket.
    Channel,
}

// ---------------------------------------------------------------------------
// Config:
// ---------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub title: String,
    pub http_addr: String,
    pub http_port: u16,
    pub ingest_addr: String,
    pub ingest_port: u16,
    pub transport: Transport,
    pub store_file: String,
    pub pages_dir: String,
    pub static_dir: String,
    pub max_submission_bytes: usize,
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn http_socket_addr(&self) -> String {
        format!("{}:{}", self.http_addr, self.http_port)
    }

    pub fn ingest_socket_addr(&self) -> String {
        format!("{}:{}", self.ingest_addr, self.ingest_port)
    }

    /// Body size limit, never above what one datagram can carry when
    /// submissions go over udp.
    pub fn submission_limit(&self) -> usize {
        match self.transport {
            Transport::Udp => self.max_submission_bytes.min(MAX_DATAGRAM_PAYLOAD),
            Transport::Channel => self.max_submission_bytes,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: "Form Store Server".to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            ingest_addr: DEFAULT_INGEST_ADDR.to_string(),
            ingest_port: DEFAULT_INGEST_PORT,
            transport: Transport::Udp,
            store_file: DEFAULT_STORE_FILE.to_string(),
            pages_dir: DEFAULT_PAGES_DIR.to_string(),
            static_dir: DEFAULT_STATIC_DIR.to_string(),
            max_submission_bytes: MAX_DATAGRAM_PAYLOAD,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_SECS,
        }
    }
}

// ***************************************************************************
//                            Directory Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_formstore_args:
// ---------------------------------------------------------------------------
/** Get the command line arguments. */
fn init_formstore_args() -> FormstoreArgs {
    FormstoreArgs::from_args()
}

// ---------------------------------------------------------------------------
// init_formstore_dirs:
// ---------------------------------------------------------------------------
/** Calculate the root and config directories.  Neither is created here; a
 * missing config directory simply means built-in defaults are used.
 */
fn init_formstore_dirs() -> FormstoreDirs {
    let root_dir = get_root_dir();
    let config_dir = root_dir.clone() + CONFIG_DIR;
    FormstoreDirs {root_dir, config_dir}
}

// ---------------------------------------------------------------------------
// get_root_dir:
// ---------------------------------------------------------------------------
fn get_root_dir() -> String {
    // Order of precedence:
    //  1. Environment variable
    //  2. Command line --root-dir argument
    //  3. Current working directory
    //
    let root_dir = env::var(ENV_ROOT_DIR).unwrap_or_else(
        |_| {
            match FORMSTORE_ARGS.root_dir.clone() {
                Some(r) => r,
                None => DEFAULT_ROOT_DIR.to_string(),
            }
        });

    form_utils::get_absolute_path(&root_dir)
}

// ---------------------------------------------------------------------------
// resolve_path:
// ---------------------------------------------------------------------------
/** Configured paths are relative to the root directory unless absolute. */
fn resolve_path(root_dir: &str, configured: &str) -> PathBuf {
    let expanded = form_utils::get_absolute_path_from(root_dir, configured);
    PathBuf::from(expanded)
}

// ***************************************************************************
//                               Log Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_log:
// ---------------------------------------------------------------------------
/** Initialize log4rs from the installed yaml file if there is one, otherwise
 * log to the console at info level.
 */
pub fn init_log() -> Result<()> {
    let logconfig = init_log_config();
    if Path::new(&logconfig).is_file() {
        if let Err(e) = log4rs::init_file(&logconfig, Default::default()) {
            return Err(anyhow!("{}\n   {}", Errors::Log4rsInitialization(logconfig), e));
        }
        info!("Log4rs initialized using: {}", logconfig);
        return Ok(());
    }

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(DEFAULT_LOG_PATTERN)))
        .build();
    let config = LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    info!("Log4rs initialized with console defaults, no file at: {}", logconfig);
    Ok(())
}

// ---------------------------------------------------------------------------
// init_log_config:
// ---------------------------------------------------------------------------
fn init_log_config() -> String {
    FORMSTORE_DIRS.config_dir.clone() + LOG4RS_CONFIG_FILE
}

// ***************************************************************************
//                             Parms Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_parms:
// ---------------------------------------------------------------------------
/** Retrieve the application parameters from the configuration file in the
 * config directory.  A missing file means default values; a file that exists
 * but does not parse is an error.
 */
fn get_parms() -> Result<Parms> {
    let config_file = FORMSTORE_DIRS.config_dir.clone() + FORMSTORE_CONFIG_FILE;

    let config_file_abs = form_utils::get_absolute_path(&config_file);
    info!("{}", Errors::ReadingConfigFile(config_file_abs.clone()));
    let contents = match fs::read_to_string(&config_file_abs) {
        Ok(c) => c,
        Err(_) => {
            info!("Unable to read configuration at {}. Using default values.", config_file_abs);
            return Ok(Parms { config_file: Default::default(), config: Config::new() });
        }
    };

    let config = match parse_config(&contents) {
        Ok(c)  => c,
        Err(e) => {
            let msg = format!("{}\n   {}", Errors::TOMLParseError(config_file_abs), e);
            error!("{}", msg);
            return Result::Err(anyhow!(msg));
        }
    };

    Ok(Parms { config_file: config_file_abs, config })
}

// ---------------------------------------------------------------------------
// parse_config:
// ---------------------------------------------------------------------------
fn parse_config(contents: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(contents)
}

// ***************************************************************************
//                             Config Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_runtime_context:
// ---------------------------------------------------------------------------
pub fn init_runtime_context() -> Result<RuntimeCtx> {
    let parms = get_parms()?;
    Ok(RuntimeCtx {parms, args: &FORMSTORE_ARGS, dirs: &FORMSTORE_DIRS})
}
