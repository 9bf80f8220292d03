use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use structopt::StructOpt;

use metricd_core::{Error, Result};
use metricd_storage::DiskOptions;
use metricd_storage::scheduler;
use metricd_storage::BackendConfig;

const DEFAULT_DEBUG_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_STATSD_PORT: u16 = 8125;

#[derive(Debug)]
pub struct Config {
    /// Enables debug logging, including every ingested sample and every failed write
    pub verbose: bool,

    /// Logs isolated failures (failed writes, dropped records); on with `--verbose`
    /// or `ERROR_LOGGER`
    pub error_logger: bool,

    /// How frequently to log internal debug metrics
    pub debug_interval: Option<Duration>,

    /// The port the HTTP query api listens on
    pub http_port: u16,

    /// The UDP port of the StatsD listener, or `None` when the listener is disabled
    pub statsd_port: Option<u16>,

    /// The storage backend to open at startup, including its data directory
    pub backend: BackendConfig,

    /// The number of worker threads that apply inserts to the backend
    pub workers: usize,

    /// The number of inserts each worker will queue before ingestion waits
    pub queue_depth: usize,
}

impl Config {
    /// Loads configuration from arguments, env and dotenv
    pub fn load() -> Result<Config> {
        // Attempts to find a `.env` file to initialize/extend the environment
        dotenv::dotenv().ok();

        // Load the config from arguments, then environment variables
        Config::from_env(Environment::from_args())
    }

    /// Prints the usage text, for when configuration is rejected after parsing
    pub fn print_usage() {
        Environment::clap().print_long_help().ok();
        println!();
    }

    fn from_env(env: Environment) -> Result<Config> {
        let backend = match env.storage_backend.as_str() {
            "inmemory" => BackendConfig::InMemory,
            "disk" => {
                let datadir = env.datadir.ok_or_else(|| {
                    Error::Config("the --datadir flag must be set when using the disk backend".into())
                })?;
                let mut options = DiskOptions::new(datadir);
                options.segment_size = env.segment_size;
                if env.max_open_segments > 0 {
                    options.max_open_segments = env.max_open_segments;
                }
                BackendConfig::Disk(options)
            }
            other => return Err(Error::Config(format!("unknown backend type: {}", other))),
        };
        let verbose = env.verbose || env_flag("VERBOSE")?;
        Ok(Config {
            verbose,
            error_logger: verbose || env_flag("ERROR_LOGGER")?,
            debug_interval: match env.debug_interval {
                ToggleValue::Enabled(secs) => Some(Duration::from_secs(secs)),
                ToggleValue::EnabledDefault => Some(DEFAULT_DEBUG_INTERVAL),
                ToggleValue::Disabled => None,
            },
            http_port: env.http_port,
            statsd_port: match env.statsd_port {
                ToggleValue::Enabled(port) => Some(port),
                ToggleValue::EnabledDefault => Some(DEFAULT_STATSD_PORT),
                ToggleValue::Disabled => None,
            },
            backend,
            workers: if env.workers == 0 {
                scheduler::DEFAULT_WORKERS
            } else {
                env.workers
            },
            queue_depth: if env.queue_depth == 0 {
                scheduler::DEFAULT_QUEUE_DEPTH
            } else {
                env.queue_depth
            },
        })
    }
}

/// Reads an on/off environment variable; unset means off
fn env_flag(name: &str) -> Result<bool> {
    match dotenv::var(name).ok() {
        Some(val) if val == "true" || val == "on" || val == "1" => Ok(true),
        Some(val) if val == "false" || val == "off" || val == "0" || val.is_empty() => Ok(false),
        Some(val) => Err(Error::Config(format!("invalid {}: {}", name, val))),
        None => Ok(false),
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "metricd",
    after_help = "EXAMPLE:\n    metricd --statsd-port 8125 --http-port 8080 --storage-backend disk --datadir /var/lib/metricd"
)]
struct Environment {
    /// Enables debug logging of ingested samples and failed writes
    #[structopt(short, long)]
    verbose: bool,

    /// How frequently (in seconds) to log internal debug metrics
    #[structopt(long, env = "DEBUG_INTERVAL", default_value = "300")]
    debug_interval: ToggleValue<u64>,

    /// The port to serve the HTTP query api on
    #[structopt(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// The UDP port to receive StatsD samples on ("off" to disable)
    #[structopt(long, env = "STATSD_PORT", default_value = "8125")]
    statsd_port: ToggleValue<u16>,

    /// One of "inmemory" or "disk"
    #[structopt(long, env = "STORAGE_BACKEND", default_value = "disk")]
    storage_backend: String,

    /// The directory to store series in (if storage is "disk"); it must already exist
    #[structopt(long, env = "DATADIR", parse(from_os_str))]
    datadir: Option<PathBuf>,

    /// The number of worker threads that write to storage
    #[structopt(long, env = "WORKER_THREADS", default_value = "4")]
    workers: usize,

    /// How many pending inserts each worker may queue
    #[structopt(long, env = "QUEUE_DEPTH", default_value = "1024")]
    queue_depth: usize,

    /// The size (in bytes) after which a series starts a new log segment
    #[structopt(long, env = "SEGMENT_SIZE", default_value = "8388608")]
    segment_size: u64,

    /// How many segment files the disk backend keeps open for appending
    #[structopt(long, env = "MAX_OPEN_SEGMENTS", default_value = "256")]
    max_open_segments: usize,
}

#[derive(Debug, Eq, PartialEq)]
enum ToggleValue<T: FromStr> {
    Enabled(T),
    EnabledDefault,
    Disabled,
}

impl<T: FromStr> Default for ToggleValue<T> {
    fn default() -> Self {
        ToggleValue::Disabled
    }
}

impl<T: FromStr> FromStr for ToggleValue<T> {
    type Err = T::Err;
    fn from_str(val: &str) -> std::result::Result<Self, Self::Err> {
        match val {
            "false" | "off" | "0" | "" => Ok(ToggleValue::Disabled),
            "true" | "on" => Ok(ToggleValue::EnabledDefault),
            _ => val.parse().map(ToggleValue::Enabled),
        }
    }
}
