use std::{path::PathBuf, sync::Arc};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION")
)]
pub struct Args {
    /// Settings file with the camera sources and tuning values.
    #[arg(long, value_name = "PATH", env = "VFC_SETTINGS", default_value = "settings.json")]
    settings: String,

    /// Folder for the snapshot and the durable database, overrides the settings file.
    #[arg(long, value_name = "PATH")]
    data_dir: Option<String>,

    /// Folder for the rotating log files.
    #[arg(long, value_name = "PATH", default_value = "./logs")]
    log_path: String,

    /// Turns all log categories up to Debug on the console.
    #[arg(short, long)]
    verbose: bool,

    /// Writes Trace level logs to the log file.
    #[arg(long)]
    enable_tracing_level_log_file: bool,

    /// Starts with empty in-memory counters, ignoring the last snapshot.
    #[arg(long)]
    reset: bool,
}

#[derive(Debug)]
struct Manager {
    clap_matches: Args,
}

lazy_static! {
    static ref MANAGER: Arc<Manager> = Arc::new(Manager::new());
}

impl Manager {
    fn new() -> Self {
        Self {
            clap_matches: Args::parse(),
        }
    }
}

// Construct our manager, should be done inside main
pub fn init() {
    MANAGER.as_ref();
}

// Check if the verbosity parameter was used
pub fn is_verbose() -> bool {
    MANAGER.clap_matches.verbose
}

pub fn is_tracing() -> bool {
    MANAGER.clap_matches.enable_tracing_level_log_file
}

pub fn is_reset() -> bool {
    MANAGER.clap_matches.reset
}

pub fn settings_path() -> PathBuf {
    expand(&MANAGER.clap_matches.settings)
}

pub fn data_dir() -> Option<PathBuf> {
    MANAGER.clap_matches.data_dir.as_deref().map(expand)
}

pub fn log_path() -> PathBuf {
    expand(&MANAGER.clap_matches.log_path)
}

// Return the command line used to start this application
pub fn command_line_string() -> String {
    std::env::args().collect::<Vec<String>>().join(" ")
}

// Return a clone of current Args struct
pub fn command_line() -> String {
    format!("{:#?}", MANAGER.clap_matches)
}

fn expand(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(path),
    }
}
