use clap::Parser;
use std::path::PathBuf;
use tracing::trace;

const SYSTEM_CONFIG: &str = "/etc/preheat/config.toml";
const SYSTEM_CONFIG_DIR_GLOB: &str = "/etc/preheat/config.d/*.toml";

/// Command line interface for the preheat daemon.
#[derive(Debug, Parser, Clone)]
#[command(name = "preheat", about, long_about = None, version)]
pub struct Cli {
    /// Path to a configuration file. When omitted, the system config and
    /// its config.d drop-ins are merged.
    #[arg(short, long, value_name = "FILE")]
    pub conffile: Option<PathBuf>,

    /// Path to the state file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "/var/lib/preheat/preheat.state"
    )]
    pub statefile: PathBuf,

    /// Path to the PID lock file guarding single-instance operation.
    #[arg(long, value_name = "FILE", default_value = "/run/preheat.pid")]
    pub pidfile: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv).
    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

impl Cli {
    /// Configuration files to merge, in precedence order (later overrides
    /// earlier). An explicit `--conffile` wins over system discovery.
    pub fn config_candidates(&self) -> Vec<PathBuf> {
        if let Some(conffile) = &self.conffile {
            return vec![conffile.clone()];
        }
        let mut candidates: Vec<PathBuf> = glob::glob(SYSTEM_CONFIG_DIR_GLOB)
            .map(|paths| paths.filter_map(Result::ok).collect())
            .unwrap_or_default();
        candidates.sort();
        candidates.insert(0, PathBuf::from(SYSTEM_CONFIG));
        trace!(?candidates, "config file candidates");
        candidates
    }
}
