use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/dtrace/dtprobed.toml";
const ENV_CONFIG_PATH: &str = "DTPROBED_CONFIG";

/// Daemon configuration. A TOML file (optional) supplies every field;
/// command-line flags (see [`crate::Args`]) override whatever the file or
/// the built-in defaults provide.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_parser_timeout_secs")]
    pub parser_timeout_secs: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_dof_maxsz")]
    pub dof_maxsz: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub foreground: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            parser_timeout_secs: default_parser_timeout_secs(),
            state_dir: default_state_dir(),
            chunk_size: default_chunk_size(),
            dof_maxsz: default_dof_maxsz(),
            sweep_interval: default_sweep_interval(),
            debug: false,
            foreground: false,
        }
    }
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `DTPROBED_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// The sweep interval actually in effect: `sweep_interval` normally, or
    /// `TESTING_SWEEP_INTERVAL` (5) when `_DTRACE_TESTING` is set in the
    /// environment, matching the original's test-mode behavior.
    pub fn effective_sweep_interval(&self) -> u64 {
        if std::env::var_os("_DTRACE_TESTING").is_some() {
            dof_wire::consts::TESTING_SWEEP_INTERVAL.min(self.sweep_interval)
        } else {
            self.sweep_interval
        }
    }
}

fn default_device_name() -> String {
    dof_wire::consts::DEFAULT_DEVICE_NAME.to_string()
}

fn default_parser_timeout_secs() -> u64 {
    dof_wire::consts::DEFAULT_PARSER_TIMEOUT_SECS
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(dof_wire::consts::DEFAULT_STATE_DIR)
}

fn default_chunk_size() -> usize {
    dof_wire::consts::CHUNK_SIZE_DEFAULT
}

fn default_dof_maxsz() -> u64 {
    dof_wire::consts::DOF_MAXSZ_DEFAULT
}

fn default_sweep_interval() -> u64 {
    dof_wire::consts::DEFAULT_SWEEP_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.device_name, "dtrace/helper");
        assert_eq!(cfg.parser_timeout_secs, 5);
        assert_eq!(cfg.state_dir, PathBuf::from("/run/dtrace"));
        assert_eq!(cfg.sweep_interval, 128);
    }

    #[test]
    fn parse_config_overrides_defaults() {
        let toml = r#"
device_name = "dtrace/testdev"
parser_timeout_secs = 30
state_dir = "/tmp/dtrace-test"
sweep_interval = 64
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.device_name, "dtrace/testdev");
        assert_eq!(cfg.parser_timeout_secs, 30);
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/dtrace-test"));
        assert_eq!(cfg.sweep_interval, 64);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.chunk_size, dof_wire::consts::CHUNK_SIZE_DEFAULT);
    }

    #[test]
    fn sweep_interval_is_unshortened_without_testing_env() {
        unsafe {
            std::env::remove_var("_DTRACE_TESTING");
        }
        let cfg = Config::default();
        assert_eq!(cfg.effective_sweep_interval(), 128);
    }

    #[test]
    fn sweep_interval_shortens_under_testing_env() {
        unsafe {
            std::env::set_var("_DTRACE_TESTING", "1");
        }
        let cfg = Config::default();
        assert_eq!(cfg.effective_sweep_interval(), 5);
        unsafe {
            std::env::remove_var("_DTRACE_TESTING");
        }
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sweep_interval = 7").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.sweep_interval, 7);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
