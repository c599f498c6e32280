use crate::prelude::*;
use std::env;
use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

fn default_config_file() -> PathBuf {
    env::var_os("GRADER_CONFIG")
        .unwrap_or_else(|| OsStr::new("grader.toml").to_os_string())
        .into()
}

#[derive(Debug, thiserror::Error)]
#[error("the configuration file has errors")]
pub struct BadConfig;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    ([127, 0, 0, 1], 8000).into()
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_queue_depth() -> usize {
    1024
}

fn default_llm_timeout_secs() -> u64 {
    300
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    "grader.db".into()
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            queue_depth: default_queue_depth(),
            llm_timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_path: default_database_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            runner: RunnerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Fallible<Self> {
        let path = default_config_file();
        if !path.exists() {
            info!(
                "no configuration file at {}, using the defaults",
                path.to_string_lossy()
            );
            return Ok(Config::default());
        }

        let buffer = Self::load_as_string(path)?;
        Ok(::toml::from_str(&buffer)?)
    }

    fn load_as_string(filename: PathBuf) -> Fallible<String> {
        let mut buffer = String::new();
        File::open(filename)?.read_to_string(&mut buffer)?;

        Ok(buffer)
    }

    pub fn check(file: &Option<String>) -> Fallible<()> {
        let filename = match file {
            Some(file) => file.into(),
            None => default_config_file(),
        };

        let buffer = Self::load_as_string(filename)?;
        match ::toml::from_str::<Config>(&buffer) {
            Ok(cfg) => {
                if cfg.runner.max_concurrent_tasks == 0 {
                    error!("check-config failed: runner.max-concurrent-tasks must be at least 1");
                    return Err(BadConfig.into());
                }
                Ok(())
            }
            Err(e) => {
                error!("got error parsing the config file: {}", e);
                Err(BadConfig.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn test_config_parsing() {
        let config = concat!(
            "[server]\n",
            "bind = \"0.0.0.0:9000\"\n",
            "[runner]\n",
            "max-concurrent-tasks = 4\n",
            "queue-depth = 64\n",
            "llm-timeout-secs = 30\n",
            "[storage]\n",
            "database-path = \"/tmp/grader-test.db\"\n",
        );

        let config: Config = ::toml::from_str(config).unwrap();
        assert_eq!(config.runner.max_concurrent_tasks, 4);
        assert_eq!(config.runner.queue_depth, 64);
        assert_eq!(config.runner.llm_timeout_secs, 30);
        assert_eq!(config.server.bind.port(), 9000);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = ::toml::from_str("").unwrap();
        assert_eq!(
            config.runner.max_concurrent_tasks,
            Config::default().runner.max_concurrent_tasks
        );
        assert_eq!(config.storage.database_path, "grader.db".parse::<std::path::PathBuf>().unwrap());
    }
}
