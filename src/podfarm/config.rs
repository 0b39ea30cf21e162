/*
 * Copyright (C) 2025 The Podfarm Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Process configuration, loaded from the YAML document named by the
//! `CONFIG_PATH` environment variable.

use serde::Deserialize;
use std::env;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

const DEFAULT_CONSUL_ADDRESS: &str = "127.0.0.1:8500";
const DEFAULT_HOOKS_DIRECTORY: &str = "/usr/local/p2hooks.d";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PreparerConfig {
    pub node_name: String,
    #[serde(default = "default_consul_address")]
    pub consul_address: String,
    #[serde(default = "default_hooks_directory")]
    pub hooks_directory: String,
}

fn default_consul_address() -> String {
    DEFAULT_CONSUL_ADDRESS.to_string()
}

fn default_hooks_directory() -> String {
    DEFAULT_HOOKS_DIRECTORY.to_string()
}

impl PreparerConfig {
    /// Reads the configuration from the path in `CONFIG_PATH`.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV).map_err(|_| ConfigError::MissingConfigPath)?;
        Self::load(Path::new(&path))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| ConfigError::Unreadable(path.to_path_buf(), err))?;
        let config: PreparerConfig =
            serde_yaml::from_str(&raw).map_err(ConfigError::Malformed)?;
        if config.node_name.is_empty() {
            return Err(ConfigError::MissingNodeName);
        }
        Ok(config)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    MissingConfigPath,
    Unreadable(PathBuf, std::io::Error),
    Malformed(serde_yaml::Error),
    MissingNodeName,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingConfigPath => {
                write!(f, "no {} variable was given", CONFIG_PATH_ENV)
            }
            ConfigError::Unreadable(path, err) => {
                write!(f, "could not read the config file '{}': {}", path.display(), err)
            }
            ConfigError::Malformed(err) => write!(f, "the config file was malformatted: {}", err),
            ConfigError::MissingNodeName => {
                write!(f, "`node_name` was not set in the file at {}", CONFIG_PATH_ENV)
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Unreadable(_, err) => Some(err),
            ConfigError::Malformed(err) => Some(err),
            ConfigError::MissingConfigPath | ConfigError::MissingNodeName => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn full_config_parses() {
        let file = write_config(
            "node_name: node1.example.com\n\
             consul_address: consul.example.com:8500\n\
             hooks_directory: /etc/hooks.d\n",
        );
        let config = PreparerConfig::load(file.path()).expect("load config");
        assert_eq!(config.node_name, "node1.example.com");
        assert_eq!(config.consul_address, "consul.example.com:8500");
        assert_eq!(config.hooks_directory, "/etc/hooks.d");
    }

    #[test]
    fn omitted_fields_take_defaults() {
        let file = write_config("node_name: node1\n");
        let config = PreparerConfig::load(file.path()).expect("load config");
        assert_eq!(config.consul_address, DEFAULT_CONSUL_ADDRESS);
        assert_eq!(config.hooks_directory, DEFAULT_HOOKS_DIRECTORY);
    }

    #[test]
    fn empty_node_name_is_rejected() {
        let file = write_config("node_name: \"\"\n");
        let err = PreparerConfig::load(file.path()).expect_err("empty node_name");
        assert!(matches!(err, ConfigError::MissingNodeName));
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let file = write_config("node_name: [unterminated\n");
        let err = PreparerConfig::load(file.path()).expect_err("malformed yaml");
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn missing_file_is_rejected() {
        let err = PreparerConfig::load(Path::new("/nonexistent/podfarm-config.yaml"))
            .expect_err("missing file");
        assert!(matches!(err, ConfigError::Unreadable(_, _)));
    }
}
