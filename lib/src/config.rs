//! # Configuration file
//!
//! Defaults for command line options can be put into `tcbuilder.toml` in
//! the current directory (or a file given with `--config`):
//!
//! ```toml
//! storage-directory = "storage"
//! include-dirs = ["device-trees/include"]
//!
//! [remote]
//! username = "torizon"
//! port = 22
//! mdns-source = "192.168.1.10"
//!
//! [device-trees]
//! url = "https://github.com/toradex/device-trees"
//! branch = "toradex_6.6-2.2.x-imx"
//!
//! [serve]
//! port = 8080
//! ```
//!
//! Command line flags override values from the file.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::dt::{CheckoutOptions, DEVICE_TREES_DIR};
use crate::remote::{SshConfig, DEFAULT_SERVE_PORT, DEFAULT_SSH_PORT, DEFAULT_USERNAME};
use crate::resolve::ResolverConfig;

/// Name of the configuration file looked up in the current directory.
pub const CONFIG_FILE: &str = "tcbuilder.toml";
/// Default storage directory.
pub const DEFAULT_STORAGE_DIR: &str = "storage";

/// The toplevel configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Where images are unpacked and changes collected.
    pub storage_directory: Option<Utf8PathBuf>,
    /// Include search path for device tree sources.
    pub include_dirs: Option<Vec<Utf8PathBuf>>,
    /// The `[remote]` section.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// The `[device-trees]` section.
    #[serde(default)]
    pub device_trees: DeviceTreesConfig,
    /// The `[serve]` section.
    #[serde(default)]
    pub serve: ServeConfig,
}

/// How to reach devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RemoteConfig {
    /// Login user.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// ssh port.
    pub port: Option<u16>,
    /// Address to send mDNS queries from.
    pub mdns_source: Option<Ipv4Addr>,
}

/// Where device tree sources come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceTreesConfig {
    /// Git repository URL.
    pub url: Option<String>,
    /// Branch to check out.
    pub branch: Option<String>,
}

/// The HTTP server devices pull from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServeConfig {
    /// Port to listen on.
    pub port: Option<u16>,
}

impl Config {
    /// Parse a configuration file's contents.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load `path`, or [`CONFIG_FILE`] if it exists when no path is given.
    #[context("Loading configuration")]
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Utf8Path::new(CONFIG_FILE), false),
        };
        let buf = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                return Ok(Self::default())
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let c = Self::parse(&buf).with_context(|| format!("Parsing {path}"))?;
        tracing::debug!("Loaded {path}: {c:?}");
        Ok(c)
    }

    /// The storage directory, `flag` taking precedence.
    pub fn storage_directory(&self, flag: Option<&Utf8Path>) -> Utf8PathBuf {
        flag.map(ToOwned::to_owned)
            .or_else(|| self.storage_directory.clone())
            .unwrap_or_else(|| DEFAULT_STORAGE_DIR.into())
    }

    /// The include search path, `flags` taking precedence when non-empty.
    pub fn include_dirs(&self, flags: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
        if !flags.is_empty() {
            return flags.to_vec();
        }
        self.include_dirs
            .clone()
            .unwrap_or_else(|| vec![Utf8Path::new(DEVICE_TREES_DIR).join("include")])
    }

    /// Login settings with the given overrides.
    pub fn ssh(
        &self,
        username: Option<String>,
        password: Option<String>,
        port: Option<u16>,
    ) -> SshConfig {
        SshConfig {
            username: username
                .or_else(|| self.remote.username.clone())
                .unwrap_or_else(|| DEFAULT_USERNAME.to_owned()),
            password: password.or_else(|| self.remote.password.clone()),
            port: port.or(self.remote.port).unwrap_or(DEFAULT_SSH_PORT),
        }
    }

    /// Name resolution settings with the given override.
    pub fn resolver(&self, mdns_source: Option<Ipv4Addr>) -> ResolverConfig {
        ResolverConfig {
            mdns_source: mdns_source.or(self.remote.mdns_source),
            ..Default::default()
        }
    }

    /// The port to serve the archive repository on.
    pub fn serve_port(&self, flag: Option<u16>) -> u16 {
        flag.or(self.serve.port).unwrap_or(DEFAULT_SERVE_PORT)
    }

    /// Where to get the device tree sources from.
    pub fn checkout(&self, update: bool) -> CheckoutOptions {
        let defaults = CheckoutOptions::default();
        CheckoutOptions {
            url: self.device_trees.url.clone().unwrap_or(defaults.url),
            branch: self.device_trees.branch.clone(),
            update,
        }
    }
}
