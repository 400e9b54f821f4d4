//! Engine configuration and controller address resolution.
//!
//! Every section has a `Default`, so a config file only needs the values it
//! changes:
//!
//! ```json
//! { "link": { "poll_interval_ms": 500 }, "target": { "tolerance_hz": 20 } }
//! ```

use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::control::AutoControlConfig;
use crate::error::ConfigError;
use crate::session::{LinkConfig, OfflineConfig};
use crate::telemetry::{SamplerConfig, SpinLogConfig};
use crate::types::{ConnectionConfig, ControlTarget};

/// Name of the RNMR symbols file holding the controller address.
pub const SYMBOLS_FILE: &str = "symbols.sh";

/// Symbol naming the controller host.
pub const NODE_SYMBOL: &str = "TRM1_TCP_NODE";

/// Symbol naming the controller port.
pub const PORT_SYMBOL: &str = "TRM1_TCP_PORT";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MasConfig {
    pub link: LinkConfig,
    pub sampler: SamplerConfig,
    pub auto: AutoControlConfig,
    pub target: ControlTarget,
    pub spin_log: SpinLogConfig,
    pub offline: OfflineConfig,
}

impl MasConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: MasConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config
            .target
            .validate()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_json(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

// ================================================================================================
// SYMBOLS FILE
// ================================================================================================

/// Parse `export NAME = "value"` lines from a symbols file.
pub fn parse_symbols(text: &str) -> HashMap<String, String> {
    let Ok(pattern) = Regex::new(r#"^\s*export\s+(\w+)\s*=\s*"?([^"]*?)"?\s*$"#) else {
        return HashMap::new();
    };

    text.lines()
        .filter_map(|line| pattern.captures(line))
        .map(|caps| (caps[1].to_string(), caps[2].trim().to_string()))
        .collect()
}

/// Controller address from parsed symbols.
pub fn connection_from_symbols(
    symbols: &HashMap<String, String>,
) -> Result<ConnectionConfig, ConfigError> {
    let host = symbols
        .get(NODE_SYMBOL)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Missing(NODE_SYMBOL.to_string()))?;
    let port = symbols
        .get(PORT_SYMBOL)
        .ok_or_else(|| ConfigError::Missing(PORT_SYMBOL.to_string()))?;
    ConnectionConfig::new(host.clone(), parse_port(port)?)
}

/// First `symbols.sh` found in `cwd`, then in `rnmr_specific`.
///
/// The caller supplies both directories; nothing here reads the environment.
pub fn find_symbols_file(cwd: &Path, rnmr_specific: Option<&Path>) -> Option<PathBuf> {
    std::iter::once(cwd)
        .chain(rnmr_specific)
        .map(|dir| dir.join(SYMBOLS_FILE))
        .find(|path| path.is_file())
}

pub fn load_symbols(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let symbols = parse_symbols(&text);
    debug!("Read {} symbols from {}", symbols.len(), path.display());
    Ok(symbols)
}

/// Resolve the controller address. Explicit values override the symbols
/// file; a symbols file is only read when something is missing.
pub fn resolve_connection(
    host: Option<&str>,
    port: Option<u16>,
    symbols_file: Option<&Path>,
) -> Result<ConnectionConfig, ConfigError> {
    if let (Some(host), Some(port)) = (host, port) {
        return ConnectionConfig::new(host, port);
    }

    let path = symbols_file.ok_or_else(|| {
        ConfigError::Missing(format!(
            "controller address (give --host and --port, or a {})",
            SYMBOLS_FILE
        ))
    })?;
    let symbols = load_symbols(path)?;

    let host = match host {
        Some(host) => host.to_string(),
        None => symbols
            .get(NODE_SYMBOL)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| ConfigError::Missing(NODE_SYMBOL.to_string()))?,
    };
    let port = match port {
        Some(port) => port,
        None => parse_port(
            symbols
                .get(PORT_SYMBOL)
                .ok_or_else(|| ConfigError::Missing(PORT_SYMBOL.to_string()))?,
        )?,
    };

    info!("Controller {}:{} from {}", host, port, path.display());
    ConnectionConfig::new(host, port)
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(value.to_string())),
    }
}
