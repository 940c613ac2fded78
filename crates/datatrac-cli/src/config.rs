//! Configuration file management for datatrac.
//!
//! Provides a TOML-based config file at `~/.config/datatrac/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use datatrac_core::credentials::SecretKey;
use datatrac_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub secrets: SecretsSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SecretsSection {
    /// Hex-encoded credential-sealing key (64 hex chars = 32 bytes).
    pub key: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the datatrac config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/datatrac` or
/// `~/.config/datatrac`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("datatrac");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("datatrac")
}

/// Return the path to the datatrac config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Secret key generation
// -----------------------------------------------------------------------

/// Generate a random sealing key: 32 random bytes, hex-encoded (64 chars).
pub fn generate_secret_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DatatracConfig {
    pub db_config: DbConfig,
    pub secret_key: SecretKey,
}

impl DatatracConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `DATATRAC_DATABASE_URL` env >
    ///   `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Sealing key: `DATATRAC_SECRET_KEY` env > `config_file.secrets.key`
    ///   > error
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("DATATRAC_DATABASE_URL") {
            url
        } else if let Some(ref file) = file_config {
            file.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let key_hex = if let Ok(key) = std::env::var("DATATRAC_SECRET_KEY") {
            key
        } else if let Some(ref file) = file_config {
            file.secrets.key.clone()
        } else {
            bail!(
                "no sealing key found: set DATATRAC_SECRET_KEY or run `datatrac init` \
                 to write {}",
                config_path().display()
            );
        };

        let secret_key = SecretKey::from_hex(&key_hex)
            .map_err(|e| anyhow::anyhow!("invalid sealing key: {e}"))?;

        Ok(Self {
            db_config: DbConfig::new(db_url),
            secret_key,
        })
    }
}
