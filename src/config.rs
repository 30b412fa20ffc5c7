//! Configuration file handling.
//!
//! The configuration is TOML. Scalar keys at the top level belong to the
//! root section (the daemon itself: where MPD lives); every top-level table
//! is one scrobbler section, named by its table key, which selects the
//! protocol:
//!
//! ```toml
//! mpd_host = "localhost"
//! mpd_port = 6600
//!
//! [as20]
//! session = "..."
//! store = "/var/lib/scrobd/cache.json"
//! ```
//!
//! Sections expose a deliberately small string interface — `has`, `get`,
//! `get_or` — so scrobbler back-ends stay decoupled from the file format.

use std::{collections::BTreeMap, env, fs, io, path::Path};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot read configuration file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration key {0} has an unsupported value type")]
    Unsupported(String),

    #[error("missing configuration key: {0}")]
    MissingKey(String),

    #[error("invalid MPD port: {0}")]
    Port(String),
}

/// One named group of string settings.
#[derive(Clone, Debug, Default)]
pub struct Section {
    name: String,
    values: BTreeMap<String, String>,
}

impl Section {
    fn from_table(name: &str, table: &toml::Table) -> Result<Self, Error> {
        let mut values = BTreeMap::new();
        for (key, value) in table {
            values.insert(key.clone(), scalar(&format!("{name}.{key}"), value)?);
        }
        Ok(Self {
            name: name.to_string(),
            values,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// The value for `key`; an error if the key is absent.
    pub fn get(&self, key: &str) -> Result<&str, Error> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::MissingKey(key.to_string()))
    }

    /// The value for `key`, or `default` when absent.
    #[must_use]
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

/// Converts a scalar TOML value into its string form.
fn scalar(key: &str, value: &toml::Value) -> Result<String, Error> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        _ => Err(Error::Unsupported(key.to_string())),
    }
}

/// The loaded configuration file.
#[derive(Clone, Debug, Default)]
pub struct Config {
    root: Section,
    sections: Vec<Section>,
}

impl Config {
    /// Loads and parses the file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses configuration text.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let table: toml::Table = text.parse()?;

        let mut root = Section::default();
        let mut sections = Vec::new();
        for (key, value) in &table {
            if let toml::Value::Table(inner) = value {
                sections.push(Section::from_table(key, inner)?);
            } else {
                root.values.insert(key.clone(), scalar(key, value)?);
            }
        }

        Ok(Self { root, sections })
    }

    #[must_use]
    pub fn root(&self) -> &Section {
        &self.root
    }

    /// The scrobbler sections, one per top-level table.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// MPD host: `mpd_host` key, else `$MPD_HOST`, else localhost.
    #[must_use]
    pub fn mpd_host(&self) -> String {
        self.root.get_or(
            "mpd_host",
            &env::var("MPD_HOST").unwrap_or_else(|_| "localhost".to_string()),
        )
    }

    /// MPD port: `mpd_port` key, else `$MPD_PORT`, else 6600.
    pub fn mpd_port(&self) -> Result<u16, Error> {
        let value = self.root.get_or(
            "mpd_port",
            &env::var("MPD_PORT").unwrap_or_else(|_| "6600".to_string()),
        );
        value.parse().map_err(|_| Error::Port(value))
    }
}
