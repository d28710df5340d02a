//! Files of trusted public keys: authorized keys on servers, known hosts on clients.

use std::{fs, io::Write as _, path::Path, str::FromStr};

use tracing::{debug, warn};

use crate::{Error, PublicKey};

/// One trusted key, optionally tied to an identity (a host name or address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    /// The identity this key is known for. Empty if the key is trusted for any identity.
    pub identity: String,

    /// The trusted key.
    pub key: PublicKey,
}

/// A set of trusted keys, as used for authorized keys (server side) and known hosts (client side).
///
/// The text form has one entry per line: `identity key` or a bare `key`, where keys are in their
/// base64 form. Blank lines and lines starting with `#` or `--` are ignored, as are lines whose
/// key cannot be decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustStore {
    entries: Vec<TrustEntry>,
}

impl TrustStore {
    /// Load a trust store from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let store: Self = text.parse()?;
        debug!(path = %path.display(), entries = store.entries.len(), "loaded trust store");
        Ok(store)
    }

    /// Load a trust store from a file, or start an empty one if the file doesn't exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, Error> {
        match Self::load(path) {
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    /// All entries, in file order.
    pub fn entries(&self) -> &[TrustEntry] {
        &self.entries
    }

    /// Whether the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the key is trusted under any identity.
    pub fn contains_key(&self, key: &PublicKey) -> bool {
        self.entries.iter().any(|entry| entry.key == *key)
    }

    /// Whether the key is trusted for this identity.
    ///
    /// Entries without an identity match every identity.
    pub fn is_known(&self, identity: &str, key: &PublicKey) -> bool {
        self.entries.iter().any(|entry| {
            entry.key == *key && (entry.identity.is_empty() || entry.identity == identity)
        })
    }

    /// Add an entry in memory.
    pub fn insert(&mut self, identity: impl Into<String>, key: PublicKey) {
        self.entries.push(TrustEntry {
            identity: identity.into(),
            key,
        });
    }

    /// Add an entry, and append it to the file at `path` (creating it if needed).
    pub fn append(
        &mut self,
        path: impl AsRef<Path>,
        identity: &str,
        key: PublicKey,
    ) -> Result<(), Error> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        writeln!(file, "{}", format_line(identity, &key))?;
        self.insert(identity, key);
        Ok(())
    }
}

fn format_line(identity: &str, key: &PublicKey) -> String {
    if identity.is_empty() {
        key.to_base64()
    } else {
        format!("{identity} {key}")
    }
}

impl FromStr for TrustStore {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut store = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("--") {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (identity, key) = match (fields.next(), fields.next()) {
                (Some(key), None) => ("", key),
                (Some(identity), Some(key)) => (identity, key),
                (None, _) => continue,
            };

            match PublicKey::from_base64(key) {
                Ok(key) => store.insert(identity, key),
                Err(err) => warn!(line = lineno + 1, %err, "skipping malformed trust entry"),
            }
        }

        Ok(store)
    }
}
