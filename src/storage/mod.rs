//! Namespaced key/value storage persisted to a TOML file.
//!
//! The file holds one table per section: a general section per client
//! (`[my_client]`: flow id, flow checksum, function ids and checksums, default
//! input overrides) and a tokens section per login client id
//! (`["tokens_<client-id>"]`). Every value is a string.
//!
//! Writes rewrite the whole file. Whenever the document holds a `tokens_*`
//! section the file is left readable and writable by its owner only.

pub mod migrations;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::{Error, Result};

/// Parsed storage file: section name -> key -> value.
pub type Document = BTreeMap<String, BTreeMap<String, String>>;

/// Prefix of sections that hold credential material.
pub const TOKENS_SECTION_PREFIX: &str = "tokens_";

/// Prefix of stored default-input overrides in a general section.
pub const INPUT_DEFAULT_PREFIX: &str = "default_input__";

/// Name of the tokens section for a login client id.
pub fn tokens_section_name(client_id: &str) -> String {
    format!("{TOKENS_SECTION_PREFIX}{client_id}")
}

/// Key/value contract every manager persists through.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn save(&self) -> Result<()>;
    /// All keys currently present in this section.
    fn keys(&self) -> Result<Vec<String>>;
}

/// Default location of the storage file.
///
/// `TOOLFLOW_CONFIG` wins; otherwise `~/.toolflow/config.toml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TOOLFLOW_CONFIG") {
        return PathBuf::from(path);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".toolflow").join("config.toml");
    }

    PathBuf::from(".toolflow-config.toml")
}

struct ConfigInner {
    path: PathBuf,
    doc: Document,
}

/// Shared handle to one storage file. Cloning shares the same document.
#[derive(Clone)]
pub struct ConfigFile {
    inner: Arc<Mutex<ConfigInner>>,
}

impl std::fmt::Debug for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigFile").finish_non_exhaustive()
    }
}

impl ConfigFile {
    /// Load `path` (an absent file is an empty document) and run migrations.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut doc = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                Error::Storage(format!("failed reading {}: {e}", path.display()))
            })?;
            parse_document(&raw)
                .map_err(|e| Error::Storage(format!("invalid config {}: {e}", path.display())))?
        } else {
            Document::new()
        };

        let applied = migrations::run_migrations(&mut doc);
        let file = Self {
            inner: Arc::new(Mutex::new(ConfigInner { path, doc })),
        };
        if !applied.is_empty() {
            debug!(migrations = ?applied, "applied storage migrations");
            file.save()?;
        }
        Ok(file)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ConfigInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".into()))
    }

    /// Path of the backing file.
    pub fn path(&self) -> Result<PathBuf> {
        Ok(self.lock()?.path.clone())
    }

    /// A handle on one namespaced section.
    pub fn section(&self, name: impl Into<String>) -> ConfigSection {
        ConfigSection {
            file: self.clone(),
            name: name.into(),
        }
    }

    /// Names of every section currently in the document.
    pub fn sections(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.doc.keys().cloned().collect())
    }

    /// Write the whole document back to disk.
    pub fn save(&self) -> Result<()> {
        let inner = self.lock()?;
        write_document(&inner.path, &inner.doc)
    }
}

/// One section of a [`ConfigFile`].
#[derive(Debug, Clone)]
pub struct ConfigSection {
    file: ConfigFile,
    name: String,
}

impl ConfigSection {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Storage for ConfigSection {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.file.lock()?;
        Ok(inner
            .doc
            .get(&self.name)
            .and_then(|section| section.get(key))
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.file.lock()?;
        inner
            .doc
            .entry(self.name.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.file.lock()?;
        if let Some(section) = inner.doc.get_mut(&self.name) {
            section.remove(key);
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        self.file.save()
    }

    fn keys(&self) -> Result<Vec<String>> {
        let inner = self.file.lock()?;
        Ok(inner
            .doc
            .get(&self.name)
            .map(|section| section.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Process-local storage, mostly for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".into()))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

fn parse_document(raw: &str) -> std::result::Result<Document, toml::de::Error> {
    let table: toml::Table = toml::from_str(raw)?;
    let mut doc = Document::new();
    for (section, value) in table {
        match value {
            toml::Value::Table(entries) => {
                let values = entries
                    .into_iter()
                    .map(|(key, value)| {
                        let value = match value {
                            toml::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        (key, value)
                    })
                    .collect();
                doc.insert(section, values);
            }
            _ => warn!(key = %section, "ignoring top-level config value outside a section"),
        }
    }
    Ok(doc)
}

fn holds_tokens(doc: &Document) -> bool {
    doc.iter()
        .any(|(name, values)| name.starts_with(TOKENS_SECTION_PREFIX) && !values.is_empty())
}

fn write_document(path: &Path, doc: &Document) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
    }

    let text = toml::to_string(doc)
        .map_err(|e| Error::Storage(format!("serialize config failed: {e}")))?;
    let restricted = holds_tokens(doc);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if restricted {
        create_owner_only(&mut options);
    }
    let mut file = options
        .open(path)
        .map_err(|e| Error::Storage(format!("failed opening {}: {e}", path.display())))?;
    file.write_all(text.as_bytes())
        .map_err(|e| Error::Storage(format!("failed writing {}: {e}", path.display())))?;

    if restricted {
        restrict_permissions(path)?;
    }
    debug!(path = %path.display(), restricted, "saved config");
    Ok(())
}

#[cfg(unix)]
fn create_owner_only(options: &mut fs::OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
}

#[cfg(not(unix))]
fn create_owner_only(_options: &mut fs::OpenOptions) {}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use rustix::fs::{chmod, Mode};
    chmod(path, Mode::RUSR | Mode::WUSR).map_err(|e| Error::Io(e.into()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::open(dir.path().join("missing.toml")).unwrap();
        let section = file.section("client");
        assert_eq!(section.get("flow_id").unwrap(), None);
        assert!(file.sections().unwrap().is_empty());
    }

    #[test]
    fn values_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let file = ConfigFile::open(&path).unwrap();
        let section = file.section("my_client");
        section.set("flow_id", "abc").unwrap();
        section.set("hello_function_id", "fn-1").unwrap();
        section.save().unwrap();

        let reopened = ConfigFile::open(&path).unwrap();
        let section = reopened.section("my_client");
        assert_eq!(section.get("flow_id").unwrap().as_deref(), Some("abc"));
        assert_eq!(section.keys().unwrap().len(), 2);

        section.delete("flow_id").unwrap();
        assert_eq!(section.get("flow_id").unwrap(), None);
    }

    #[test]
    fn sections_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::open(dir.path().join("c.toml")).unwrap();
        file.section("a").set("k", "1").unwrap();
        file.section("b").set("k", "2").unwrap();
        assert_eq!(file.section("a").get("k").unwrap().as_deref(), Some("1"));
        assert_eq!(file.section("b").get("k").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn scope_keys_survive_quoting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        let file = ConfigFile::open(&path).unwrap();
        let tokens = file.section(tokens_section_name("client-1"));
        let key = "https://auth.example.org/scopes/abc/all__access_token";
        tokens.set(key, "secret").unwrap();
        tokens.save().unwrap();

        let reopened = ConfigFile::open(&path).unwrap();
        assert_eq!(
            reopened
                .section(tokens_section_name("client-1"))
                .get(key)
                .unwrap()
                .as_deref(),
            Some("secret")
        );
    }

    #[test]
    fn non_string_values_are_stringified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        fs::write(&path, "[client]\nretries = 3\nenabled = true\n").unwrap();
        let file = ConfigFile::open(&path).unwrap();
        let section = file.section("client");
        assert_eq!(section.get("retries").unwrap().as_deref(), Some("3"));
        assert_eq!(section.get("enabled").unwrap().as_deref(), Some("true"));
    }

    #[test]
    fn invalid_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        fs::write(&path, "[client\nbroken").unwrap();
        assert!(matches!(ConfigFile::open(&path), Err(Error::Storage(_))));
    }

    #[cfg(unix)]
    #[test]
    fn token_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        fs::write(&path, "[client]\nflow_id = \"x\"\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let file = ConfigFile::open(&path).unwrap();
        file.section(tokens_section_name("cid"))
            .set("scope__access_token", "t")
            .unwrap();
        file.save().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn memory_storage_contract() {
        let storage = MemoryStorage::new();
        storage.set("a", "1").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("1"));
        storage.delete("a").unwrap();
        assert_eq!(storage.get("a").unwrap(), None);
        storage.save().unwrap();
    }
}
