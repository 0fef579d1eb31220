//! Local filesystem persistence for histories, bundles, aliases and
//! relations.
//!
//! ## Layout
//!
//! - `v1/resource/<realm>/<subrealm>/<path>.yml` — the resource history
//! - `v1/observed/<realm>+<subrealm>+<path>/<affordance>.yml` — one cached
//!   bundle per observed affordance
//! - `v1/alias/<hash>.yml` — alias string → locator
//! - `v1/relation/defs/<hash>.yml` — relation definitions by unique id
//! - `v1/relation/refs/<node>/<hash>.yml` — one reference per touched node
//!
//! Values are YAML-serialized records. Writers take an exclusive per-URI
//! lock while applying a delta; reads are lock-free since every write is a
//! whole-file replace.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::history::{Locator, ResourceHistory};
use crate::relation::Relation;
use crate::uri::{ResourceUri, Suffix};

/// Local filesystem storage for the knowledge cache.
pub struct Storage {
    root_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Storage {
    /// Storage rooted at the default data directory.
    ///
    /// `NDK_DATA_DIR` overrides the root explicitly; otherwise
    /// `XDG_DATA_HOME/ndk` or `~/.ndk` is used.
    pub fn new() -> Result<Self> {
        if let Ok(dir) = std::env::var("NDK_DATA_DIR") {
            let trimmed = dir.trim();
            if !trimmed.is_empty() {
                return Self::with_root(PathBuf::from(trimmed));
            }
        }

        let root_dir = if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            let trimmed = xdg.trim();
            if trimmed.is_empty() {
                Self::fallback_data_dir()?
            } else {
                PathBuf::from(trimmed).join("ndk")
            }
        } else {
            Self::fallback_data_dir()?
        };

        Self::with_root(root_dir)
    }

    fn fallback_data_dir() -> Result<PathBuf> {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| Error::Internal("failed to determine home directory".into()))?;
        Ok(base.home_dir().join(".ndk"))
    }

    /// Storage rooted at an explicit directory.
    pub fn with_root(root_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root_dir)
            .map_err(|e| Error::Internal(format!("failed to create storage root: {e}")))?;
        Ok(Self {
            root_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// The root data directory.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// The exclusive write lock for one resource URI.
    ///
    /// Held while applying a delta so concurrent writers of the same
    /// resource serialize; different resources never contend.
    pub fn uri_lock(&self, uri: &ResourceUri) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    ///
    /// Paths
    ///

    fn resource_path(&self, uri: &ResourceUri) -> PathBuf {
        let mut path = self
            .root_dir
            .join("v1")
            .join("resource")
            .join(uri.realm().as_str())
            .join(uri.subrealm().as_str());
        for part in uri.path() {
            path = path.join(part.as_str());
        }
        path.with_extension("yml")
    }

    fn observed_dir(&self, uri: &ResourceUri) -> PathBuf {
        let mut key = format!("{}+{}", uri.realm(), uri.subrealm());
        for part in uri.path() {
            key.push('+');
            key.push_str(part.as_str());
        }
        self.root_dir.join("v1").join("observed").join(key)
    }

    fn observed_path(&self, uri: &ResourceUri, affordance: &Suffix) -> PathBuf {
        let file_name = affordance.as_suffix().replace('/', "+");
        self.observed_dir(uri).join(format!("{file_name}.yml"))
    }

    fn alias_path(&self, alias: &str) -> PathBuf {
        self.root_dir
            .join("v1")
            .join("alias")
            .join(format!("{}.yml", hash_key(alias)))
    }

    fn relation_def_path(&self, unique_id: &str) -> PathBuf {
        self.root_dir
            .join("v1")
            .join("relation")
            .join("defs")
            .join(format!("{}.yml", hash_key(unique_id)))
    }

    fn relation_refs_dir(&self, node: &ResourceUri) -> PathBuf {
        self.root_dir
            .join("v1")
            .join("relation")
            .join("refs")
            .join(hash_key(&node.to_string()))
    }

    ///
    /// Resource history
    ///

    /// Persist a resource history.
    pub fn save_resource_history(
        &self,
        uri: &ResourceUri,
        history: &ResourceHistory,
    ) -> Result<()> {
        debug!(uri = %uri, deltas = history.history.len(), "saving resource history");
        write_yaml(&self.resource_path(uri), history)
    }

    /// Load a resource history, when cached.
    pub fn load_resource_history(&self, uri: &ResourceUri) -> Result<Option<ResourceHistory>> {
        read_yaml(&self.resource_path(uri))
    }

    ///
    /// Bundles
    ///

    /// Persist a cached bundle under its affordance.
    pub fn save_bundle(&self, bundle: &Bundle) -> Result<()> {
        let uri = bundle.uri();
        debug!(uri = %uri, "saving cached bundle");
        write_yaml(
            &self.observed_path(uri.resource_uri(), uri.suffix()),
            bundle,
        )
    }

    /// Load a cached bundle, when present.
    pub fn load_bundle(
        &self,
        resource_uri: &ResourceUri,
        affordance: &Suffix,
    ) -> Result<Option<Bundle>> {
        read_yaml(&self.observed_path(resource_uri, affordance))
    }

    ///
    /// Aliases
    ///

    /// Persist an alias from a reference string to a locator.
    pub fn save_alias(&self, alias: &str, locator: &Locator) -> Result<()> {
        debug!(alias, "saving alias");
        write_yaml(&self.alias_path(alias), locator)
    }

    /// Resolve an alias to its locator, when known.
    pub fn load_alias(&self, alias: &str) -> Result<Option<Locator>> {
        read_yaml(&self.alias_path(alias))
    }

    /// Remove an alias, ignoring missing entries.
    pub fn remove_alias(&self, alias: &str) -> Result<()> {
        remove_file_if_exists(&self.alias_path(alias))
    }

    ///
    /// Relations
    ///

    /// Persist a relation: one definition plus one reference per node.
    pub fn save_relation(&self, relation: &Relation) -> Result<()> {
        let unique_id = relation.unique_id();
        debug!(unique_id, "saving relation");
        write_yaml(&self.relation_def_path(&unique_id), relation)?;

        for node in relation.nodes() {
            let ref_path = self
                .relation_refs_dir(&node)
                .join(format!("{}.yml", hash_key(&unique_id)));
            write_yaml(&ref_path, &unique_id)?;
        }
        Ok(())
    }

    /// Remove a relation's definition and references.
    pub fn remove_relation(&self, relation: &Relation) -> Result<()> {
        let unique_id = relation.unique_id();
        remove_file_if_exists(&self.relation_def_path(&unique_id))?;
        for node in relation.nodes() {
            let ref_path = self
                .relation_refs_dir(&node)
                .join(format!("{}.yml", hash_key(&unique_id)));
            remove_file_if_exists(&ref_path)?;
        }
        Ok(())
    }

    /// All relations touching a node, sorted by unique id.
    pub fn list_relations(&self, node: &ResourceUri) -> Result<Vec<Relation>> {
        let refs_dir = self.relation_refs_dir(node);
        let entries = match fs::read_dir(&refs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Internal(format!(
                    "failed to list relations: {e}"
                )));
            },
        };

        let mut relations: Vec<Relation> = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Internal(format!("failed to list relations: {e}")))?;
            let unique_id: Option<String> = read_yaml(&entry.path())?;
            let Some(unique_id) = unique_id else {
                continue;
            };
            match read_yaml::<Relation>(&self.relation_def_path(&unique_id))? {
                Some(relation) => relations.push(relation),
                None => {
                    warn!(unique_id, "dangling relation reference");
                },
            }
        }

        relations.sort_by_key(Relation::unique_id);
        relations.dedup_by_key(|relation| relation.unique_id());
        Ok(relations)
    }
}

fn hash_key(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    // 128 bits is plenty for uniqueness and keeps file names readable.
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Internal(format!("failed to create storage dir: {e}")))?;
    }
    let yaml = serde_yaml::to_string(value)
        .map_err(|e| Error::Internal(format!("failed to serialize record: {e}")))?;
    fs::write(path, yaml).map_err(|e| Error::Internal(format!("failed to write record: {e}")))
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Internal(format!("failed to read record: {e}"))),
    };
    let value = serde_yaml::from_str(&contents)
        .map_err(|e| Error::Internal(format!("failed to parse record: {e}")))?;
    Ok(Some(value))
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Internal(format!("failed to remove record: {e}"))),
    }
}
