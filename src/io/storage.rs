use crate::types::{AccessError, AccessResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Blob store accessed by key (S3 bucket, local directory, memory)
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AccessResult<()>;
    fn get(&self, key: &str) -> AccessResult<Vec<u8>>;
    /// Deleting a missing key is not an error
    fn delete(&self, key: &str) -> AccessResult<()>;
    fn exists(&self, key: &str) -> AccessResult<bool>;
    /// Every key starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> AccessResult<Vec<String>>;
}

/// File name of a storage key without directory or extension
pub fn artifact_stem(storage_key: &str) -> String {
    let name = storage_key.rsplit('/').next().unwrap_or(storage_key);
    match name.rfind('.') {
        Some(dot) if dot > 0 => name[..dot].to_string(),
        _ => name.to_string(),
    }
}

/// Overview key next to the raster: `{dir}/{overview_dir}/{stem}.png`
pub fn overview_key(storage_key: &str, overview_dir: &str) -> String {
    let stem = artifact_stem(storage_key);
    match storage_key.rfind('/') {
        Some(slash) => format!("{}/{}/{}.png", &storage_key[..slash], overview_dir, stem),
        None => format!("{}/{}.png", overview_dir, stem),
    }
}

/// (annotated, masked) crop keys for the `index`th polygon of a raster
pub fn crop_keys(prefix: &str, stem: &str, index: usize) -> (String, String) {
    let prefix = prefix.trim_end_matches('/');
    (
        format!("{}/{}-{}.jpg", prefix, stem, index),
        format!("{}/masked/{}-{}.jpg", prefix, stem, index),
    )
}

/// Whether `key` is one of the crop artifacts `crop_keys(prefix, stem, _)` produces
pub fn is_crop_key(key: &str, prefix: &str, stem: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    let Some(rest) = key.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) else {
        return false;
    };
    let name = rest.strip_prefix("masked/").unwrap_or(rest);
    name.strip_prefix(stem)
        .and_then(|r| r.strip_prefix('-'))
        .and_then(|r| r.strip_suffix(".jpg"))
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|(_, ct)| ct.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AccessResult<()> {
        self.objects
            .write()
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(())
    }

    fn get(&self, key: &str) -> AccessResult<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| AccessError::NotFound(format!("Object {}", key)))
    }

    fn delete(&self, key: &str) -> AccessResult<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> AccessResult<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    fn list(&self, prefix: &str) -> AccessResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Store rooted at a local directory; keys map to relative paths
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P) -> AccessResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            AccessError::Storage(format!("Cannot create store root {}: {}", root.display(), e))
        })?;
        log::debug!("Local object store at {}", root.display());
        Ok(Self { root })
    }

    pub fn path_for(&self, key: &str) -> AccessResult<PathBuf> {
        let relative = key.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|part| part == "..") {
            return Err(AccessError::Storage(format!("Invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for LocalStore {
    fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> AccessResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AccessError::Storage(format!("Cannot create {}: {}", parent.display(), e)))?;
        }
        fs::write(&path, bytes).map_err(|e| AccessError::Storage(format!("Cannot write {}: {}", key, e)))
    }

    fn get(&self, key: &str) -> AccessResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AccessError::NotFound(format!("Object {}", key)))
            }
            Err(e) => Err(AccessError::Storage(format!("Cannot read {}: {}", key, e))),
        }
    }

    fn delete(&self, key: &str) -> AccessResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AccessError::Storage(format!("Cannot delete {}: {}", key, e))),
        }
    }

    fn exists(&self, key: &str) -> AccessResult<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn list(&self, prefix: &str) -> AccessResult<Vec<String>> {
        // only the directory holding the prefix needs walking
        let dir_part = prefix.trim_start_matches('/').rsplit_once('/').map_or("", |(dir, _)| dir);
        let start = if dir_part.is_empty() { self.root.clone() } else { self.path_for(dir_part)? };

        let mut keys = Vec::new();
        if start.is_dir() {
            collect_files(&self.root, &start, &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix.trim_start_matches('/')));
        keys.sort();
        Ok(keys)
    }
}

fn collect_files(root: &Path, dir: &Path, keys: &mut Vec<String>) -> AccessResult<()> {
    let entries =
        fs::read_dir(dir).map_err(|e| AccessError::Storage(format!("Cannot list {}: {}", dir.display(), e)))?;
    for entry in entries {
        let path = entry
            .map_err(|e| AccessError::Storage(format!("Cannot list {}: {}", dir.display(), e)))?
            .path();
        if path.is_dir() {
            collect_files(root, &path, keys)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            keys.push(key.join("/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_derivation() {
        assert_eq!(artifact_stem("uploads/2024/site-a.tif"), "site-a");
        assert_eq!(artifact_stem("plain"), "plain");
        assert_eq!(artifact_stem("dir/.hidden"), ".hidden");
        assert_eq!(overview_key("uploads/site-a.tif", "modified"), "uploads/modified/site-a.png");
        assert_eq!(overview_key("site-a.tif", "modified"), "modified/site-a.png");

        let (annotated, masked) = crop_keys("fire-access-way/", "site-a", 3);
        assert_eq!(annotated, "fire-access-way/site-a-3.jpg");
        assert_eq!(masked, "fire-access-way/masked/site-a-3.jpg");
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.put("a/b.png", b"png", "image/png").unwrap();
        assert_eq!(store.get("a/b.png").unwrap(), b"png");
        assert_eq!(store.content_type("a/b.png").as_deref(), Some("image/png"));
        assert!(matches!(store.get("missing"), Err(AccessError::NotFound(_))));

        store.delete("a/b.png").unwrap();
        store.delete("a/b.png").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_local_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().join("bucket")).unwrap();

        store.put("fire-access-way/masked/x-0.jpg", &[1, 2, 3], "image/jpeg").unwrap();
        assert!(store.exists("fire-access-way/masked/x-0.jpg").unwrap());
        assert_eq!(store.get("fire-access-way/masked/x-0.jpg").unwrap(), vec![1, 2, 3]);

        store.delete("fire-access-way/masked/x-0.jpg").unwrap();
        store.delete("fire-access-way/masked/x-0.jpg").unwrap();
        assert!(!store.exists("fire-access-way/masked/x-0.jpg").unwrap());
        assert!(matches!(store.get("nope.jpg"), Err(AccessError::NotFound(_))));
    }

    #[test]
    fn test_crop_key_matching() {
        let (annotated, masked) = crop_keys("fire-access-way", "site-a", 12);
        assert!(is_crop_key(&annotated, "fire-access-way/", "site-a"));
        assert!(is_crop_key(&masked, "fire-access-way", "site-a"));

        // a different raster whose stem extends this one
        assert!(!is_crop_key("fire-access-way/site-a-b-0.jpg", "fire-access-way", "site-a"));
        assert!(!is_crop_key("fire-access-way/site-a-.jpg", "fire-access-way", "site-a"));
        assert!(!is_crop_key("other/site-a-0.jpg", "fire-access-way", "site-a"));
        assert!(!is_crop_key("fire-access-way/site-a-0.png", "fire-access-way", "site-a"));
    }

    #[test]
    fn test_list_by_prefix() {
        let dir = TempDir::new().unwrap();
        let local = LocalStore::new(dir.path()).unwrap();
        let memory = MemoryStore::new();
        let stores: [&dyn ObjectStore; 2] = [&local, &memory];

        for store in stores {
            store.put("faw/a-0.jpg", b"x", "image/jpeg").unwrap();
            store.put("faw/masked/a-0.jpg", b"x", "image/jpeg").unwrap();
            store.put("uploads/modified/a.png", b"x", "image/png").unwrap();

            assert_eq!(store.list("faw/").unwrap(), vec!["faw/a-0.jpg", "faw/masked/a-0.jpg"]);
            assert_eq!(store.list("faw/masked/").unwrap(), vec!["faw/masked/a-0.jpg"]);
            assert_eq!(store.list("").unwrap().len(), 3);
            assert!(store.list("nothing/here/").unwrap().is_empty());
        }
    }

    #[test]
    fn test_local_store_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        assert!(store.put("../outside.jpg", b"x", "image/jpeg").is_err());
    }
}
