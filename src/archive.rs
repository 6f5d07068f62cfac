use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::debug;
use parking_lot::RwLock;

/// Image extensions probed, in order, when resolving a numbered entry.
const NUMBERED_EXTENSIONS: &[&str] = &["png", "bmp", "jpg", "tga"];

/// Read-only access to the game's data files.
///
/// Names always use `/` as separator; implementations translate them to
/// whatever their backing store expects.
pub trait Archive: Send + Sync {
    /// Returns true when `name` can be read.
    fn exists(&self, name: &str) -> bool;

    /// Returns the exact bytes of `name`, or `None` if it cannot be read.
    fn get(&self, name: &str) -> Option<Vec<u8>>;

    /// Returns the bytes of the numbered entry `index` (background CGs).
    fn get_numbered(&self, index: u32) -> Option<Vec<u8>>;
}

/// Normalizes an asset name to forward slashes without leading separators.
pub fn normalize_name(name: &str) -> String {
    let replaced = name.replace('\\', "/");
    let mut parts = Vec::new();
    for part in replaced.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Archive backed by a directory tree on disk.
#[derive(Debug)]
pub struct DirectoryArchive {
    root: PathBuf,
    // lowercase relative name -> on-disk relative name, built lazily
    folded: RwLock<Option<HashMap<String, PathBuf>>>,
}

impl DirectoryArchive {
    /// Opens `root` as an archive. The directory must exist.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let metadata = fs::metadata(&root)
            .with_context(|| format!("unable to open asset directory {}", root.display()))?;
        if !metadata.is_dir() {
            return Err(anyhow!("{} is not a directory", root.display()));
        }
        Ok(Self {
            root,
            folded: RwLock::new(None),
        })
    }

    /// Returns the directory backing this archive.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return None;
        }
        let exact = self.root.join(&normalized);
        if exact.is_file() {
            return Some(exact);
        }
        // Game data is authored on case-insensitive filesystems.
        let key = normalized.to_lowercase();
        if self.folded.read().is_none() {
            let index = build_case_index(&self.root);
            *self.folded.write() = Some(index);
        }
        self.folded
            .read()
            .as_ref()
            .and_then(|index| index.get(&key))
            .map(|relative| self.root.join(relative))
    }
}

impl Archive for DirectoryArchive {
    fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    fn get(&self, name: &str) -> Option<Vec<u8>> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                debug!("unable to read {}: {err}", path.display());
                None
            }
        }
    }

    fn get_numbered(&self, index: u32) -> Option<Vec<u8>> {
        NUMBERED_EXTENSIONS
            .iter()
            .find_map(|ext| self.get(&format!("cg/{index}.{ext}")))
    }
}

fn build_case_index(root: &Path) -> HashMap<String, PathBuf> {
    let mut index = HashMap::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let Ok(entries) = fs::read_dir(root.join(&relative)) else {
            continue;
        };
        for entry in entries.flatten() {
            let child = relative.join(entry.file_name());
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => pending.push(child),
                Ok(_) => {
                    let key = child.to_string_lossy().replace('\\', "/").to_lowercase();
                    index.insert(key, child);
                }
                Err(_) => {}
            }
        }
    }
    index
}

/// Archive held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    entries: HashMap<String, Vec<u8>>,
    numbered: HashMap<u32, Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a named entry.
    pub fn insert(&mut self, name: &str, data: impl Into<Vec<u8>>) {
        self.entries.insert(normalize_name(name), data.into());
    }

    /// Adds or replaces a numbered entry.
    pub fn insert_numbered(&mut self, index: u32, data: impl Into<Vec<u8>>) {
        self.numbered.insert(index, data.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.numbered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Archive for MemoryArchive {
    fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(&normalize_name(name))
    }

    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.get(&normalize_name(name)).cloned()
    }

    fn get_numbered(&self, index: u32) -> Option<Vec<u8>> {
        self.numbered.get(&index).cloned()
    }
}
