use crate::file_discovery::SourceFile;
use crate::symbol_indexer::FileIndex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Size and modification time; a changed file misses the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        Some(Self {
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

struct CacheEntry {
    fingerprint: Fingerprint,
    index: Arc<FileIndex>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

/// Parsed indexes kept between scans of the same tree. Owned by the caller
/// and handed to the analyzer by reference; it is only touched before and
/// after the parallel indexing phase.
pub struct ScanCache {
    entries: HashMap<PathBuf, CacheEntry>,
    hits: usize,
    misses: usize,
}

impl ScanCache {
    pub fn init() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Drop every entry. Returns how many were held.
    pub fn teardown(&mut self) -> usize {
        let held = self.entries.len();
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
        debug!(entries = held, "scan cache torn down");
        held
    }

    pub fn lookup(&mut self, file: &SourceFile) -> Option<Arc<FileIndex>> {
        let current = Fingerprint::of(&file.path);
        let hit = self.entries.get(&file.path).and_then(|entry| {
            let fresh = current == Some(entry.fingerprint) && entry.index.file == *file;
            fresh.then(|| Arc::clone(&entry.index))
        });
        match hit {
            Some(index) => {
                self.hits += 1;
                Some(index)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, file: &SourceFile, index: Arc<FileIndex>) {
        if let Some(fingerprint) = Fingerprint::of(&file.path) {
            self.entries
                .insert(file.path.clone(), CacheEntry { fingerprint, index });
        }
    }

    /// Forget files that are no longer part of the tree.
    pub fn retain(&mut self, live: &HashSet<PathBuf>) {
        self.entries.retain(|path, _| live.contains(path));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_discovery::Language;
    use crate::symbol_indexer::SymbolIndexer;
    use tempfile::TempDir;

    fn source(dir: &TempDir, rel: &str, content: &str) -> SourceFile {
        let path = dir.path().join(rel);
        fs::write(&path, content).unwrap();
        SourceFile {
            path,
            relative_path: PathBuf::from(rel),
            size: content.len() as u64,
            language: Language::Python,
            is_test: false,
        }
    }

    #[test]
    fn hit_until_file_changes() {
        let dir = TempDir::new().unwrap();
        let file = source(&dir, "a.py", "x = 1\n");
        let index = Arc::new(SymbolIndexer::new().unwrap().index_file(&file).unwrap());

        let mut cache = ScanCache::init();
        assert!(cache.lookup(&file).is_none());
        cache.insert(&file, index);
        assert!(cache.lookup(&file).is_some());

        let changed = source(&dir, "a.py", "x = 1\ny = 2\n");
        assert!(cache.lookup(&changed).is_none());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn teardown_empties_the_cache() {
        let dir = TempDir::new().unwrap();
        let file = source(&dir, "a.py", "x = 1\n");
        let index = Arc::new(SymbolIndexer::new().unwrap().index_file(&file).unwrap());

        let mut cache = ScanCache::init();
        cache.insert(&file, index);
        assert_eq!(cache.teardown(), 1);
        assert!(cache.is_empty());
        assert!(cache.lookup(&file).is_none());
    }
}
