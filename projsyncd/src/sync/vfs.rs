//! The live editing surface and the hook the sync engine uses to observe it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use super::classify::is_binary;
use super::paths::{PathError, normalize_path};

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("file not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsFile {
    pub path: String,
    pub content: Vec<u8>,
    pub is_binary: bool,
}

pub trait VirtualFs: Send + Sync + 'static {
    fn write(&self, path: &str, content: Vec<u8>) -> Result<(), VfsError>;

    fn remove(&self, path: &str) -> Result<(), VfsError>;

    fn read(&self, path: &str) -> Option<Vec<u8>>;

    fn list_with_contents(&self) -> Vec<VfsFile>;
}

/// Receives every change that went through an [`ObservedFs`].
pub trait SyncObserver: Send + Sync + 'static {
    fn on_write(&self, path: &str, content: Vec<u8>);

    fn on_remove(&self, path: &str);
}

#[derive(Debug, Default)]
pub struct MemoryVfs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.read().map(|files| files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VirtualFs for MemoryVfs {
    fn write(&self, path: &str, content: Vec<u8>) -> Result<(), VfsError> {
        let path = normalize_path(path)?;
        let mut files = self.files.write().unwrap_or_else(|poison| poison.into_inner());
        files.insert(path, content);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), VfsError> {
        let path = normalize_path(path)?;
        let mut files = self.files.write().unwrap_or_else(|poison| poison.into_inner());
        files
            .remove(&path)
            .map(|_| ())
            .ok_or(VfsError::NotFound(path))
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        let path = normalize_path(path).ok()?;
        let files = self.files.read().unwrap_or_else(|poison| poison.into_inner());
        files.get(&path).cloned()
    }

    fn list_with_contents(&self) -> Vec<VfsFile> {
        let files = self.files.read().unwrap_or_else(|poison| poison.into_inner());
        files
            .iter()
            .map(|(path, content)| VfsFile {
                path: path.clone(),
                is_binary: is_binary(path, content),
                content: content.clone(),
            })
            .collect()
    }
}

/// Wraps a filesystem so that successful writes and removes are reported
/// to an observer after they land in the inner filesystem.
pub struct ObservedFs<F, O> {
    inner: Arc<F>,
    observer: O,
}

impl<F: VirtualFs, O: SyncObserver> ObservedFs<F, O> {
    pub fn new(inner: Arc<F>, observer: O) -> Self {
        Self { inner, observer }
    }

    pub fn inner(&self) -> &Arc<F> {
        &self.inner
    }
}

impl<F: VirtualFs, O: SyncObserver> VirtualFs for ObservedFs<F, O> {
    fn write(&self, path: &str, content: Vec<u8>) -> Result<(), VfsError> {
        let path = normalize_path(path)?;
        self.inner.write(&path, content.clone())?;
        self.observer.on_write(&path, content);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), VfsError> {
        let path = normalize_path(path)?;
        self.inner.remove(&path)?;
        self.observer.on_remove(&path);
        Ok(())
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.read(path)
    }

    fn list_with_contents(&self) -> Vec<VfsFile> {
        self.inner.list_with_contents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SyncObserver for Arc<Recorder> {
        fn on_write(&self, path: &str, content: Vec<u8>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("write {path} {}", String::from_utf8_lossy(&content)));
        }

        fn on_remove(&self, path: &str) {
            self.events.lock().unwrap().push(format!("remove {path}"));
        }
    }

    #[test]
    fn memory_vfs_normalizes_paths() {
        let fs = MemoryVfs::new();
        fs.write("src//main.py", b"x".to_vec()).unwrap();
        assert_eq!(fs.read("/src/main.py").unwrap(), b"x");
        assert_eq!(fs.list_with_contents()[0].path, "/src/main.py");
    }

    #[test]
    fn list_classifies_binary_files() {
        let fs = MemoryVfs::new();
        fs.write("/a.txt", b"text".to_vec()).unwrap();
        fs.write("/b.dat", vec![1, 0, 2]).unwrap();
        let files = fs.list_with_contents();
        assert!(!files[0].is_binary);
        assert!(files[1].is_binary);
    }

    #[test]
    fn observer_sees_writes_and_removes_after_they_apply() {
        let recorder = Arc::new(Recorder::default());
        let fs = ObservedFs::new(Arc::new(MemoryVfs::new()), Arc::clone(&recorder));

        fs.write("a.txt", b"1".to_vec()).unwrap();
        fs.remove("/a.txt").unwrap();
        assert!(fs.remove("/a.txt").is_err());

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["write /a.txt 1", "remove /a.txt"]);
        assert!(fs.inner().is_empty());
    }

    #[test]
    fn rejected_paths_are_not_observed() {
        let recorder = Arc::new(Recorder::default());
        let fs = ObservedFs::new(Arc::new(MemoryVfs::new()), Arc::clone(&recorder));
        assert!(matches!(
            fs.write("../x", b"1".to_vec()),
            Err(VfsError::Path(PathError::UnsupportedComponent))
        ));
        assert!(recorder.events.lock().unwrap().is_empty());
    }
}
