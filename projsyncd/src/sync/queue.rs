use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use projsync_core::FileEntry;

use super::classify::is_binary;
use super::vfs::VfsFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub path: String,
    pub content: Vec<u8>,
    pub is_binary: bool,
    /// Permanent transmission failures seen for this exact value.
    pub failures: u32,
}

impl PendingWrite {
    pub fn new(path: impl Into<String>, content: Vec<u8>) -> Self {
        let path = path.into();
        let is_binary = is_binary(&path, &content);
        Self {
            path,
            content,
            is_binary,
            failures: 0,
        }
    }

    pub fn to_entry(&self) -> FileEntry {
        FileEntry::from_bytes(self.path.clone(), &self.content, self.is_binary)
    }
}

impl From<VfsFile> for PendingWrite {
    fn from(file: VfsFile) -> Self {
        Self {
            path: file.path,
            content: file.content,
            is_binary: file.is_binary,
            failures: 0,
        }
    }
}

/// Not-yet-persisted writes keyed by path. A newer write to the same path
/// replaces the older one.
#[derive(Debug, Default)]
pub struct SyncQueue {
    inner: BTreeMap<String, PendingWrite>,
}

impl SyncQueue {
    /// Returns the value it replaced, if any.
    pub fn enqueue(&mut self, write: PendingWrite) -> Option<PendingWrite> {
        self.inner.insert(write.path.clone(), write)
    }

    pub fn drain(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.inner).into_values().collect()
    }

    /// Puts back entries from a failed attempt. Paths written again since
    /// the drain keep their newer value. Returns how many were restored.
    pub fn requeue(&mut self, entries: impl IntoIterator<Item = PendingWrite>) -> usize {
        let mut restored = 0;
        for write in entries {
            if let Entry::Vacant(slot) = self.inner.entry(write.path.clone()) {
                slot.insert(write);
                restored += 1;
            }
        }
        restored
    }

    pub fn remove(&mut self, path: &str) -> Option<PendingWrite> {
        self.inner.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&PendingWrite> {
        self.inner.get(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.inner.len();
        self.inner.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &str, content: &str) -> PendingWrite {
        PendingWrite::new(path, content.as_bytes().to_vec())
    }

    #[test]
    fn later_write_to_same_path_wins() {
        let mut queue = SyncQueue::default();
        assert!(queue.enqueue(write("/a.txt", "1")).is_none());
        let replaced = queue.enqueue(write("/a.txt", "2")).unwrap();
        assert_eq!(replaced.content, b"1");

        let batch = queue.drain();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, "/a.txt");
        assert_eq!(batch[0].content, b"2");
    }

    #[test]
    fn drain_leaves_queue_empty() {
        let mut queue = SyncQueue::default();
        queue.enqueue(write("/a.txt", "1"));
        queue.enqueue(write("/b.txt", "2"));

        let batch = queue.drain();
        assert_eq!(batch.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn requeue_keeps_fresher_pending_value() {
        let mut queue = SyncQueue::default();
        queue.enqueue(write("/a.txt", "1"));
        queue.enqueue(write("/b.txt", "b"));
        let attempted = queue.drain();

        queue.enqueue(write("/a.txt", "3"));
        let restored = queue.requeue(attempted);

        assert_eq!(restored, 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get("/a.txt").unwrap().content, b"3");
        assert_eq!(queue.get("/b.txt").unwrap().content, b"b");
    }

    #[test]
    fn classifies_binary_on_construction() {
        let png = PendingWrite::new("/logo.png", vec![1, 2, 3]);
        assert!(png.is_binary);
        assert_eq!(png.to_entry().content, "AQID");
        assert!(!write("/a.txt", "text").is_binary);
    }

    #[test]
    fn remove_drops_pending_write() {
        let mut queue = SyncQueue::default();
        queue.enqueue(write("/a.txt", "1"));
        assert!(queue.remove("/a.txt").is_some());
        assert!(!queue.contains("/a.txt"));
        assert_eq!(queue.clear(), 0);
    }
}
