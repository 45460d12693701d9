use std::sync::Arc;

use projsync_core::FileEntry;
use tracing::{debug, warn};

use super::queue::PendingWrite;
use super::store::{DurableStore, StoreError};

/// Outcome of sending one drained snapshot.
#[derive(Debug, Default)]
pub struct Delivery {
    pub sent: usize,
    /// Entries that did not persist, each with whether its failure is
    /// permanent.
    pub failed: Vec<(PendingWrite, bool)>,
    /// First error seen.
    pub error: Option<StoreError>,
}

impl Delivery {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Turns a drained snapshot into a single `batch_write` call.
pub struct BatchTransmitter<S> {
    store: Arc<S>,
}

impl<S: DurableStore> BatchTransmitter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the number of files sent. An empty batch makes no call.
    pub async fn transmit(
        &self,
        project_id: &str,
        batch: &[PendingWrite],
    ) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let entries: Vec<FileEntry> = batch.iter().map(PendingWrite::to_entry).collect();
        debug!(project = project_id, files = entries.len(), "sending batch");
        self.store.batch_write(project_id, &entries).await?;
        Ok(entries.len())
    }

    /// Sends `batch` as one call. A permanent rejection of a multi-file
    /// batch is followed by one `write_file` per entry, so only entries
    /// that fail on their own are reported as failed.
    pub async fn deliver(&self, project_id: &str, batch: Vec<PendingWrite>) -> Delivery {
        let err = match self.transmit(project_id, &batch).await {
            Ok(sent) => {
                return Delivery {
                    sent,
                    ..Delivery::default()
                };
            }
            Err(err) => err,
        };
        if !err.is_permanent() || batch.len() < 2 {
            let permanent = err.is_permanent();
            return Delivery {
                sent: 0,
                failed: batch.into_iter().map(|write| (write, permanent)).collect(),
                error: Some(err),
            };
        }

        warn!(project = project_id, files = batch.len(), error = %err, "batch rejected, sending files one at a time");
        let mut delivery = Delivery::default();
        for write in batch {
            match self.store.write_file(project_id, &write.to_entry()).await {
                Ok(()) => delivery.sent += 1,
                Err(err) => {
                    debug!(project = project_id, path = %write.path, error = %err, "file rejected");
                    delivery.failed.push((write, err.is_permanent()));
                    delivery.error.get_or_insert(err);
                }
            }
        }
        delivery
    }
}

/// Where the entries of a failed batch go next.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FailureTriage {
    pub retry: Vec<PendingWrite>,
    pub dead: Vec<PendingWrite>,
}

/// Transient failures always retry. Permanent failures retry until a value
/// has failed `max_permanent_failures` times; zero means never give up.
pub fn triage_failure(
    failed: impl IntoIterator<Item = (PendingWrite, bool)>,
    max_permanent_failures: u32,
) -> FailureTriage {
    let mut triage = FailureTriage::default();
    for (mut write, permanent) in failed {
        if permanent {
            write.failures = write.failures.saturating_add(1);
            if max_permanent_failures > 0 && write.failures >= max_permanent_failures {
                triage.dead.push(write);
                continue;
            }
        }
        triage.retry.push(write);
    }
    triage
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::sync::fs_store::FsProjectStore;
    use projsync_core::ProjectMetadata;

    fn write(path: &str, content: &str) -> PendingWrite {
        PendingWrite::new(path, content.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        let dir = tempdir().unwrap();
        // No project exists, so any real call would fail.
        let transmitter = BatchTransmitter::new(Arc::new(FsProjectStore::new(dir.path())));
        assert_eq!(transmitter.transmit("missing", &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sends_whole_batch_to_store() {
        let dir = tempdir().unwrap();
        let store = FsProjectStore::new(dir.path());
        store
            .create_project(&ProjectMetadata::named("p1", "One"))
            .await
            .unwrap();
        let transmitter = BatchTransmitter::new(Arc::new(store));

        let sent = transmitter
            .transmit("p1", &[write("/a.txt", "2"), write("/b.txt", "b")])
            .await
            .unwrap();

        assert_eq!(sent, 2);
        let store = transmitter.store();
        assert_eq!(store.read_file("p1", "/a.txt").await.unwrap(), b"2");
        assert_eq!(store.read_file("p1", "/b.txt").await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn rejected_batch_is_retried_file_by_file() {
        let dir = tempdir().unwrap();
        let store = FsProjectStore::new(dir.path());
        store
            .create_project(&ProjectMetadata::named("p1", "One"))
            .await
            .unwrap();
        let transmitter = BatchTransmitter::new(Arc::new(store));

        let delivery = transmitter
            .deliver("p1", vec![write("/.project.json", "{}"), write("/ok.txt", "ok")])
            .await;

        assert_eq!(delivery.sent, 1);
        assert!(!delivery.is_complete());
        assert_eq!(delivery.failed.len(), 1);
        assert_eq!(delivery.failed[0].0.path, "/.project.json");
        assert!(delivery.failed[0].1);
        assert!(delivery.error.unwrap().is_permanent());
        let store = transmitter.store();
        assert_eq!(store.read_file("p1", "/ok.txt").await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn missing_project_fails_every_entry() {
        let dir = tempdir().unwrap();
        let transmitter = BatchTransmitter::new(Arc::new(FsProjectStore::new(dir.path())));

        let delivery = transmitter
            .deliver("gone", vec![write("/a.txt", "1"), write("/b.txt", "2")])
            .await;

        assert_eq!(delivery.sent, 0);
        assert_eq!(delivery.failed.len(), 2);
        assert!(delivery.failed.iter().all(|(_, permanent)| *permanent));
    }

    #[test]
    fn transient_failures_always_retry() {
        let triage = triage_failure(vec![(write("/a.txt", "1"), false)], 1);
        assert_eq!(triage.retry.len(), 1);
        assert_eq!(triage.retry[0].failures, 0);
        assert!(triage.dead.is_empty());
    }

    #[test]
    fn permanent_failures_dead_letter_after_budget() {
        let first = triage_failure(vec![(write("/a.txt", "1"), true)], 2);
        assert_eq!(first.retry[0].failures, 1);

        let second = triage_failure(first.retry.into_iter().map(|w| (w, true)), 2);
        assert!(second.retry.is_empty());
        assert_eq!(second.dead.len(), 1);
        assert_eq!(second.dead[0].path, "/a.txt");
    }

    #[test]
    fn zero_budget_retries_forever() {
        let mut batch = vec![write("/a.txt", "1")];
        for _ in 0..50 {
            let triage = triage_failure(batch.into_iter().map(|w| (w, true)), 0);
            assert!(triage.dead.is_empty());
            batch = triage.retry;
        }
        assert_eq!(batch[0].failures, 50);
    }
}
