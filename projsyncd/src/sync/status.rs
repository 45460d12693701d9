use projsync_core::ProjectMetadata;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub project: Option<ProjectMetadata>,
    /// True exactly while a batch transmission is outstanding.
    pub syncing: bool,
    pub last_synced_at: Option<OffsetDateTime>,
}

impl SyncStatus {
    pub fn bound(project: Option<ProjectMetadata>) -> Self {
        Self {
            project,
            syncing: false,
            last_synced_at: None,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project.as_ref().map(|project| project.id.as_str())
    }

    pub fn last_synced_label(&self) -> String {
        match self.last_synced_at {
            Some(at) => at
                .format(&Rfc3339)
                .unwrap_or_else(|_| at.unix_timestamp().to_string()),
            None => "never".to_string(),
        }
    }
}

/// Owner side of the observable status. Only the engine holds one;
/// everybody else gets a receiver.
#[derive(Debug)]
pub(crate) struct StatusCell {
    tx: watch::Sender<SyncStatus>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn reset(&self, project: Option<ProjectMetadata>) {
        self.tx.send_replace(SyncStatus::bound(project));
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        self.tx.send_if_modified(|status| {
            let changed = status.syncing != syncing;
            status.syncing = syncing;
            changed
        });
    }

    pub(crate) fn mark_synced(&self, at: OffsetDateTime) {
        self.tx.send_modify(|status| {
            status.syncing = false;
            status.last_synced_at = Some(at);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_previous_binding_state() {
        let cell = StatusCell::new();
        cell.reset(Some(ProjectMetadata::named("p1", "One")));
        cell.set_syncing(true);
        cell.mark_synced(OffsetDateTime::UNIX_EPOCH);

        cell.reset(Some(ProjectMetadata::named("p2", "Two")));
        let status = cell.current();
        assert_eq!(status.project_id(), Some("p2"));
        assert!(!status.syncing);
        assert_eq!(status.last_synced_at, None);
    }

    #[test]
    fn subscribers_only_wake_on_real_changes() {
        let cell = StatusCell::new();
        let mut rx = cell.subscribe();
        rx.borrow_and_update();

        cell.set_syncing(false);
        assert!(!rx.has_changed().unwrap());

        cell.set_syncing(true);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().syncing);
    }

    #[test]
    fn labels_timestamps_as_rfc3339() {
        let mut status = SyncStatus::default();
        assert_eq!(status.last_synced_label(), "never");
        status.last_synced_at = Some(OffsetDateTime::UNIX_EPOCH);
        assert_eq!(status.last_synced_label(), "1970-01-01T00:00:00Z");
    }
}
