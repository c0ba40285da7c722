use parking_lot::Mutex;
use std::collections::BTreeSet;
use tokio::sync::Notify;

use idrs_core::ResourceId;

/// Resources mutated since their last successful persist.
///
/// With `eager` set, every mark also wakes whoever awaits [`DirtySet::notified`]
/// so the flush task writes without waiting for its next tick.
#[derive(Debug, Default)]
pub struct DirtySet {
    ids: Mutex<BTreeSet<ResourceId>>,
    notify: Notify,
    eager: bool,
}

impl DirtySet {
    pub fn new(eager: bool) -> Self {
        Self {
            ids: Mutex::new(BTreeSet::new()),
            notify: Notify::new(),
            eager,
        }
    }

    /// Returns `true` if the id was not already dirty.
    pub fn mark(&self, id: &ResourceId) -> bool {
        let inserted = self.ids.lock().insert(id.clone());
        if self.eager {
            self.notify.notify_one();
        }
        inserted
    }

    /// Take every dirty id, leaving the set empty.
    pub fn drain(&self) -> Vec<ResourceId> {
        std::mem::take(&mut *self.ids.lock()).into_iter().collect()
    }

    /// Put back ids whose persist did not complete.
    pub fn restore<I: IntoIterator<Item = ResourceId>>(&self, ids: I) {
        self.ids.lock().extend(ids);
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.ids.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_drain_restore() {
        let dirty = DirtySet::new(false);
        let a = ResourceId::from("a");
        let b = ResourceId::from("b");
        assert!(dirty.mark(&a));
        assert!(!dirty.mark(&a));
        dirty.mark(&b);
        assert_eq!(dirty.len(), 2);

        let drained = dirty.drain();
        assert_eq!(drained, vec![a.clone(), b]);
        assert!(dirty.is_empty());

        dirty.restore(vec![a.clone()]);
        assert!(dirty.contains(&a));
    }

    #[tokio::test]
    async fn test_eager_mark_wakes_waiter() {
        let dirty = std::sync::Arc::new(DirtySet::new(true));
        let waiter = {
            let dirty = dirty.clone();
            tokio::spawn(async move { dirty.notified().await })
        };
        tokio::task::yield_now().await;
        dirty.mark(&ResourceId::from("a"));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
