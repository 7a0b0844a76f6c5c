use std::collections::BTreeSet;

use tokio::sync::watch;

/// Project ids the UI currently needs mounted.
///
/// Changes are published over a watch channel so the lifecycle controller
/// can react without polling. The set is only ever changed by `add` and
/// `remove`; nothing prunes it on a timer.
#[derive(Debug)]
pub struct ActiveEntityRegistry {
    ids: watch::Sender<BTreeSet<String>>,
}

impl Default for ActiveEntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveEntityRegistry {
    pub fn new() -> Self {
        let (ids, _) = watch::channel(BTreeSet::new());
        Self { ids }
    }

    /// Idempotent union. Subscribers are only woken when the set grows.
    pub fn add<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        self.ids.send_if_modified(|current| {
            let before = current.len();
            current.extend(ids);
            current.len() != before
        });
    }

    pub fn remove(&self, id: &str) {
        self.ids.send_if_modified(|current| current.remove(id));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.borrow().contains(id)
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.ids.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<String>> {
        self.ids.subscribe()
    }
}
