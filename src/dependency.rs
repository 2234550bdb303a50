//! Change notification for storage entries.
//!
//! Scene-side users register callbacks on the entries they display; the
//! storage fires them synchronously, in registration order, whenever a
//! mutation invalidates cached render state. This replaces an implicit
//! notification bus with an explicit per-entry subscriber list.

/// What changed about a storage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// GPU buffers were freed or will be recreated; re-record draw state.
    Buffers,
    /// Reported bounds changed.
    Bounds,
    /// The entry was freed; drop every reference to it.
    Deleted,
}

/// Ticket returned by [`DependencyTracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ChangeCallback = Box<dyn FnMut(ChangeKind)>;

/// Per-entry subscriber list.
pub struct DependencyTracker {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, ChangeCallback)>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(ChangeKind) + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    pub fn notify(&mut self, kind: ChangeKind) {
        for (_, callback) in &mut self.subscribers {
            callback(kind);
        }
    }

    /// Fire `Deleted` and drop all subscribers. Called exactly once, when
    /// the owning entry is freed.
    pub fn notify_deleted(&mut self) {
        self.notify(ChangeKind::Deleted);
        self.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for DependencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyTracker")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_notify_in_registration_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = DependencyTracker::new();

        for tag in 0..3 {
            let seen = Rc::clone(&seen);
            tracker.subscribe(move |kind| seen.borrow_mut().push((tag, kind)));
        }
        tracker.notify(ChangeKind::Bounds);

        assert_eq!(
            *seen.borrow(),
            vec![
                (0, ChangeKind::Bounds),
                (1, ChangeKind::Bounds),
                (2, ChangeKind::Bounds)
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let seen = Rc::new(RefCell::new(0u32));
        let mut tracker = DependencyTracker::new();

        let seen_a = Rc::clone(&seen);
        let id = tracker.subscribe(move |_| *seen_a.borrow_mut() += 1);
        tracker.notify(ChangeKind::Buffers);
        assert!(tracker.unsubscribe(id));
        assert!(!tracker.unsubscribe(id));
        tracker.notify(ChangeKind::Buffers);

        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn test_deleted_clears_subscribers() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = DependencyTracker::new();

        let seen_a = Rc::clone(&seen);
        tracker.subscribe(move |kind| seen_a.borrow_mut().push(kind));
        tracker.notify_deleted();

        assert_eq!(*seen.borrow(), vec![ChangeKind::Deleted]);
        assert_eq!(tracker.subscriber_count(), 0);
    }
}
