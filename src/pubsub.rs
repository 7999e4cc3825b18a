use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::warn;

use crate::{Payload, Result, Topic};

/// A subscriber callable. It receives the originally published topic and
/// the payload. Returning `Err` means the payload did not have the shape
/// the subscriber expected; delivery continues with the remaining
/// subscribers. Panics propagate to the publisher.
pub type SubscriberFn = dyn Fn(&Topic, &Payload) -> Result<()>;

/// The owner handle for a subscriber. The dispatcher keeps only a weak
/// reference, so dropping the last clone of the handle unsubscribes it.
pub type Subscriber = Rc<SubscriberFn>;

/// Wraps a closure into a [`Subscriber`] handle.
pub fn subscriber<F>(f: F) -> Subscriber
where
    F: Fn(&Topic, &Payload) -> Result<()> + 'static,
{
    Rc::new(f)
}

/// An in-process publish-subscribe dispatcher.
///
/// Topics form a hierarchy: a subscriber on `("a",)` also receives
/// messages published on `("a", "b")`. Subscribers on longer prefixes are
/// invoked first, root subscribers last, and within one topic key in
/// subscription order.
///
/// All operations take `&self` so a subscriber may add, remove, or publish
/// on the same dispatcher while a delivery is in progress; a nested publish
/// runs to completion before the outer delivery resumes.
#[derive(Default)]
pub struct PubSub {
    subs: RefCell<HashMap<Topic, Vec<Weak<SubscriberFn>>>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `subscriber` to `topic`.
    pub fn add_subscriber(&self, topic: impl Into<Topic>, subscriber: &Subscriber) {
        self.subs
            .borrow_mut()
            .entry(topic.into())
            .or_default()
            .push(Rc::downgrade(subscriber));
    }

    /// Removes the first subscription of `subscriber` on `topic`, matching
    /// by handle identity. Does nothing when the topic has no entries or
    /// the handle is not among them.
    pub fn remove_subscriber(&self, topic: impl Into<Topic>, subscriber: &Subscriber) {
        let topic = topic.into();
        let mut subs = self.subs.borrow_mut();
        let Some(list) = subs.get_mut(&topic) else {
            return;
        };
        let target = Rc::downgrade(subscriber);
        if let Some(position) = list.iter().position(|weak| weak.ptr_eq(&target)) {
            list.remove(position);
        }
    }

    pub fn clear_subscribers(&self) {
        self.subs.borrow_mut().clear();
    }

    /// Publishes a message on a topic.
    ///
    /// Every subscriber whose topic is a prefix of `topic` (including the
    /// root) is invoked with the original topic and the payload. Dropped
    /// subscribers are skipped.
    pub fn publish(&self, topic: impl Into<Topic>, payload: &Payload) {
        let original = topic.into();
        let mut level = original.clone();
        loop {
            // Snapshot the key's list so subscribers can mutate the table
            // or publish again while we iterate.
            let snapshot = self.subs.borrow().get(&level).cloned();
            if let Some(list) = snapshot {
                for weak in &list {
                    let Some(subscriber) = weak.upgrade() else {
                        continue;
                    };
                    if let Err(err) = subscriber(&original, payload) {
                        warn!("failed to deliver {original} to subscriber: {err}");
                    }
                }
            }
            match level.parent() {
                Some(parent) => level = parent,
                None => break,
            }
        }
    }
}
