use std::collections::HashMap;

use crate::message::Message;
use crate::store::Snapshot;

/// General display observer, driven with a full snapshot on every change.
pub trait DisplaySubscriber {
    fn display(&mut self, snapshot: &Snapshot);
}

impl<F> DisplaySubscriber for F
where
    F: FnMut(&Snapshot),
{
    fn display(&mut self, snapshot: &Snapshot) {
        (self)(snapshot)
    }
}

/// Per-message listener for one tag, fired for newly ingested messages only.
pub trait TagAction {
    fn on_message(&mut self, message: &Message);
}

impl<F> TagAction for F
where
    F: FnMut(&Message),
{
    fn on_message(&mut self, message: &Message) {
        (self)(message)
    }
}

#[derive(Default)]
pub struct Subscribers {
    display: Vec<Box<dyn DisplaySubscriber>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<S: DisplaySubscriber + 'static>(&mut self, subscriber: S) {
        self.display.push(Box::new(subscriber));
    }

    pub fn is_empty(&self) -> bool {
        self.display.is_empty()
    }

    /// Delivers the snapshot in registration order.
    pub fn notify(&mut self, snapshot: &Snapshot) {
        for subscriber in self.display.iter_mut() {
            subscriber.display(snapshot);
        }
    }
}

#[derive(Default)]
pub struct TagActions {
    actions: HashMap<String, Vec<Box<dyn TagAction>>>,
}

impl TagActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<A: TagAction + 'static>(&mut self, tag: impl Into<String>, action: A) {
        self.actions
            .entry(tag.into())
            .or_default()
            .push(Box::new(action));
    }

    /// Fires every action registered for each of the message's tags.
    /// Returns how many actions ran.
    pub fn fire(&mut self, message: &Message) -> usize {
        let mut fired = 0;
        for tag in &message.tags {
            if let Some(actions) = self.actions.get_mut(tag) {
                for action in actions.iter_mut() {
                    action.on_message(message);
                    fired += 1;
                }
            }
        }
        fired
    }
}
