use std::sync::mpsc;

use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::dispatch::{DisplaySubscriber, Subscribers, TagAction, TagActions};
use crate::error::EndpointError;
use crate::message::Message;
use crate::protocol::{Command, Envelope};
use crate::store::{MessageStore, Snapshot};
use crate::transport::{FrameSink, Transport, TransportEvent, TransportHandle};

/// Notification protocol engine.
///
/// Owns the message store and the observer lists, applies inbound envelopes
/// and user actions, and pushes commands out through its [`FrameSink`].
/// Every state change ends with one snapshot delivered to each subscriber.
pub struct Channel<S: FrameSink> {
    sink: S,
    store: MessageStore,
    subscribers: Subscribers,
    tag_actions: TagActions,
    connected: bool,
}

impl Channel<TransportHandle> {
    /// Starts a transport for the configured endpoint and wraps it in a channel.
    ///
    /// Feed the returned events to [`Channel::handle_event`].
    pub fn connect(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), EndpointError> {
        let endpoint = config.endpoint()?;
        info!(target: "notify.channel", %endpoint, "starting notification channel");
        let (handle, events) = Transport::spawn(endpoint, config.transport);
        Ok((Channel::new(handle), events))
    }

    pub fn shutdown(&self) {
        self.sink.shutdown();
    }
}

impl<S: FrameSink> Channel<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            store: MessageStore::new(),
            subscribers: Subscribers::new(),
            tag_actions: TagActions::new(),
            connected: false,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn unread(&self) -> u64 {
        self.store.unread()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Registers a display subscriber. It sees future changes only.
    pub fn subscribe<D: DisplaySubscriber + 'static>(&mut self, subscriber: D) {
        self.subscribers.push(subscriber);
    }

    /// Registers an action for newly arriving messages carrying `tag`.
    pub fn add_tag_action<A: TagAction + 'static>(&mut self, tag: impl Into<String>, action: A) {
        self.tag_actions.add(tag, action);
    }

    /// Dismisses one message locally and upstream.
    ///
    /// The identity stays behind as a tombstone so a late re-push of the same
    /// message does not bring it back.
    pub fn mark_read(&mut self, uuid: &str) {
        if self.store.tombstone(uuid) {
            self.store.decrement_unread();
            self.send(Command::Dismiss(uuid.to_string()));
        } else {
            debug!(target: "notify.channel", uuid, "mark_read on unknown or dismissed message");
        }
        self.notify();
    }

    /// Clears everything locally, tells the server, and asks for a fresh list.
    pub fn mark_all_read(&mut self) {
        self.send(Command::Reset);
        self.reset_messages();
        self.notify();
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                info!(target: "notify.channel", "session opened, resynchronizing");
                self.connected = true;
                // Anything may have been missed while disconnected.
                self.reset_messages();
                self.notify();
            }
            TransportEvent::Frame(frame) => self.handle_frame(&frame),
            TransportEvent::Close => {
                info!(target: "notify.channel", "session closed");
                self.connected = false;
            }
        }
    }

    /// Decodes and applies one inbound text frame. Bad frames are dropped.
    pub fn handle_frame(&mut self, frame: &str) {
        match Envelope::decode(frame) {
            Ok(envelope) => self.apply(envelope),
            Err(err) if err.is_unknown_shape() => {
                debug!(target: "notify.channel", "ignoring frame with unknown shape");
            }
            Err(err) => {
                warn!(target: "notify.channel", error = %err, "dropping malformed frame");
            }
        }
    }

    pub fn apply(&mut self, envelope: Envelope) {
        debug!(target: "notify.channel", kind = envelope.kind(), "applying envelope");
        match envelope {
            Envelope::Messages { messages, unread } => {
                for message in messages {
                    self.ingest(message);
                }
                self.store.set_unread(unread);
            }
            Envelope::Reset => self.reset_messages(),
            Envelope::Dismiss { uuid, unread } => {
                self.store.remove(&uuid);
                self.store.set_unread(unread);
            }
        }
        self.notify();
    }

    fn ingest(&mut self, message: Message) {
        match self.store.insert_if_new(message) {
            Some(stored) => {
                let fired = self.tag_actions.fire(stored);
                if fired > 0 {
                    debug!(target: "notify.channel", uuid = %stored.uuid, fired, "tag actions fired");
                }
            }
            None => debug!(target: "notify.channel", "skipping already known message"),
        }
    }

    fn reset_messages(&mut self) {
        self.store.clear();
        self.send(Command::Fetch);
    }

    fn send(&self, command: Command) {
        self.sink.send(command.encode());
    }

    fn notify(&mut self) {
        if self.subscribers.is_empty() {
            return;
        }
        let snapshot = self.store.snapshot();
        self.subscribers.notify(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Rc<RefCell<Vec<String>>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<String> {
            self.frames.borrow_mut().drain(..).collect()
        }
    }

    impl FrameSink for RecordingSink {
        fn send(&self, frame: String) {
            self.frames.borrow_mut().push(frame);
        }
    }

    struct Harness {
        channel: Channel<RecordingSink>,
        sink: RecordingSink,
        snapshots: Rc<RefCell<Vec<Snapshot>>>,
        tagged: Rc<RefCell<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            let sink = RecordingSink::default();
            let mut channel = Channel::new(sink.clone());
            let snapshots = Rc::new(RefCell::new(Vec::new()));
            let tagged = Rc::new(RefCell::new(Vec::new()));
            {
                let snapshots = snapshots.clone();
                channel.subscribe(move |snapshot: &Snapshot| {
                    snapshots.borrow_mut().push(snapshot.clone());
                });
            }
            {
                let tagged = tagged.clone();
                channel.add_tag_action("build", move |message: &Message| {
                    tagged.borrow_mut().push(message.uuid.clone());
                });
            }
            Self {
                channel,
                sink,
                snapshots,
                tagged,
            }
        }

        fn last(&self) -> Snapshot {
            self.snapshots.borrow().last().cloned().expect("a snapshot")
        }

        fn notifications(&self) -> usize {
            self.snapshots.borrow().len()
        }

        fn tag_fires(&self) -> Vec<String> {
            self.tagged.borrow().clone()
        }
    }

    const BUILD_DONE: &str = r#"{"messages": [["Build done", ["build"], {}, 1000, "a1"]], "unread": 1}"#;

    #[test]
    fn first_delivery_stores_fires_and_notifies() {
        let mut h = Harness::new();
        h.channel.handle_frame(BUILD_DONE);

        assert!(h.channel.store().get("a1").is_some());
        assert_eq!(h.tag_fires(), vec!["a1"]);
        let last = h.last();
        assert_eq!(last.uuids(), vec!["a1"]);
        assert_eq!(last.unread, 1);
        assert_eq!(last.messages[0].text, "Build done");
        assert!(h.sink.take().is_empty());
    }

    #[test]
    fn mark_read_tombstones_and_sends_dismiss() {
        let mut h = Harness::new();
        h.channel.handle_frame(BUILD_DONE);
        h.channel.mark_read("a1");

        assert!(h.channel.store().is_tombstoned("a1"));
        assert_eq!(h.last(), Snapshot::default());
        assert_eq!(h.sink.take(), vec![r#"{"dismiss":"a1"}"#]);
    }

    #[test]
    fn redelivery_after_mark_read_is_ignored() {
        let mut h = Harness::new();
        h.channel.handle_frame(BUILD_DONE);
        h.channel.mark_read("a1");
        h.channel.handle_frame(BUILD_DONE);

        assert!(h.channel.store().is_tombstoned("a1"));
        assert_eq!(h.channel.store().len(), 1);
        assert!(h.last().is_empty());
        // unread follows the server even though the message stays dismissed
        assert_eq!(h.last().unread, 1);
        assert_eq!(h.tag_fires(), vec!["a1"]);
    }

    #[test]
    fn duplicate_batches_are_idempotent() {
        let mut once = Harness::new();
        once.channel.handle_frame(BUILD_DONE);

        let mut twice = Harness::new();
        twice.channel.handle_frame(BUILD_DONE);
        twice.channel.handle_frame(BUILD_DONE);

        assert_eq!(once.channel.snapshot(), twice.channel.snapshot());
        assert_eq!(once.channel.store().len(), twice.channel.store().len());
        assert_eq!(twice.tag_fires(), vec!["a1"]);
    }

    #[test]
    fn snapshots_are_time_ordered_across_batches() {
        let mut h = Harness::new();
        h.channel.handle_frame(
            r#"{"messages": [["three", [], null, 300, "m3"], ["one", [], null, 100, "m1"]], "unread": 2}"#,
        );
        assert_eq!(h.last().uuids(), vec!["m1", "m3"]);

        h.channel.handle_frame(
            r#"{"messages": [["four", [], null, 400, "m4"], ["two", [], null, 200, "m2"]], "unread": 4}"#,
        );
        assert_eq!(h.last().uuids(), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(h.last().unread, 4);
    }

    #[test]
    fn mark_all_read_clears_before_server_answers() {
        let mut h = Harness::new();
        h.channel.handle_frame(BUILD_DONE);
        h.sink.take();

        h.channel.mark_all_read();
        assert!(h.channel.store().is_empty());
        assert_eq!(h.channel.unread(), 0);
        assert_eq!(h.last(), Snapshot::default());
        assert_eq!(
            h.sink.take(),
            vec![r#"{"reset":true}"#, r#"{"fetch":true}"#]
        );

        h.channel.handle_frame(
            r#"{"messages": [["fresh", ["build"], {}, 2000, "b2"]], "unread": 1}"#,
        );
        let last = h.last();
        assert_eq!(last.uuids(), vec!["b2"]);
        assert_eq!(last.unread, 1);
        assert_eq!(h.channel.store().len(), 1);
    }

    #[test]
    fn server_reset_clears_and_fetches() {
        let mut h = Harness::new();
        h.channel.handle_frame(BUILD_DONE);
        h.channel.mark_read("a1");
        h.sink.take();

        h.channel.handle_frame(r#"{"reset": true}"#);
        assert!(h.channel.store().is_empty());
        assert_eq!(h.sink.take(), vec![r#"{"fetch":true}"#]);

        // tombstones went with the reset, so the message is new again
        h.channel.handle_frame(BUILD_DONE);
        assert_eq!(h.last().uuids(), vec!["a1"]);
        assert_eq!(h.tag_fires(), vec!["a1", "a1"]);
    }

    #[test]
    fn server_dismiss_removes_key_outright() {
        let mut h = Harness::new();
        h.channel.handle_frame(BUILD_DONE);
        h.channel
            .handle_frame(r#"{"dismiss": "a1", "unread": 0}"#);

        assert!(!h.channel.store().contains("a1"));
        assert_eq!(h.last(), Snapshot::default());

        h.channel.handle_frame(BUILD_DONE);
        assert_eq!(h.last().uuids(), vec!["a1"]);
        assert_eq!(h.tag_fires(), vec!["a1", "a1"]);
    }

    #[test]
    fn mark_read_of_unknown_identity_only_notifies() {
        let mut h = Harness::new();
        h.channel.mark_read("ghost");
        assert_eq!(h.notifications(), 1);
        assert!(h.sink.take().is_empty());
        assert!(h.channel.store().is_empty());
    }

    #[test]
    fn repeated_mark_read_dismisses_once() {
        let mut h = Harness::new();
        h.channel.handle_frame(
            r#"{"messages": [["Build done", ["build"], {}, 1000, "a1"], ["Import done", [], {}, 1001, "b1"]], "unread": 3}"#,
        );
        let before = h.notifications();

        h.channel.mark_read("a1");
        h.channel.mark_read("a1");

        assert_eq!(h.channel.unread(), 2);
        assert_eq!(h.sink.take(), vec![r#"{"dismiss":"a1"}"#]);
        assert_eq!(h.notifications(), before + 2);
        assert_eq!(h.last().uuids(), vec!["b1"]);
        assert!(h.channel.store().is_tombstoned("a1"));
    }

    #[test]
    fn pre_epoch_message_does_not_spoil_its_batch() {
        let mut h = Harness::new();
        h.channel.handle_frame(
            r#"{"messages": [["current", [], null, 50, "c1"], ["ancient", [], null, -5, "d1"]], "unread": 2}"#,
        );

        assert_eq!(h.last().uuids(), vec!["d1", "c1"]);
        assert_eq!(h.channel.unread(), 2);
    }

    #[test]
    fn bad_frames_are_dropped_without_notifying() {
        let mut h = Harness::new();
        h.channel.handle_frame(BUILD_DONE);
        let before = h.notifications();

        h.channel.handle_frame("{not json");
        h.channel.handle_frame(r#"{"greeting": "hi"}"#);
        h.channel
            .handle_frame(r#"{"messages": [["short", []]], "unread": 3}"#);

        assert_eq!(h.notifications(), before);
        assert_eq!(h.channel.unread(), 1);

        h.channel
            .handle_frame(r#"{"messages": [["next", [], null, 1001, "a2"]], "unread": 2}"#);
        assert_eq!(h.last().uuids(), vec!["a1", "a2"]);
    }

    #[test]
    fn subscribers_see_only_future_changes() {
        let sink = RecordingSink::default();
        let mut channel = Channel::new(sink);
        channel.handle_frame(BUILD_DONE);

        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            channel.subscribe(move |snapshot: &Snapshot| {
                seen.borrow_mut().push(snapshot.unread);
            });
        }
        assert!(seen.borrow().is_empty());

        channel.handle_frame(r#"{"dismiss": "a1", "unread": 0}"#);
        assert_eq!(*seen.borrow(), vec![0]);
    }

    #[test]
    fn open_event_resynchronizes_without_marking_read() {
        let mut h = Harness::new();
        h.channel.handle_event(TransportEvent::Open);
        assert!(h.channel.is_connected());
        assert_eq!(h.sink.take(), vec![r#"{"fetch":true}"#]);

        h.channel
            .handle_event(TransportEvent::Frame(BUILD_DONE.to_string()));
        h.channel.handle_event(TransportEvent::Close);
        assert!(!h.channel.is_connected());
        // state survives the disconnect
        assert_eq!(h.channel.snapshot().uuids(), vec!["a1"]);

        h.channel.handle_event(TransportEvent::Open);
        assert!(h.channel.store().is_empty());
        assert_eq!(h.sink.take(), vec![r#"{"fetch":true}"#]);
    }
}
