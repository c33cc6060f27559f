use crate::directory::Directory;
use crate::multicast::GroupTransport;
use crate::multicast::TokioGroupTransport;
use crate::receiver::ChatObserver;
use kaiwa_protocol::Envelope;
use kaiwa_protocol::PeerId;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A live membership in the chat group and the facade the user interface
/// drives.
///
/// Exactly one receiver task runs per session; everything else happens on
/// whichever task calls into the facade.
pub struct ChatSession<T: GroupTransport = TokioGroupTransport> {
    peer_id: PeerId,
    transport: Mutex<Option<Arc<T>>>,
    directory: Arc<Directory>,
    shutdown: CancellationToken,
    receiver: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ChatSession<TokioGroupTransport> {
    /// Joins the group under `peer_id` and asks every member to report the
    /// peers it knows.
    ///
    /// This is the only operation whose failure reaches the caller; past
    /// this point the session degrades silently instead of erroring.
    pub async fn start(
        peer_id: PeerId,
        observer: Arc<dyn ChatObserver>,
    ) -> Result<Self, StartError> {
        if peer_id.is_blank() {
            return Err(StartError::BlankPeerId);
        }
        let transport = TokioGroupTransport::open(crate::get_group_address()).await?;
        Ok(Self::start_with_transport(transport, peer_id, observer).await)
    }
}

impl<T: GroupTransport + 'static> ChatSession<T> {
    async fn start_with_transport(
        transport: T,
        peer_id: PeerId,
        observer: Arc<dyn ChatObserver>,
    ) -> Self {
        log::info!("Joining the chat as {}", peer_id);
        let transport = Arc::new(transport);
        let directory = Arc::new(Directory::default());
        let shutdown = CancellationToken::new();
        let receiver = tokio::spawn(crate::receiver::run(
            transport.clone(),
            directory.clone(),
            observer.clone(),
            shutdown.clone(),
        ));

        directory.add(peer_id.clone());
        observer.on_directory_changed(directory.snapshot());

        // The join must hit the wire before the directory request so that
        // repliers can already see the new member.
        let join = Envelope::Join {
            peer: peer_id.clone(),
        };
        transport.send(join.encode()).await;
        let request = Envelope::DirectoryRequest {
            requester: peer_id.clone(),
        };
        transport.send(request.encode()).await;

        Self {
            peer_id,
            transport: Mutex::new(Some(transport)),
            directory,
            shutdown,
            receiver: Mutex::new(Some(receiver)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Broadcasts a chat message to the group.
    ///
    /// There is no local echo: the message appears in this peer's own
    /// transcript only because multicast loops the datagram back through the
    /// receiver like everyone else's. A no-op once the session is stopped.
    pub async fn send_chat(&self, body: impl Into<String>) {
        if self.stopped.load(Ordering::SeqCst) {
            log::debug!("Session already stopped, dropping a chat message");
            return;
        }
        let transport = match self.lock_transport().clone() {
            Some(transport) => transport,
            None => return,
        };
        let envelope = Envelope::ChatMessage {
            sender: self.peer_id.clone(),
            body: body.into(),
        };
        transport.send(envelope.encode()).await;
    }

    /// Announces departure and tears the session down. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Leaving the chat as {}", self.peer_id);
        self.shutdown.cancel();
        let receiver = self
            .receiver
            .lock()
            .expect("Receiver handle mutex must not be poisoned")
            .take();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.await {
                log::error!("Receiver task failed to shut down: {}", e);
            }
        }
        // The receiver task has already exited, so the handle taken here is
        // the last one; dropping it closes the socket and releases the
        // shared port.
        let transport = self.lock_transport().take();
        if let Some(transport) = transport {
            let leave = Envelope::Leave {
                peer: self.peer_id.clone(),
            };
            transport.send(leave.encode()).await;
            self.directory.remove(&self.peer_id);
            if let Err(e) = transport.leave() {
                log::error!("Failed to leave the multicast group: {}", e);
            }
        }
    }

    /// Who this node currently believes is present, itself included.
    pub fn directory(&self) -> BTreeSet<PeerId> {
        self.directory.snapshot()
    }

    fn lock_transport(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        self.transport
            .lock()
            .expect("Transport mutex must not be poisoned")
    }
}

impl<T: GroupTransport> Drop for ChatSession<T> {
    fn drop(&mut self) {
        // Lets an orphaned receiver task exit even when `stop` was never
        // called.
        self.shutdown.cancel();
    }
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Peer identifier must not be blank")]
    BlankPeerId,

    #[error("Failed to open the group transport")]
    Transport(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::multicast::MockGroupTransport;
    use crate::receiver::MockChatObserver;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[tokio::test]
    async fn start_announces_join_before_requesting_the_directory() {
        crate::test::init();

        let mut transport = new_idle_transport();
        let mut sequence = Sequence::new();
        transport
            .expect_send()
            .with(eq("JOIN:alice".to_string()))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| async {}.boxed());
        transport
            .expect_send()
            .with(eq("REQUEST_USER_LIST:alice".to_string()))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| async {}.boxed());
        let mut observer = MockChatObserver::new();
        observer
            .expect_on_directory_changed()
            .with(eq(BTreeSet::from(["alice".into()])))
            .times(1)
            .return_const(());

        // When
        let session =
            ChatSession::start_with_transport(transport, "alice".into(), Arc::new(observer)).await;

        // Then
        assert_eq!(BTreeSet::from(["alice".into()]), session.directory());
    }

    #[tokio::test]
    async fn send_chat_broadcasts_one_message() {
        crate::test::init();

        let mut transport = new_idle_transport();
        expect_startup_sends(&mut transport);
        transport
            .expect_send()
            .with(eq("MESSAGE:alice:hi".to_string()))
            .times(1)
            .returning(|_| async {}.boxed());
        let session = start_quietly(transport).await;

        // When
        session.send_chat("hi").await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_silences_send_chat() {
        crate::test::init();

        let mut transport = new_idle_transport();
        expect_startup_sends(&mut transport);
        transport
            .expect_send()
            .with(eq("LEAVE:alice".to_string()))
            .times(1)
            .returning(|_| async {}.boxed());
        transport.expect_leave().times(1).returning(|| Ok(()));
        let session = start_quietly(transport).await;

        // When
        session.stop().await;
        session.stop().await;
        session.send_chat("hi").await;

        // Then
        assert!(!session.directory().contains(&"alice".into()));
    }

    #[tokio::test]
    async fn start_rejects_blank_peer_id() {
        crate::test::init();

        // When
        let result = ChatSession::start("  ".into(), Arc::new(MockChatObserver::new())).await;

        // Then
        if let Err(StartError::BlankPeerId) = result {
        } else {
            panic!("A blank peer identifier must be rejected");
        }
    }

    #[tokio::test]
    async fn stop_releases_the_transport() {
        crate::test::init();

        let mut transport = new_idle_transport();
        expect_startup_sends(&mut transport);
        transport
            .expect_send()
            .with(eq("LEAVE:alice".to_string()))
            .times(1)
            .returning(|_| async {}.boxed());
        transport.expect_leave().times(1).returning(|| Ok(()));
        let released = Arc::new(AtomicBool::new(false));
        let transport = ReleaseTrackingTransport {
            inner: transport,
            released: released.clone(),
        };
        let session = start_quietly(transport).await;

        // When
        session.stop().await;

        // Then
        assert!(
            released.load(Ordering::SeqCst),
            "The socket must close when the session stops, not when it is dropped"
        );
    }

    #[tokio::test]
    async fn two_peers_converge_and_hear_each_other() -> anyhow::Result<()> {
        crate::test::init();

        let group = LoopbackGroup::new();

        let (bob_observer, mut bob) = RecordingObserver::new();
        let bob_session =
            ChatSession::start_with_transport(group.transport(), "bob".into(), bob_observer).await;
        await_directory(&mut bob, ["bob"]).await;

        let (alice_observer, mut alice) = RecordingObserver::new();
        let alice_session =
            ChatSession::start_with_transport(group.transport(), "alice".into(), alice_observer)
                .await;

        // Presence converges on both sides through join + directory replies.
        await_directory(&mut alice, ["alice", "bob"]).await;
        await_directory(&mut bob, ["alice", "bob"]).await;

        // The sender hears its own chat message through loopback only.
        alice_session.send_chat("hi").await;
        await_line(&mut alice, "alice: hi").await;
        await_line(&mut bob, "alice: hi").await;

        alice_session.stop().await;
        await_line(&mut bob, "alice has left the chat.").await;
        await_directory(&mut bob, ["bob"]).await;

        bob_session.stop().await;
        Ok(())
    }

    /// A transport whose receiver side fails immediately, parking the
    /// receiver task out of the way of facade-level assertions.
    fn new_idle_transport() -> MockGroupTransport {
        let mut transport = MockGroupTransport::new();
        transport
            .expect_receive()
            .returning(|| async { Err(std::io::ErrorKind::ConnectionAborted.into()) }.boxed());
        transport
    }

    fn expect_startup_sends(transport: &mut MockGroupTransport) {
        transport
            .expect_send()
            .with(eq("JOIN:alice".to_string()))
            .times(1)
            .returning(|_| async {}.boxed());
        transport
            .expect_send()
            .with(eq("REQUEST_USER_LIST:alice".to_string()))
            .times(1)
            .returning(|_| async {}.boxed());
    }

    async fn start_quietly<T: GroupTransport + 'static>(transport: T) -> ChatSession<T> {
        let mut observer = MockChatObserver::new();
        observer.expect_on_directory_changed().return_const(());
        ChatSession::start_with_transport(transport, "alice".into(), Arc::new(observer)).await
    }

    /// Flags when the session lets go of its last transport handle.
    struct ReleaseTrackingTransport {
        inner: MockGroupTransport,
        released: Arc<AtomicBool>,
    }

    impl GroupTransport for ReleaseTrackingTransport {
        fn send(&self, payload: String) -> BoxFuture<'static, ()> {
            self.inner.send(payload)
        }
        fn receive(&self) -> BoxFuture<'static, std::io::Result<String>> {
            self.inner.receive()
        }
        fn leave(&self) -> std::io::Result<()> {
            self.inner.leave()
        }
    }

    impl Drop for ReleaseTrackingTransport {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// An in-memory stand-in for the multicast group: every payload reaches
    /// every transport, the sender's own included, just like a
    /// loopback-enabled multicast socket.
    struct LoopbackGroup {
        sender: broadcast::Sender<String>,
    }

    impl LoopbackGroup {
        fn new() -> Self {
            Self {
                sender: broadcast::channel(64).0,
            }
        }

        fn transport(&self) -> LoopbackTransport {
            LoopbackTransport {
                receiver: Arc::new(tokio::sync::Mutex::new(self.sender.subscribe())),
                sender: self.sender.clone(),
            }
        }
    }

    struct LoopbackTransport {
        sender: broadcast::Sender<String>,
        receiver: Arc<tokio::sync::Mutex<broadcast::Receiver<String>>>,
    }

    impl GroupTransport for LoopbackTransport {
        fn send(&self, payload: String) -> BoxFuture<'static, ()> {
            let sender = self.sender.clone();
            async move {
                let _ = sender.send(payload);
            }
            .boxed()
        }
        fn receive(&self) -> BoxFuture<'static, std::io::Result<String>> {
            let receiver = self.receiver.clone();
            async move {
                receiver
                    .lock()
                    .await
                    .recv()
                    .await
                    .map_err(|_| std::io::ErrorKind::ConnectionAborted.into())
            }
            .boxed()
        }
        fn leave(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Line(String),
        Peers(BTreeSet<PeerId>),
    }

    struct RecordingObserver {
        events: mpsc::UnboundedSender<Event>,
    }

    impl RecordingObserver {
        fn new() -> (Arc<dyn ChatObserver>, UnboundedReceiver<Event>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            (Arc::new(Self { events: sender }), receiver)
        }
    }

    impl ChatObserver for RecordingObserver {
        fn on_chat_line(&self, line: String) {
            let _ = self.events.send(Event::Line(line));
        }
        fn on_directory_changed(&self, peers: BTreeSet<PeerId>) {
            let _ = self.events.send(Event::Peers(peers));
        }
    }

    async fn await_directory(
        events: &mut UnboundedReceiver<Event>,
        expected: impl IntoIterator<Item = &str>,
    ) {
        let expected = Event::Peers(expected.into_iter().map(Into::into).collect());
        await_event(events, expected).await;
    }

    async fn await_line(events: &mut UnboundedReceiver<Event>, expected: &str) {
        await_event(events, Event::Line(expected.into())).await;
    }

    async fn await_event(events: &mut UnboundedReceiver<Event>, expected: Event) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if event == expected {
                    return;
                }
            }
            panic!("Event channel closed while waiting for {:?}", expected);
        })
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {:?}", expected));
    }
}
