use crate::directory::Directory;
use crate::multicast::GroupTransport;
use kaiwa_protocol::Envelope;
use kaiwa_protocol::PeerId;
use mockall::automock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Callbacks through which the user interface renders core events.
///
/// Implementations always receive a detached snapshot of the directory,
/// never the live set.
#[automock]
pub trait ChatObserver: Send + Sync {
    fn on_chat_line(&self, line: String);
    fn on_directory_changed(&self, peers: BTreeSet<PeerId>);
}

/// Drains the group transport until shutdown or transport failure.
///
/// The token is the only way to stop the loop, and it is consulted before a
/// receive failure is interpreted: a failure after cancellation is the
/// expected result of tearing the session down, anything else is terminal.
/// There is no retry; once the loop exits, the session is deaf.
pub async fn run(
    transport: Arc<impl GroupTransport>,
    directory: Arc<Directory>,
    observer: Arc<dyn ChatObserver>,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                log::debug!("Shutdown requested, stopping the receiver");
                break;
            }
            result = transport.receive() => match result {
                Ok(payload) => payload,
                Err(e) if shutdown.is_cancelled() => {
                    log::debug!("Socket closed during shutdown: {}", e);
                    break;
                }
                Err(e) => {
                    log::error!("Failed to receive a packet, stopping the receiver: {}", e);
                    break;
                }
            }
        };
        match payload.parse() {
            Ok(envelope) => handle_envelope(envelope, &*transport, &directory, &*observer).await,
            Err(e) => log::debug!("Discarding a malformed packet: {}", e),
        }
    }
}

async fn handle_envelope(
    envelope: Envelope,
    transport: &impl GroupTransport,
    directory: &Directory,
    observer: &dyn ChatObserver,
) {
    match envelope {
        Envelope::Join { peer } => {
            directory.add(peer.clone());
            observer.on_chat_line(format!("{} has joined the chat.", peer));
            observer.on_directory_changed(directory.snapshot());
        }
        Envelope::Leave { peer } => {
            directory.remove(&peer);
            observer.on_chat_line(format!("{} has left the chat.", peer));
            observer.on_directory_changed(directory.snapshot());
        }
        Envelope::ChatMessage { sender, body } => {
            observer.on_chat_line(format!("{}: {}", sender, body));
        }
        Envelope::DirectoryRequest { requester } => {
            reply_with_directory(requester, transport, directory).await;
        }
        // Every member processes every entry, requester or not.
        Envelope::DirectoryEntry { peer, .. } => {
            if directory.add(peer) {
                observer.on_directory_changed(directory.snapshot());
            }
        }
    }
}

/// Re-broadcasts the entire local membership, one envelope per member.
///
/// Every member answers every request this way, so a single request produces
/// O(members²) datagrams across the group. Wire compatibility with deployed
/// peers requires keeping this behavior.
async fn reply_with_directory(
    requester: PeerId,
    transport: &impl GroupTransport,
    directory: &Directory,
) {
    for peer in directory.snapshot() {
        let envelope = Envelope::DirectoryEntry {
            requester: requester.clone(),
            peer,
        };
        transport.send(envelope.encode()).await;
    }
}
