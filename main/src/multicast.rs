use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mockall::automock;
use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::net::UdpSocket as StdUdpSocket;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Payloads longer than this are truncated silently, matching the wire
/// behavior every deployed peer exhibits.
const RECEIVE_BUFFER_SIZE: usize = 1024;

/// The multicast socket shared by the application task and the receiver task.
#[automock]
pub trait GroupTransport: Send + Sync {
    /// Broadcasts one payload to the whole group, fire and forget.
    ///
    /// Failures are logged and swallowed; the caller is never told a message
    /// was dropped.
    fn send(&self, payload: String) -> BoxFuture<'static, ()>;

    /// Resolves with the next datagram addressed to the group, including
    /// this peer's own broadcasts looped back by the network stack.
    fn receive(&self) -> BoxFuture<'static, std::io::Result<String>>;

    /// Leaves the multicast group without emitting any traffic.
    fn leave(&self) -> std::io::Result<()>;
}

pub struct TokioGroupTransport {
    socket: Arc<UdpSocket>,
    group_address: SocketAddrV4,
}

impl TokioGroupTransport {
    /// Binds the shared group port and joins the group on the default
    /// network interface. Failure here is fatal: a session cannot start
    /// without a usable transport.
    pub async fn open(group_address: SocketAddrV4) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        // Every peer on one host binds the same port.
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        let local_address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group_address.port());
        socket.bind(&local_address.into())?;
        log::info!("Group transport socket listening at {}", local_address);

        let socket: StdUdpSocket = socket.into();
        let socket: UdpSocket = socket.try_into()?;
        socket.join_multicast_v4(*group_address.ip(), Ipv4Addr::UNSPECIFIED)?;

        // A peer is a member of its own group: loopback is what makes its
        // own messages appear in its own transcript.
        socket.set_multicast_loop_v4(true)?;

        Ok(Self {
            socket: Arc::new(socket),
            group_address,
        })
    }
}

impl GroupTransport for TokioGroupTransport {
    fn send(&self, payload: String) -> BoxFuture<'static, ()> {
        let socket = self.socket.clone();
        let group_address = self.group_address;
        async move {
            log::debug!("Sending packet: {}", payload);
            let result = socket.send_to(payload.as_bytes(), group_address).await;
            if let Err(e) = result {
                log::error!("Failed to send a packet, dropping it: {}", e);
            }
        }
        .boxed()
    }

    fn receive(&self) -> BoxFuture<'static, std::io::Result<String>> {
        let socket = self.socket.clone();
        async move {
            let mut buffer = [0; RECEIVE_BUFFER_SIZE];
            let (size, remote_address) = socket.recv_from(&mut buffer).await?;
            let payload = String::from_utf8_lossy(&buffer[..size]).into_owned();
            log::debug!("Received packet from {}: {}", remote_address, payload);
            Ok(payload)
        }
        .boxed()
    }

    fn leave(&self) -> std::io::Result<()> {
        log::info!("Leaving multicast group {}", self.group_address.ip());
        self.socket
            .leave_multicast_v4(*self.group_address.ip(), Ipv4Addr::UNSPECIFIED)
    }
}
