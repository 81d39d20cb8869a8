//! The per-peer connection worker: handshake, framed message stream, local
//! choke/interest state, and the request/receive loop.
//!
//! This merges the two connection-handling shapes found in the teacher
//! (`peer.rs`'s full session loop and `peer/mod.rs`'s handshake handoff)
//! into a single leech-only worker driven by a [`crate::piece_manager::PieceManagerHandle`]
//! instead of a local piece picker.

pub mod codec;
pub mod message;

use std::net::SocketAddr;

use bitflags::bitflags;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{Framed, FramedParts};

use crate::error::{Error, ProtocolError, TransportError};
use crate::piece::BlockInfo;
use crate::piece_manager::PieceManagerHandle;
use crate::{Bitfield, PeerId, Sha1Hash};

use codec::{Handshake, HandshakeCodec, PeerCodec, PROTOCOL_STRING};
use message::Message;

bitflags! {
    /// Replaces both the teacher's boolean-struct `Status` and the original
    /// Python source's `my_state: List[str]` with a small flag set.
    #[derive(Default)]
    pub struct Status: u8 {
        /// Peer has not unchoked us; absence means unchoked.
        const CHOKED = 0b0001;
        /// We've told the peer we're interested.
        const INTERESTED = 0b0010;
        /// We have a Request outstanding with no reply yet. Depth-1
        /// pipelining: at most one bit, i.e. at most one outstanding
        /// request. Pipelining to depth k would replace this with a count.
        const PENDING_REQUEST = 0b0100;
        /// The session has been asked to shut down.
        const STOPPED = 0b1000;
    }
}

impl Status {
    fn initial() -> Self {
        Status::CHOKED
    }
}

/// Lifecycle state of the underlying connection, orthogonal to the
/// choke/interest bits tracked in [`Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Dialing,
    Handshaking,
    Connected,
    Terminated,
}

/// The channel on which the coordinator can command a peer session.
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

pub enum Command {
    Shutdown,
}

/// Drives one outbound TCP peer connection for the lifetime of the session.
pub struct PeerSession {
    addr: SocketAddr,
    info_hash: Sha1Hash,
    local_peer_id: PeerId,
    remote_peer_id: Option<PeerId>,
    piece_manager: PieceManagerHandle,
    conn_state: ConnState,
    status: Status,
    cmd_port: Receiver,
    /// Initial capacity of the `Framed` read buffer, carried through from
    /// [`crate::conf::TorrentConf::read_chunk_size`] (spec §5: "Read chunks
    /// are 10 240 bytes").
    read_chunk_size: usize,
    /// The single outstanding request, tracked so a reply can be matched;
    /// depth-1 pipelining per spec §9.
    outgoing_request: Option<BlockInfo>,
}

impl PeerSession {
    /// Creates a new outbound session for `addr` and returns it along with
    /// the sender half the coordinator uses to command it.
    pub fn outbound(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        local_peer_id: PeerId,
        piece_manager: PieceManagerHandle,
        read_chunk_size: usize,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                addr,
                info_hash,
                local_peer_id,
                remote_peer_id: None,
                piece_manager,
                conn_state: ConnState::Dialing,
                status: Status::initial(),
                cmd_port,
                read_chunk_size,
                outgoing_request: None,
            },
            cmd_chan,
        )
    }

    /// Runs the session until the connection drops, the peer misbehaves, or
    /// it's told to stop.
    pub async fn start(&mut self) -> Result<(), Error> {
        log::info!("Connecting to peer {}", self.addr);
        self.conn_state = ConnState::Dialing;
        let socket = TcpStream::connect(self.addr)
            .await
            .map_err(TransportError::Io)?;
        log::info!("Connected to peer {}", self.addr);

        // Pre-size the read buffer to the configured read-chunk size (spec
        // §5: "Read chunks are 10 240 bytes"); it carries over to the
        // `PeerCodec`-framed socket below via `FramedParts`.
        let mut handshake_parts = FramedParts::new(socket, HandshakeCodec);
        handshake_parts.read_buf = BytesMut::with_capacity(self.read_chunk_size);
        let mut socket = Framed::from_parts(handshake_parts);

        self.conn_state = ConnState::Handshaking;
        let handshake = Handshake::new(self.info_hash, self.local_peer_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => {
                self.conn_state = ConnState::Terminated;
                return Err(Error::Protocol(ProtocolError::MalformedFrame(
                    "connection closed before handshake".into(),
                )));
            }
        };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        debug_assert_eq!(
            &peer_handshake.prot[..],
            PROTOCOL_STRING.as_bytes()
        );

        if peer_handshake.info_hash != self.info_hash {
            log::warn!("Peer {} handshake has mismatched info_hash", self.addr);
            self.conn_state = ConnState::Terminated;
            return Err(Error::Protocol(ProtocolError::InfoHashMismatch));
        }
        self.remote_peer_id = Some(peer_handshake.peer_id);

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.conn_state = ConnState::Connected;
        log::info!("Peer {} session connected", self.addr);

        let (mut sink, stream) = socket.split();
        // Choked: send Interested once, immediately on entering this state,
        // not gated on any incoming message — a peer with zero pieces need
        // not send a Bitfield at all, and must not be left stalled forever.
        self.send_interested(&mut sink).await?;

        let result = self.run(sink, stream).await;
        self.conn_state = ConnState::Terminated;
        self.piece_manager.remove_peer(self.peer_key());
        result
    }

    /// The key this session registers itself under with the piece manager.
    /// Before the handshake completes there is no remote peer id yet, so the
    /// local id is used as a placeholder that is never looked up.
    fn peer_key(&self) -> PeerId {
        self.remote_peer_id.unwrap_or(self.local_peer_id)
    }

    async fn run(
        &mut self,
        mut sink: futures::stream::SplitSink<
            Framed<TcpStream, PeerCodec>,
            Message,
        >,
        stream: futures::stream::SplitStream<Framed<TcpStream, PeerCodec>>,
    ) -> Result<(), Error> {
        let mut stream = stream.fuse();

        loop {
            futures::select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    self.handle_msg(&mut sink, msg).await?;
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down peer {} session", self.addr);
                            self.status.insert(Status::STOPPED);
                            break;
                        }
                    }
                }
            }
            if self.status.contains(Status::STOPPED) {
                break;
            }
        }

        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut futures::stream::SplitSink<
            Framed<TcpStream, PeerCodec>,
            Message,
        >,
        msg: Message,
    ) -> Result<(), Error> {
        log::trace!("Peer {} sent {:?}", self.addr, msg.id());
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.contains(Status::CHOKED) {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.insert(Status::CHOKED);
                    self.status.remove(Status::PENDING_REQUEST);
                    self.outgoing_request = None;
                }
            }
            Message::Unchoke => {
                if self.status.contains(Status::CHOKED) {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.remove(Status::CHOKED);
                    self.make_request(sink).await?;
                }
            }
            Message::Interested | Message::NotInterested => {
                // Leech-only: we never serve pieces, so peer interest in us
                // is not actionable.
            }
            Message::Bitfield(mut bitfield) => {
                log::info!("Peer {} sent bitfield", self.addr);
                bitfield.truncate(bitfield.len());
                self.piece_manager
                    .add_peer(self.peer_key(), bitfield);
            }
            Message::Have(piece_index) => {
                self.piece_manager.update_peer(self.peer_key(), piece_index);
            }
            Message::Piece {
                index,
                offset,
                data,
            } => {
                self.status.remove(Status::PENDING_REQUEST);
                if self.outgoing_request.map(|r| (r.piece_index, r.offset))
                    == Some((index, offset))
                {
                    self.outgoing_request = None;
                }
                self.piece_manager
                    .block_received(index, offset, data)
                    .await;
                self.make_request(sink).await?;
            }
            // We never serve blocks: these are logged and ignored.
            Message::Request(_) | Message::Cancel(_) => {
                log::debug!(
                    "Peer {} sent a request-side message, ignoring",
                    self.addr
                );
            }
        }
        Ok(())
    }

    async fn send_interested(
        &mut self,
        sink: &mut futures::stream::SplitSink<
            Framed<TcpStream, PeerCodec>,
            Message,
        >,
    ) -> Result<(), Error> {
        if !self.status.contains(Status::INTERESTED) {
            log::info!("Interested in peer {}", self.addr);
            sink.send(Message::Interested).await?;
            self.status.insert(Status::INTERESTED);
        }
        Ok(())
    }

    /// Requests the next block from the piece manager if we're unchoked and
    /// have no outstanding request. At most one Request is ever outstanding
    /// per peer (depth-1 pipelining).
    async fn make_request(
        &mut self,
        sink: &mut futures::stream::SplitSink<
            Framed<TcpStream, PeerCodec>,
            Message,
        >,
    ) -> Result<(), Error> {
        if self.status.contains(Status::CHOKED)
            || self.status.contains(Status::PENDING_REQUEST)
        {
            return Ok(());
        }

        if let Some(block) =
            self.piece_manager.next_request(self.peer_key()).await
        {
            log::debug!("Requesting {:?} from peer {}", block, self.addr);
            self.outgoing_request = Some(block);
            self.status.insert(Status::PENDING_REQUEST);
            sink.send(Message::Request(block)).await?;
        }

        Ok(())
    }
}
