//! Peer network adapter
//!
//! The client-side mirror of the relay. [`Peer::connect`] performs the raw
//! identity handshake, binds an ephemeral media socket and announces it with
//! `udp-register`, then runs two receive loops:
//!
//! 1. control: decodes frames from the relay and forwards them as
//!    [`PeerEvent::Control`]
//! 2. media: decodes sender-tagged relay datagrams and forwards them as
//!    [`PeerEvent::Media`]
//!
//! Events go out on an `mpsc` channel to whatever presents them. The adapter
//! never interprets them beyond decoding.

use std::{
    fs,
    io::{self, BufRead, ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Local, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::model::{
    frame::{
        self, decode_datagram, parse_confirmed_identity, untag_media, HANDSHAKE_READ_LIMIT,
        MAX_FRAME_LEN,
    },
    payload::{
        self, Chat, FileChunk, FileNotify, Presence, ScreenImage, ScreenSignal, UdpRegister,
        FILE_CHUNK_SIZE,
    },
    session::TcpSink,
    transfer::{ChunkOutcome, FileTransfers},
    ControlSink, Frame, FrameDecoder, MessageKind,
};
use crate::util::init_log;

/// How often the media loop wakes to check for shutdown
const MEDIA_POLL_INTERVAL: Duration = Duration::from_millis(200);

const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A decoded control frame from the relay.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    pub kind: MessageKind,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl ControlMessage {
    /// The relay-stamped sender, if the payload carries one.
    pub fn sender(&self) -> Option<&str> {
        self.payload.get("user").and_then(Value::as_str)
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::InvalidPayload(format!("{}: {e}", self.kind)))
    }
}

/// A relayed media datagram.
#[derive(Debug, Clone)]
pub struct MediaMessage {
    pub kind: MessageKind,
    pub sender: String,
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Everything the adapter hands to the presentation side.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Control(ControlMessage),
    Media(MediaMessage),
    /// The control connection closed. No further control events follow.
    Disconnected { reason: String },
}

/// Capture-side contract: something that yields encoded media chunks.
///
/// `None` ends the stream.
pub trait MediaSource {
    fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

impl<I: Iterator<Item = Vec<u8>>> MediaSource for I {
    fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.next()
    }
}

/// Sends untagged media datagrams to the relay. The relay adds the sender tag.
#[derive(Debug, Clone)]
pub struct MediaSender {
    socket: Arc<UdpSocket>,
    relay: SocketAddr,
}

impl MediaSender {
    pub fn send(&self, kind: MessageKind, data: &[u8]) -> Result<()> {
        if !kind.is_media() {
            return Err(Error::InvalidPayload(format!(
                "{kind} cannot travel on the media channel"
            )));
        }
        self.socket.send_to(&frame::encode(kind, data), self.relay)?;
        Ok(())
    }
}

/// A connected peer.
pub struct Peer {
    identity: String,
    control: Arc<TcpSink>,
    media: MediaSender,
    media_port: u16,
    running: Arc<AtomicBool>,
}

impl Peer {
    /// Connect, handshake, register the media port and start both receive loops.
    pub fn connect(config: &PeerConfig, events: Sender<PeerEvent>) -> Result<Peer> {
        let mut stream = TcpStream::connect(config.control_addr())?;
        stream.write_all(config.identity.as_bytes())?;

        let mut buf = [0u8; HANDSHAKE_READ_LIMIT];
        let n = stream.read(&mut buf)?;
        let (identity, rest) = parse_confirmed_identity(&buf[..n])?;
        let decoder = FrameDecoder::with_remainder(rest);

        let relay = config
            .media_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Handshake(format!("cannot resolve {}", config.media_addr())))?;

        // Same local IP as the control connection, so the relay can match
        // datagrams against the registered address.
        let socket = UdpSocket::bind((stream.local_addr()?.ip(), 0))?;
        socket.set_read_timeout(Some(MEDIA_POLL_INTERVAL))?;
        let media_port = socket.local_addr()?.port();
        let socket = Arc::new(socket);

        let control = Arc::new(TcpSink::new(stream.try_clone()?, CONTROL_WRITE_TIMEOUT)?);
        let running = Arc::new(AtomicBool::new(true));

        let peer = Peer {
            identity,
            control,
            media: MediaSender {
                socket: socket.clone(),
                relay,
            },
            media_port,
            running: running.clone(),
        };
        peer.send_control(MessageKind::UdpRegister, &UdpRegister { port: media_port })?;

        {
            let events = events.clone();
            let buffer_size = config.buffer_size;
            thread::spawn(move || control_loop(stream, decoder, events, buffer_size));
        }
        {
            let buffer_size = config.buffer_size;
            thread::spawn(move || media_loop(&socket, events, &running, buffer_size));
        }

        info!("Connected as {}, UDP port: {}", peer.identity, media_port);
        Ok(peer)
    }

    /// The identity the relay confirmed (possibly suffixed).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn media_port(&self) -> u16 {
        self.media_port
    }

    pub fn media_sender(&self) -> MediaSender {
        self.media.clone()
    }

    /// Send a structured record on the control channel.
    ///
    /// The first failed write closes the connection; every later call
    /// returns [`Error::ConnectionLost`].
    pub fn send_control<T: Serialize>(&self, kind: MessageKind, record: &T) -> Result<()> {
        if kind.is_media() {
            return Err(Error::InvalidPayload(format!(
                "{kind} cannot travel on the control channel"
            )));
        }
        let frame = Frame::json(kind, record)?;
        if frame.payload.len() > MAX_FRAME_LEN as usize {
            return Err(Error::FrameTooLarge(
                u32::try_from(frame.payload.len()).unwrap_or(u32::MAX),
            ));
        }

        if self.control.is_closed() {
            return Err(Error::ConnectionLost);
        }
        // A failed write may have left half a frame on the stream. The sink
        // has shut it down; stop the media loop too.
        match self.control.send(&frame.encode()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Err(Error::ConnectionLost),
            Err(e) => {
                warn!("Control write failed, closing connection: {}", e);
                self.running.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Send raw media bytes, untagged.
    pub fn send_media(&self, kind: MessageKind, data: &[u8]) -> Result<()> {
        self.media.send(kind, data)
    }

    pub fn send_chat(&self, msg: &str) -> Result<()> {
        self.send_control(
            MessageKind::Chat,
            &Chat {
                user: None,
                msg: msg.to_string(),
            },
        )
    }

    /// Announce a file, then stream it in base64 chunks. Returns the chunk count.
    pub fn share_file(&self, filename: &str, contents: &[u8]) -> Result<u64> {
        self.send_control(
            MessageKind::FileNotify,
            &FileNotify {
                user: None,
                filename: filename.to_string(),
                size: contents.len() as u64,
            },
        )?;

        let mut sent = 0;
        for (chunk_id, bytes) in contents.chunks(FILE_CHUNK_SIZE).enumerate() {
            self.send_control(
                MessageKind::FileChunk,
                &FileChunk::new(filename, chunk_id as u64, bytes),
            )?;
            sent += 1;
        }

        info!("Shared {} ({} bytes, {} chunks)", filename, contents.len(), sent);
        Ok(sent)
    }

    pub fn start_screen_share(&self) -> Result<()> {
        self.send_control(MessageKind::ScreenStart, &ScreenSignal::default())
    }

    pub fn send_screen_image(&self, jpeg: &[u8]) -> Result<()> {
        self.send_control(MessageKind::ScreenImage, &ScreenImage::new(jpeg))
    }

    pub fn stop_screen_share(&self) -> Result<()> {
        self.send_control(MessageKind::ScreenStop, &ScreenSignal::default())
    }

    /// Forward a capture source as media datagrams, one every `interval`,
    /// until the source ends or the peer shuts down.
    pub fn stream_media<S>(
        &self,
        kind: MessageKind,
        mut source: S,
        interval: Duration,
    ) -> JoinHandle<()>
    where
        S: MediaSource + Send + 'static,
    {
        let sender = self.media.clone();
        let running = self.running.clone();

        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let Some(chunk) = source.next_chunk() else {
                    break;
                };
                if let Err(e) = sender.send(kind, &chunk) {
                    warn!("{} send error: {}", kind, e);
                }
                thread::sleep(interval);
            }
            debug!("{} stream ended", kind);
        })
    }

    /// Close the control connection and stop the media loop.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.control.close();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn control_loop(
    mut stream: TcpStream,
    mut decoder: FrameDecoder,
    events: Sender<PeerEvent>,
    buffer_size: usize,
) {
    let mut buf = vec![0; buffer_size];

    let reason = loop {
        for next in decoder.decode_available() {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) if !e.is_recoverable() => {
                    let _ = events.send(PeerEvent::Disconnected {
                        reason: e.to_string(),
                    });
                    return;
                }
                Err(e) => {
                    warn!("Dropping control frame: {}", e);
                    continue;
                }
            };

            let Some(message) = to_control_message(frame) else {
                continue;
            };
            if events.send(PeerEvent::Control(message)).is_err() {
                return;
            }
        }

        match stream.read(&mut buf) {
            Ok(0) => break "relay closed the connection".to_string(),
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => break e.to_string(),
        }
    };

    info!("Control connection closed: {}", reason);
    let _ = events.send(PeerEvent::Disconnected { reason });
}

fn to_control_message(frame: Frame) -> Option<ControlMessage> {
    if frame.kind.is_media() {
        warn!("Ignoring {} on the control channel", frame.kind);
        return None;
    }

    match payload::parse_object(&frame.payload) {
        Ok(map) => Some(ControlMessage {
            kind: frame.kind,
            payload: Value::Object(map),
            received_at: Utc::now(),
        }),
        Err(e) => {
            warn!("Dropping {} with bad payload: {}", frame.kind, e);
            None
        }
    }
}

fn media_loop(
    socket: &UdpSocket,
    events: Sender<PeerEvent>,
    running: &AtomicBool,
    buffer_size: usize,
) {
    let mut buf = vec![0; buffer_size];

    while running.load(Ordering::Relaxed) {
        let n = match socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e) => match e.kind() {
                // Expected error for set_read_timeout(). One for windows, one for the rest.
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => continue,
                _ => {
                    warn!("UDP receive error: {}", e);
                    continue;
                }
            },
        };

        let tagged = match decode_datagram(&buf[..n]).and_then(untag_media) {
            Ok(tagged) if tagged.kind.is_media() => tagged,
            Ok(tagged) => {
                debug!("Ignoring {} on the media channel", tagged.kind);
                continue;
            }
            Err(e) => {
                debug!("Dropping media datagram: {}", e);
                continue;
            }
        };

        let message = MediaMessage {
            kind: tagged.kind,
            sender: tagged.sender,
            data: tagged.data,
            received_at: Utc::now(),
        };
        if events.send(PeerEvent::Media(message)).is_err() {
            break;
        }
    }
}

/// Interactive peer: stdin lines become chat, `/send <path>` shares a file,
/// `/quit` leaves.
pub fn main(args: &[String]) -> anyhow::Result<()> {
    init_log();

    let config = PeerConfig::from_args(args)?;
    let (tx, rx) = mpsc::channel();
    let peer = Peer::connect(&config, tx)?;
    println!("Connected as {} (UDP port {})", peer.identity(), peer.media_port());
    println!("Type a message, /send <path> to share a file, /quit to leave.");

    let presenter = thread::spawn(move || present(rx));

    for line in io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();

        if line == "/quit" {
            break;
        } else if let Some(path) = line.strip_prefix("/send ") {
            if let Err(e) = send_file(&peer, Path::new(path.trim())) {
                println!("Could not share {}: {}", path, e);
            }
        } else if !line.is_empty() {
            peer.send_chat(line)?;
        }
    }

    peer.shutdown();
    let _ = presenter.join();
    Ok(())
}

fn send_file(peer: &Peer, path: &Path) -> anyhow::Result<()> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("not a file path: {}", path.display()))?;
    let contents = fs::read(path)?;
    peer.share_file(filename, &contents)?;
    Ok(())
}

/// Print inbound traffic until the connection closes.
fn present(rx: Receiver<PeerEvent>) {
    let mut transfers = FileTransfers::new();

    for event in rx {
        match event {
            PeerEvent::Control(message) => show_control(&message, &mut transfers),
            PeerEvent::Media(media) => {
                debug!("{} from {}: {} bytes", media.kind, media.sender, media.data.len())
            }
            PeerEvent::Disconnected { reason } => {
                println!("* Disconnected: {}", reason);
                break;
            }
        }
    }
}

fn show_control(message: &ControlMessage, transfers: &mut FileTransfers) {
    let time = message.received_at.with_timezone(&Local).format("%H:%M:%S");
    let sender = message.sender().unwrap_or("someone");

    match message.kind {
        MessageKind::Chat => match message.parse::<Chat>() {
            Ok(chat) => println!("[{}] {}: {}", time, sender, chat.msg),
            Err(e) => warn!("{}", e),
        },
        MessageKind::UserJoin | MessageKind::UserLeave => {
            if let Ok(presence) = message.parse::<Presence>() {
                let verb = if message.kind == MessageKind::UserJoin { "joined" } else { "left" };
                println!("[{}] * {} {}", time, presence.user, verb);
            }
        }
        MessageKind::ScreenStart => println!("[{}] * {} started sharing", time, sender),
        MessageKind::ScreenStop => println!("[{}] * {} stopped sharing", time, sender),
        MessageKind::ScreenImage => debug!("Screen image from {}", sender),
        MessageKind::FileNotify => match message.parse::<FileNotify>() {
            Ok(notify) => {
                transfers.on_notify(&notify);
                println!(
                    "[{}] * {} is sharing {} ({} bytes)",
                    time, sender, notify.filename, notify.size
                );
            }
            Err(e) => warn!("{}", e),
        },
        MessageKind::FileChunk => {
            let chunk = match message.parse::<FileChunk>() {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("{}", e);
                    return;
                }
            };
            match transfers.on_chunk(&chunk) {
                Ok(ChunkOutcome::Completed) => {
                    if let Some(done) = transfers.take_complete(&chunk.filename) {
                        let size = done.assemble().map(|b| b.len()).unwrap_or(0);
                        println!(
                            "[{}] * Received {} from {} ({} bytes in {} ms)",
                            time,
                            done.filename,
                            done.sender,
                            size,
                            done.elapsed().num_milliseconds()
                        );
                    }
                }
                Ok(ChunkOutcome::Duplicate) => {
                    debug!("Duplicate chunk {} of {}", chunk.chunk_id, chunk.filename)
                }
                Ok(ChunkOutcome::Progress(_)) => {}
                Err(e) => warn!("Bad chunk for {}: {}", chunk.filename, e),
            }
        }
        other => debug!("Unhandled {} from {}", other, sender),
    }
}
