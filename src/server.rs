//! Relay process
//!
//! One thread accepts control connections and spawns a thread per
//! connection; one more thread owns the shared media socket. All of them
//! share the [`Registry`].

use std::{
    io::{ErrorKind, Read},
    net::{SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::Arc,
    thread,
};

use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::model::{
    frame::{decode_datagram, parse_claimed_identity, tag_media, HANDSHAKE_READ_LIMIT},
    payload::{self, Chat, FileNotify, FileRequest, UdpRegister},
    propagated::Propagated,
    session::{MediaRegistration, QueuedSink, TcpSink},
    Frame, FrameDecoder, MessageKind, Registry,
};
use crate::util::{announce_lan_addresses, init_log};

pub fn main(args: &[String]) -> anyhow::Result<()> {
    init_log();

    let config = RelayConfig::from_args(args)?;
    let relay = Relay::bind(config)?;

    info!(
        "Relay listening on TCP {} and UDP {}",
        relay.control_addr()?,
        relay.media_addr()?
    );
    announce_lan_addresses(relay.control_addr()?.port(), relay.media_addr()?.port());

    relay.run()?;
    Ok(())
}

/// Both listeners, bound and ready.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<Registry>,
    listener: TcpListener,
    media: Arc<UdpSocket>,
}

/// A relay running on background threads.
#[derive(Clone)]
pub struct RelayHandle {
    pub control_addr: SocketAddr,
    pub media_addr: SocketAddr,
    pub registry: Arc<Registry>,
}

impl Relay {
    pub fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.control_addr())?;
        let media = UdpSocket::bind(config.media_addr())?;

        Ok(Self {
            config,
            registry: Arc::new(Registry::new()),
            listener,
            media: Arc::new(media),
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn media_addr(&self) -> Result<SocketAddr> {
        Ok(self.media.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Run the media relay on its own thread and accept control
    /// connections on this one. Returns only if accepting fails for good.
    pub fn run(self) -> Result<()> {
        self.spawn_media();
        accept_loop(self.listener, self.registry, self.config);
        Ok(())
    }

    /// Run everything on background threads.
    pub fn spawn(self) -> Result<RelayHandle> {
        let handle = RelayHandle {
            control_addr: self.control_addr()?,
            media_addr: self.media_addr()?,
            registry: self.registry.clone(),
        };

        self.spawn_media();
        let (listener, registry, config) = (self.listener, self.registry, self.config);
        thread::spawn(move || accept_loop(listener, registry, config));

        Ok(handle)
    }

    fn spawn_media(&self) {
        let socket = self.media.clone();
        let registry = self.registry.clone();
        let buffer_size = self.config.buffer_size;
        thread::spawn(move || media_loop(&socket, &registry, buffer_size));
    }
}

fn accept_loop(listener: TcpListener, registry: Arc<Registry>, config: RelayConfig) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let registry = registry.clone();
                let config = config.clone();
                thread::spawn(move || serve_control(stream, &registry, &config));
            }
            Err(e) => warn!("TCP accept error: {}", e),
        }
    }
}

/// Everything one control connection does, from handshake to cleanup.
fn serve_control(mut stream: TcpStream, registry: &Registry, config: &RelayConfig) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Dropping connection without a peer address: {}", e);
            return;
        }
    };

    let (identity, mut decoder) = match handshake(&mut stream, peer_addr, registry, config) {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };

    info!("{} connected from {}", identity, peer_addr);
    match Propagated::joined(&identity) {
        Ok(join) => {
            broadcast(registry, &join);
        }
        Err(e) => warn!("Could not announce {}: {}", identity, e),
    }

    match receive_loop(&mut stream, &identity, &mut decoder, registry, config.buffer_size) {
        Err(Error::ConnectionLost) => {}
        Err(e) => warn!("Connection to {} ended: {}", identity, e),
        Ok(()) => {}
    }

    disconnect(registry, &identity);
}

/// Read the claimed identity, register it, and answer with the confirmed one.
///
/// The confirmation is the writer thread's preamble, so it reaches the peer
/// ahead of any broadcast queued since registration.
fn handshake(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    registry: &Registry,
    config: &RelayConfig,
) -> Result<(String, FrameDecoder)> {
    let mut buf = [0u8; HANDSHAKE_READ_LIMIT];
    let n = stream.read(&mut buf)?;
    let (claimed, rest) = parse_claimed_identity(&buf[..n])?;

    let tcp = TcpSink::new(stream.try_clone()?, config.write_timeout)?;
    let (sink, writer) = QueuedSink::new(tcp, config.send_queue);
    let identity = registry.register(&claimed, Arc::new(sink), peer_addr);
    writer.spawn(identity.as_bytes().to_vec());

    Ok((identity, FrameDecoder::with_remainder(rest)))
}

fn receive_loop(
    stream: &mut TcpStream,
    identity: &str,
    decoder: &mut FrameDecoder,
    registry: &Registry,
    buffer_size: usize,
) -> Result<()> {
    let mut buf = vec![0; buffer_size];

    loop {
        for next in decoder.decode_available() {
            match next {
                Ok(frame) => dispatch(registry, identity, &frame),
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => warn!("Dropping frame from {}: {}", identity, e),
            }
        }

        let n = match stream.read(&mut buf) {
            Ok(0) => return Err(Error::ConnectionLost),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        decoder.extend(&buf[..n]);
    }
}

/// Apply the relay policy for one control frame from `identity`.
pub fn dispatch(registry: &Registry, identity: &str, frame: &Frame) {
    if frame.kind == MessageKind::UdpRegister {
        register_media(registry, identity, frame);
        return;
    }

    match Propagated::from_control(frame, identity) {
        Ok(Some(propagated)) => {
            log_control(identity, frame);
            broadcast(registry, &propagated);
        }
        Ok(None) if frame.kind == MessageKind::FileRequest => {
            match payload::parse::<FileRequest>(&frame.payload) {
                Ok(request) => {
                    debug!("Not relaying file-request for {} from {}", request.filename, identity)
                }
                Err(e) => debug!("Not relaying file-request from {}: {}", identity, e),
            }
        }
        Ok(None) => debug!("Not relaying {} from {}", frame.kind, identity),
        Err(e) => warn!("Dropping {} from {}: {}", frame.kind, identity, e),
    }
}

fn register_media(registry: &Registry, identity: &str, frame: &Frame) {
    let port = match payload::parse::<UdpRegister>(&frame.payload) {
        Ok(register) => register.port,
        Err(e) => {
            warn!("Bad udp-register from {}: {}", identity, e);
            return;
        }
    };

    match registry.set_media_port(identity, port) {
        MediaRegistration::Registered(addr) => info!("{} registered UDP at {}", identity, addr),
        MediaRegistration::AlreadyRegistered(addr) => {
            warn!("{} already registered UDP at {}, ignoring port {}", identity, addr, port)
        }
        MediaRegistration::UnknownSession => warn!("udp-register from unknown session {}", identity),
    }
}

fn log_control(identity: &str, frame: &Frame) {
    match frame.kind {
        MessageKind::Chat => {
            if let Ok(chat) = payload::parse::<Chat>(&frame.payload) {
                info!("[chat] {}: {}", identity, chat.msg);
            }
        }
        MessageKind::FileNotify => {
            if let Ok(notify) = payload::parse::<FileNotify>(&frame.payload) {
                info!("[file] {} sharing {} ({} bytes)", identity, notify.filename, notify.size);
            }
        }
        MessageKind::ScreenStart => info!("[screen] {} started screen share", identity),
        MessageKind::ScreenStop => info!("[screen] {} stopped screen share", identity),
        _ => {}
    }
}

/// Hand a propagated frame to every session in its audience.
///
/// Targets come from a registry snapshot and each send only queues the frame
/// for that session's writer, so one stalled peer holds up nobody else. A
/// target whose queue is full or whose writer has stopped is logged and torn
/// down, and the rest still get the frame.
pub fn broadcast(registry: &Registry, propagated: &Propagated) -> Vec<Error> {
    let mut failures = vec![];

    for session in registry.snapshot() {
        if !propagated.audience.includes(&session.identity) {
            continue;
        }

        if let Err(source) = session.control.send(&propagated.bytes) {
            // The peer's own receive loop sees the shutdown and cleans up.
            session.control.close();
            let failure = Error::PeerDelivery {
                identity: session.identity.clone(),
                source,
            };
            warn!("{}: {}", propagated.kind, failure);
            failures.push(failure);
        }
    }

    failures
}

/// Drop the session and tell everyone else it left.
pub fn disconnect(registry: &Registry, identity: &str) {
    let Some(session) = registry.remove(identity) else {
        return;
    };
    session.control.close();
    info!("{} disconnected", identity);

    match Propagated::left(identity) {
        Ok(leave) => {
            broadcast(registry, &leave);
        }
        Err(e) => warn!("Could not announce departure of {}: {}", identity, e),
    }
}

fn media_loop(socket: &UdpSocket, registry: &Registry, buffer_size: usize) {
    info!("Media relay started on {:?}", socket.local_addr());
    let mut buf = vec![0; buffer_size];

    loop {
        let (n, source) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) => {
                match e.kind() {
                    // ICMP port-unreachable from a vanished peer surfaces here on some platforms.
                    ErrorKind::Interrupted | ErrorKind::ConnectionReset => {
                        debug!("UDP receive interrupted: {}", e)
                    }
                    _ => warn!("UDP receive error: {}", e),
                }
                continue;
            }
        };

        match relay_datagram(socket, registry, &buf[..n], source) {
            Ok(_) => {}
            Err(e @ Error::UnregisteredSender(_)) => debug!("{}", e),
            Err(e) => debug!("Dropping datagram from {}: {}", source, e),
        }
    }
}

/// Relay one inbound media datagram to every other registered peer.
///
/// Returns the number of targets it was sent to.
pub fn relay_datagram(
    socket: &UdpSocket,
    registry: &Registry,
    datagram: &[u8],
    source: SocketAddr,
) -> Result<usize> {
    let frame = decode_datagram(datagram)?;
    if !frame.kind.is_media() {
        return Err(Error::MalformedFrame(format!(
            "{} is not a media kind",
            frame.kind
        )));
    }

    let route = registry
        .media_route(source)
        .ok_or(Error::UnregisteredSender(source))?;
    let tagged = tag_media(frame.kind, &route.sender, &frame.payload);

    let mut sent = 0;
    for (identity, addr) in &route.targets {
        match socket.send_to(&tagged, addr) {
            Ok(_) => sent += 1,
            Err(source) => {
                let failure = Error::PeerDelivery {
                    identity: identity.clone(),
                    source,
                };
                warn!("UDP send error: {}", failure);
            }
        }
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::frame::untag_media;
    use crate::model::payload::{parse, Presence};
    use crate::model::session::tests::{addr, RecordingSink};
    use std::time::Duration;

    fn frames_of(sink: &RecordingSink) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        for bytes in sink.received() {
            decoder.extend(&bytes);
        }
        decoder
            .decode_available()
            .into_iter()
            .map(|f| f.unwrap())
            .collect()
    }

    fn registry_abc() -> (Registry, Vec<Arc<RecordingSink>>) {
        let registry = Registry::new();
        let sinks: Vec<Arc<RecordingSink>> =
            (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
        for (name, (i, sink)) in ["A", "B", "C"].iter().zip(sinks.iter().enumerate()) {
            registry.register(name, sink.clone(), addr(&format!("10.0.0.{}:4000", i + 1)));
        }
        (registry, sinks)
    }

    #[test]
    fn chat_is_delivered_to_everyone_including_sender() {
        let (registry, sinks) = registry_abc();
        dispatch(
            &registry,
            "A",
            &Frame::new(MessageKind::Chat, br#"{"msg":"hi"}"#.to_vec()),
        );

        for sink in &sinks {
            let frames = frames_of(sink);
            assert_eq!(frames.len(), 1);
            let chat: Chat = parse(&frames[0].payload).unwrap();
            assert_eq!(chat.user.as_deref(), Some("A"));
            assert_eq!(chat.msg, "hi");
        }
    }

    #[test]
    fn file_notify_skips_the_sender() {
        let (registry, sinks) = registry_abc();
        dispatch(
            &registry,
            "A",
            &Frame::new(
                MessageKind::FileNotify,
                br#"{"filename":"a.txt","size":3}"#.to_vec(),
            ),
        );

        assert!(sinks[0].received().is_empty());
        for sink in &sinks[1..] {
            let notify: FileNotify = parse(&frames_of(sink)[0].payload).unwrap();
            assert_eq!(notify.user.as_deref(), Some("A"));
            assert_eq!(notify.filename, "a.txt");
        }
    }

    #[test]
    fn one_failing_target_does_not_block_the_rest() {
        let registry = Registry::new();
        let good = Arc::new(RecordingSink::default());
        registry.register("A", Arc::new(RecordingSink::failing()), addr("10.0.0.1:1"));
        registry.register("B", good.clone(), addr("10.0.0.2:1"));

        let chat = Frame::new(MessageKind::Chat, br#"{"msg":"x"}"#.to_vec());
        let failures = broadcast(
            &registry,
            &Propagated::from_control(&chat, "B").unwrap().unwrap(),
        );

        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], Error::PeerDelivery { identity, .. } if identity == "A"));
        assert_eq!(frames_of(&good).len(), 1);
    }

    #[test]
    fn malformed_and_unrelayed_frames_are_dropped() {
        let (registry, sinks) = registry_abc();
        dispatch(&registry, "A", &Frame::new(MessageKind::Chat, b"not json".to_vec()));
        dispatch(&registry, "A", &Frame::new(MessageKind::Chat, b"[1]".to_vec()));
        dispatch(&registry, "A", &Frame::new(MessageKind::FileRequest, b"{}".to_vec()));
        dispatch(
            &registry,
            "A",
            &Frame::new(MessageKind::FileRequest, br#"{"filename":"a.txt"}"#.to_vec()),
        );
        dispatch(&registry, "A", &Frame::new(MessageKind::UserLeave, b"{}".to_vec()));

        assert!(sinks.iter().all(|s| s.received().is_empty()));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn udp_register_sets_the_media_address() {
        let (registry, _) = registry_abc();
        dispatch(
            &registry,
            "B",
            &Frame::new(MessageKind::UdpRegister, br#"{"port":40002}"#.to_vec()),
        );
        dispatch(
            &registry,
            "C",
            &Frame::new(MessageKind::UdpRegister, br#"{"port":"nope"}"#.to_vec()),
        );

        assert_eq!(
            registry.lookup_by_media_address(addr("10.0.0.2:40002")).as_deref(),
            Some("B")
        );
        assert!(registry.snapshot()[2].media_addr.is_none());
    }

    #[test]
    fn disconnect_removes_and_announces_once() {
        let (registry, sinks) = registry_abc();
        disconnect(&registry, "A");
        disconnect(&registry, "A");

        assert!(!registry.contains("A"));
        assert!(sinks[0].received().is_empty());
        for sink in &sinks[1..] {
            let frames = frames_of(sink);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].kind, MessageKind::UserLeave);
            let presence: Presence = parse(&frames[0].payload).unwrap();
            assert_eq!(presence.user, "A");
        }
    }

    fn local_udp() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        socket
    }

    #[test]
    fn media_is_tagged_and_relayed_to_everyone_else() {
        let relay = local_udp();
        let peers: Vec<UdpSocket> = (0..3).map(|_| local_udp()).collect();
        let registry = Registry::new();
        for (name, socket) in ["A", "B", "C"].iter().zip(&peers) {
            registry.register(name, Arc::new(RecordingSink::default()), addr("127.0.0.1:1"));
            registry.set_media_address(name, socket.local_addr().unwrap());
        }

        let datagram = crate::model::frame::encode(MessageKind::VideoStream, b"R-frame");
        let sent = relay_datagram(
            &relay,
            &registry,
            &datagram,
            peers[0].local_addr().unwrap(),
        )
        .unwrap();
        assert_eq!(sent, 2);

        let mut buf = [0u8; 2048];
        for peer in &peers[1..] {
            let (n, from) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(from, relay.local_addr().unwrap());
            let tagged = untag_media(decode_datagram(&buf[..n]).unwrap()).unwrap();
            assert_eq!(tagged.sender, "A");
            assert_eq!(tagged.data, b"R-frame".to_vec());
        }
        assert!(peers[0].recv_from(&mut buf).is_err());
    }

    #[test]
    fn media_from_unknown_or_non_media_is_dropped() {
        let relay = local_udp();
        let registry = Registry::new();
        registry.register("A", Arc::new(RecordingSink::default()), addr("127.0.0.1:1"));
        registry.set_media_address("A", addr("127.0.0.1:6000"));

        let video = crate::model::frame::encode(MessageKind::VideoStream, b"x");
        assert!(matches!(
            relay_datagram(&relay, &registry, &video, addr("127.0.0.1:6001")),
            Err(Error::UnregisteredSender(_))
        ));

        let chat = crate::model::frame::encode(MessageKind::Chat, b"{}");
        assert!(matches!(
            relay_datagram(&relay, &registry, &chat, addr("127.0.0.1:6000")),
            Err(Error::MalformedFrame(_))
        ));
    }
}
