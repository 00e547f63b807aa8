//! Message discriminants shared by both transports

use std::fmt;

use crate::error::Error;

/// The closed set of frame kinds. The discriminant is the wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Chat = 1,
    FileNotify = 2,
    FileRequest = 3,
    FileChunk = 4,
    ScreenStart = 5,
    ScreenImage = 6,
    ScreenStop = 7,
    UserJoin = 8,
    UserLeave = 9,
    VideoStream = 10,
    AudioStream = 11,
    UdpRegister = 12,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::Chat,
        MessageKind::FileNotify,
        MessageKind::FileRequest,
        MessageKind::FileChunk,
        MessageKind::ScreenStart,
        MessageKind::ScreenImage,
        MessageKind::ScreenStop,
        MessageKind::UserJoin,
        MessageKind::UserLeave,
        MessageKind::VideoStream,
        MessageKind::AudioStream,
        MessageKind::UdpRegister,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Video and audio carry raw bytes over the media channel. Every other
    /// kind carries a JSON record over the control channel.
    pub fn is_media(self) -> bool {
        matches!(self, MessageKind::VideoStream | MessageKind::AudioStream)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        MessageKind::ALL
            .into_iter()
            .find(|k| k.as_byte() == byte)
            .ok_or_else(|| Error::MalformedFrame(format!("unknown message kind {byte}")))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Chat => "chat",
            MessageKind::FileNotify => "file-notify",
            MessageKind::FileRequest => "file-request",
            MessageKind::FileChunk => "file-chunk",
            MessageKind::ScreenStart => "screen-start",
            MessageKind::ScreenImage => "screen-image",
            MessageKind::ScreenStop => "screen-stop",
            MessageKind::UserJoin => "user-join",
            MessageKind::UserLeave => "user-leave",
            MessageKind::VideoStream => "video-stream",
            MessageKind::AudioStream => "audio-stream",
            MessageKind::UdpRegister => "udp-register",
        };
        f.write_str(name)
    }
}
