//! Control frames fanned out from one session to others
//!
//! The relay never routes a control frame to a single peer: it either goes
//! to everyone or to everyone but its originator.

use crate::error::Result;
use crate::model::frame::Frame;
use crate::model::kind::MessageKind;
use crate::model::payload::{self, Presence};

/// Which sessions a fan-out reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every session, the originator included.
    Everyone,
    /// Every session except the named one.
    AllExcept(String),
}

impl Audience {
    pub fn includes(&self, identity: &str) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::AllExcept(excluded) => excluded != identity,
        }
    }
}

/// An encoded frame and its audience.
#[derive(Debug, Clone)]
pub struct Propagated {
    pub kind: MessageKind,
    pub bytes: Vec<u8>,
    pub audience: Audience,
}

impl Propagated {
    pub fn new(frame: &Frame, audience: Audience) -> Self {
        Self {
            kind: frame.kind,
            bytes: frame.encode(),
            audience,
        }
    }

    /// Consume a control frame from `sender` and decide where it goes.
    ///
    /// The sender identity is stamped into the payload. Returns `Ok(None)`
    /// for kinds the relay does not forward.
    pub fn from_control(frame: &Frame, sender: &str) -> Result<Option<Self>> {
        let audience = match frame.kind {
            // The chat log is ordered by the relay, so the sender hears its own
            // message back along with everyone else.
            MessageKind::Chat => Audience::Everyone,
            MessageKind::FileNotify
            | MessageKind::FileChunk
            | MessageKind::ScreenStart
            | MessageKind::ScreenImage
            | MessageKind::ScreenStop => Audience::AllExcept(sender.to_string()),
            _ => return Ok(None),
        };

        let stamped = payload::stamp_user(&frame.payload, sender)?;
        Ok(Some(Self::new(&Frame::new(frame.kind, stamped), audience)))
    }

    /// `user-join`, for everyone but the newcomer.
    pub fn joined(identity: &str) -> Result<Self> {
        let frame = Frame::json(
            MessageKind::UserJoin,
            &Presence {
                user: identity.to_string(),
            },
        )?;
        Ok(Self::new(&frame, Audience::AllExcept(identity.to_string())))
    }

    /// `user-leave`, for everyone still connected.
    pub fn left(identity: &str) -> Result<Self> {
        let frame = Frame::json(
            MessageKind::UserLeave,
            &Presence {
                user: identity.to_string(),
            },
        )?;
        Ok(Self::new(&frame, Audience::Everyone))
    }
}
