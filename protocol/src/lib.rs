//! Text wire format of the chat protocol.
//!
//! Every datagram carries exactly one [Envelope] rendered as
//! `VERB:field1[:field2]`. A payload is split into at most 3 fields at the
//! first two delimiter occurrences, so the body of a chat message may itself
//! contain delimiters without being cut.

mod peer_id;

pub use peer_id::PeerId;

use std::str::FromStr;
use thiserror::Error;

const FIELD_DELIMITER: char = ':';

/// One protocol message exchanged over the multicast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A peer announces its presence.
    Join { peer: PeerId },

    /// A peer announces its departure.
    Leave { peer: PeerId },

    /// Chat text addressed to the whole group.
    ChatMessage { sender: PeerId, body: String },

    /// A peer asks all members to report everyone they know.
    DirectoryRequest { requester: PeerId },

    /// One known member reported in response to a [Envelope::DirectoryRequest].
    ///
    /// The `requester` field is plain text, not a unicast address; the
    /// datagram is still broadcast to the whole group.
    DirectoryEntry { requester: PeerId, peer: PeerId },
}

impl Envelope {
    pub fn encode(&self) -> String {
        match self {
            Self::Join { peer } => format!("JOIN{}{}", FIELD_DELIMITER, peer),
            Self::Leave { peer } => format!("LEAVE{}{}", FIELD_DELIMITER, peer),
            Self::ChatMessage { sender, body } => {
                format!("MESSAGE{}{}{}{}", FIELD_DELIMITER, sender, FIELD_DELIMITER, body)
            }
            Self::DirectoryRequest { requester } => {
                format!("REQUEST_USER_LIST{}{}", FIELD_DELIMITER, requester)
            }
            Self::DirectoryEntry { requester, peer } => {
                format!("USER_LIST{}{}{}{}", FIELD_DELIMITER, requester, FIELD_DELIMITER, peer)
            }
        }
    }
}

impl FromStr for Envelope {
    type Err = DecodeError;

    /// Best-effort parser: fails only on field counts and unknown verbs.
    ///
    /// Fields beyond what a verb consumes are ignored, matching how the wire
    /// format has always been read.
    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let mut fields = payload.splitn(3, FIELD_DELIMITER);
        let verb = fields.next().unwrap_or_default();
        let first = fields.next().ok_or(DecodeError::MissingFields)?;
        let second = fields.next();
        match verb {
            "JOIN" => Ok(Self::Join { peer: first.into() }),
            "LEAVE" => Ok(Self::Leave { peer: first.into() }),
            "MESSAGE" => second
                .map(|body| Self::ChatMessage {
                    sender: first.into(),
                    body: body.into(),
                })
                .ok_or(DecodeError::MissingFields),
            "REQUEST_USER_LIST" => Ok(Self::DirectoryRequest {
                requester: first.into(),
            }),
            "USER_LIST" => second
                .map(|peer| Self::DirectoryEntry {
                    requester: first.into(),
                    peer: peer.into(),
                })
                .ok_or(DecodeError::MissingFields),
            _ => Err(DecodeError::UnknownVerb(verb.into())),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Too few fields for an envelope")]
    MissingFields,

    #[error("Unknown verb `{0}`")]
    UnknownVerb(String),
}
