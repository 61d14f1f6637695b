use serde::{Deserialize, Serialize};

pub const TYPE_INITIATION: &str = "Initiation";
pub const TYPE_OFFER: &str = "offer";
pub const TYPE_ANSWER: &str = "answer";
pub const TYPE_CANDIDATE: &str = "candidate";
pub const TYPE_REQICE: &str = "reqice";

/// Envelope exchanged over the signaling WebSocket.
///
/// `data` is an opaque string; for `offer`, `answer` and `candidate` it holds a
/// further JSON document (session description or candidate init).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: String,
}

impl SignalMessage {
    pub fn new(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }

    pub fn offer(description_json: String) -> Self {
        Self::new(TYPE_OFFER, description_json)
    }

    pub fn candidate(candidate_json: String) -> Self {
        Self::new(TYPE_CANDIDATE, candidate_json)
    }

    /// Tells the client the server is ready to receive its candidates.
    pub fn reqice() -> Self {
        Self::new(TYPE_REQICE, "")
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn command(&self) -> ClientCommand<'_> {
        match self.kind.as_str() {
            TYPE_INITIATION => ClientCommand::Initiation,
            TYPE_ANSWER => ClientCommand::Answer(&self.data),
            TYPE_CANDIDATE => ClientCommand::Candidate(&self.data),
            TYPE_REQICE => ClientCommand::ReqIce,
            other => ClientCommand::Unknown(other),
        }
    }
}

/// Client-originated message, discriminated by exact match on `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand<'a> {
    Initiation,
    Answer(&'a str),
    Candidate(&'a str),
    ReqIce,
    Unknown(&'a str),
}
