//! Named side-channel events fired at the remote service.

use serde::{Deserialize, Serialize};

/// Events the client fires without expecting a payload back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    /// The user started typing.
    StartTyping,
    /// The user stopped typing.
    StopTyping,
}

impl EventName {
    /// Name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartTyping => "startTyping",
            Self::StopTyping => "stopTyping",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
