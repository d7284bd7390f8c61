use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientTimeouts {
    pub connect: Option<Duration>,
    /// How long the handshake waits for the peer's first SETTINGS frame.
    pub settings: Option<Duration>,
    pub write: Option<Duration>,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            settings: Some(Duration::from_secs(10)),
            write: Some(Duration::from_secs(30)),
        }
    }
}

impl ClientTimeouts {
    pub fn disabled() -> Self {
        Self {
            connect: None,
            settings: None,
            write: None,
        }
    }
}
