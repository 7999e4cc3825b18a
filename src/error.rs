use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("authentication failed: {0}")]
    Auth(&'static str),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("already connected to a broker")]
    AlreadyConnected,
    #[error("not connected to a broker")]
    NotConnected,
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(u64),
    #[error("payload field missing: {0}")]
    MissingField(String),
    #[error("payload field invalid: {0}")]
    InvalidField(String),
}

impl Error {
    /// True when the failure means the peer is gone, as opposed to a
    /// recoverable per-message error.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Disconnected => true,
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
