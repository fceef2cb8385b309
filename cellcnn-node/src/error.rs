use std::time::Duration;

use cellcnn::{CnnError, ErrorKind};
use thiserror::Error;

use crate::wire::{FrameError, MessageType};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),

    #[error("channel to {0} closed")]
    ChannelClosed(&'static str),

    #[error("cancelled")]
    Cancelled,

    #[error("no message within {0:?}")]
    Timeout(Duration),

    #[error("unexpected {got:?} while waiting for {want:?}")]
    UnexpectedMessage { want: MessageType, got: MessageType },

    #[error(transparent)]
    Cnn(#[from] CnnError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(_) | Self::UnexpectedMessage { .. } => ErrorKind::Serialization,
            Self::ChannelClosed(_) | Self::Cancelled => ErrorKind::ProtocolAbort,
            Self::Timeout(_) => ErrorKind::ProtocolTimeout,
            Self::Cnn(e) => e.kind(),
        }
    }
}
