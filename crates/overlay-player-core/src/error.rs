//! Error types for the decode boundary and the public player API.

use std::fmt;

/// Errors reported by a [`Decoder`](crate::media::Decoder) or
/// [`Container`](crate::media::Container).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The stream could not be opened for decoding
    OpenFailed(String),
    /// A single unit was corrupt; the pipeline skips it and continues
    Corrupt(String),
    /// Decoding cannot continue; the pipeline worker exits
    DecodeFailed(String),
    /// Repositioning the decoder failed
    SeekFailed(String),
    /// Unsupported codec or sample format
    Unsupported(String),
}

impl DecodeError {
    /// Returns true if the pipeline should skip the unit and keep decoding.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::Corrupt(_) | DecodeError::SeekFailed(_))
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::OpenFailed(msg) => write!(f, "Failed to open stream: {msg}"),
            DecodeError::Corrupt(msg) => write!(f, "Corrupt unit skipped: {msg}"),
            DecodeError::DecodeFailed(msg) => write!(f, "Decode failed: {msg}"),
            DecodeError::SeekFailed(msg) => write!(f, "Seek failed: {msg}"),
            DecodeError::Unsupported(msg) => write!(f, "Unsupported format: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors returned by [`CorePlayer`](crate::player::CorePlayer).
#[derive(Debug)]
pub enum PlayerError {
    /// The container has neither a usable audio nor a usable video stream
    NoStreams,
    /// `open()` was called on a player that already has streams bound
    AlreadyOpen,
    /// The operation requires an opened player
    NotOpen,
    /// A decoder could not be created
    Decoder(DecodeError),
    /// A pipeline worker thread could not be spawned
    ThreadSpawn(String),
}

impl fmt::Display for PlayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerError::NoStreams => write!(f, "No usable audio or video stream"),
            PlayerError::AlreadyOpen => write!(f, "Player is already open"),
            PlayerError::NotOpen => write!(f, "Player is not open"),
            PlayerError::Decoder(err) => write!(f, "Decoder error: {err}"),
            PlayerError::ThreadSpawn(msg) => write!(f, "Failed to spawn worker thread: {msg}"),
        }
    }
}

impl std::error::Error for PlayerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlayerError::Decoder(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for PlayerError {
    fn from(err: DecodeError) -> Self {
        PlayerError::Decoder(err)
    }
}
