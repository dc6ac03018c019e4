// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelCastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("Channel '{channel}' playlist is empty")]
    EmptyPlaylist { channel: String },

    #[error("Invalid segment: {0}")]
    InvalidSegment(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Playlist I/O error: {0}")]
    PlaylistIo(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Channel '{0}' is unavailable (too many consecutive encoder failures)")]
    ChannelUnavailable(String),
}

pub type Result<T> = std::result::Result<T, ChannelCastError>;
