use std::fmt;

use basic_timing_cache_channel::ChannelError;
use cache_side_channel::SideChannelError;
use tee_client::TeecError;

/// Everything that ends a run. None of these are retried.
#[derive(Debug)]
pub enum Error {
    Config(String),
    Clock(nix::Error),
    Channel(ChannelError),
    Tee(TeecError),
    SideChannel(SideChannelError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Clock(e) => write!(f, "monotonic clock unavailable: {}", e),
            Error::Channel(e) => write!(f, "{}", e),
            Error::Tee(e) => write!(f, "{}", e),
            Error::SideChannel(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(_) => None,
            Error::Clock(e) => Some(e),
            Error::Channel(e) => Some(e),
            Error::Tee(e) => Some(e),
            Error::SideChannel(e) => Some(e),
        }
    }
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        Error::Channel(e)
    }
}

impl From<TeecError> for Error {
    fn from(e: TeecError) -> Self {
        Error::Tee(e)
    }
}

impl From<SideChannelError> for Error {
    fn from(e: SideChannelError) -> Self {
        Error::SideChannel(e)
    }
}
