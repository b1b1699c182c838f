//! Connection options

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

bitflags! {
    /// Flags passed to the transport when connecting
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ConnectFlags: u32 {
        const HANDLE_SHARE_NONE = 0x0020;
        const HANDLE_SHARE_BLOCK = 0x0040;
        const HANDLE_SHARE_NO_BLOCK = 0x0080;
        const RECONNECT = 0x0100_0000;
    }
}

/// Compatibility switch for how connection handles are shared between threads
///
/// Controls the sharing flags a default [`ConnectOptions`] carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleShareMode {
    /// Share handles; callers from other threads block until the handle is free
    #[default]
    Block,
    /// Share handles; callers from other threads fail instead of blocking
    NoBlock,
    /// Handles are bound to the thread that created them
    None,
}

impl HandleShareMode {
    pub fn connect_flags(&self) -> ConnectFlags {
        match self {
            Self::Block => ConnectFlags::HANDLE_SHARE_BLOCK,
            Self::NoBlock => ConnectFlags::HANDLE_SHARE_NO_BLOCK,
            Self::None => ConnectFlags::HANDLE_SHARE_NONE,
        }
    }
}

impl FromStr for HandleShareMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "noblock" | "no-block" | "no_block" => Ok(Self::NoBlock),
            "none" => Ok(Self::None),
            other => Err(format!("unknown handle share mode: {}", other)),
        }
    }
}

/// Options for opening a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub flags: ConnectFlags,
    pub application_name: Option<String>,
}

impl ConnectOptions {
    /// Default options for the given share mode
    pub fn for_share_mode(mode: HandleShareMode) -> Self {
        Self {
            flags: mode.connect_flags(),
            application_name: None,
        }
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn with_reconnect(mut self) -> Self {
        self.flags.insert(ConnectFlags::RECONNECT);
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::for_share_mode(HandleShareMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connect_options_block() {
        let options = ConnectOptions::default();
        assert_eq!(options.flags, ConnectFlags::HANDLE_SHARE_BLOCK);
    }

    #[test]
    fn test_share_mode_selects_flags() {
        let options = ConnectOptions::for_share_mode(HandleShareMode::NoBlock).with_reconnect();
        assert!(options.flags.contains(ConnectFlags::HANDLE_SHARE_NO_BLOCK));
        assert!(options.flags.contains(ConnectFlags::RECONNECT));
        assert!(!options.flags.contains(ConnectFlags::HANDLE_SHARE_BLOCK));
    }

    #[test]
    fn test_share_mode_parse() {
        assert_eq!("BLOCK".parse::<HandleShareMode>(), Ok(HandleShareMode::Block));
        assert_eq!(
            "no-block".parse::<HandleShareMode>(),
            Ok(HandleShareMode::NoBlock)
        );
        assert!("sometimes".parse::<HandleShareMode>().is_err());
    }
}
