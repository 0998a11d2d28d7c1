//! Connectivity as seen from the top of the pipeline.
//!
//! The root of the stage chain publishes a [`ConnectionState`] on a watch
//! channel every time the protocol stage reports a connect or disconnect, so
//! callers can react to connectivity without owning an operation.

use std::fmt;

/// Current connectivity of the protocol session.
///
/// Transitions are driven only by the protocol stage's `on_connected` and
/// `on_disconnected` notifications:
/// - `Disconnected` -> `Connected` (session reported a successful handshake)
/// - `Connected` -> `Disconnected` (requested disconnect or connection drop)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection has been reported yet, or the last one ended.
    #[default]
    Disconnected,

    /// The session reported a successful handshake and no disconnect since.
    Connected,
}

impl ConnectionState {
    /// Returns a short string identifier for the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connected => "Connected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(!ConnectionState::default().is_connected());
    }

    #[test]
    fn test_display_matches_as_str() {
        for state in [ConnectionState::Connected, ConnectionState::Disconnected] {
            assert_eq!(state.to_string(), state.as_str());
        }
        assert!(ConnectionState::Connected.is_connected());
    }
}
