/// Connection context state machine.
///
/// State transitions, all driven by the event-loop thread:
/// ```text
/// disconnected → connecting → authorizing → setting_name → ready
///                    ↓             ↓              ↓           ↓
///                  failed / terminated ←──────────┴──── terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Not connected yet.
    Disconnected,
    Connecting,
    Authorizing,
    /// Passing the application name to the server.
    SettingName,
    /// Established; requests may be issued.
    Ready,
    /// The handshake failed or the connection was lost.
    Failed,
    /// Cleanly closed.
    Terminated,
}

impl ContextState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Authorizing | Self::SettingName)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// State of one in-flight asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Running,
    Done,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}
