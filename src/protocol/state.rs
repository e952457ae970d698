use crate::transport::StateMachine;

/// 会话协议状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Anonymous,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl ProtocolState {
    /// Disconnected 与 Error 为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolState::Disconnected | ProtocolState::Error)
    }

    /// 是否允许提交普通请求
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ProtocolState::Connecting | ProtocolState::Connected)
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolState::Anonymous => "ANONYMOUS",
            ProtocolState::Connecting => "CONNECTING",
            ProtocolState::Connected => "CONNECTED",
            ProtocolState::Disconnecting => "DISCONNECTING",
            ProtocolState::Disconnected => "DISCONNECTED",
            ProtocolState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl StateMachine for ProtocolState {
    fn next(self, to: Self) -> Option<Self> {
        use ProtocolState::*;

        let legal = match (self, to) {
            (Anonymous, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Disconnecting) => true,
            (Disconnecting, Disconnected) => true,
            (Connecting | Connected | Disconnecting, Error) => true,
            // 外部过期
            (Anonymous | Connecting | Connected, Disconnected) => true,
            _ => false,
        };
        if legal {
            Some(to)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProtocolState::*;

    #[test]
    fn test_lifecycle() {
        assert_eq!(Anonymous.next(Connecting), Some(Connecting));
        assert_eq!(Connecting.next(Connected), Some(Connected));
        assert_eq!(Connected.next(Disconnecting), Some(Disconnecting));
        assert_eq!(Disconnecting.next(Disconnected), Some(Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(Anonymous.next(Connected), None);
        assert_eq!(Anonymous.next(Error), None);
        assert_eq!(Connected.next(Connecting), None);
        assert_eq!(Disconnected.next(Connecting), None);
        assert_eq!(Error.next(Disconnected), None);
        assert_eq!(Disconnected.next(Error), None);
    }

    #[test]
    fn test_expiry_from_any_live_state() {
        for state in [Anonymous, Connecting, Connected, Disconnecting] {
            assert_eq!(state.next(Disconnected), Some(Disconnected));
        }
        assert!(Disconnected.is_terminal());
        assert!(Error.is_terminal());
        assert!(Connecting.accepts_requests());
        assert!(!Disconnecting.accepts_requests());
    }
}
