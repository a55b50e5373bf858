use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

/// Lifecycle of a gateway node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyStatus {
    Stopped = 0,
    Initializing = 1,
    Replaying = 2,
    Ready = 3,
    Restarting = 4,
}

impl ProxyStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProxyStatus::Initializing,
            2 => ProxyStatus::Replaying,
            3 => ProxyStatus::Ready,
            4 => ProxyStatus::Restarting,
            _ => ProxyStatus::Stopped,
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Initializing => "initializing",
            ProxyStatus::Replaying => "replaying",
            ProxyStatus::Ready => "ready",
            ProxyStatus::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Node status plus the readiness latch reported by `/readyz`.
#[derive(Debug)]
pub struct GatewayStatus {
    status: AtomicU8,
    ready: AtomicBool,
}

impl Default for GatewayStatus {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(ProxyStatus::Stopped as u8),
            ready: AtomicBool::new(false),
        }
    }
}

impl GatewayStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ProxyStatus {
        ProxyStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn transition(&self, to: ProxyStatus) -> ProxyStatus {
        let from = ProxyStatus::from_u8(self.status.swap(to as u8, Ordering::AcqRel));
        if from != to {
            tracing::info!(%from, %to, "gateway status changed");
        }
        from
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        let was = self.ready.swap(ready, Ordering::AcqRel);
        if ready && !was {
            tracing::info!("gateway is ready");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let status = GatewayStatus::new();
        assert_eq!(status.get(), ProxyStatus::Stopped);
        assert_eq!(status.transition(ProxyStatus::Initializing), ProxyStatus::Stopped);
        status.transition(ProxyStatus::Ready);
        assert_eq!(status.get(), ProxyStatus::Ready);
        assert!(!status.is_ready());
        status.set_ready(true);
        assert!(status.is_ready());
    }
}
