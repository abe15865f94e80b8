use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Gate for side effects only the elected master may perform.
///
/// Implementations must reconfirm ownership against the shared store rather
/// than trust a cached flag alone.
#[async_trait]
pub trait Leadership: Send + Sync {
    async fn confirm(&self) -> bool;
}

/// Fixed answer, for tests and single-instance tools
#[derive(Debug, Default)]
pub struct StaticLeadership {
    leader: AtomicBool,
}

impl StaticLeadership {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
        }
    }

    pub fn set(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

#[async_trait]
impl Leadership for StaticLeadership {
    async fn confirm(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}
