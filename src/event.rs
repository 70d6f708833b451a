use crate::gap_recovery::RecoveryReport;
use crate::model::bar::{Bar, BarKey};
use crate::model::pattern::Pattern;
use crate::signal::SignalAssessment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsConnectionStatus {
    Connecting,
    Connected,
    /// `code` is the server close code, when one was sent.
    Disconnected { code: Option<u16> },
    Reconnecting { attempt: u32, delay_ms: u64 },
}

/// Downtime between losing and regaining the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapWindow {
    pub symbols: Vec<String>,
    pub disconnected_at_ms: u64,
    pub reconnected_at_ms: u64,
}

impl GapWindow {
    pub fn downtime_ms(&self) -> u64 {
        self.reconnected_at_ms.saturating_sub(self.disconnected_at_ms)
    }
}

/// Pushed by the connection manager.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    FinalizedBar(Bar),
    GapWindow(GapWindow),
    Status(WsConnectionStatus),
}

/// Pushed by the coordinator to downstream consumers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    BaseBarStored(Bar),
    PatternDetected { key: BarKey, pattern: Pattern },
    DerivedBarBuilt(Bar),
    GapRecovered(RecoveryReport),
    Signal { key: BarKey, assessment: SignalAssessment },
}
