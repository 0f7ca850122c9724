use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::primary::ToolStep;

pub const DEFAULT_DRAIN_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Elapsed,
    Cancelled,
}

/// Fixed pause between the end of the primary stream and the audit. Ends
/// early when the session is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct DrainDelay {
    duration: Duration,
}

impl DrainDelay {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> DrainOutcome {
        if cancel.is_cancelled() {
            return DrainOutcome::Cancelled;
        }
        tokio::select! {
            _ = cancel.cancelled() => DrainOutcome::Cancelled,
            _ = tokio::time::sleep(self.duration) => DrainOutcome::Elapsed,
        }
    }
}

impl Default for DrainDelay {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_DELAY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditVerdict {
    Done,
    NeedsFollowUp,
}

impl AuditVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditVerdict::Done => "done",
            AuditVerdict::NeedsFollowUp => "needs_follow_up",
        }
    }
}

pub struct CompletionAuditor;

impl CompletionAuditor {
    /// A turn needs a follow-up only when a tool ran and no text at all
    /// reached the user. Any text, however short, settles the turn.
    pub fn audit(steps: &[ToolStep], saw_text: bool, final_text: &str) -> AuditVerdict {
        let has_tool_call = !steps.is_empty();
        let has_text = saw_text || !final_text.trim().is_empty();
        if has_tool_call && !has_text {
            AuditVerdict::NeedsFollowUp
        } else {
            AuditVerdict::Done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step() -> ToolStep {
        ToolStep {
            round: 1,
            call_id: "c1".to_string(),
            tool_name: "get_invoice".to_string(),
            arguments: json!({}),
            output: json!({"status": "SENT"}),
            is_error: false,
        }
    }

    #[test]
    fn follow_up_only_for_tool_calls_without_text() {
        let steps = vec![step()];
        assert_eq!(
            CompletionAuditor::audit(&steps, false, "  \n"),
            AuditVerdict::NeedsFollowUp
        );
        assert_eq!(CompletionAuditor::audit(&steps, true, ""), AuditVerdict::Done);
        assert_eq!(CompletionAuditor::audit(&steps, false, "ok"), AuditVerdict::Done);
        assert_eq!(CompletionAuditor::audit(&[], false, ""), AuditVerdict::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_delay_elapses() {
        let delay = DrainDelay::new(Duration::from_millis(250));
        let started = tokio::time::Instant::now();
        assert_eq!(delay.wait(&CancellationToken::new()).await, DrainOutcome::Elapsed);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn drain_delay_stops_on_cancel() {
        let delay = DrainDelay::new(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert_eq!(delay.wait(&cancel).await, DrainOutcome::Cancelled);

        let already = CancellationToken::new();
        already.cancel();
        assert_eq!(delay.wait(&already).await, DrainOutcome::Cancelled);
    }
}
