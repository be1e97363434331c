use crate::error::TraceError;
use hoptrace_model::{HopRecord, SessionOutcome, SessionStatus};

/// Collects a session's emissions into one [`SessionOutcome`].
#[derive(Debug, Clone)]
pub struct ResultFinalizer {
    target: String,
    backend: String,
    hops: Vec<HopRecord>,
    artifact: Option<String>,
}

impl ResultFinalizer {
    pub fn new(target: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            backend: backend.into(),
            hops: Vec::new(),
            artifact: None,
        }
    }

    /// Records one emission. A later emission for the same hop replaces the
    /// earlier one in place.
    pub fn record(&mut self, hop: &HopRecord) {
        match self
            .hops
            .iter_mut()
            .rev()
            .find(|existing| existing.hop_number == hop.hop_number)
        {
            Some(existing) => *existing = hop.clone(),
            None => self.hops.push(hop.clone()),
        }
    }

    /// The last artifact seen wins.
    pub fn set_artifact(&mut self, value: impl Into<String>) {
        self.artifact = Some(value.into());
    }

    pub fn hops(&self) -> &[HopRecord] {
        &self.hops
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty() && self.artifact.is_none()
    }

    pub fn finish(mut self, status: SessionStatus, exit_code: Option<i32>) -> SessionOutcome {
        if status.is_success() {
            if let Some(last) = self.hops.last_mut() {
                last.is_final = last.has_reply();
            }
        }
        SessionOutcome {
            target: self.target,
            backend: self.backend,
            hops: self.hops,
            artifact: self.artifact,
            status,
            exit_code,
        }
    }

    pub fn finish_with_error(mut self, error: &TraceError, exit_code: Option<i32>) -> SessionOutcome {
        if !error.keeps_partial_hops() {
            self.hops.clear();
        }
        let status = error.status();
        self.finish(status, exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrections_replace_in_place() {
        let mut finalizer = ResultFinalizer::new("example.com", "rich");
        finalizer.record(&HopRecord::new(1, "192.168.1.1"));
        finalizer.record(&HopRecord::new(2, "10.0.0.1"));
        let mut corrected = HopRecord::new(2, "10.0.0.1");
        corrected.geo.fill_unknown(&["China"]);
        finalizer.record(&corrected);
        finalizer.set_artifact("https://first");
        finalizer.set_artifact("https://second");

        let outcome = finalizer.finish(SessionStatus::Completed, Some(0));
        assert_eq!(outcome.hops.len(), 2);
        assert_eq!(outcome.hops[1].geo.country.as_known(), Some("China"));
        assert!(outcome.hops[1].is_final);
        assert!(!outcome.hops[0].is_final);
        assert_eq!(outcome.artifact.as_deref(), Some("https://second"));
    }

    #[test]
    fn trailing_timeout_is_not_final() {
        let mut finalizer = ResultFinalizer::new("example.com", "native");
        finalizer.record(&HopRecord::new(1, "192.168.1.1"));
        finalizer.record(&HopRecord::timed_out(2));
        let outcome = finalizer.finish(SessionStatus::Completed, Some(0));
        assert!(outcome.hops.iter().all(|hop| !hop.is_final));
    }

    #[test]
    fn selection_failure_drops_hops() {
        let mut finalizer = ResultFinalizer::new("example.com", "rich");
        finalizer.record(&HopRecord::new(1, "192.168.1.1"));
        let outcome = finalizer.finish_with_error(
            &TraceError::SelectionFailed("cancelled".to_string()),
            None,
        );
        assert!(outcome.hops.is_empty());
        assert!(matches!(outcome.status, SessionStatus::Failed { .. }));
    }

    #[test]
    fn cancelled_sessions_keep_hops_unmarked() {
        let mut finalizer = ResultFinalizer::new("example.com", "rich");
        finalizer.record(&HopRecord::new(1, "192.168.1.1"));
        let outcome = finalizer.finish(SessionStatus::Cancelled, None);
        assert_eq!(outcome.hops.len(), 1);
        assert!(!outcome.hops[0].is_final);
    }
}
