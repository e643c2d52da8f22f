use crate::peer::types::IceCandidate;
use std::fmt;
use tracing::debug;

/// Кандидаты, полученные до установки remote description
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        debug!("Buffering remote candidate until remote description is set");
        self.queue.push(candidate);
    }

    /// Забирает все отложенные кандидаты в порядке поступления
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateStats {
    pub fn record(&mut self, candidate: &IceCandidate) {
        if candidate.candidate.contains("typ host") {
            self.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            self.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            self.relay += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay
    }
}

impl fmt::Display for CandidateStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} host, {} srflx, {} relay",
            self.host, self.srflx, self.relay
        )
    }
}
