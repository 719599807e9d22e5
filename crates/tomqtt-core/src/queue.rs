//! The pending-command FIFO.
//!
//! Commands are held as verbatim strings: responses are correlated by
//! re-parsing the head command's prefix (`GET_NETWORK 7 disabled` routes by
//! `GET_NETWORK` and re-parses `7`, `disabled`), so no richer command
//! object is needed. At most one command is outstanding; the head is the
//! in-flight one, everything behind it is pending.

use std::collections::VecDeque;
use std::time::Duration;

/// Consecutive head timeouts tolerated before the transport counts as dead.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;

/// A queued command line with its response deadline.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// Exact bytes written (to be written) to the transport
    pub line: String,
    /// How long to wait for the terminating response once in flight
    pub timeout: Duration,
}

/// FIFO of outstanding requests.
#[derive(Debug, Default)]
pub struct CommandQueue {
    items: VecDeque<PendingCommand>,
    in_flight: bool,
    consecutive_timeouts: u32,
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. Returns true when it became the new head, in
    /// which case the caller must write it to the transport.
    pub fn push(&mut self, line: String, timeout: Duration) -> bool {
        self.items.push_back(PendingCommand { line, timeout });
        self.items.len() == 1
    }

    /// Linear scan for a verbatim queued line; pollers use this to avoid
    /// duplicate enqueues.
    pub fn contains(&self, line: &str) -> bool {
        self.items.iter().any(|cmd| cmd.line == line)
    }

    /// Scan for any queued line matching the predicate.
    pub fn any(&self, pred: impl Fn(&str) -> bool) -> bool {
        self.items.iter().any(|cmd| pred(&cmd.line))
    }

    /// The head command, if any.
    pub fn head(&self) -> Option<&PendingCommand> {
        self.items.front()
    }

    /// True while the head command has been written and awaits its
    /// response. A head is written exactly once before being popped.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight && !self.items.is_empty()
    }

    /// Record that the head was written to the transport.
    pub fn mark_in_flight(&mut self) {
        self.in_flight = true;
    }

    /// Pop the head after its terminating response arrived. Resets the
    /// consecutive-timeout count.
    pub fn complete_head(&mut self) -> Option<PendingCommand> {
        self.consecutive_timeouts = 0;
        self.in_flight = false;
        self.items.pop_front()
    }

    /// Drop the head after its deadline expired. Returns the dropped
    /// command and the updated consecutive-timeout count; at
    /// [`MAX_CONSECUTIVE_TIMEOUTS`] the caller must give the transport up.
    pub fn timeout_head(&mut self) -> Option<(PendingCommand, u32)> {
        let head = self.items.pop_front()?;
        self.in_flight = false;
        self.consecutive_timeouts += 1;
        Some((head, self.consecutive_timeouts))
    }

    /// Number of queued commands, in-flight one included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(5);

    #[test]
    fn push_reports_new_head() {
        let mut q = CommandQueue::new();
        assert!(q.push("AT+CSQ".into(), T));
        assert!(!q.push("AT+CREG?".into(), T));
        assert_eq!(q.head().unwrap().line, "AT+CSQ");
    }

    #[test]
    fn contains_is_verbatim() {
        let mut q = CommandQueue::new();
        q.push("GET_NETWORK 7 disabled".into(), T);
        assert!(q.contains("GET_NETWORK 7 disabled"));
        assert!(!q.contains("GET_NETWORK 7"));
    }

    #[test]
    fn in_flight_tracks_head_lifecycle() {
        let mut q = CommandQueue::new();
        q.push("STATUS".into(), T);
        assert!(!q.is_in_flight());
        q.mark_in_flight();
        assert!(q.is_in_flight());
        q.complete_head();
        assert!(!q.is_in_flight());
        assert!(q.is_empty());
    }

    #[test]
    fn complete_resets_timeout_count() {
        let mut q = CommandQueue::new();
        for _ in 0..3 {
            q.push("AT".into(), T);
        }
        assert_eq!(q.timeout_head().unwrap().1, 1);
        assert_eq!(q.timeout_head().unwrap().1, 2);
        q.push("AT".into(), T);
        q.complete_head();
        q.push("AT".into(), T);
        assert_eq!(q.timeout_head().unwrap().1, 1);
    }

    #[test]
    fn five_consecutive_timeouts_reach_the_budget() {
        let mut q = CommandQueue::new();
        let mut last = 0;
        for _ in 0..MAX_CONSECUTIVE_TIMEOUTS {
            q.push("AT".into(), T);
            last = q.timeout_head().unwrap().1;
        }
        assert_eq!(last, MAX_CONSECUTIVE_TIMEOUTS);
    }
}
