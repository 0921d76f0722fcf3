//! Ack window
//!
//! Small coalescer shared by both directions: the receive side batches
//! outgoing receipts behind the compress timeout, the send side folds
//! incoming receipts before applying them. One cumulative head plus a
//! map of selective receipts beyond it.

use std::collections::HashMap;

use trellis_core::Id;

/// One receipt position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEntry {
    /// Acked message
    pub message_id: Id,
    /// Its sequence number
    pub sequence_number: u64,
}

/// Receipt fed into the window
#[derive(Debug, Clone, Copy)]
pub struct AckUpdate {
    /// Acked message
    pub message_id: Id,
    /// Its sequence number
    pub sequence_number: u64,
    /// Selective: does not imply earlier receipt
    pub selective: bool,
}

/// Result of draining the window
#[derive(Debug, Clone, Default)]
pub struct AckSnapshot {
    /// Cumulative receipt covering all earlier sequence numbers
    pub head: Option<AckEntry>,
    /// Selective receipts strictly beyond the head
    pub selective: Vec<AckEntry>,
    /// Updates folded in since the last reset
    pub update_count: u64,
}

/// Coalescer for cumulative and selective receipts
#[derive(Debug, Default)]
pub struct AckWindow {
    head: Option<AckEntry>,
    selective: HashMap<Id, u64>,
    update_count: u64,
}

impl AckWindow {
    /// Create an empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing has been recorded since the last reset
    pub fn is_empty(&self) -> bool {
        self.update_count == 0
    }

    /// Fold one receipt into the window
    ///
    /// A stale receipt (at or below the head) still counts as an update
    /// so the head gets re-emitted for sender liveness.
    pub fn update(&mut self, ack: AckUpdate) {
        self.update_count += 1;

        let beyond_head = match self.head {
            Some(head) => ack.sequence_number > head.sequence_number,
            None => true,
        };
        if !beyond_head {
            return;
        }

        if ack.selective {
            self.selective.insert(ack.message_id, ack.sequence_number);
        } else {
            self.head = Some(AckEntry {
                message_id: ack.message_id,
                sequence_number: ack.sequence_number,
            });
        }
    }

    /// Drain the window
    ///
    /// Selective entries at or below the head are dropped here, lazily.
    /// With `reset` the update counter clears and selective entries are
    /// consumed; the head is retained for stale-ack re-emission.
    pub fn snapshot(&mut self, reset: bool) -> AckSnapshot {
        let head = self.head;
        let head_sequence = head.map(|h| h.sequence_number).unwrap_or(0);

        let mut selective: Vec<AckEntry> = self
            .selective
            .iter()
            .filter(|(_, sequence_number)| **sequence_number > head_sequence)
            .map(|(message_id, sequence_number)| AckEntry {
                message_id: *message_id,
                sequence_number: *sequence_number,
            })
            .collect();
        selective.sort_by_key(|entry| entry.sequence_number);

        let snapshot = AckSnapshot {
            head,
            selective,
            update_count: self.update_count,
        };

        if reset {
            self.update_count = 0;
            self.selective
                .retain(|_, sequence_number| *sequence_number > head_sequence);
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(sequence_number: u64, selective: bool) -> AckUpdate {
        AckUpdate {
            message_id: Id::new(),
            sequence_number,
            selective,
        }
    }

    #[test]
    fn test_head_advances() {
        let mut window = AckWindow::new();
        window.update(ack(1, false));
        window.update(ack(3, false));

        let snapshot = window.snapshot(true);
        assert_eq!(snapshot.head.unwrap().sequence_number, 3);
        assert_eq!(snapshot.update_count, 2);

        // Reset clears the counter but keeps the head.
        let snapshot = window.snapshot(false);
        assert_eq!(snapshot.head.unwrap().sequence_number, 3);
        assert_eq!(snapshot.update_count, 0);
    }

    #[test]
    fn test_selective_beyond_head_kept() {
        let mut window = AckWindow::new();
        window.update(ack(2, false));
        window.update(ack(5, true));
        window.update(ack(7, true));

        let snapshot = window.snapshot(true);
        assert_eq!(snapshot.head.unwrap().sequence_number, 2);
        let positions: Vec<u64> = snapshot
            .selective
            .iter()
            .map(|entry| entry.sequence_number)
            .collect();
        assert_eq!(positions, vec![5, 7]);
    }

    #[test]
    fn test_selective_below_head_dropped_lazily() {
        let mut window = AckWindow::new();
        window.update(ack(5, true));
        window.update(ack(6, false));

        let snapshot = window.snapshot(true);
        assert_eq!(snapshot.head.unwrap().sequence_number, 6);
        assert!(snapshot.selective.is_empty());
    }

    #[test]
    fn test_stale_ack_still_bumps_counter() {
        let mut window = AckWindow::new();
        window.update(ack(4, false));
        window.snapshot(true);
        assert!(window.is_empty());

        // Duplicate at the head: no state change but the counter moves,
        // which triggers a head re-emission.
        window.update(ack(4, false));
        assert!(!window.is_empty());
        let snapshot = window.snapshot(true);
        assert_eq!(snapshot.head.unwrap().sequence_number, 4);
        assert_eq!(snapshot.update_count, 1);
    }

    #[test]
    fn test_head_never_regresses() {
        let mut window = AckWindow::new();
        window.update(ack(9, false));
        window.update(ack(3, false));

        let snapshot = window.snapshot(true);
        assert_eq!(snapshot.head.unwrap().sequence_number, 9);
    }
}
