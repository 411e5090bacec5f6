/// Read-receipt bookkeeping
use crate::directory::ConversationDirectory;
use std::collections::HashSet;
use tracing::debug;

/// Decides when a conversation needs a read receipt and coalesces duplicates
#[derive(Debug, Default)]
pub struct ReadReceipts {
    in_flight: HashSet<String>,
    receipts_sent: u64,
    messages_marked: u64,
}

impl ReadReceipts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unread messages from `other` and no receipt already pending
    pub fn needs_receipt(&self, directory: &ConversationDirectory, other: &str) -> bool {
        directory.unread_for(other) > 0 && !self.in_flight.contains(other)
    }

    /// Claim the receipt for `other`. False if one is already in flight.
    pub fn begin(&mut self, other: &str) -> bool {
        let fresh = self.in_flight.insert(other.to_string());
        if !fresh {
            debug!("Read receipt for {} already in flight", other);
        }
        fresh
    }

    /// Release the claim; `marked` is how many local messages flipped to read
    pub fn finish(&mut self, other: &str, marked: Option<usize>) {
        self.in_flight.remove(other);
        if let Some(marked) = marked {
            self.receipts_sent += 1;
            self.messages_marked += marked as u64;
        }
    }

    pub fn is_in_flight(&self, other: &str) -> bool {
        self.in_flight.contains(other)
    }

    pub fn receipts_sent(&self) -> u64 {
        self.receipts_sent
    }

    pub fn messages_marked(&self) -> u64 {
        self.messages_marked
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}
