use crate::{engine::RuleSet, Verdict};

/// Classification capability attached to a queue: turns the raw bytes of one queued packet
/// (network header first, possibly empty when the copy mode carries no payload) into a verdict.
///
/// Handlers run on the queue worker thread, one packet at a time.
pub trait PacketHandler: Send + Sync + 'static {
    fn classify_and_verdict(&self, packet: &[u8]) -> Verdict;
}

impl PacketHandler for RuleSet {
    fn classify_and_verdict(&self, packet: &[u8]) -> Verdict {
        self.classify(packet).into()
    }
}

impl<F> PacketHandler for F
where
    F: Fn(&[u8]) -> Verdict + Send + Sync + 'static,
{
    fn classify_and_verdict(&self, packet: &[u8]) -> Verdict {
        self(packet)
    }
}
