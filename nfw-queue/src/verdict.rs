//! Answers queued packets.

use nfw_transport::{QueueHandle, QueueSession};
use nfw_wire::{Packet, Verdict};
use tracing::debug;

use crate::QueueError;

/// Issues `verdict` for `packet`. A packet without a header has no id; it is answered as packet
/// 0 rather than left without a verdict.
pub fn issue<S>(
    session: &mut S,
    queue: &QueueHandle,
    packet: &Packet,
    verdict: Verdict,
) -> Result<(), QueueError>
where
    S: QueueSession + ?Sized,
{
    let id = packet.id().unwrap_or_else(|| {
        debug!(queue = queue.number(), "packet without header, answering id 0");
        0
    });

    session.set_verdict(queue, id, verdict).map_err(|source| QueueError::Verdict {
        queue: queue.number(),
        id,
        source,
    })
}

/// Lets `packet` through.
pub fn accept<S>(session: &mut S, queue: &QueueHandle, packet: &Packet) -> Result<(), QueueError>
where
    S: QueueSession + ?Sized,
{
    issue(session, queue, packet, Verdict::Accept)
}

/// Discards `packet`.
pub fn drop<S>(session: &mut S, queue: &QueueHandle, packet: &Packet) -> Result<(), QueueError>
where
    S: QueueSession + ?Sized,
{
    issue(session, queue, packet, Verdict::Drop)
}
