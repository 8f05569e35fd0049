//! Per-reader delivery order.
//!
//! The bus log is append-ordered across all writers, which is not the order a
//! reader must observe. A reader always sees blocking before normal before fyi,
//! and within one sender at one priority, strict `sender_seq` order.

use std::cmp::Ordering;

use fleetbus_types::envelope::Envelope;

/// Compare two envelopes by `(priority rank, sender, sender_seq)`.
pub fn delivery_order(a: &Envelope, b: &Envelope) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| a.from.cmp(&b.from))
        .then_with(|| a.sender_seq.cmp(&b.sender_seq))
}

/// Sort a batch of envelopes in place into delivery order.
///
/// The sort is stable, so envelopes that compare equal (a sender that reused a
/// sequence number) keep their log order.
pub fn sort_for_delivery(messages: &mut [Envelope]) {
    messages.sort_by(delivery_order);
}
