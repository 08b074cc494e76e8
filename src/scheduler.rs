/*
    iop_core
    https://github.com/dbalsom/iop_core

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    scheduler.rs

    Nanosecond-resolution event scheduler.

    Devices never block the host thread; anything that takes non-zero time in
    hardware is expressed as a scheduled event carrying a lightweight device
    context token. The enclosing emulator advances the clock and drains due
    events back into the owning device, which matches the token against its
    current command state before acting.
*/

#![allow(dead_code)]

use std::{cmp::Ordering, collections::BinaryHeap};

use crate::devices::fdc::FdcEvent;

/// Context token routed back to the scheduling device when an event fires.
#[derive(Copy, Clone, Debug)]
pub enum DeviceContext {
    Fdc(FdcEvent),
}

#[derive(Copy, Clone, Debug)]
struct ScheduledEvent {
    due_ns: u64,
    order: u64,
    context: DeviceContext,
}

// BinaryHeap is a max-heap; invert the comparison so the earliest due time
// pops first, with insertion order breaking ties to keep equal-time events
// FIFO.
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_ns
            .cmp(&self.due_ns)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due_ns == other.due_ns && self.order == other.order
    }
}

impl Eq for ScheduledEvent {}

pub struct EventScheduler {
    now_ns: u64,
    next_order: u64,
    queue: BinaryHeap<ScheduledEvent>,
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self {
            now_ns: 0,
            next_order: 0,
            queue: BinaryHeap::new(),
        }
    }
}

impl EventScheduler {
    pub fn new() -> Self {
        Default::default()
    }

    /// The current emulated timestamp.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Schedule `context` to fire `delay_ns` from the current timestamp.
    pub fn schedule(&mut self, delay_ns: u64, context: DeviceContext) {
        let due_ns = self.now_ns.saturating_add(delay_ns);
        let order = self.next_order;
        self.next_order += 1;

        self.queue.push(ScheduledEvent { due_ns, order, context });
    }

    /// Advance the emulated clock. Events are not dispatched here; the host
    /// drains them with pop_due() so that each callback runs with exclusive
    /// access to its device.
    #[inline]
    pub fn advance(&mut self, delta_ns: u64) {
        self.now_ns = self.now_ns.saturating_add(delta_ns);
    }

    /// Timestamp of the next pending event, if any.
    pub fn next_due_ns(&self) -> Option<u64> {
        self.queue.peek().map(|ev| ev.due_ns)
    }

    /// Pop the next event whose due time has been reached, returning its
    /// scheduled timestamp and context. Events fire in monotonic scheduled
    /// order.
    pub fn pop_due(&mut self) -> Option<(u64, DeviceContext)> {
        match self.queue.peek() {
            Some(ev) if ev.due_ns <= self.now_ns => {
                let ev = self.queue.pop().unwrap();
                Some((ev.due_ns, ev.context))
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::fdc::{FdcEvent, FdcEventKind};

    fn token(kind: FdcEventKind) -> DeviceContext {
        DeviceContext::Fdc(FdcEvent { seq: 0, kind })
    }

    #[test]
    fn events_fire_in_scheduled_order() {
        let mut scheduler = EventScheduler::new();
        scheduler.schedule(3_000, token(FdcEventKind::StepTick));
        scheduler.schedule(1_000, token(FdcEventKind::TransferEntry));
        scheduler.schedule(2_000, token(FdcEventKind::IndexResetExpiry));

        scheduler.advance(10_000);

        let times: Vec<u64> = std::iter::from_fn(|| scheduler.pop_due().map(|(t, _)| t)).collect();
        assert_eq!(times, vec![1_000, 2_000, 3_000]);
    }

    #[test]
    fn equal_timestamps_pop_fifo() {
        let mut scheduler = EventScheduler::new();
        scheduler.schedule(500, token(FdcEventKind::StepTick));
        scheduler.schedule(500, token(FdcEventKind::TransferEntry));
        scheduler.advance(500);

        let (_, first) = scheduler.pop_due().unwrap();
        let (_, second) = scheduler.pop_due().unwrap();

        assert!(matches!(
            first,
            DeviceContext::Fdc(FdcEvent {
                kind: FdcEventKind::StepTick,
                ..
            })
        ));
        assert!(matches!(
            second,
            DeviceContext::Fdc(FdcEvent {
                kind: FdcEventKind::TransferEntry,
                ..
            })
        ));
    }

    #[test]
    fn future_events_do_not_fire_early() {
        let mut scheduler = EventScheduler::new();
        scheduler.schedule(1_000_000, token(FdcEventKind::WriteTrackIndex));

        scheduler.advance(999_999);
        assert!(scheduler.pop_due().is_none());

        scheduler.advance(1);
        assert!(scheduler.pop_due().is_some());
        assert!(scheduler.is_empty());
    }
}
