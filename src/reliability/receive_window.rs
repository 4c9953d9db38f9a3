use std::collections::BTreeMap;
use crate::util::safe_converter::PrecheckedCast;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    /// already delivered or already buffered
    Duplicate,
    /// delivered, together with the given total number of messages (including this one)
    Delivered(usize),
    Held,
    Overflow,
}

/// Reorders sequenced messages from one peer.
///
/// `cont_seq` is the highest sequence number up to which everything was delivered. Messages
///  within `(cont_seq, cont_seq + hold_size]` are buffered in a fixed ring indexed by
///  `seq % hold_size`, messages further ahead go to an ordered overflow map. Whenever the gap
///  at `cont_seq + 1` closes, delivery proceeds through the ring, pulling overflow entries that
///  moved into the window along.
pub struct ReceiveWindow<T> {
    cont_seq: i64,
    hold: Vec<Option<(i64, T)>>,
    num_held: usize,
    overflow: BTreeMap<i64, T>,
}

impl<T> ReceiveWindow<T> {
    pub fn new(hold_size: usize) -> ReceiveWindow<T> {
        let mut hold = Vec::with_capacity(hold_size);
        hold.resize_with(hold_size, || None);

        ReceiveWindow {
            cont_seq: 0,
            hold,
            num_held: 0,
            overflow: BTreeMap::default(),
        }
    }

    pub fn cont_seq(&self) -> i64 {
        self.cont_seq
    }

    /// true if there are buffered messages waiting for a gap to be filled
    pub fn has_gap(&self) -> bool {
        self.num_held > 0 || !self.overflow.is_empty()
    }

    pub fn num_buffered(&self) -> usize {
        self.num_held + self.overflow.len()
    }

    /// Discards everything buffered and starts over with sequence number 1
    pub fn reset(&mut self) {
        for slot in self.hold.iter_mut() {
            *slot = None;
        }
        self.num_held = 0;
        self.overflow.clear();
        self.cont_seq = 0;
    }

    fn window_size(&self) -> i64 {
        self.hold.len() as i64
    }

    fn slot(&self, seq: i64) -> usize {
        seq.prechecked_cast() % self.hold.len()
    }

    /// Accepts a message, calling `deliver` for every message that becomes deliverable in
    ///  sequence order
    pub fn receive(&mut self, seq: i64, item: T, mut deliver: impl FnMut(i64, T)) -> Placement {
        if seq <= self.cont_seq {
            return Placement::Duplicate;
        }

        if seq > self.cont_seq + self.window_size() {
            if self.overflow.contains_key(&seq) {
                return Placement::Duplicate;
            }
            self.overflow.insert(seq, item);
            return Placement::Overflow;
        }

        if seq == self.cont_seq + 1 {
            deliver(seq, item);
            self.cont_seq = seq;
            let num_drained = self.drain(&mut deliver);
            return Placement::Delivered(1 + num_drained);
        }

        let slot = self.slot(seq);
        if self.hold[slot].is_some() {
            return Placement::Duplicate;
        }
        self.hold[slot] = Some((seq, item));
        self.num_held += 1;
        Placement::Held
    }

    fn drain(&mut self, deliver: &mut impl FnMut(i64, T)) -> usize {
        let mut num_delivered = 0;
        loop {
            let next = self.cont_seq + 1;
            let slot = self.slot(next);
            match self.hold[slot].take() {
                Some((seq, item)) if seq == next => {
                    self.num_held -= 1;
                    deliver(seq, item);
                    self.cont_seq = seq;
                    num_delivered += 1;
                }
                other => {
                    self.hold[slot] = other;
                    if !self.pull_overflow() {
                        return num_delivered;
                    }
                }
            }
        }
    }

    /// moves overflow entries that are now within the window into the ring. Returns true if
    ///  the message following `cont_seq` is now in the ring.
    fn pull_overflow(&mut self) -> bool {
        let limit = self.cont_seq + self.window_size();
        while let Some(entry) = self.overflow.first_entry() {
            let seq = *entry.key();
            if seq > limit {
                break;
            }
            let item = entry.remove();
            if seq <= self.cont_seq {
                continue;
            }

            let slot = self.slot(seq);
            if self.hold[slot].is_none() {
                self.hold[slot] = Some((seq, item));
                self.num_held += 1;
            }
        }

        let next = self.cont_seq + 1;
        matches!(&self.hold[self.slot(next)], Some((seq, _)) if *seq == next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn feed(window: &mut ReceiveWindow<i64>, seqs: &[i64]) -> Vec<i64> {
        let mut delivered = Vec::new();
        for &seq in seqs {
            window.receive(seq, seq * 10, |s, item| {
                assert_eq!(item, s * 10);
                delivered.push(s);
            });
        }
        delivered
    }

    #[rstest]
    #[case::in_order(4, vec![1, 2, 3, 4, 5], vec![1, 2, 3, 4, 5])]
    #[case::swapped(4, vec![2, 1, 3], vec![1, 2, 3])]
    #[case::reversed(8, vec![5, 4, 3, 2, 1], vec![1, 2, 3, 4, 5])]
    #[case::duplicates(4, vec![1, 1, 3, 3, 2, 2, 1], vec![1, 2, 3])]
    #[case::overflow(2, vec![5, 4, 3, 2, 1], vec![1, 2, 3, 4, 5])]
    #[case::overflow_duplicates(2, vec![6, 6, 5, 4, 6, 3, 2, 1, 5], vec![1, 2, 3, 4, 5, 6])]
    #[case::gap_remains(4, vec![1, 3, 4], vec![1])]
    #[case::hold_size_one(1, vec![3, 2, 1, 4], vec![1, 2, 3, 4])]
    fn test_receive(#[case] hold_size: usize, #[case] seqs: Vec<i64>, #[case] expected: Vec<i64>) {
        let mut window = ReceiveWindow::new(hold_size);
        assert_eq!(feed(&mut window, &seqs), expected);
        assert_eq!(window.cont_seq(), *expected.last().unwrap());
    }

    #[test]
    fn test_placement() {
        let mut window = ReceiveWindow::new(4);
        assert_eq!(window.receive(3, 0, |_, _| {}), Placement::Held);
        assert_eq!(window.receive(3, 0, |_, _| {}), Placement::Duplicate);
        assert_eq!(window.receive(9, 0, |_, _| {}), Placement::Overflow);
        assert_eq!(window.receive(9, 0, |_, _| {}), Placement::Duplicate);
        assert!(window.has_gap());
        assert_eq!(window.num_buffered(), 2);

        assert_eq!(window.receive(1, 0, |_, _| {}), Placement::Delivered(1));
        assert_eq!(window.receive(2, 0, |_, _| {}), Placement::Delivered(2));
        assert_eq!(window.receive(2, 0, |_, _| {}), Placement::Duplicate);
        assert_eq!(window.cont_seq(), 3);
        assert_eq!(window.num_buffered(), 1);
    }

    #[test]
    fn test_overflow_moves_into_window() {
        let mut window = ReceiveWindow::new(4);
        // 6, 7 and 8 start out beyond the window and move into the ring as the gap closes
        assert_eq!(feed(&mut window, &[7, 8, 1]), vec![1]);
        assert_eq!(feed(&mut window, &[6]), Vec::<i64>::new());
        assert_eq!(feed(&mut window, &[3, 2]), vec![2, 3]);
        assert_eq!(feed(&mut window, &[5, 4]), vec![4, 5, 6, 7, 8]);
        assert!(!window.has_gap());
    }

    #[test]
    fn test_reset() {
        let mut window = ReceiveWindow::new(4);
        feed(&mut window, &[1, 2, 4, 10]);
        window.reset();
        assert_eq!(window.cont_seq(), 0);
        assert!(!window.has_gap());
        assert_eq!(feed(&mut window, &[1]), vec![1]);
    }

    #[test]
    fn test_swapped_pair_in_long_stream() {
        let mut seqs: Vec<i64> = (1..=1000).collect();
        seqs.swap(499, 500);
        assert_eq!(seqs[499], 501);

        let mut window = ReceiveWindow::new(4096);
        let delivered = feed(&mut window, &seqs);
        assert_eq!(delivered, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_every_seq_delivered_exactly_once() {
        // deterministic shuffle with duplicates: each seq appears twice, spread over the stream
        let n = 500i64;
        let mut seqs = Vec::new();
        for i in 0..n {
            seqs.push((i * 37) % n + 1);
        }
        for i in 0..n {
            seqs.push((i * 101) % n + 1);
        }

        for hold_size in [1, 7, 64, 1024] {
            let mut window = ReceiveWindow::new(hold_size);
            let delivered = feed(&mut window, &seqs);
            assert_eq!(delivered, (1..=n).collect::<Vec<_>>(), "hold size {}", hold_size);
            assert!(!window.has_gap());
        }
    }
}
