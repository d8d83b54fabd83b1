use super::frame_table::FrameTableEntry;
use super::Frame;
use alloc::collections::BTreeMap;
use core::ops::Bound::{Excluded, Unbounded};

/// What a policy learns when it looks at a candidate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    /// Used since the last look. The probe has already cleared the bit.
    Referenced,
    Unreferenced,
    /// The owner cannot be disturbed right now.
    Busy,
}

pub trait PageReplacementPolicy: Default + Send {
    /// Choose an unpinned frame to evict, or `None` if no frame qualifies.
    fn select_victim(
        &mut self,
        frames: &BTreeMap<Frame, FrameTableEntry>,
        probe: &mut dyn FnMut(&FrameTableEntry) -> Reference,
    ) -> Option<Frame>;
}

/// Second chance: sweep a hand over the frames, clearing accessed bits, and
/// take the first frame found not accessed.
#[derive(Debug, Default)]
pub struct Clock {
    // The last frame examined.
    hand: Option<Frame>,
}

impl Clock {
    fn advance<'a>(
        &mut self,
        frames: &'a BTreeMap<Frame, FrameTableEntry>,
    ) -> Option<&'a FrameTableEntry> {
        let next = match self.hand {
            Some(hand) => frames.range((Excluded(hand), Unbounded)).next(),
            None => None,
        };
        let (&frame, entry) = next.or_else(|| frames.iter().next())?;
        self.hand = Some(frame);
        Some(entry)
    }
}

impl PageReplacementPolicy for Clock {
    fn select_victim(
        &mut self,
        frames: &BTreeMap<Frame, FrameTableEntry>,
        probe: &mut dyn FnMut(&FrameTableEntry) -> Reference,
    ) -> Option<Frame> {
        // Two full sweeps: the first may only clear accessed bits.
        for _ in 0..2 * frames.len() {
            let entry = self.advance(frames)?;
            if entry.is_pinned() {
                continue;
            }

            match probe(entry) {
                Reference::Unreferenced => {
                    log::trace!("clock: victim {:?}", entry.frame);
                    return Some(entry.frame);
                }
                Reference::Referenced => log::trace!("clock: second chance for {:?}", entry.frame),
                Reference::Busy => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;
    use proptest::prelude::*;

    fn entries(pinned: &[bool]) -> BTreeMap<Frame, FrameTableEntry> {
        pinned
            .iter()
            .enumerate()
            .map(|(i, &pinned)| {
                let frame = Frame::new(i);
                let entry = FrameTableEntry {
                    frame,
                    owner: 1,
                    page: i * 0x1000,
                    pins: u32::from(pinned),
                };
                (frame, entry)
            })
            .collect()
    }

    /// A probe over simulated accessed bits, cleared as the hand passes.
    fn bits(accessed: &mut BTreeSet<Frame>) -> impl FnMut(&FrameTableEntry) -> Reference + '_ {
        move |entry: &FrameTableEntry| {
            if accessed.remove(&entry.frame) {
                Reference::Referenced
            } else {
                Reference::Unreferenced
            }
        }
    }

    #[test]
    fn takes_first_unreferenced_frame() {
        let frames = entries(&[false; 4]);
        let mut clock = Clock::default();
        let mut accessed = BTreeSet::from([Frame::new(0), Frame::new(1)]);
        let victim = clock.select_victim(&frames, &mut bits(&mut accessed));
        assert_eq!(victim, Some(Frame::new(2)));
        assert!(accessed.is_empty());
    }

    #[test]
    fn hand_continues_after_last_victim() {
        let frames = entries(&[false; 3]);
        let mut clock = Clock::default();
        let mut accessed = BTreeSet::new();
        assert_eq!(clock.select_victim(&frames, &mut bits(&mut accessed)), Some(Frame::new(0)));
        assert_eq!(clock.select_victim(&frames, &mut bits(&mut accessed)), Some(Frame::new(1)));
        assert_eq!(clock.select_victim(&frames, &mut bits(&mut accessed)), Some(Frame::new(2)));
        assert_eq!(clock.select_victim(&frames, &mut bits(&mut accessed)), Some(Frame::new(0)));
    }

    #[test]
    fn hand_survives_removal_of_victim() {
        let mut frames = entries(&[false; 3]);
        let mut clock = Clock::default();
        let mut accessed = BTreeSet::new();
        let victim = clock.select_victim(&frames, &mut bits(&mut accessed)).unwrap();
        frames.remove(&victim);
        assert_eq!(clock.select_victim(&frames, &mut bits(&mut accessed)), Some(Frame::new(1)));
    }

    #[test]
    fn all_referenced_gets_second_chance() {
        let frames = entries(&[false; 3]);
        let mut clock = Clock::default();
        let mut accessed: BTreeSet<_> = frames.keys().copied().collect();
        assert_eq!(clock.select_victim(&frames, &mut bits(&mut accessed)), Some(Frame::new(0)));
    }

    #[test]
    fn pinned_frames_are_skipped_and_keep_their_bit() {
        let frames = entries(&[true, false, true]);
        let mut clock = Clock::default();
        let mut probed = alloc::vec::Vec::new();
        let victim = clock.select_victim(&frames, &mut |entry| {
            probed.push(entry.frame);
            Reference::Unreferenced
        });
        assert_eq!(victim, Some(Frame::new(1)));
        assert_eq!(probed, [Frame::new(1)]);
    }

    #[test]
    fn gives_up_when_everything_is_pinned_or_busy() {
        let mut clock = Clock::default();
        let pinned = entries(&[true; 4]);
        assert_eq!(clock.select_victim(&pinned, &mut |_| Reference::Unreferenced), None);

        let mut probes = 0;
        let victim = clock.select_victim(&entries(&[false; 4]), &mut |_| {
            probes += 1;
            Reference::Busy
        });
        assert_eq!(victim, None);
        assert_eq!(probes, 8);
    }

    #[test]
    fn empty_table_has_no_victim() {
        let mut clock = Clock::default();
        assert_eq!(clock.select_victim(&BTreeMap::new(), &mut |_| Reference::Unreferenced), None);
    }

    proptest! {
        #[test]
        fn never_selects_a_pinned_frame(
            frames in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..64),
            rounds in 1usize..16,
        ) {
            let pinned: alloc::vec::Vec<bool> =
                frames.iter().map(|&(pinned, _)| pinned).collect();
            let table = entries(&pinned);
            let mut accessed: BTreeSet<Frame> = frames
                .iter()
                .enumerate()
                .filter(|(_, (_, accessed))| *accessed)
                .map(|(i, _)| Frame::new(i))
                .collect();
            let mut clock = Clock::default();

            for _ in 0..rounds {
                match clock.select_victim(&table, &mut bits(&mut accessed)) {
                    Some(victim) => prop_assert!(!table[&victim].is_pinned()),
                    None => prop_assert!(pinned.iter().all(|&p| p)),
                }
            }
        }
    }
}
