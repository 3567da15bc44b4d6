// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-capacity storage of the analysed lowres frames.
//!
//! Frames refer to their references through [`FrameRef`] indices rather than pointers. A
//! reference carries the generation of its slot, so a reference to an evicted frame never
//! resolves to the frame that took its slot.

use crate::lookahead::cost::LowresFrame;
use crate::lookahead::LookaheadError;

/// Index of a frame in a [`FrameArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameRef {
    slot: u32,
    generation: u32,
}

impl FrameRef {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    frame: Option<LowresFrame>,
}

pub struct FrameArena {
    slots: Vec<Slot>,
    /// Next slot to try, so that slots are reused in a ring.
    cursor: usize,
    len: usize,
}

impl FrameArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| Slot::default()).collect(),
            cursor: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, frame: LowresFrame) -> Result<FrameRef, LookaheadError> {
        let capacity = self.slots.len();
        let slot = (0..capacity)
            .map(|i| (self.cursor + i) % capacity)
            .find(|i| self.slots[*i].frame.is_none())
            .ok_or(LookaheadError::ArenaFull(capacity))?;

        let entry = &mut self.slots[slot];
        entry.generation = entry.generation.wrapping_add(1);
        entry.frame = Some(frame);
        self.cursor = (slot + 1) % capacity;
        self.len += 1;

        Ok(FrameRef::new(slot as u32, entry.generation))
    }

    pub fn get(&self, frame: FrameRef) -> Option<&LowresFrame> {
        self.slots
            .get(frame.slot as usize)
            .filter(|s| s.generation == frame.generation)
            .and_then(|s| s.frame.as_ref())
    }

    pub fn contains(&self, frame: FrameRef) -> bool {
        self.get(frame).is_some()
    }

    /// Looks up a resident frame by its frame number.
    pub fn find(&self, frame_num: u64) -> Option<FrameRef> {
        self.slots.iter().enumerate().find_map(|(slot, s)| {
            s.frame
                .as_ref()
                .filter(|f| f.info().frame_num == frame_num)
                .map(|_| FrameRef::new(slot as u32, s.generation))
        })
    }

    pub fn remove(&mut self, frame: FrameRef) -> Option<LowresFrame> {
        let entry = self
            .slots
            .get_mut(frame.slot as usize)
            .filter(|s| s.generation == frame.generation)?;
        let removed = entry.frame.take();
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.frame = None;
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::encoder::Picture;
    use crate::gop::SliceType;
    use crate::lookahead::cost::FrameInfo;
    use crate::lookahead::cost::LowresPlane;
    use crate::Resolution;

    fn frame(frame_num: u64) -> LowresFrame {
        let resolution = Resolution::from((16, 16));
        let picture = Picture::new(resolution, vec![0u8; 256]);
        let plane = LowresPlane::from_picture(&picture, resolution).unwrap();
        let info = FrameInfo {
            frame_num,
            poc: frame_num,
            coding_idx: frame_num,
            slice_type: SliceType::I,
            gop_size: 1,
            temporal_id: 0,
        };
        LowresFrame::analyse(info, Arc::new(plane), None, None, 0)
    }

    #[test]
    fn insert_find_remove() {
        let mut arena = FrameArena::new(2);
        let a = arena.insert(frame(0)).unwrap();
        let b = arena.insert(frame(1)).unwrap();
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.insert(frame(2)).unwrap_err(), LookaheadError::ArenaFull(2));

        assert_eq!(arena.find(1), Some(b));
        assert_eq!(arena.get(a).unwrap().info().frame_num, 0);

        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.find(0), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_reference_does_not_resolve() {
        let mut arena = FrameArena::new(1);
        let old = arena.insert(frame(0)).unwrap();
        arena.remove(old);
        let new = arena.insert(frame(1)).unwrap();

        assert_ne!(old, new);
        assert!(!arena.contains(old));
        assert!(arena.remove(old).is_none());
        assert_eq!(arena.get(new).unwrap().info().frame_num, 1);
    }

    #[test]
    fn slots_are_reused_in_a_ring() {
        let mut arena = FrameArena::new(3);
        let refs = (0..3)
            .map(|n| arena.insert(frame(n)).unwrap())
            .collect::<Vec<_>>();
        arena.remove(refs[0]);
        arena.remove(refs[1]);

        // The cursor moved past the last slot, so the first free slot is reused first.
        let next = arena.insert(frame(3)).unwrap();
        assert_eq!(next.slot, 0);
        let next = arena.insert(frame(4)).unwrap();
        assert_eq!(next.slot, 1);

        arena.clear();
        assert!(arena.is_empty());
    }
}
