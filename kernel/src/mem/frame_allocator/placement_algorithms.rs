//! Frame placement policies for the raw page allocator.

use super::CoreMapEntry;

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Default + Send {
    /// Returns the number of a free frame to allocate, or `None` if every
    /// frame is in use.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize>;
}

/// Resume the search where the last one stopped, so frames are handed out
/// round robin instead of always reusing the lowest free one.
#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        let total_frames = core_map.len();
        if total_frames == 0 {
            return None;
        }

        let start = self.position % total_frames;
        let frame = (start..total_frames)
            .chain(0..start)
            .find(|&i| !core_map[i].allocated())?;
        self.position = (frame + 1) % total_frames;
        Some(frame)
    }
}
