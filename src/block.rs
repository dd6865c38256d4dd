//! In-memory payload shapes carried by the circular buffers (spec.md
//! section 3, "Input block"). These are distinct from the `raw` module's
//! on-disk/on-wire layouts: a `FaBlock` is what the frame source hands to
//! the FA circular buffer, row-major over `(row, id)`.

use raw::{DecimatedSample, Frame};

/// One `input_block_size`-worth of rows, row-major: frame at
/// `(row, id)` lives at `frames[row * fa_entry_count + id]`.
#[derive(Clone, Debug, Default)]
pub struct FaBlock {
    pub frames: Vec<Frame>,
    pub fa_entry_count: usize,
}

impl FaBlock {
    pub fn new(fa_entry_count: usize, row_count: usize) -> Self {
        FaBlock {
            frames: vec![Frame::ZERO; fa_entry_count * row_count],
            fa_entry_count,
        }
    }

    pub fn rows(&self) -> usize {
        if self.fa_entry_count == 0 {
            0
        } else {
            self.frames.len() / self.fa_entry_count
        }
    }

    pub fn row(&self, r: usize) -> &[Frame] {
        let start = r * self.fa_entry_count;
        &self.frames[start..start + self.fa_entry_count]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [Frame] {
        let start = r * self.fa_entry_count;
        &mut self.frames[start..start + self.fa_entry_count]
    }

    pub fn id_at(&self, r: usize, id: usize) -> Frame {
        self.frames[r * self.fa_entry_count + id]
    }
}

/// One decimated tick across a fixed set of ids, used by the decimator's
/// live buffer (spec.md section 4.5) and by subscribers of `D` streams.
#[derive(Clone, Debug, Default)]
pub struct DecimatedBlock {
    pub samples: Vec<DecimatedSample>,
    pub entry_count: usize,
}

impl DecimatedBlock {
    pub fn new(entry_count: usize) -> Self {
        DecimatedBlock {
            samples: vec![DecimatedSample::default(); entry_count],
            entry_count,
        }
    }
}
