use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bitset::FiniteBitSet;
use crate::file::{FileId, FileInfo};

/// Names a single piece of a single file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceSpec {
    pub info: FileInfo,
    pub index: u32,
}

impl PieceSpec {
    pub fn new(info: FileInfo, index: u32) -> Self {
        assert!(info.valid_index(index), "piece index out of range");
        Self { info, index }
    }

    pub fn id(&self) -> (FileId, u32) {
        (self.info.id().clone(), self.index)
    }
}

impl fmt::Debug for PieceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceSpec[{:?}#{}]", self.info.id(), self.index)
    }
}

/// Names a set of pieces of one file via a bitmap.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FilePieceSpecs {
    pub info: FileInfo,
    pub bits: FiniteBitSet,
}

impl FilePieceSpecs {
    /// Every piece of the file.
    pub fn whole(info: FileInfo) -> Self {
        let bits = FiniteBitSet::complete(info.piece_count());
        Self { info, bits }
    }

    pub fn single(info: FileInfo, index: u32) -> Self {
        assert!(info.valid_index(index), "piece index out of range");
        let bits = FiniteBitSet::empty(info.piece_count()).set_bit(index);
        Self { info, bits }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.num_set() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        // A bitmap that arrived off the wire may disagree with the piece
        // count; out-of-range indexes are dropped rather than trusted.
        self.bits
            .iter_set()
            .filter(|index| self.info.valid_index(*index))
            .map(move |index| PieceSpec::new(self.info.clone(), index))
    }
}

/// A compact description of "which pieces of which files".
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct PieceSpecSet {
    files: Vec<FilePieceSpecs>,
}

impl PieceSpecSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn whole_file(info: FileInfo) -> Self {
        Self {
            files: vec![FilePieceSpecs::whole(info)],
        }
    }

    pub fn single(spec: PieceSpec) -> Self {
        Self {
            files: vec![FilePieceSpecs::single(spec.info, spec.index)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.iter().all(FilePieceSpecs::is_empty)
    }

    /// Merges more pieces into the set, unioning bitmaps of the same file
    /// version.
    pub fn merge(&mut self, specs: FilePieceSpecs) {
        for existing in &mut self.files {
            if existing.info == specs.info {
                let bits = std::mem::replace(
                    &mut existing.bits,
                    FiniteBitSet::complete(0),
                );
                existing.bits = bits.union(&specs.bits);
                return;
            }
        }
        self.files.push(specs);
    }

    pub fn add(&mut self, spec: PieceSpec) {
        self.merge(FilePieceSpecs::single(spec.info, spec.index));
    }

    pub fn files(&self) -> &[FilePieceSpecs] {
        &self.files
    }

    pub fn iter_pieces(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        self.files.iter().flat_map(FilePieceSpecs::iter)
    }
}

impl From<FilePieceSpecs> for PieceSpecSet {
    fn from(specs: FilePieceSpecs) -> Self {
        Self { files: vec![specs] }
    }
}
