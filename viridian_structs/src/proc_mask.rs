// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structures for working with processor masks.

use viridian_defs::hypercall::HV_GENERIC_SET_ALL;
use viridian_defs::hypercall::HV_GENERIC_SET_SPARSE_4K;

/// A set of processor IDs, stored as a sparse array of 64-bit masks.
///
/// The trailing mask count must equal the population count of the validity
/// mask; construction fails otherwise.
#[derive(Copy, Clone, Debug)]
pub struct ProcessorSet<'a> {
    valid_masks: u64,
    masks: &'a [u64],
}

impl<'a> ProcessorSet<'a> {
    /// Attempts to create a ProcessorSet from a set of processor masks.
    pub fn from_processor_masks(valid_masks: u64, masks: &'a [u64]) -> Option<Self> {
        let mask_count = valid_masks.count_ones();
        if masks.len() != mask_count as usize {
            return None;
        }
        Some(Self { valid_masks, masks })
    }

    /// Returns the set as an iterator of u64s, suitable for collecting and
    /// using as a raw sparse-4K generic set in a hypercall.
    pub fn as_generic_set(&self) -> impl Iterator<Item = u64> + use<'_> {
        core::iter::once(self.valid_masks).chain(self.masks.iter().copied())
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.valid_masks == 0 || self.count() == 0
    }

    /// Returns the number of processors in the set.
    pub fn count(&self) -> usize {
        self.masks.iter().map(|x| x.count_ones() as usize).sum()
    }

    /// Returns an iterator over the processor IDs in the set.
    pub fn iter(&self) -> ProcessorSetIter<'a> {
        self.into_iter()
    }
}

impl<'a> IntoIterator for ProcessorSet<'a> {
    type Item = u32;
    type IntoIter = ProcessorSetIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        ProcessorSetIter {
            bit: 0,
            mask: 0,
            remaining_valid: self.valid_masks,
            masks: self.masks,
        }
    }
}

/// An iterator over the processor IDs in a ProcessorSet.
pub struct ProcessorSetIter<'a> {
    bit: u32,
    mask: u64,
    remaining_valid: u64,
    masks: &'a [u64],
}

impl Iterator for ProcessorSetIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while self.mask == 0 {
            self.mask = *self.masks.first()?;
            self.masks = &self.masks[1..];
            self.bit = self.remaining_valid.trailing_zeros();
            self.remaining_valid &= !(1 << self.bit);
        }
        let proc = self.mask.trailing_zeros();
        self.mask &= !(1 << proc);
        Some(self.bit * 64 + proc)
    }
}

impl std::iter::FusedIterator for ProcessorSetIter<'_> {}

/// A decoded generic VP set: either every processor in the partition or a
/// sparse set of banks.
#[derive(Copy, Clone, Debug)]
pub enum GenericSet<'a> {
    /// The all-processors format; no trailing content words.
    All,
    /// The sparse-4K bank format.
    Sparse(ProcessorSet<'a>),
}

impl<'a> GenericSet<'a> {
    /// Attempts to decode a generic set from its format word and trailing
    /// content words.
    pub fn from_generic_set(format: u64, rest: &'a [u64]) -> Option<Self> {
        match format {
            HV_GENERIC_SET_ALL => rest.is_empty().then_some(Self::All),
            HV_GENERIC_SET_SPARSE_4K => {
                let &[valid_masks, ref masks @ ..] = rest else {
                    return None;
                };
                Some(Self::Sparse(ProcessorSet::from_processor_masks(
                    valid_masks,
                    masks,
                )?))
            }
            _ => None,
        }
    }

    /// Returns the sparse processor list, or `None` for the all-processors
    /// format.
    pub fn sparse(&self) -> Option<ProcessorSet<'a>> {
        match *self {
            GenericSet::All => None,
            GenericSet::Sparse(set) => Some(set),
        }
    }
}
