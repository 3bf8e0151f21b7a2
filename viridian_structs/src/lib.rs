// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structures shared by the hypercall codec and the SynIC emulator.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod proc_mask;

pub use proc_mask::GenericSet;
pub use proc_mask::ProcessorSet;
pub use proc_mask::ProcessorSetIter;
