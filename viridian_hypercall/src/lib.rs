// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hypercall parsing for the Viridian guest interface.
//!
//! This crate implements the hypercall calling convention defined in the
//! [Hypervisor Top Level Functional Specification][]: the 64-bit control
//! word, fast (register-based) and slow (memory-based) input marshaling, rep
//! hypercall progress reporting, and the input/output formats of each
//! supported call.
//!
//! The codec itself is stateless. The external dispatcher provides the
//! processor's registers through [`HypercallIo`] and, for slow calls, the
//! already-resolved guest input/output page buffers through [`PageBuffers`];
//! resolving guest physical addresses is the memory subsystem's job. You
//! implement the trait corresponding to each hypercall you want to support,
//! instantiate a dispatcher with the [`dispatcher`] macro, and call
//! [`Dispatcher::dispatch`].
//!
//! [Hypervisor Top Level Functional Specification]:
//!     <https://learn.microsoft.com/en-us/virtualization/hyper-v-on-windows/tlfs/tlfs>

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod imp;
mod support;
#[cfg(test)]
mod tests;
mod x86;

pub use self::imp::*;
pub use self::support::AsHandler;
pub use self::support::Dispatcher;
pub use self::support::HvRepResult;
pub use self::support::HypercallDefinition;
pub use self::support::HypercallHandler;
pub use self::support::HypercallIo;
pub use self::support::PageBuffers;
pub use self::x86::X64HypercallRegister;
pub use self::x86::X64RegisterIo;
pub use self::x86::X64RegisterState;
