// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Support for individual hypercalls.

use super::support::HypercallDispatch;
use super::support::HypercallParameters;
use super::support::RepHypercall;
use super::support::SimpleHypercall;
use super::support::VariableHypercall;
use crate::support::HvRepResult;
use crate::support::VariableRepHypercall;
use viridian_defs::HvError;
use viridian_defs::HvResult;
use viridian_defs::HypercallCode;
use viridian_defs::hypercall as defs;
use viridian_defs::hypercall::HypercallOutput;
use viridian_structs::GenericSet;
use zerocopy::IntoBytes;

/// Implements the `HvPostMessage` hypercall.
pub trait PostMessage {
    /// Post a synic message.
    fn post_message(&mut self, connection_id: u32, message: &[u8]) -> HvResult<()>;
}

/// Defines the `HvPostMessage` hypercall.
pub type HvPostMessage =
    SimpleHypercall<defs::PostMessage, (), { HypercallCode::HvCallPostMessage.0 }>;

impl<T: PostMessage> HypercallDispatch<HvPostMessage> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvPostMessage::run(params, |input| {
            self.post_message(
                input.connection_id,
                input
                    .payload
                    .as_bytes()
                    .get(..input.payload_size as usize)
                    .ok_or(HvError::InvalidParameter)?,
            )
        })
    }
}

/// Implements the `HvSignalEvent` hypercall.
pub trait SignalEvent {
    /// Signal synic event.
    fn signal_event(&mut self, connection_id: u32, flag: u16) -> HvResult<()>;
}

/// Defines the `HvSignalEvent` hypercall.
pub type HvSignalEvent =
    SimpleHypercall<defs::SignalEvent, (), { HypercallCode::HvCallSignalEvent.0 }>;

impl<T: SignalEvent> HypercallDispatch<HvSignalEvent> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvSignalEvent::run(params, |input| {
            self.signal_event(input.connection_id, input.flag_number)
        })
    }
}

fn parse_processor_masks(mut valid_masks: u64, masks: &[u64]) -> Option<Vec<u32>> {
    let mut procs = Vec::new();
    while valid_masks != 0 {
        let bank = valid_masks.trailing_zeros();
        valid_masks &= !(1 << bank);
        let mut mask = *masks.get(bank as usize)?;
        while mask != 0 {
            let index = mask.trailing_zeros();
            mask &= !(1 << index);
            procs.push(bank * 64 + index);
        }
    }
    Some(procs)
}

fn parse_generic_set(var_header: &[u64]) -> Option<GenericSet<'_>> {
    let &[format, ref rest @ ..] = var_header else {
        return None;
    };
    GenericSet::from_generic_set(format, rest)
}

/// Implements the `HvFlushVirtualAddressList` hypercall.
pub trait FlushVirtualAddressList {
    /// Invalidates portions of the virtual TLB.
    fn flush_virtual_address_list(
        &mut self,
        processor_set: Vec<u32>,
        flags: defs::HvFlushFlags,
        gva_ranges: &[defs::HvGvaRange],
    ) -> HvRepResult;
}

/// Defines the `HvFlushVirtualAddressList` hypercall.
pub type HvFlushVirtualAddressList = RepHypercall<
    defs::FlushVirtualAddressSpace,
    defs::HvGvaRange,
    (),
    { HypercallCode::HvCallFlushVirtualAddressList.0 },
>;

impl<T: FlushVirtualAddressList> HypercallDispatch<HvFlushVirtualAddressList> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvFlushVirtualAddressList::run(params, |header, input, _output| {
            let processors = parse_processor_masks(1, &[header.processor_mask])
                .ok_or((HvError::InvalidParameter, 0))?;
            self.flush_virtual_address_list(processors, header.flags, input)
        })
    }
}

/// Implements the `HvFlushVirtualAddressListEx` hypercall.
pub trait FlushVirtualAddressListEx {
    /// Invalidates portions of the virtual TLB.
    fn flush_virtual_address_list_ex(
        &mut self,
        processor_set: GenericSet<'_>,
        flags: defs::HvFlushFlags,
        gva_ranges: &[defs::HvGvaRange],
    ) -> HvRepResult;
}

/// Defines the `HvFlushVirtualAddressListEx` hypercall.
pub type HvFlushVirtualAddressListEx = VariableRepHypercall<
    defs::FlushVirtualAddressSpaceEx,
    defs::HvGvaRange,
    (),
    { HypercallCode::HvCallFlushVirtualAddressListEx.0 },
>;

impl<T: FlushVirtualAddressListEx> HypercallDispatch<HvFlushVirtualAddressListEx> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvFlushVirtualAddressListEx::run(params, |header, variable_input, input, _output| {
            let processors =
                parse_generic_set(variable_input).ok_or((HvError::InvalidParameter, 0))?;
            self.flush_virtual_address_list_ex(processors, header.flags, input)
        })
    }
}

/// Implements the `HvFlushVirtualAddressSpace` hypercall.
pub trait FlushVirtualAddressSpace {
    /// Invalidates all virtual TLB entries.
    fn flush_virtual_address_space(
        &mut self,
        processor_set: Vec<u32>,
        flags: defs::HvFlushFlags,
    ) -> HvResult<()>;
}

/// Defines the `HvFlushVirtualAddressSpace` hypercall.
pub type HvFlushVirtualAddressSpace = SimpleHypercall<
    defs::FlushVirtualAddressSpace,
    (),
    { HypercallCode::HvCallFlushVirtualAddressSpace.0 },
>;

impl<T: FlushVirtualAddressSpace> HypercallDispatch<HvFlushVirtualAddressSpace> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvFlushVirtualAddressSpace::run(params, |input| {
            let processors = parse_processor_masks(1, &[input.processor_mask])
                .ok_or(HvError::InvalidParameter)?;
            self.flush_virtual_address_space(processors, input.flags)
        })
    }
}

/// Implements the `HvFlushVirtualAddressSpaceEx` hypercall.
pub trait FlushVirtualAddressSpaceEx {
    /// Invalidates all virtual TLB entries.
    fn flush_virtual_address_space_ex(
        &mut self,
        processor_set: GenericSet<'_>,
        flags: defs::HvFlushFlags,
    ) -> HvResult<()>;
}

/// Defines the `HvFlushVirtualAddressSpaceEx` hypercall.
pub type HvFlushVirtualAddressSpaceEx = VariableHypercall<
    defs::FlushVirtualAddressSpaceEx,
    (),
    { HypercallCode::HvCallFlushVirtualAddressSpaceEx.0 },
>;

impl<T: FlushVirtualAddressSpaceEx> HypercallDispatch<HvFlushVirtualAddressSpaceEx> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvFlushVirtualAddressSpaceEx::run(params, |header, input| {
            let processors = parse_generic_set(input).ok_or(HvError::InvalidParameter)?;
            self.flush_virtual_address_space_ex(processors, header.flags)
        })
    }
}

/// Implements the `HvFlushGuestPhysicalAddressSpace` hypercall.
pub trait FlushGuestPhysicalAddressSpace {
    /// Invalidates cached guest physical mappings for an address space.
    fn flush_guest_physical_address_space(
        &mut self,
        address_space: u64,
        flags: u64,
    ) -> HvResult<()>;
}

/// Defines the `HvFlushGuestPhysicalAddressSpace` hypercall.
pub type HvFlushGuestPhysicalAddressSpace = SimpleHypercall<
    defs::FlushGuestPhysicalAddressSpace,
    (),
    { HypercallCode::HvCallFlushGuestPhysicalAddressSpace.0 },
>;

impl<T: FlushGuestPhysicalAddressSpace> HypercallDispatch<HvFlushGuestPhysicalAddressSpace> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvFlushGuestPhysicalAddressSpace::run(params, |input| {
            self.flush_guest_physical_address_space(input.address_space, input.flags)
        })
    }
}

/// Implements the `HvFlushGuestPhysicalAddressList` hypercall.
pub trait FlushGuestPhysicalAddressList {
    /// Invalidates cached guest physical mappings for the listed page
    /// ranges.
    fn flush_guest_physical_address_list(
        &mut self,
        address_space: u64,
        flags: u64,
        gpa_ranges: &[defs::HvGpaRange],
    ) -> HvRepResult;
}

/// Defines the `HvFlushGuestPhysicalAddressList` hypercall.
///
/// The rep list is bounded by [`defs::HV_MAX_FLUSH_REP_COUNT`]; longer
/// requests are serviced up to the page capacity and completed with
/// `HV_STATUS_INSUFFICIENT_BUFFERS` so the guest resumes via `rep_start`.
pub type HvFlushGuestPhysicalAddressList = RepHypercall<
    defs::FlushGuestPhysicalAddressList,
    defs::HvGpaRange,
    (),
    { HypercallCode::HvCallFlushGuestPhysicalAddressList.0 },
>;

impl<T: FlushGuestPhysicalAddressList> HypercallDispatch<HvFlushGuestPhysicalAddressList> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvFlushGuestPhysicalAddressList::run(params, |header, input, _output| {
            self.flush_guest_physical_address_list(header.address_space, header.flags, input)
        })
    }
}

fn check_ipi_vector(vector: u32) -> HvResult<()> {
    if !(defs::HV_IPI_LOW_VECTOR..=defs::HV_IPI_HIGH_VECTOR).contains(&vector) {
        return Err(HvError::InvalidParameter);
    }
    Ok(())
}

/// Implements the `HvSendSyntheticClusterIpi` hypercall.
pub trait SendSyntheticClusterIpi {
    /// Sends the vector to the listed processors.
    fn send_synthetic_cluster_ipi(&mut self, vector: u32, processor_set: Vec<u32>) -> HvResult<()>;
}

/// Defines the `HvSendSyntheticClusterIpi` hypercall.
pub type HvSendSyntheticClusterIpi = SimpleHypercall<
    defs::SendSyntheticClusterIpi,
    (),
    { HypercallCode::HvCallSendSyntheticClusterIpi.0 },
>;

impl<T: SendSyntheticClusterIpi> HypercallDispatch<HvSendSyntheticClusterIpi> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvSendSyntheticClusterIpi::run(params, |input| {
            check_ipi_vector(input.vector)?;
            let processors = parse_processor_masks(1, &[input.processor_mask])
                .ok_or(HvError::InvalidParameter)?;
            self.send_synthetic_cluster_ipi(input.vector, processors)
        })
    }
}

/// Implements the `HvSendSyntheticClusterIpiEx` hypercall.
pub trait SendSyntheticClusterIpiEx {
    /// Sends the vector to the processor set.
    fn send_synthetic_cluster_ipi_ex(
        &mut self,
        vector: u32,
        processor_set: GenericSet<'_>,
    ) -> HvResult<()>;
}

/// Defines the `HvSendSyntheticClusterIpiEx` hypercall.
pub type HvSendSyntheticClusterIpiEx = VariableHypercall<
    defs::SendSyntheticClusterIpiEx,
    (),
    { HypercallCode::HvCallSendSyntheticClusterIpiEx.0 },
>;

impl<T: SendSyntheticClusterIpiEx> HypercallDispatch<HvSendSyntheticClusterIpiEx> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvSendSyntheticClusterIpiEx::run(params, |input, var_input| {
            check_ipi_vector(input.vector)?;
            let processors = parse_generic_set(var_input).ok_or(HvError::InvalidParameter)?;
            self.send_synthetic_cluster_ipi_ex(input.vector, processors)
        })
    }
}

/// Implements the `HvNotifyLongSpinWait` hypercall.
pub trait NotifyLongSpinWait {
    /// Notifies that the guest has spun on a lock past the advertised
    /// threshold.
    fn notify_long_spin_wait(&mut self, spin_wait_count: u64) -> HvResult<()>;
}

/// Defines the `HvNotifyLongSpinWait` hypercall.
pub type HvNotifyLongSpinWait =
    SimpleHypercall<u64, (), { HypercallCode::HvCallNotifyLongSpinWait.0 }>;

impl<T: NotifyLongSpinWait> HypercallDispatch<HvNotifyLongSpinWait> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvNotifyLongSpinWait::run(params, |&count| self.notify_long_spin_wait(count))
    }
}

/// Implements the `HvExtQueryCapabilities` hypercall.
pub trait ExtendedQueryCapabilities {
    /// Queries extended capabilities.
    fn query_extended_capabilities(&mut self) -> HvResult<u64>;
}

/// Defines the `HvExtQueryCapabilities` hypercall.
pub type HvExtQueryCapabilities =
    SimpleHypercall<(), u64, { HypercallCode::HvExtCallQueryCapabilities.0 }>;

impl<T: ExtendedQueryCapabilities> HypercallDispatch<HvExtQueryCapabilities> for T {
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput {
        HvExtQueryCapabilities::run(params, |()| self.query_extended_capabilities())
    }
}
