// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tests for hypercall handling.

use crate::Dispatcher;
use crate::HvRepResult;
use crate::PageBuffers;
use crate::X64HypercallRegister;
use crate::X64RegisterIo;
use crate::X64RegisterState;
use crate::imp::*;
use viridian_defs::HV_PAGE_SIZE_USIZE;
use viridian_defs::HvError;
use viridian_defs::HvResult;
use viridian_defs::HypercallCode;
use viridian_defs::hypercall as defs;
use viridian_defs::hypercall::Control;
use viridian_defs::hypercall::HypercallOutput;
use viridian_structs::GenericSet;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const INPUT_GPA: u64 = 0x1000;
const OUTPUT_GPA: u64 = 0x2000;
const RIP: u64 = 0xfff0;

#[derive(Default)]
struct TestRegs {
    rip: u64,
    rax: u64,
    rcx: u64,
    rdx: u64,
    rbx: u64,
    rsi: u64,
    rdi: u64,
    r8: u64,
    xmm: [u128; 6],
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SetRecord {
    All,
    List(Vec<u32>),
}

impl From<GenericSet<'_>> for SetRecord {
    fn from(set: GenericSet<'_>) -> Self {
        match set.sparse() {
            None => SetRecord::All,
            Some(procs) => SetRecord::List(procs.iter().collect()),
        }
    }
}

/// A test vCPU: registers plus a record of every handled operation.
#[derive(Default)]
struct TestVp {
    regs: TestRegs,
    messages: Vec<(u32, Vec<u8>)>,
    events: Vec<(u32, u16)>,
    flushes: Vec<(SetRecord, u64)>,
    flushed_gvas: Vec<defs::HvGvaRange>,
    flushed_gpa_ranges: Vec<defs::HvGpaRange>,
    ipis: Vec<(u32, SetRecord)>,
    spin_waits: Vec<u64>,
    // When set, the GVA list handler fails with this error after processing
    // the given number of entries.
    fail_gva_list: Option<(HvError, usize)>,
}

impl X64RegisterState for TestVp {
    fn rip(&mut self) -> u64 {
        self.regs.rip
    }

    fn set_rip(&mut self, rip: u64) {
        self.regs.rip = rip;
    }

    fn gp(&mut self, n: X64HypercallRegister) -> u64 {
        match n {
            X64HypercallRegister::Rax => self.regs.rax,
            X64HypercallRegister::Rcx => self.regs.rcx,
            X64HypercallRegister::Rdx => self.regs.rdx,
            X64HypercallRegister::Rbx => self.regs.rbx,
            X64HypercallRegister::Rsi => self.regs.rsi,
            X64HypercallRegister::Rdi => self.regs.rdi,
            X64HypercallRegister::R8 => self.regs.r8,
        }
    }

    fn set_gp(&mut self, n: X64HypercallRegister, value: u64) {
        match n {
            X64HypercallRegister::Rax => self.regs.rax = value,
            X64HypercallRegister::Rcx => self.regs.rcx = value,
            X64HypercallRegister::Rdx => self.regs.rdx = value,
            X64HypercallRegister::Rbx => self.regs.rbx = value,
            X64HypercallRegister::Rsi => self.regs.rsi = value,
            X64HypercallRegister::Rdi => self.regs.rdi = value,
            X64HypercallRegister::R8 => self.regs.r8 = value,
        }
    }

    fn xmm(&mut self, n: usize) -> u128 {
        self.regs.xmm[n]
    }

    fn set_xmm(&mut self, n: usize, value: u128) {
        self.regs.xmm[n] = value;
    }
}

impl PostMessage for TestVp {
    fn post_message(&mut self, connection_id: u32, message: &[u8]) -> HvResult<()> {
        self.messages.push((connection_id, message.to_vec()));
        Ok(())
    }
}

impl SignalEvent for TestVp {
    fn signal_event(&mut self, connection_id: u32, flag: u16) -> HvResult<()> {
        self.events.push((connection_id, flag));
        Ok(())
    }
}

impl FlushVirtualAddressSpace for TestVp {
    fn flush_virtual_address_space(
        &mut self,
        processor_set: Vec<u32>,
        flags: defs::HvFlushFlags,
    ) -> HvResult<()> {
        self.flushes
            .push((SetRecord::List(processor_set), flags.into()));
        Ok(())
    }
}

impl FlushVirtualAddressList for TestVp {
    fn flush_virtual_address_list(
        &mut self,
        processor_set: Vec<u32>,
        flags: defs::HvFlushFlags,
        gva_ranges: &[defs::HvGvaRange],
    ) -> HvRepResult {
        self.flushes
            .push((SetRecord::List(processor_set), flags.into()));
        if let Some((err, reps)) = self.fail_gva_list {
            self.flushed_gvas.extend_from_slice(&gva_ranges[..reps]);
            return Err((err, reps));
        }
        self.flushed_gvas.extend_from_slice(gva_ranges);
        Ok(())
    }
}

impl FlushVirtualAddressSpaceEx for TestVp {
    fn flush_virtual_address_space_ex(
        &mut self,
        processor_set: GenericSet<'_>,
        flags: defs::HvFlushFlags,
    ) -> HvResult<()> {
        self.flushes.push((processor_set.into(), flags.into()));
        Ok(())
    }
}

impl FlushVirtualAddressListEx for TestVp {
    fn flush_virtual_address_list_ex(
        &mut self,
        processor_set: GenericSet<'_>,
        flags: defs::HvFlushFlags,
        gva_ranges: &[defs::HvGvaRange],
    ) -> HvRepResult {
        self.flushes.push((processor_set.into(), flags.into()));
        self.flushed_gvas.extend_from_slice(gva_ranges);
        Ok(())
    }
}

impl FlushGuestPhysicalAddressSpace for TestVp {
    fn flush_guest_physical_address_space(
        &mut self,
        address_space: u64,
        _flags: u64,
    ) -> HvResult<()> {
        self.flushes.push((SetRecord::All, address_space));
        Ok(())
    }
}

impl FlushGuestPhysicalAddressList for TestVp {
    fn flush_guest_physical_address_list(
        &mut self,
        _address_space: u64,
        _flags: u64,
        gpa_ranges: &[defs::HvGpaRange],
    ) -> HvRepResult {
        self.flushed_gpa_ranges.extend_from_slice(gpa_ranges);
        Ok(())
    }
}

impl SendSyntheticClusterIpi for TestVp {
    fn send_synthetic_cluster_ipi(&mut self, vector: u32, processor_set: Vec<u32>) -> HvResult<()> {
        self.ipis.push((vector, SetRecord::List(processor_set)));
        Ok(())
    }
}

impl SendSyntheticClusterIpiEx for TestVp {
    fn send_synthetic_cluster_ipi_ex(
        &mut self,
        vector: u32,
        processor_set: GenericSet<'_>,
    ) -> HvResult<()> {
        self.ipis.push((vector, processor_set.into()));
        Ok(())
    }
}

impl NotifyLongSpinWait for TestVp {
    fn notify_long_spin_wait(&mut self, spin_wait_count: u64) -> HvResult<()> {
        self.spin_waits.push(spin_wait_count);
        Ok(())
    }
}

impl ExtendedQueryCapabilities for TestVp {
    fn query_extended_capabilities(&mut self) -> HvResult<u64> {
        Ok(0)
    }
}

fn test_dispatcher() -> Dispatcher<TestVp> {
    crate::dispatcher!(
        TestVp,
        [
            HvPostMessage,
            HvSignalEvent,
            HvFlushVirtualAddressSpace,
            HvFlushVirtualAddressList,
            HvFlushVirtualAddressSpaceEx,
            HvFlushVirtualAddressListEx,
            HvFlushGuestPhysicalAddressSpace,
            HvFlushGuestPhysicalAddressList,
            HvSendSyntheticClusterIpi,
            HvSendSyntheticClusterIpiEx,
            HvNotifyLongSpinWait,
            HvExtQueryCapabilities,
        ],
    )
}

/// Dispatches a slow hypercall and returns the guest-visible output word.
fn dispatch_slow(
    vp: &mut TestVp,
    control: Control,
    input: &[u8],
    output: &mut [u8],
) -> HypercallOutput {
    vp.regs.rip = RIP;
    vp.regs.rcx = control.into();
    vp.regs.rdx = INPUT_GPA;
    vp.regs.r8 = OUTPUT_GPA;
    test_dispatcher().dispatch(
        PageBuffers { input, output },
        X64RegisterIo::new(&mut *vp, true),
    );
    HypercallOutput::from(vp.regs.rax)
}

/// Dispatches a fast hypercall with the register pairs preloaded.
fn dispatch_fast(vp: &mut TestVp, control: Control, input_pairs: &[[u64; 2]]) -> HypercallOutput {
    vp.regs.rip = RIP;
    vp.regs.rcx = u64::from(control.with_fast(true));
    if let Some(&[low, high]) = input_pairs.first() {
        vp.regs.rdx = low;
        vp.regs.r8 = high;
    }
    for (i, &[low, high]) in input_pairs.iter().skip(1).enumerate() {
        vp.regs.xmm[i] = low as u128 | ((high as u128) << 64);
    }
    test_dispatcher().dispatch(PageBuffers::empty(), X64RegisterIo::new(&mut *vp, true));
    HypercallOutput::from(vp.regs.rax)
}

fn page_with(data: &[u8]) -> Vec<u8> {
    let mut page = vec![0; HV_PAGE_SIZE_USIZE];
    page[..data.len()].copy_from_slice(data);
    page
}

#[test]
fn post_message_slow() {
    let mut input = defs::PostMessage::new_zeroed();
    input.connection_id = 0x42;
    input.message_type = 1;
    input.payload_size = 4;
    input.payload[..4].copy_from_slice(&[1, 2, 3, 4]);

    let mut vp = TestVp::default();
    let control = Control::new().with_code(HypercallCode::HvCallPostMessage.0);
    let output = dispatch_slow(&mut vp, control, &page_with(input.as_bytes()), &mut []);

    assert_eq!(output.result(), Ok(()));
    assert_eq!(vp.messages, [(0x42, vec![1, 2, 3, 4])]);
    // The instruction pointer advanced past the hypercall instruction.
    assert_eq!(vp.regs.rip, RIP + 3);
}

#[test]
fn post_message_oversized_payload() {
    let mut input = defs::PostMessage::new_zeroed();
    input.payload_size = 241;

    let mut vp = TestVp::default();
    let control = Control::new().with_code(HypercallCode::HvCallPostMessage.0);
    let output = dispatch_slow(&mut vp, control, &page_with(input.as_bytes()), &mut []);

    assert_eq!(output.result(), Err(HvError::InvalidParameter));
    assert!(vp.messages.is_empty());
}

#[test]
fn signal_event_fast() {
    let event = defs::SignalEvent {
        connection_id: 7,
        flag_number: 11,
        rsvd: 0,
    };
    let mut low = [0; 8];
    low.copy_from_slice(event.as_bytes());

    let mut vp = TestVp::default();
    let control = Control::new().with_code(HypercallCode::HvCallSignalEvent.0);
    let output = dispatch_fast(&mut vp, control, &[[u64::from_le_bytes(low), 0]]);

    assert_eq!(output.result(), Ok(()));
    assert_eq!(vp.events, [(7, 11)]);
}

#[test]
fn unknown_code_fails() {
    let mut vp = TestVp::default();
    let control = Control::new().with_code(0x7fff);
    let output = dispatch_slow(&mut vp, control, &page_with(&[]), &mut []);
    assert_eq!(output.result(), Err(HvError::InvalidHypercallCode));
}

#[test]
fn simple_call_rejects_rep_fields() {
    let input = defs::PostMessage::new_zeroed();
    let mut vp = TestVp::default();
    let control = Control::new()
        .with_code(HypercallCode::HvCallPostMessage.0)
        .with_rep_count(1);
    let output = dispatch_slow(&mut vp, control, &page_with(input.as_bytes()), &mut []);
    assert_eq!(output.result(), Err(HvError::InvalidHypercallInput));
}

#[test]
fn unaligned_input_gpa() {
    let input = defs::PostMessage::new_zeroed();
    let mut vp = TestVp::default();
    vp.regs.rip = RIP;
    vp.regs.rcx = Control::new()
        .with_code(HypercallCode::HvCallPostMessage.0)
        .into();
    vp.regs.rdx = INPUT_GPA + 4;
    vp.regs.r8 = OUTPUT_GPA;
    let page = page_with(input.as_bytes());
    test_dispatcher().dispatch(
        PageBuffers {
            input: &page,
            output: &mut [],
        },
        X64RegisterIo::new(&mut vp, true),
    );
    assert_eq!(
        HypercallOutput::from(vp.regs.rax).result(),
        Err(HvError::InvalidAlignment)
    );
}

#[test]
fn straddling_input_fails() {
    let input = defs::PostMessage::new_zeroed();
    let mut vp = TestVp::default();
    vp.regs.rip = RIP;
    vp.regs.rcx = Control::new()
        .with_code(HypercallCode::HvCallPostMessage.0)
        .into();
    // 256 bytes of input do not fit between this offset and the page end.
    vp.regs.rdx = INPUT_GPA + 0xf80;
    vp.regs.r8 = OUTPUT_GPA;
    test_dispatcher().dispatch(
        PageBuffers {
            input: &page_with(input.as_bytes())[0xf80..],
            output: &mut [],
        },
        X64RegisterIo::new(&mut vp, true),
    );
    assert_eq!(
        HypercallOutput::from(vp.regs.rax).result(),
        Err(HvError::InvalidHypercallInput)
    );
}

fn gva_list_input(count: usize) -> Vec<u8> {
    let header = defs::FlushVirtualAddressSpace {
        address_space: 0,
        flags: defs::HvFlushFlags::new(),
        processor_mask: 0b11,
    };
    let mut data = header.as_bytes().to_vec();
    for i in 0..count {
        let range = defs::HvGvaRangeSimple::new()
            .with_gva_page_number(0x100 + i as u64)
            .with_additional_pages(1);
        data.extend_from_slice(u64::from(range).as_bytes());
    }
    data
}

#[test]
fn flush_list_rep_progress() {
    let mut vp = TestVp::default();
    let control = Control::new()
        .with_code(HypercallCode::HvCallFlushVirtualAddressList.0)
        .with_rep_count(3)
        .with_rep_start(1);
    let output = dispatch_slow(&mut vp, control, &page_with(&gva_list_input(3)), &mut []);

    assert_eq!(output.result(), Ok(()));
    assert_eq!(output.elements_processed(), 3);
    // Only the entries from rep_start onward are presented to the handler.
    assert_eq!(vp.flushed_gvas.len(), 2);
    assert_eq!(vp.flushes.len(), 1);
    assert_eq!(vp.flushes[0].0, SetRecord::List(vec![0, 1]));
}

#[test]
fn flush_list_timeout_retries_with_progress() {
    let mut vp = TestVp {
        fail_gva_list: Some((HvError::Timeout, 2)),
        ..Default::default()
    };
    let control = Control::new()
        .with_code(HypercallCode::HvCallFlushVirtualAddressList.0)
        .with_rep_count(4);
    let rcx_before: u64 = control.into();
    let _ = dispatch_slow(&mut vp, control, &page_with(&gva_list_input(4)), &mut []);

    // A timeout re-arms the hypercall rather than completing it: rip is
    // unchanged and the control word's rep_start records the progress.
    assert_eq!(vp.regs.rip, RIP);
    let retried = Control::from(vp.regs.rcx);
    assert_ne!(vp.regs.rcx, rcx_before);
    assert_eq!(retried.rep_start(), 2);
    assert_eq!(retried.rep_count(), 4);
}

#[test]
fn flush_ex_generic_set() {
    let header = defs::FlushVirtualAddressSpaceEx {
        address_space: 0,
        flags: defs::HvFlushFlags::new().with_non_global_mappings_only(true),
    };
    let mut data = header.as_bytes().to_vec();
    for word in [defs::HV_GENERIC_SET_SPARSE_4K, 0x5, 0x21, 0x4] {
        data.extend_from_slice(word.as_bytes());
    }

    let mut vp = TestVp::default();
    let control = Control::new()
        .with_code(HypercallCode::HvCallFlushVirtualAddressSpaceEx.0)
        .with_variable_header_size(4);
    let output = dispatch_slow(&mut vp, control, &page_with(&data), &mut []);

    assert_eq!(output.result(), Ok(()));
    assert_eq!(vp.flushes[0].0, SetRecord::List(vec![0, 5, 130]));
}

#[test]
fn flush_ex_bad_bank_count() {
    let header = defs::FlushVirtualAddressSpaceEx {
        address_space: 0,
        flags: defs::HvFlushFlags::new(),
    };
    let mut data = header.as_bytes().to_vec();
    // The validity mask names two banks but only one content word follows.
    for word in [defs::HV_GENERIC_SET_SPARSE_4K, 0x3, 0x21] {
        data.extend_from_slice(word.as_bytes());
    }

    let mut vp = TestVp::default();
    let control = Control::new()
        .with_code(HypercallCode::HvCallFlushVirtualAddressSpaceEx.0)
        .with_variable_header_size(3);
    let output = dispatch_slow(&mut vp, control, &page_with(&data), &mut []);

    assert_eq!(output.result(), Err(HvError::InvalidParameter));
    assert!(vp.flushes.is_empty());
}

#[test]
fn gpa_flush_list_capacity() {
    let header = defs::FlushGuestPhysicalAddressList {
        address_space: 1,
        flags: 0,
    };
    let mut data = header.as_bytes().to_vec();
    for i in 0..defs::HV_MAX_FLUSH_REP_COUNT {
        let range = defs::HvGpaRangeExtended::new().with_gpa_page_number(i as u64);
        data.extend_from_slice(u64::from(range).as_bytes());
    }
    assert_eq!(data.len(), HV_PAGE_SIZE_USIZE);

    // Asking for one entry more than the page can hold succeeds for the
    // entries present and reports the truncation.
    let mut vp = TestVp::default();
    let control = Control::new()
        .with_code(HypercallCode::HvCallFlushGuestPhysicalAddressList.0)
        .with_rep_count(defs::HV_MAX_FLUSH_REP_COUNT + 1);
    let output = dispatch_slow(&mut vp, control, &data, &mut []);

    assert_eq!(output.result(), Err(HvError::InsufficientBuffers));
    assert_eq!(output.elements_processed(), defs::HV_MAX_FLUSH_REP_COUNT);
    assert_eq!(vp.flushed_gpa_ranges.len(), defs::HV_MAX_FLUSH_REP_COUNT);

    // The full page is processed in one call when the count fits exactly.
    let mut vp = TestVp::default();
    let control = Control::new()
        .with_code(HypercallCode::HvCallFlushGuestPhysicalAddressList.0)
        .with_rep_count(defs::HV_MAX_FLUSH_REP_COUNT);
    let output = dispatch_slow(&mut vp, control, &data, &mut []);

    assert_eq!(output.result(), Ok(()));
    assert_eq!(output.elements_processed(), defs::HV_MAX_FLUSH_REP_COUNT);
}

#[test]
fn send_ipi_fast() {
    let mut vp = TestVp::default();
    let control = Control::new().with_code(HypercallCode::HvCallSendSyntheticClusterIpi.0);
    let output = dispatch_fast(&mut vp, control, &[[0x30, 0b1010]]);

    assert_eq!(output.result(), Ok(()));
    assert_eq!(vp.ipis, [(0x30, SetRecord::List(vec![1, 3]))]);
}

#[test]
fn send_ipi_bad_vector() {
    // Vectors below 16 cannot be delivered as synthetic IPIs.
    let mut vp = TestVp::default();
    let control = Control::new().with_code(HypercallCode::HvCallSendSyntheticClusterIpi.0);
    let output = dispatch_fast(&mut vp, control, &[[0x3, 0b1010]]);

    assert_eq!(output.result(), Err(HvError::InvalidParameter));
    assert!(vp.ipis.is_empty());
}

#[test]
fn send_ipi_ex_all_format() {
    let header = defs::SendSyntheticClusterIpiEx {
        vector: 0x31,
        reserved: 0,
    };
    let mut data = header.as_bytes().to_vec();
    data.extend_from_slice(defs::HV_GENERIC_SET_ALL.as_bytes());

    let mut vp = TestVp::default();
    let control = Control::new()
        .with_code(HypercallCode::HvCallSendSyntheticClusterIpiEx.0)
        .with_variable_header_size(1);
    let output = dispatch_slow(&mut vp, control, &page_with(&data), &mut []);

    assert_eq!(output.result(), Ok(()));
    assert_eq!(vp.ipis, [(0x31, SetRecord::All)]);
}

#[test]
fn query_capabilities_fast_output() {
    let mut vp = TestVp::default();
    let control = Control::new().with_code(HypercallCode::HvExtCallQueryCapabilities.0);
    let output = dispatch_fast(&mut vp, control, &[]);

    assert_eq!(output.result(), Ok(()));
    // The 8-byte output lands in the first output register pair.
    assert_eq!(vp.regs.rdx, 0);
}

#[test]
fn notify_long_spin_wait() {
    let mut vp = TestVp::default();
    let control = Control::new().with_code(HypercallCode::HvCallNotifyLongSpinWait.0);
    let output = dispatch_fast(&mut vp, control, &[[0x100, 0]]);

    assert_eq!(output.result(), Ok(()));
    assert_eq!(vp.spin_waits, [0x100]);
}
