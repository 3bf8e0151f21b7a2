// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-visible definitions for the Viridian (Hyper-V compatible)
//! paravirtualization interface: synthetic MSR layouts, hypercall input and
//! output formats, SynIC page formats, and the enlightened VMCS.
//!
//! Everything in this crate is wire ABI. Field layouts match the published
//! Top-Level Functional Specification bit for bit; reserved bits round-trip
//! unchanged through decode/encode unless the owning field documents a
//! masking policy.

#![no_std]
#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use core::fmt::Debug;
use core::mem::size_of;
use static_assertions::const_assert;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const HV_PAGE_SIZE: u64 = 4096;
pub const HV_PAGE_SIZE_USIZE: usize = 4096;
pub const HV_PAGE_SHIFT: u64 = 12;

pub const NUM_SINTS: usize = 16;
pub const NUM_TIMERS: usize = 4;

pub const HV_CPUID_FUNCTION_HV_VENDOR_AND_MAX_FUNCTION: u32 = 0x40000000;
pub const HV_CPUID_FUNCTION_HV_INTERFACE: u32 = 0x40000001;
pub const HV_CPUID_FUNCTION_MS_HV_VERSION: u32 = 0x40000002;
pub const HV_CPUID_FUNCTION_MS_HV_FEATURES: u32 = 0x40000003;
pub const HV_CPUID_FUNCTION_MS_HV_ENLIGHTENMENT_INFORMATION: u32 = 0x40000004;
pub const HV_CPUID_FUNCTION_MS_HV_IMPLEMENTATION_LIMITS: u32 = 0x40000005;

/// The partition privilege mask reported in the features cpuid leaf.
#[bitfield(u64)]
pub struct HvPartitionPrivilege {
    // access to virtual msrs
    pub access_vp_runtime_msr: bool,
    pub access_partition_reference_counter: bool,
    pub access_synic_msrs: bool,
    pub access_synthetic_timer_msrs: bool,
    pub access_apic_msrs: bool,
    pub access_hypercall_msrs: bool,
    pub access_vp_index: bool,
    pub access_reset_msr: bool,
    pub access_stats_msr: bool,
    pub access_partition_reference_tsc: bool,
    pub access_guest_idle_msr: bool,
    pub access_frequency_msrs: bool,
    pub access_debug_msrs: bool,
    pub access_reenlightenment_ctrls: bool,
    #[bits(18)]
    _reserved1: u64,

    // access to hypercalls
    pub create_partitions: bool,
    pub access_partition_id: bool,
    pub access_memory_pool: bool,
    pub adjust_message_buffers: bool,
    pub post_messages: bool,
    pub signal_events: bool,
    pub create_port: bool,
    pub connect_port: bool,
    pub access_stats: bool,
    #[bits(2)]
    _reserved2: u64,
    pub debugging: bool,
    pub cpu_management: bool,
    #[bits(19)]
    _reserved3: u64,
}

#[bitfield(u128)]
pub struct HvFeatures {
    pub privileges: u64, // HvPartitionPrivilege

    #[bits(4)]
    pub max_supported_cstate: u32,
    #[bits(28)]
    _reserved: u32,

    pub mwait_available_deprecated: bool,
    pub guest_debugging_available: bool,
    pub performance_monitors_available: bool,
    pub cpu_dynamic_partitioning_available: bool,
    pub xmm_registers_for_fast_hypercall_available: bool,
    pub guest_idle_available: bool,
    pub hypervisor_sleep_state_support_available: bool,
    pub numa_distance_query_available: bool,
    pub frequency_regs_available: bool,
    pub synthetic_machine_check_available: bool,
    pub guest_crash_regs_available: bool,
    pub debug_regs_available: bool,
    pub npiep1_available: bool,
    pub disable_hypervisor_available: bool,
    pub extended_gva_ranges_for_flush_virtual_address_list_available: bool,
    pub fast_hypercall_output_available: bool,
    #[bits(3)]
    _reserved2: u32,
    pub direct_synthetic_timers: bool,
    #[bits(12)]
    _reserved3: u32,
}

/// The enlightenment recommendations leaf: which of the interfaces defined
/// here the guest is encouraged to use.
#[bitfield(u128)]
pub struct HvEnlightenmentInformation {
    pub use_hypercall_for_address_space_switch: bool,
    pub use_hypercall_for_local_flush: bool,
    pub use_hypercall_for_remote_flush_and_local_flush_entire: bool,
    pub use_apic_msrs: bool,
    pub use_hv_register_for_reset: bool,
    pub use_relaxed_timing: bool,
    pub use_dma_remapping_deprecated: bool,
    pub use_interrupt_remapping_deprecated: bool,
    pub use_x2_apic_msrs: bool,
    pub deprecate_auto_eoi: bool,
    pub use_synthetic_cluster_ipi: bool,
    pub use_ex_processor_masks: bool,
    pub nested: bool,
    pub use_int_for_mbec_system_calls: bool,
    pub use_vmcs_enlightenments: bool,
    pub use_synced_timeline: bool,
    _reserved1: bool,
    pub use_direct_local_flush_entire: bool,
    pub no_non_architectural_core_sharing: bool,
    #[bits(13)]
    _reserved2: u32,
    pub long_spin_wait_count: u32,
    _reserved3: u32,
    _reserved4: u32,
}

pub const HV_X64_MSR_GUEST_OS_ID: u32 = 0x40000000;
pub const HV_X64_MSR_HYPERCALL: u32 = 0x40000001;
pub const HV_X64_MSR_VP_INDEX: u32 = 0x40000002;
pub const HV_X64_MSR_TIME_REF_COUNT: u32 = 0x40000020;
pub const HV_X64_MSR_REFERENCE_TSC: u32 = 0x40000021;
pub const HV_X64_MSR_TSC_FREQUENCY: u32 = 0x40000022;
pub const HV_X64_MSR_APIC_FREQUENCY: u32 = 0x40000023;
pub const HV_X64_MSR_VP_ASSIST_PAGE: u32 = 0x40000073;
pub const HV_X64_MSR_SCONTROL: u32 = 0x40000080;
pub const HV_X64_MSR_SVERSION: u32 = 0x40000081;
pub const HV_X64_MSR_SIEFP: u32 = 0x40000082;
pub const HV_X64_MSR_SIMP: u32 = 0x40000083;
pub const HV_X64_MSR_EOM: u32 = 0x40000084;
pub const HV_X64_MSR_SINT0: u32 = 0x40000090;
pub const HV_X64_MSR_SINT1: u32 = 0x40000091;
pub const HV_X64_MSR_SINT2: u32 = 0x40000092;
pub const HV_X64_MSR_SINT3: u32 = 0x40000093;
pub const HV_X64_MSR_SINT4: u32 = 0x40000094;
pub const HV_X64_MSR_SINT5: u32 = 0x40000095;
pub const HV_X64_MSR_SINT6: u32 = 0x40000096;
pub const HV_X64_MSR_SINT7: u32 = 0x40000097;
pub const HV_X64_MSR_SINT8: u32 = 0x40000098;
pub const HV_X64_MSR_SINT9: u32 = 0x40000099;
pub const HV_X64_MSR_SINT10: u32 = 0x4000009a;
pub const HV_X64_MSR_SINT11: u32 = 0x4000009b;
pub const HV_X64_MSR_SINT12: u32 = 0x4000009c;
pub const HV_X64_MSR_SINT13: u32 = 0x4000009d;
pub const HV_X64_MSR_SINT14: u32 = 0x4000009e;
pub const HV_X64_MSR_SINT15: u32 = 0x4000009f;
pub const HV_X64_MSR_STIMER0_CONFIG: u32 = 0x400000b0;
pub const HV_X64_MSR_STIMER0_COUNT: u32 = 0x400000b1;
pub const HV_X64_MSR_STIMER1_CONFIG: u32 = 0x400000b2;
pub const HV_X64_MSR_STIMER1_COUNT: u32 = 0x400000b3;
pub const HV_X64_MSR_STIMER2_CONFIG: u32 = 0x400000b4;
pub const HV_X64_MSR_STIMER2_COUNT: u32 = 0x400000b5;
pub const HV_X64_MSR_STIMER3_CONFIG: u32 = 0x400000b6;
pub const HV_X64_MSR_STIMER3_COUNT: u32 = 0x400000b7;
pub const HV_X64_MSR_GUEST_CRASH_P0: u32 = 0x40000100;
pub const HV_X64_MSR_GUEST_CRASH_P1: u32 = 0x40000101;
pub const HV_X64_MSR_GUEST_CRASH_P2: u32 = 0x40000102;
pub const HV_X64_MSR_GUEST_CRASH_P3: u32 = 0x40000103;
pub const HV_X64_MSR_GUEST_CRASH_P4: u32 = 0x40000104;
pub const HV_X64_MSR_GUEST_CRASH_CTL: u32 = 0x40000105;
pub const HV_X64_MSR_REENLIGHTENMENT_CONTROL: u32 = 0x40000106;
pub const HV_X64_MSR_TSC_EMULATION_CONTROL: u32 = 0x40000107;
pub const HV_X64_MSR_TSC_EMULATION_STATUS: u32 = 0x40000108;

pub const HV_X64_GUEST_CRASH_PARAMETER_MSRS: usize = 5;

/// A hypervisor status code.
///
/// The non-success status codes are defined in [`HvError`].
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
#[repr(transparent)]
pub struct HvStatus(pub u16);

impl HvStatus {
    /// The success status code.
    pub const SUCCESS: Self = Self(0);

    /// Returns `Ok(())` if this is `HvStatus::SUCCESS`, otherwise returns an
    /// `Err(err)` where `err` is the corresponding `HvError`.
    pub fn result(self) -> HvResult<()> {
        if let Ok(err) = self.0.try_into() {
            Err(HvError(err))
        } else {
            Ok(())
        }
    }

    /// Returns true if this is `HvStatus::SUCCESS`.
    pub fn is_ok(self) -> bool {
        self == Self::SUCCESS
    }

    /// Returns true if this is not `HvStatus::SUCCESS`.
    pub fn is_err(self) -> bool {
        self != Self::SUCCESS
    }

    const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    const fn into_bits(self) -> u16 {
        self.0
    }
}

impl From<Result<(), HvError>> for HvStatus {
    fn from(err: Result<(), HvError>) -> Self {
        err.err().map_or(Self::SUCCESS, |err| Self(err.0.get()))
    }
}

impl Debug for HvStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.result() {
            Ok(()) => f.write_str("Success"),
            Err(err) => Debug::fmt(&err, f),
        }
    }
}

/// An [`HvStatus`] value representing an error.
//
// DEVNOTE: use `NonZeroU16` to get a niche optimization, since 0 is reserved
// for success.
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct HvError(core::num::NonZeroU16);

impl From<core::num::NonZeroU16> for HvError {
    fn from(err: core::num::NonZeroU16) -> Self {
        Self(err)
    }
}

impl Debug for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.debug_name() {
            Some(name) => f.pad(name),
            None => Debug::fmt(&self.0.get(), f),
        }
    }
}

impl core::fmt::Display for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.doc_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "Hypervisor error {:#06x}", self.0),
        }
    }
}

impl core::error::Error for HvError {}

macro_rules! hv_error {
    ($ty:ty, $(#[doc = $doc:expr] $ident:ident = $val:expr),* $(,)?) => {

        #[allow(non_upper_case_globals)]
        impl $ty {
            $(
                #[doc = $doc]
                pub const $ident: Self = Self(core::num::NonZeroU16::new($val).unwrap());
            )*

            fn debug_name(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $(
                        $val => stringify!($ident),
                    )*
                    _ => return None,
                })
            }

            fn doc_str(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $(
                        $val => $doc,
                    )*
                    _ => return None,
                })
            }
        }
    };
}

// DEVNOTE: the doc comments here are also used as the runtime error strings.
hv_error! {
    HvError,
    /// Invalid hypercall code
    InvalidHypercallCode = 0x0002,
    /// Invalid hypercall input
    InvalidHypercallInput = 0x0003,
    /// Invalid alignment
    InvalidAlignment = 0x0004,
    /// Invalid parameter
    InvalidParameter = 0x0005,
    /// Access denied
    AccessDenied = 0x0006,
    /// Unknown property
    UnknownProperty = 0x0009,
    /// Insufficient memory
    InsufficientMemory = 0x000B,
    /// Invalid VP index
    InvalidVpIndex = 0x000E,
    /// Invalid port ID
    InvalidPortId = 0x0011,
    /// Invalid connection ID
    InvalidConnectionId = 0x0012,
    /// Insufficient buffers
    InsufficientBuffers = 0x0013,
    /// Invalid SynIC state
    InvalidSynicState = 0x0018,
    /// Object in use
    ObjectInUse = 0x0019,
    /// The specified timeout expired before the operation completed.
    Timeout = 0x0078,
}

/// A useful result type for hypervisor operations.
pub type HvResult<T> = Result<T, HvError>;

/// An open enumeration over a fixed-width wire value: known values get
/// named constants and a readable `Debug` form, unknown values are preserved
/// verbatim so that decode/encode round-trips.
macro_rules! wire_enum {
    (
        $(#[$attr:meta])*
        pub enum $name:ident: $ty:ty {
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        $(#[$attr])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
        #[repr(transparent)]
        pub struct $name(pub $ty);

        #[allow(non_upper_case_globals)]
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: Self = Self($value);
            )*
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self.0 {
                    $($value => f.pad(stringify!($variant)),)*
                    raw => write!(f, concat!(stringify!($name), "({:#x})"), raw),
                }
            }
        }
    };
}

wire_enum! {
    pub enum HypercallCode: u16 {
        HvCallSwitchVirtualAddressSpace = 0x0001,
        HvCallFlushVirtualAddressSpace = 0x0002,
        HvCallFlushVirtualAddressList = 0x0003,
        HvCallNotifyLongSpinWait = 0x0008,
        HvCallSendSyntheticClusterIpi = 0x000b,
        HvCallFlushVirtualAddressSpaceEx = 0x0013,
        HvCallFlushVirtualAddressListEx = 0x0014,
        HvCallSendSyntheticClusterIpiEx = 0x0015,
        HvCallPostMessage = 0x005c,
        HvCallSignalEvent = 0x005d,
        HvCallFlushGuestPhysicalAddressSpace = 0x00af,
        HvCallFlushGuestPhysicalAddressList = 0x00b0,

        // Extended hypercalls.
        HvExtCallQueryCapabilities = 0x8001,
    }
}

wire_enum! {
    pub enum HvMessageType: u32 {
        HvMessageTypeNone = 0x00000000,

        HvMessageTypeUnmappedGpa = 0x80000000,
        HvMessageTypeGpaIntercept = 0x80000001,
        HvMessageTypeTimerExpired = 0x80000010,
        HvMessageTypeInvalidVpRegisterValue = 0x80000020,
        HvMessageTypeUnrecoverableException = 0x80000021,
        HvMessageTypeUnsupportedFeature = 0x80000022,
        HvMessageTypeEventLogBufferComplete = 0x80000040,
        HvMessageTypeX64IoPortIntercept = 0x80010000,
        HvMessageTypeMsrIntercept = 0x80010001,
        HvMessageTypeX64CpuidIntercept = 0x80010002,
        HvMessageTypeExceptionIntercept = 0x80010003,
        HvMessageTypeX64ApicEoi = 0x80010004,
    }
}

impl Default for HvMessageType {
    fn default() -> Self {
        HvMessageType::HvMessageTypeNone
    }
}

/// The well-known vendor field of a Linux guest OS ID.
pub const HV_LINUX_VENDOR_ID: u16 = 0x8100;
/// The well-known vendor field of a Xen guest OS ID.
pub const HV_XEN_VENDOR_ID: u16 = 0x8300;

/// The guest OS identity MSR contents.
///
/// Purely informational: the value is stored and reported back but never
/// validated against its content. The top bit of `vendor` distinguishes
/// proprietary from open-source vendor ID spaces.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvGuestOsId {
    pub build_number: u16,
    pub service_pack: u8,
    pub minor: u8,
    pub major: u8,
    pub os: u8,
    pub vendor: u16,
}

/// Reenlightenment notification configuration, used by guests that manage
/// their own nested TSC state across migrations.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvReenlightenmentControl {
    pub vector: u8,
    _reserved1: u8,
    pub enabled: bool,
    #[bits(15)]
    _reserved2: u64,
    pub target_vp: u32,
}

#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvTscEmulationControl {
    pub enabled: bool,
    #[bits(63)]
    _reserved: u64,
}

#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvTscEmulationStatus {
    pub in_progress: bool,
    #[bits(63)]
    _reserved: u64,
}

/// The value reported by the SVERSION MSR.
pub const HV_SYNIC_VERSION: u64 = 1;

/// Valid SynIC interrupt vectors are 16-255.
pub const HV_SYNIC_FIRST_VALID_VECTOR: u8 = 16;

#[bitfield(u64)]
pub struct HvSynicScontrol {
    pub enabled: bool,
    #[bits(63)]
    _reserved: u64,
}

/// Layout shared by the SIMP and SIEFP registers.
#[bitfield(u64)]
pub struct HvSynicSimpSiefp {
    pub enabled: bool,
    #[bits(11)]
    _reserved: u64,
    #[bits(52)]
    pub base_gpn: u64,
}

#[bitfield(u64)]
pub struct HvSynicSint {
    pub vector: u8,
    _reserved1: u8,
    pub masked: bool,
    pub auto_eoi: bool,
    pub polling: bool,
    #[bits(45)]
    _reserved2: u64,
}

#[bitfield(u64)]
pub struct HvSynicStimerConfig {
    pub enabled: bool,
    pub periodic: bool,
    pub lazy: bool,
    pub auto_enable: bool,
    pub apic_vector: u8,
    pub direct_mode: bool,
    #[bits(3)]
    _reserved1: u64,
    #[bits(4)]
    pub sint: u8,
    #[bits(44)]
    _reserved2: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessageHeader {
    pub typ: HvMessageType,
    pub len: u8,
    pub flags: HvMessageFlags,
    pub rsvd: u16,
    pub id: u64,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessageFlags {
    pub message_pending: bool,
    #[bits(7)]
    _reserved: u8,
}

pub const HV_MESSAGE_SIZE: usize = size_of::<HvMessage>();
const_assert!(HV_MESSAGE_SIZE == 256);
pub const HV_MESSAGE_PAYLOAD_SIZE: usize = 240;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessage {
    pub header: HvMessageHeader,
    pub payload_buffer: [u8; HV_MESSAGE_PAYLOAD_SIZE],
}

impl Default for HvMessage {
    fn default() -> Self {
        Self {
            header: FromZeros::new_zeroed(),
            payload_buffer: [0; 240],
        }
    }
}

impl HvMessage {
    /// Constructs a new message. `payload` must fit into the payload field
    /// (240 bytes limit).
    pub fn new(typ: HvMessageType, id: u64, payload: &[u8]) -> Self {
        assert!(payload.len() <= HV_MESSAGE_PAYLOAD_SIZE);
        let mut msg = HvMessage {
            header: HvMessageHeader {
                typ,
                len: payload.len() as u8,
                flags: HvMessageFlags::new(),
                rsvd: 0,
                id,
            },
            payload_buffer: [0; 240],
        };
        msg.payload_buffer[..payload.len()].copy_from_slice(payload);
        msg
    }

    pub fn payload(&self) -> &[u8] {
        // The length is guest-controlled when the message was decoded from
        // raw bytes; clamp rather than panic.
        &self.payload_buffer[..(self.header.len as usize).min(HV_MESSAGE_PAYLOAD_SIZE)]
    }

    pub fn from_bytes(b: [u8; HV_MESSAGE_SIZE]) -> Self {
        let mut msg = Self::default();
        msg.as_mut_bytes().copy_from_slice(&b);
        msg
    }

    pub fn into_bytes(self) -> [u8; HV_MESSAGE_SIZE] {
        let mut v = [0; HV_MESSAGE_SIZE];
        v.copy_from_slice(self.as_bytes());
        v
    }
}

/// The SIMP overlay: one message slot per SINT.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessagePage {
    pub sint_message: [HvMessage; NUM_SINTS],
}

const_assert!(size_of::<HvMessagePage>() == HV_PAGE_SIZE_USIZE);

#[repr(C)]
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TimerMessagePayload {
    pub timer_index: u32,
    pub reserved: u32,
    pub expiration_time: u64,
    pub delivery_time: u64,
}

/// The number of event flags in one SINT's bank of the SIEFP page.
pub const HV_EVENT_FLAGS_PER_SINT: usize = 2048;

/// One SINT's bank of event flags.
#[repr(C)]
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvSynicEventFlags(pub [u64; HV_EVENT_FLAGS_PER_SINT / 64]);

impl HvSynicEventFlags {
    /// Sets `flag`, returning true if it was newly set.
    pub fn set(&mut self, flag: u16) -> bool {
        let word = &mut self.0[flag as usize / 64];
        let mask = 1 << (flag % 64);
        let newly_set = *word & mask == 0;
        *word |= mask;
        newly_set
    }

    /// Returns true if no flags are set.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }
}

/// The SIEFP overlay: one bank of event flags per SINT.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvEventFlagsPage {
    pub sint_event_flags: [HvSynicEventFlags; NUM_SINTS],
}

const_assert!(size_of::<HvEventFlagsPage>() == HV_PAGE_SIZE_USIZE);

/// The reference TSC MSR contents.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvRegisterReferenceTsc {
    pub enable: bool,
    #[bits(11)]
    pub reserved_p: u64,
    #[bits(52)]
    pub gpn: u64,
}

/// The reference time counter and the reference TSC page count in 100ns
/// units.
pub const HV_CLOCK_HZ: u64 = 10_000_000;

/// A sequence value of zero marks the page contents invalid: readers must
/// fall back to the time reference count MSR.
pub const HV_REFERENCE_TSC_SEQUENCE_INVALID: u32 = 0;

/// The reference TSC page.
///
/// A single-writer, many-reader versioned snapshot: the writer publishes a
/// new scale/offset by first storing [`HV_REFERENCE_TSC_SEQUENCE_INVALID`],
/// then the payload, then the incremented (nonzero) sequence. A reader that
/// observes the same nonzero sequence before and after sampling scale and
/// offset has a consistent snapshot.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvReferenceTscPage {
    pub tsc_sequence: u32,
    pub reserved1: u32,
    pub tsc_scale: u64,
    pub tsc_offset: i64,
    pub reserved2: [u64; 509],
}

const_assert!(size_of::<HvReferenceTscPage>() == HV_PAGE_SIZE_USIZE);

impl HvReferenceTscPage {
    /// Computes the reference time for `tsc` from this snapshot, in 100ns
    /// units.
    ///
    /// Returns `None` when the sequence is invalid; the caller must use the
    /// time reference count MSR instead. The scale is a 64.64 fixed-point
    /// multiplier, so the product's high 64 bits are the tick count.
    pub fn reference_time(&self, tsc: u64) -> Option<u64> {
        if self.tsc_sequence == HV_REFERENCE_TSC_SEQUENCE_INVALID {
            return None;
        }
        let ticks = ((tsc as u128 * self.tsc_scale as u128) >> 64) as u64;
        Some(ticks.wrapping_add_signed(self.tsc_offset))
    }
}

/// Computes the 64.64 fixed-point reference TSC scale for a TSC frequency.
///
/// Truncating division: the error is below one part in 2^64 per tick, well
/// under the 100ns granularity of the reference time. `tsc_frequency` must
/// exceed [`HV_CLOCK_HZ`] (always true for a real TSC) or the scale does not
/// fit in 64 bits.
pub const fn reference_tsc_scale(tsc_frequency: u64) -> u64 {
    assert!(tsc_frequency > HV_CLOCK_HZ);
    (((HV_CLOCK_HZ as u128) << 64) / tsc_frequency as u128) as u64
}

/// The VP assist page MSR contents.
#[bitfield(u64)]
pub struct HvRegisterVpAssistPage {
    pub enabled: bool,
    #[bits(11)]
    _reserved: u64,
    #[bits(52)]
    pub gpa_page_number: u64,
}

/// Nested enlightenment controls in the VP assist page.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvNestedEnlightenmentsControl {
    pub direct_hypercall: bool,
    #[bits(31)]
    _reserved_features: u32,
    _reserved_hypercall_controls: u32,
}

/// The guest-visible prefix of the VP assist page.
#[repr(C)]
#[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvVpAssistPage {
    /// APIC assist for optimized EOI processing.
    pub apic_assist: u32,
    pub reserved_z0: u32,
    pub vtl_control: [u64; 3],
    pub nested_control: HvNestedEnlightenmentsControl,
    pub enlighten_vm_entry: u8,
    pub reserved_z1: [u8; 7],
    pub current_nested_vmcs: u64,
}

#[bitfield(u64)]
pub struct GuestCrashCtl {
    #[bits(58)]
    _reserved: u64,
    // ID of the pre-OS environment
    #[bits(3)]
    pub pre_os_id: u8,
    // Crash dump will not be captured
    #[bits(1)]
    pub no_crash_dump: bool,
    // `HV_X64_MSR_GUEST_CRASH_P3` is the GPA of the message,
    // `HV_X64_MSR_GUEST_CRASH_P4` is its length in bytes
    #[bits(1)]
    pub crash_message: bool,
    // Log contents of crash parameter system registers
    #[bits(1)]
    pub crash_notify: bool,
}

pub mod hypercall {
    use super::*;

    /// The hypercall input value.
    #[bitfield(u64)]
    pub struct Control {
        /// The hypercall code.
        pub code: u16,
        /// If this hypercall is a fast hypercall.
        pub fast: bool,
        /// The variable header size, in qwords.
        #[bits(10)]
        pub variable_header_size: usize,
        #[bits(4)]
        _rsvd0: u8,
        /// Specifies that the hypercall should be handled by the L0
        /// hypervisor in a nested environment.
        pub nested: bool,
        /// The element count for rep hypercalls.
        #[bits(12)]
        pub rep_count: usize,
        #[bits(4)]
        _rsvd1: u8,
        /// The first element to start processing in a rep hypercall.
        #[bits(12)]
        pub rep_start: usize,
        #[bits(4)]
        _rsvd2: u8,
    }

    /// The hypercall output value returned to the guest.
    ///
    /// Encoding always zeroes the reserved regions; this is the one
    /// intentional `encode(decode(x)) != x` exception in this crate.
    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[must_use]
    pub struct HypercallOutput {
        #[bits(16)]
        pub call_status: HvStatus,
        pub rsvd: u16,
        #[bits(12)]
        pub elements_processed: usize,
        #[bits(20)]
        pub rsvd2: u32,
    }

    impl From<HvError> for HypercallOutput {
        fn from(e: HvError) -> Self {
            Self::new().with_call_status(Err(e).into())
        }
    }

    impl HypercallOutput {
        /// A success output with zero elements processed.
        pub const SUCCESS: Self = Self::new();

        pub fn result(&self) -> Result<(), HvError> {
            self.call_status().result()
        }
    }

    /// The hypercall-enable MSR contents.
    ///
    /// Writes with nonzero `reserved_p` bits are rejected; the field is
    /// preserved (not masked) so reads round-trip what was stored.
    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct MsrHypercallContents {
        pub enable: bool,
        pub locked: bool,
        #[bits(10)]
        pub reserved_p: u64,
        #[bits(52)]
        pub gpn: u64,
    }

    #[repr(C, align(8))]
    #[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PostMessage {
        pub connection_id: u32,
        pub padding: u32,
        pub message_type: u32,
        pub payload_size: u32,
        pub payload: [u8; HV_MESSAGE_PAYLOAD_SIZE],
    }

    #[repr(C, align(8))]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct SignalEvent {
        pub connection_id: u32,
        pub flag_number: u16,
        pub rsvd: u16,
    }

    pub const HV_GENERIC_SET_SPARSE_4K: u64 = 0;
    pub const HV_GENERIC_SET_ALL: u64 = 1;

    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HvFlushFlags {
        pub all_processors: bool,
        pub all_virtual_address_spaces: bool,
        pub non_global_mappings_only: bool,
        pub use_extended_range_format: bool,
        #[bits(60)]
        _reserved: u64,
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FlushVirtualAddressSpace {
        pub address_space: u64,
        pub flags: HvFlushFlags,
        pub processor_mask: u64,
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FlushVirtualAddressSpaceEx {
        pub address_space: u64,
        pub flags: HvFlushFlags,
        // Followed by a generic VP set in the variable header.
    }

    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[repr(transparent)]
    pub struct HvGvaRange(pub u64);

    impl HvGvaRange {
        pub fn as_simple(self) -> HvGvaRangeSimple {
            HvGvaRangeSimple(self.0)
        }

        pub fn as_extended(self) -> HvGvaRangeExtended {
            HvGvaRangeExtended(self.0)
        }

        pub fn as_extended_large_page(self) -> HvGvaRangeExtendedLargePage {
            HvGvaRangeExtendedLargePage(self.0)
        }
    }

    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HvGvaRangeSimple {
        /// The number of pages beyond one.
        #[bits(12)]
        pub additional_pages: u64,
        /// The top 52 most significant bits of the guest virtual address.
        #[bits(52)]
        pub gva_page_number: u64,
    }

    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HvGvaRangeExtended {
        /// The number of pages beyond one.
        #[bits(11)]
        pub additional_pages: u64,
        /// Is page size greater than 4 KB.
        pub large_page: bool,
        /// The top 52 most significant bits of the guest virtual address when
        /// `large_page` is clear.
        #[bits(52)]
        pub gva_page_number: u64,
    }

    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HvGvaRangeExtendedLargePage {
        /// The number of pages beyond one.
        #[bits(11)]
        pub additional_pages: u64,
        /// Is page size greater than 4 KB.
        pub large_page: bool,
        /// The page size when `large_page` is set.
        /// false: 2 MB
        /// true: 1 GB
        pub page_size: bool,
        #[bits(8)]
        _reserved: u64,
        /// The top 43 most significant bits of the guest virtual address when
        /// `large_page` is set.
        #[bits(43)]
        pub gva_large_page_number: u64,
    }

    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[repr(transparent)]
    pub struct HvGpaRange(pub u64);

    impl HvGpaRange {
        pub fn as_simple(self) -> HvGpaRangeSimple {
            HvGpaRangeSimple(self.0)
        }

        pub fn as_extended(self) -> HvGpaRangeExtended {
            HvGpaRangeExtended(self.0)
        }

        pub fn as_extended_large_page(self) -> HvGpaRangeExtendedLargePage {
            HvGpaRangeExtendedLargePage(self.0)
        }
    }

    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HvGpaRangeSimple {
        /// The number of pages beyond one.
        #[bits(12)]
        pub additional_pages: u64,
        /// The top 52 most significant bits of the guest physical address.
        #[bits(52)]
        pub gpa_page_number: u64,
    }

    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HvGpaRangeExtended {
        /// The number of pages beyond one.
        #[bits(11)]
        pub additional_pages: u64,
        /// Is page size greater than 4 KB.
        pub large_page: bool,
        /// The top 52 most significant bits of the guest physical address
        /// when `large_page` is clear.
        #[bits(52)]
        pub gpa_page_number: u64,
    }

    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HvGpaRangeExtendedLargePage {
        /// The number of pages beyond one.
        #[bits(11)]
        pub additional_pages: u64,
        /// Is page size greater than 4 KB.
        pub large_page: bool,
        /// The page size when `large_page` is set.
        /// false: 2 MB
        /// true: 1 GB
        pub page_size: bool,
        #[bits(8)]
        _reserved: u64,
        /// The top 43 most significant bits of the guest physical address
        /// when `large_page` is set.
        #[bits(43)]
        pub gpa_large_page_number: u64,
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FlushGuestPhysicalAddressSpace {
        pub address_space: u64,
        pub flags: u64,
    }

    /// Header of the guest physical address flush-list input page; the
    /// [`HvGpaRange`] rep list follows.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FlushGuestPhysicalAddressList {
        pub address_space: u64,
        pub flags: u64,
    }

    /// The number of [`HvGpaRange`] entries that fit in a flush-list input
    /// page after the two header qwords. This capacity is derived from the
    /// page size, not tunable; callers with longer lists must split them
    /// into multiple hypercalls via `rep_start`.
    pub const HV_MAX_FLUSH_REP_COUNT: usize =
        (HV_PAGE_SIZE_USIZE - size_of::<FlushGuestPhysicalAddressList>()) / size_of::<HvGpaRange>();

    const_assert!(HV_MAX_FLUSH_REP_COUNT == 510);

    /// The lowest vector deliverable by a synthetic cluster IPI.
    pub const HV_IPI_LOW_VECTOR: u32 = 0x10;
    /// The highest vector deliverable by a synthetic cluster IPI.
    pub const HV_IPI_HIGH_VECTOR: u32 = 0xff;

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct SendSyntheticClusterIpi {
        pub vector: u32,
        pub reserved: u32,
        pub processor_mask: u64,
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct SendSyntheticClusterIpiEx {
        pub vector: u32,
        pub reserved: u32,
        // Followed by a generic VP set in the variable header.
    }
}

pub mod nested;

#[cfg(test)]
mod tests {
    use super::hypercall::Control;
    use super::hypercall::HypercallOutput;
    use super::hypercall::MsrHypercallContents;
    use super::*;

    #[test]
    fn hypercall_msr_round_trip() {
        // enable=1 with the page at GPA 0x1000.
        let hc = MsrHypercallContents::from(0x1001u64);
        assert!(hc.enable());
        assert!(!hc.locked());
        assert_eq!(hc.reserved_p(), 0);
        assert_eq!(hc.gpn(), 0x1);
        assert_eq!(u64::from(hc), 0x1001);

        let built = MsrHypercallContents::new().with_enable(true).with_gpn(0x1);
        assert_eq!(u64::from(built), 0x1001);
    }

    #[test]
    fn raw_values_round_trip() {
        // Reserved bits survive decode/encode untouched.
        for raw in [0u64, !0, 0x8000_0000_0000_0001, 0xdead_beef_f00d_cafe] {
            assert_eq!(u64::from(HvSynicSint::from(raw)), raw);
            assert_eq!(u64::from(HvSynicSimpSiefp::from(raw)), raw);
            assert_eq!(u64::from(HvSynicStimerConfig::from(raw)), raw);
            assert_eq!(u64::from(HvGuestOsId::from(raw)), raw);
            assert_eq!(u64::from(HvReenlightenmentControl::from(raw)), raw);
            assert_eq!(u64::from(Control::from(raw)), raw);
        }
    }

    #[test]
    fn new_values_have_zero_reserved_bits() {
        assert_eq!(u64::from(HvSynicSint::new().with_masked(true)), 1 << 16);
        assert_eq!(u64::from(HvSynicScontrol::new().with_enabled(true)), 1);
        assert_eq!(
            u64::from(HvRegisterReferenceTsc::new().with_enable(true).with_gpn(2)),
            (2 << 12) | 1
        );
    }

    #[test]
    fn control_word_fields() {
        // Bit positions from the published ABI: fast at 16, variable header
        // size at 17, rep count at 32, rep start at 48.
        let control = Control::new()
            .with_code(3)
            .with_variable_header_size(8)
            .with_rep_count(0x300)
            .with_rep_start(0x12);
        assert_eq!(
            u64::from(control),
            3 | (8 << 17) | (0x300 << 32) | (0x12 << 48)
        );

        let decoded = Control::from(u64::from(control));
        assert_eq!(decoded.code(), 3);
        assert!(!decoded.fast());
        assert_eq!(decoded.variable_header_size(), 8);
        assert_eq!(decoded.rep_count(), 0x300);
        assert_eq!(decoded.rep_start(), 0x12);

        assert_eq!(u64::from(Control::new().with_fast(true)), 1 << 16);
    }

    #[test]
    fn status_encoding() {
        let output = HypercallOutput::from(HvError::InsufficientBuffers).with_elements_processed(3);
        assert_eq!(output.call_status(), HvStatus(0x13));
        assert_eq!(output.elements_processed(), 3);
        assert_eq!(output.rsvd(), 0);

        assert!(HypercallOutput::SUCCESS.result().is_ok());
        assert_eq!(HvStatus::SUCCESS.result(), Ok(()));
        assert_eq!(HvStatus(0x13).result(), Err(HvError::InsufficientBuffers));
    }

    #[test]
    fn guest_os_id_fields() {
        let id = HvGuestOsId::from(0x8100_010d_0004_1f2cu64);
        assert_eq!(id.vendor(), HV_LINUX_VENDOR_ID);
        assert_eq!(id.os(), 0x01);
        assert_eq!(id.major(), 0x0d);
        assert_eq!(id.minor(), 0x00);
        assert_eq!(id.service_pack(), 0x04);
        assert_eq!(id.build_number(), 0x1f2c);
    }

    #[test]
    fn tsc_page_fallback_and_math() {
        let mut page = HvReferenceTscPage::new_zeroed();
        assert_eq!(page.reference_time(12345), None);

        // A power-of-two frequency keeps the fixed-point scale exact: one
        // second of TSC counts is exactly one second of 100ns ticks.
        page.tsc_sequence = 1;
        page.tsc_scale = reference_tsc_scale(1 << 31);
        assert_eq!(page.reference_time(1 << 31), Some(HV_CLOCK_HZ));

        page.tsc_offset = -45;
        assert_eq!(page.reference_time(1 << 31), Some(HV_CLOCK_HZ - 45));
    }

    #[test]
    fn message_payload_bounds() {
        let msg = HvMessage::new(HvMessageType::HvMessageTypeTimerExpired, 0, &[1, 2, 3]);
        assert_eq!(msg.header.len, 3);
        assert_eq!(msg.payload(), &[1, 2, 3]);
        assert!(!msg.header.flags.message_pending());
    }

    #[test]
    fn event_flag_banks() {
        let mut flags = HvSynicEventFlags::new_zeroed();
        assert!(flags.set(5));
        assert!(!flags.set(5));
        assert!(flags.set(2047));
        assert_eq!(flags.0[31], 1 << 63);
    }
}
