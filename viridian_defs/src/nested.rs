// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The enlightened VMCS: a flat, hypervisor-readable copy of the nested VMX
//! control state, with per-group clean bits that let the consuming
//! hypervisor skip resynchronizing state groups that have not changed since
//! the last VM entry.

use super::HV_PAGE_SIZE_USIZE;
use core::mem::size_of;
use static_assertions::const_assert;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The enlightened VMCS revision this implementation understands. A record
/// with any other revision must be treated as fully dirty and untrusted.
pub const HV_ENLIGHTENED_VMCS_REVISION: u32 = 1;

pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE: u32 = 0;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_IO_BITMAP: u32 = 1 << 0;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_MSR_BITMAP: u32 = 1 << 1;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2: u32 = 1 << 2;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP1: u32 = 1 << 3;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_PROC: u32 = 1 << 4;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_EVENT: u32 = 1 << 5;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_ENTRY: u32 = 1 << 6;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_EXCPN: u32 = 1 << 7;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR: u32 = 1 << 8;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_XLAT: u32 = 1 << 9;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_BASIC: u32 = 1 << 10;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1: u32 = 1 << 11;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2: u32 = 1 << 12;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_POINTER: u32 = 1 << 13;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1: u32 = 1 << 14;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_ENLIGHTENMENTSCONTROL: u32 = 1 << 15;
pub const HV_VMX_ENLIGHTENED_CLEAN_FIELD_ALL: u32 = 0xffff;

/// Typed view of the clean-field bitmap.
#[bitfield_struct::bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct EvmcsCleanFields {
    pub io_bitmap: bool,
    pub msr_bitmap: bool,
    pub control_grp2: bool,
    pub control_grp1: bool,
    pub control_proc: bool,
    pub control_event: bool,
    pub control_entry: bool,
    pub control_excpn: bool,
    pub crdr: bool,
    pub control_xlat: bool,
    pub guest_basic: bool,
    pub guest_grp1: bool,
    pub guest_grp2: bool,
    pub host_pointer: bool,
    pub host_grp1: bool,
    pub enlightenments_control: bool,
    #[bits(16)]
    _reserved: u32,
}

impl EvmcsCleanFields {
    /// Every group dirty: the consumer must resynchronize everything.
    pub const NONE: Self = Self::from_bits(HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE);
    /// Every group clean.
    pub const ALL: Self = Self::from_bits(HV_VMX_ENLIGHTENED_CLEAN_FIELD_ALL);
}

/// Per-VMCS enlightenment opt-ins.
#[bitfield_struct::bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EvmcsEnlightenmentsControl {
    pub nested_flush_hypercall: bool,
    pub msr_bitmap: bool,
    #[bits(30)]
    _reserved: u32,
}

/// The enlightened VMCS record.
///
/// Fields are not directly exposed: every mutator clears the clean bit of
/// the group the field belongs to, so a stale clean bit cannot be produced
/// through this API. Asserting a clean bit again is only possible through
/// [`Self::set_clean_fields`], which the consumer calls after it has
/// resynchronized.
#[repr(C)]
#[derive(Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EnlightenedVmcs {
    revision_id: u32,
    abort: u32,

    host_es_selector: u16,
    host_cs_selector: u16,
    host_ss_selector: u16,
    host_ds_selector: u16,
    host_fs_selector: u16,
    host_gs_selector: u16,
    host_tr_selector: u16,
    padding16_1: u16,

    host_ia32_pat: u64,
    host_ia32_efer: u64,
    host_cr0: u64,
    host_cr3: u64,
    host_cr4: u64,
    host_ia32_sysenter_esp: u64,
    host_ia32_sysenter_eip: u64,
    host_rip: u64,
    host_ia32_sysenter_cs: u32,

    pin_based_vm_exec_control: u32,
    vm_exit_controls: u32,
    secondary_vm_exec_control: u32,

    io_bitmap_a: u64,
    io_bitmap_b: u64,
    msr_bitmap: u64,

    guest_es_selector: u16,
    guest_cs_selector: u16,
    guest_ss_selector: u16,
    guest_ds_selector: u16,
    guest_fs_selector: u16,
    guest_gs_selector: u16,
    guest_ldtr_selector: u16,
    guest_tr_selector: u16,

    guest_es_limit: u32,
    guest_cs_limit: u32,
    guest_ss_limit: u32,
    guest_ds_limit: u32,
    guest_fs_limit: u32,
    guest_gs_limit: u32,
    guest_ldtr_limit: u32,
    guest_tr_limit: u32,
    guest_gdtr_limit: u32,
    guest_idtr_limit: u32,

    guest_es_ar_bytes: u32,
    guest_cs_ar_bytes: u32,
    guest_ss_ar_bytes: u32,
    guest_ds_ar_bytes: u32,
    guest_fs_ar_bytes: u32,
    guest_gs_ar_bytes: u32,
    guest_ldtr_ar_bytes: u32,
    guest_tr_ar_bytes: u32,

    guest_es_base: u64,
    guest_cs_base: u64,
    guest_ss_base: u64,
    guest_ds_base: u64,
    guest_fs_base: u64,
    guest_gs_base: u64,
    guest_ldtr_base: u64,
    guest_tr_base: u64,
    guest_gdtr_base: u64,
    guest_idtr_base: u64,

    padding64_1: [u64; 3],

    vm_exit_msr_store_addr: u64,
    vm_exit_msr_load_addr: u64,
    vm_entry_msr_load_addr: u64,

    cr3_target_value0: u64,
    cr3_target_value1: u64,
    cr3_target_value2: u64,
    cr3_target_value3: u64,

    page_fault_error_code_mask: u32,
    page_fault_error_code_match: u32,

    cr3_target_count: u32,
    vm_exit_msr_store_count: u32,
    vm_exit_msr_load_count: u32,
    vm_entry_msr_load_count: u32,

    tsc_offset: u64,
    virtual_apic_page_addr: u64,
    vmcs_link_pointer: u64,

    guest_ia32_debugctl: u64,
    guest_ia32_pat: u64,
    guest_ia32_efer: u64,

    guest_pdptr0: u64,
    guest_pdptr1: u64,
    guest_pdptr2: u64,
    guest_pdptr3: u64,

    guest_pending_dbg_exceptions: u64,
    guest_sysenter_esp: u64,
    guest_sysenter_eip: u64,

    guest_activity_state: u32,
    guest_sysenter_cs: u32,

    cr0_guest_host_mask: u64,
    cr4_guest_host_mask: u64,
    cr0_read_shadow: u64,
    cr4_read_shadow: u64,
    guest_cr0: u64,
    guest_cr3: u64,
    guest_cr4: u64,
    guest_dr7: u64,

    host_fs_base: u64,
    host_gs_base: u64,
    host_tr_base: u64,
    host_gdtr_base: u64,
    host_idtr_base: u64,
    host_rsp: u64,

    ept_pointer: u64,

    virtual_processor_id: u16,
    padding16_2: [u16; 3],

    padding64_2: [u64; 5],
    guest_physical_address: u64,

    vm_instruction_error: u32,
    vm_exit_reason: u32,
    vm_exit_intr_info: u32,
    vm_exit_intr_error_code: u32,
    idt_vectoring_info_field: u32,
    idt_vectoring_error_code: u32,
    vm_exit_instruction_len: u32,
    vmx_instruction_info: u32,

    exit_qualification: u64,
    exit_io_instruction_ecx: u64,
    exit_io_instruction_esi: u64,
    exit_io_instruction_edi: u64,
    exit_io_instruction_eip: u64,

    guest_linear_address: u64,
    guest_rsp: u64,
    guest_rflags: u64,

    guest_interruptibility_info: u32,
    cpu_based_vm_exec_control: u32,
    exception_bitmap: u32,
    vm_entry_controls: u32,
    vm_entry_intr_info_field: u32,
    vm_entry_exception_error_code: u32,
    vm_entry_instruction_len: u32,
    tpr_threshold: u32,

    guest_rip: u64,

    hv_clean_fields: u32,
    hv_padding_32: u32,
    hv_synthetic_controls: u32,
    hv_enlightenments_control: EvmcsEnlightenmentsControl,
    hv_vp_id: u32,
    // The C layout pads here to realign the following u64.
    padding32_2: u32,

    hv_vm_id: u64,
    partition_assist_page: u64,
    padding64_4: [u64; 4],
    guest_bndcfgs: u64,
    padding64_5: [u64; 7],
    xss_exit_bitmap: u64,
    padding64_6: [u64; 7],
}

const_assert!(size_of::<EnlightenedVmcs>() == 1024);
const_assert!(size_of::<EnlightenedVmcs>() <= HV_PAGE_SIZE_USIZE);

impl EnlightenedVmcs {
    /// Returns the revision ID of the record.
    pub fn revision_id(&self) -> u32 {
        self.revision_id
    }

    /// Sets the revision ID.
    pub fn set_revision_id(&mut self, value: u32) {
        self.revision_id = value;
    }

    /// Returns the abort indicator.
    pub fn abort(&self) -> u32 {
        self.abort
    }

    /// Sets the abort indicator. Written by the consuming hypervisor, not
    /// tracked by any clean-field group.
    pub fn set_abort(&mut self, value: u32) {
        self.abort = value;
    }

    /// Returns the raw clean-field bitmap.
    pub fn clean_fields(&self) -> EvmcsCleanFields {
        EvmcsCleanFields::from_bits(self.hv_clean_fields)
    }

    /// Replaces the clean-field bitmap.
    ///
    /// [`EvmcsCleanFields::ALL`] is what the consumer stores once it has
    /// fully resynchronized; [`EvmcsCleanFields::NONE`] forces a full
    /// resynchronization on the next VM entry.
    pub fn set_clean_fields(&mut self, value: EvmcsCleanFields) {
        self.hv_clean_fields = value.into_bits();
    }

    /// Returns the clean-field bitmap the consumer may trust: groups marked
    /// clean in a record with a valid revision, or nothing otherwise.
    pub fn validated_clean_fields(&self) -> EvmcsCleanFields {
        if self.revision_id == HV_ENLIGHTENED_VMCS_REVISION {
            self.clean_fields()
        } else {
            EvmcsCleanFields::NONE
        }
    }
}

/// Generates a getter/setter pair per field; the setter clears the owning
/// group's clean bit so a mutation can never leave a stale clean bit behind.
macro_rules! evmcs_access {
    ($($field:ident / $set:ident: $ty:ty => $group:expr;)*) => {
        impl EnlightenedVmcs {
            $(
                pub fn $field(&self) -> $ty {
                    self.$field
                }

                pub fn $set(&mut self, value: $ty) {
                    self.$field = value;
                    self.hv_clean_fields &= !$group;
                }
            )*
        }
    };
}

evmcs_access! {
    io_bitmap_a / set_io_bitmap_a: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_IO_BITMAP;
    io_bitmap_b / set_io_bitmap_b: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_IO_BITMAP;

    msr_bitmap / set_msr_bitmap: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_MSR_BITMAP;

    vm_exit_msr_store_addr / set_vm_exit_msr_store_addr: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    vm_exit_msr_load_addr / set_vm_exit_msr_load_addr: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    vm_entry_msr_load_addr / set_vm_entry_msr_load_addr: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    cr3_target_value0 / set_cr3_target_value0: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    cr3_target_value1 / set_cr3_target_value1: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    cr3_target_value2 / set_cr3_target_value2: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    cr3_target_value3 / set_cr3_target_value3: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    page_fault_error_code_mask / set_page_fault_error_code_mask: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    page_fault_error_code_match / set_page_fault_error_code_match: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    cr3_target_count / set_cr3_target_count: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    vm_exit_msr_store_count / set_vm_exit_msr_store_count: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    vm_exit_msr_load_count / set_vm_exit_msr_load_count: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    vm_entry_msr_load_count / set_vm_entry_msr_load_count: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    tsc_offset / set_tsc_offset: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    virtual_apic_page_addr / set_virtual_apic_page_addr: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;
    vmcs_link_pointer / set_vmcs_link_pointer: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP2;

    pin_based_vm_exec_control / set_pin_based_vm_exec_control: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP1;
    vm_exit_controls / set_vm_exit_controls: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP1;
    secondary_vm_exec_control / set_secondary_vm_exec_control: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_GRP1;

    cpu_based_vm_exec_control / set_cpu_based_vm_exec_control: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_PROC;
    tpr_threshold / set_tpr_threshold: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_PROC;

    vm_entry_intr_info_field / set_vm_entry_intr_info_field: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_EVENT;
    vm_entry_exception_error_code / set_vm_entry_exception_error_code: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_EVENT;
    vm_entry_instruction_len / set_vm_entry_instruction_len: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_EVENT;

    vm_entry_controls / set_vm_entry_controls: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_ENTRY;

    exception_bitmap / set_exception_bitmap: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_EXCPN;

    cr0_guest_host_mask / set_cr0_guest_host_mask: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR;
    cr4_guest_host_mask / set_cr4_guest_host_mask: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR;
    cr0_read_shadow / set_cr0_read_shadow: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR;
    cr4_read_shadow / set_cr4_read_shadow: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR;
    guest_cr0 / set_guest_cr0: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR;
    guest_cr3 / set_guest_cr3: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR;
    guest_cr4 / set_guest_cr4: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR;
    guest_dr7 / set_guest_dr7: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR;

    ept_pointer / set_ept_pointer: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_XLAT;
    virtual_processor_id / set_virtual_processor_id: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_XLAT;

    guest_rsp / set_guest_rsp: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_BASIC;
    guest_rflags / set_guest_rflags: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_BASIC;
    guest_rip / set_guest_rip: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_BASIC;
    guest_interruptibility_info / set_guest_interruptibility_info: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_BASIC;

    guest_ia32_debugctl / set_guest_ia32_debugctl: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_ia32_pat / set_guest_ia32_pat: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_ia32_efer / set_guest_ia32_efer: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_pdptr0 / set_guest_pdptr0: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_pdptr1 / set_guest_pdptr1: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_pdptr2 / set_guest_pdptr2: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_pdptr3 / set_guest_pdptr3: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_pending_dbg_exceptions / set_guest_pending_dbg_exceptions: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_sysenter_esp / set_guest_sysenter_esp: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_sysenter_eip / set_guest_sysenter_eip: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_activity_state / set_guest_activity_state: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_sysenter_cs / set_guest_sysenter_cs: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    guest_bndcfgs / set_guest_bndcfgs: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;
    xss_exit_bitmap / set_xss_exit_bitmap: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP1;

    guest_es_selector / set_guest_es_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_cs_selector / set_guest_cs_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ss_selector / set_guest_ss_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ds_selector / set_guest_ds_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_fs_selector / set_guest_fs_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_gs_selector / set_guest_gs_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ldtr_selector / set_guest_ldtr_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_tr_selector / set_guest_tr_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_es_limit / set_guest_es_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_cs_limit / set_guest_cs_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ss_limit / set_guest_ss_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ds_limit / set_guest_ds_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_fs_limit / set_guest_fs_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_gs_limit / set_guest_gs_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ldtr_limit / set_guest_ldtr_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_tr_limit / set_guest_tr_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_gdtr_limit / set_guest_gdtr_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_idtr_limit / set_guest_idtr_limit: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_es_ar_bytes / set_guest_es_ar_bytes: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_cs_ar_bytes / set_guest_cs_ar_bytes: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ss_ar_bytes / set_guest_ss_ar_bytes: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ds_ar_bytes / set_guest_ds_ar_bytes: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_fs_ar_bytes / set_guest_fs_ar_bytes: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_gs_ar_bytes / set_guest_gs_ar_bytes: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ldtr_ar_bytes / set_guest_ldtr_ar_bytes: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_tr_ar_bytes / set_guest_tr_ar_bytes: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_es_base / set_guest_es_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_cs_base / set_guest_cs_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ss_base / set_guest_ss_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ds_base / set_guest_ds_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_fs_base / set_guest_fs_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_gs_base / set_guest_gs_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_ldtr_base / set_guest_ldtr_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_tr_base / set_guest_tr_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_gdtr_base / set_guest_gdtr_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;
    guest_idtr_base / set_guest_idtr_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_GRP2;

    host_rip / set_host_rip: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_POINTER;
    host_rsp / set_host_rsp: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_POINTER;

    host_es_selector / set_host_es_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_cs_selector / set_host_cs_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_ss_selector / set_host_ss_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_ds_selector / set_host_ds_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_fs_selector / set_host_fs_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_gs_selector / set_host_gs_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_tr_selector / set_host_tr_selector: u16 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_ia32_pat / set_host_ia32_pat: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_ia32_efer / set_host_ia32_efer: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_cr0 / set_host_cr0: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_cr3 / set_host_cr3: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_cr4 / set_host_cr4: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_ia32_sysenter_esp / set_host_ia32_sysenter_esp: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_ia32_sysenter_eip / set_host_ia32_sysenter_eip: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_ia32_sysenter_cs / set_host_ia32_sysenter_cs: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_fs_base / set_host_fs_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_gs_base / set_host_gs_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_tr_base / set_host_tr_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_gdtr_base / set_host_gdtr_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;
    host_idtr_base / set_host_idtr_base: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_GRP1;

    hv_enlightenments_control / set_hv_enlightenments_control: EvmcsEnlightenmentsControl => HV_VMX_ENLIGHTENED_CLEAN_FIELD_ENLIGHTENMENTSCONTROL;
    hv_synthetic_controls / set_hv_synthetic_controls: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_ENLIGHTENMENTSCONTROL;
    hv_vp_id / set_hv_vp_id: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_ENLIGHTENMENTSCONTROL;
    hv_vm_id / set_hv_vm_id: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_ENLIGHTENMENTSCONTROL;
    partition_assist_page / set_partition_assist_page: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_ENLIGHTENMENTSCONTROL;

    // Exit information is written by the hypervisor on the way out of a VM
    // exit; it belongs to no clean-field group.
    vm_instruction_error / set_vm_instruction_error: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    vm_exit_reason / set_vm_exit_reason: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    vm_exit_intr_info / set_vm_exit_intr_info: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    vm_exit_intr_error_code / set_vm_exit_intr_error_code: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    idt_vectoring_info_field / set_idt_vectoring_info_field: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    idt_vectoring_error_code / set_idt_vectoring_error_code: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    vm_exit_instruction_len / set_vm_exit_instruction_len: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    vmx_instruction_info / set_vmx_instruction_info: u32 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    exit_qualification / set_exit_qualification: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    exit_io_instruction_ecx / set_exit_io_instruction_ecx: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    exit_io_instruction_esi / set_exit_io_instruction_esi: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    exit_io_instruction_edi / set_exit_io_instruction_edi: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    exit_io_instruction_eip / set_exit_io_instruction_eip: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    guest_linear_address / set_guest_linear_address: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
    guest_physical_address / set_guest_physical_address: u64 => HV_VMX_ENLIGHTENED_CLEAN_FIELD_NONE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    fn all_clean() -> EnlightenedVmcs {
        let mut vmcs = EnlightenedVmcs::new_zeroed();
        vmcs.set_revision_id(HV_ENLIGHTENED_VMCS_REVISION);
        vmcs.set_clean_fields(EvmcsCleanFields::ALL);
        vmcs
    }

    #[test]
    fn setters_clear_exactly_their_group() {
        let mut vmcs = all_clean();
        vmcs.set_guest_rip(0x1000);
        assert!(!vmcs.clean_fields().guest_basic());
        assert_eq!(
            vmcs.clean_fields().into_bits(),
            HV_VMX_ENLIGHTENED_CLEAN_FIELD_ALL & !HV_VMX_ENLIGHTENED_CLEAN_FIELD_GUEST_BASIC
        );
        assert_eq!(vmcs.guest_rip(), 0x1000);

        let mut vmcs = all_clean();
        vmcs.set_guest_cr3(0xbeef_0000);
        assert_eq!(
            vmcs.clean_fields().into_bits(),
            HV_VMX_ENLIGHTENED_CLEAN_FIELD_ALL & !HV_VMX_ENLIGHTENED_CLEAN_FIELD_CRDR
        );

        let mut vmcs = all_clean();
        vmcs.set_host_rsp(8);
        vmcs.set_exception_bitmap(1);
        assert_eq!(
            vmcs.clean_fields().into_bits(),
            HV_VMX_ENLIGHTENED_CLEAN_FIELD_ALL
                & !HV_VMX_ENLIGHTENED_CLEAN_FIELD_HOST_POINTER
                & !HV_VMX_ENLIGHTENED_CLEAN_FIELD_CONTROL_EXCPN
        );
    }

    #[test]
    fn exit_information_does_not_dirty_groups() {
        let mut vmcs = all_clean();
        vmcs.set_vm_exit_reason(48);
        vmcs.set_exit_qualification(0x184);
        assert_eq!(vmcs.clean_fields(), EvmcsCleanFields::ALL);
    }

    #[test]
    fn invalid_revision_is_fully_dirty() {
        let mut vmcs = all_clean();
        assert_eq!(vmcs.validated_clean_fields(), EvmcsCleanFields::ALL);
        vmcs.set_revision_id(2);
        assert_eq!(vmcs.validated_clean_fields(), EvmcsCleanFields::NONE);
    }
}
