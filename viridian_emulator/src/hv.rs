// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hypervisor MSR emulation.

use crate::GuestPages;
use crate::MsrError;
use crate::PageAccessError;
use crate::ReferenceTimeSource;
use crate::VpIndex;
use crate::synic::GlobalSynic;
use crate::synic::ProcessorSynic;
use parking_lot::Mutex;
use std::mem::offset_of;
use std::sync::Arc;
use viridian_defs::GuestCrashCtl;
use viridian_defs::HV_PAGE_SIZE;
use viridian_defs::HV_PAGE_SIZE_USIZE;
use viridian_defs::HV_REFERENCE_TSC_SEQUENCE_INVALID;
use viridian_defs::HV_X64_GUEST_CRASH_PARAMETER_MSRS;
use viridian_defs::HvNestedEnlightenmentsControl;
use viridian_defs::HvReenlightenmentControl;
use viridian_defs::HvReferenceTscPage;
use viridian_defs::HvRegisterReferenceTsc;
use viridian_defs::HvRegisterVpAssistPage;
use viridian_defs::HvTscEmulationControl;
use viridian_defs::HvTscEmulationStatus;
use viridian_defs::HvVpAssistPage;
use viridian_defs::hypercall::MsrHypercallContents;
use viridian_defs::nested::EnlightenedVmcs;
use viridian_defs::nested::EvmcsCleanFields;
use viridian_defs::reference_tsc_scale;

/// The partition-wide hypervisor state.
pub struct GlobalHv {
    partition_state: Arc<GlobalHvState>,
    mutable_state: Arc<Mutex<MutableHvState>>,
    /// The partition-wide synic state.
    pub synic: GlobalSynic,
}

struct GlobalHvState {
    vendor: Vendor,
    ref_time: Arc<dyn ReferenceTimeSource>,
    tsc_frequency: u64,
    is_ref_time_backed_by_tsc: bool,
}

struct MutableHvState {
    hypercall_reg: MsrHypercallContents,
    guest_os_id: viridian_defs::HvGuestOsId,
    reference_tsc_reg: HvRegisterReferenceTsc,
    tsc_sequence: u32,
    reenlightenment_control: HvReenlightenmentControl,
    tsc_emulation_control: HvTscEmulationControl,
    tsc_emulation_status: HvTscEmulationStatus,
    crash_parameters: [u64; HV_X64_GUEST_CRASH_PARAMETER_MSRS],
    crash_control: GuestCrashCtl,
}

impl MutableHvState {
    fn new() -> Self {
        Self {
            hypercall_reg: MsrHypercallContents::new(),
            guest_os_id: viridian_defs::HvGuestOsId::new(),
            reference_tsc_reg: HvRegisterReferenceTsc::new(),
            tsc_sequence: 0,
            reenlightenment_control: HvReenlightenmentControl::new(),
            tsc_emulation_control: HvTscEmulationControl::new(),
            tsc_emulation_status: HvTscEmulationStatus::new(),
            crash_parameters: [0; HV_X64_GUEST_CRASH_PARAMETER_MSRS],
            crash_control: GuestCrashCtl::new(),
        }
    }

    /// Publishes new reference TSC page contents using the versioned
    /// snapshot discipline: invalidate the sequence, store the payload, then
    /// expose the new nonzero sequence last. A reader that samples the same
    /// nonzero sequence around scale and offset has a consistent pair.
    fn publish_reference_tsc(
        &mut self,
        guest_memory: &impl GuestPages,
        tsc_scale: u64,
        tsc_offset: i64,
    ) -> Result<(), PageAccessError> {
        let gpa = self.reference_tsc_reg.gpn() * HV_PAGE_SIZE;
        guest_memory.write_plain(
            gpa + offset_of!(HvReferenceTscPage, tsc_sequence) as u64,
            &HV_REFERENCE_TSC_SEQUENCE_INVALID,
        )?;
        guest_memory.write_plain(
            gpa + offset_of!(HvReferenceTscPage, tsc_scale) as u64,
            &tsc_scale,
        )?;
        guest_memory.write_plain(
            gpa + offset_of!(HvReferenceTscPage, tsc_offset) as u64,
            &tsc_offset,
        )?;

        self.tsc_sequence = self.tsc_sequence.wrapping_add(1);
        if self.tsc_sequence == HV_REFERENCE_TSC_SEQUENCE_INVALID {
            self.tsc_sequence = self.tsc_sequence.wrapping_add(1);
        }
        guest_memory.write_plain(
            gpa + offset_of!(HvReferenceTscPage, tsc_sequence) as u64,
            &self.tsc_sequence,
        )?;
        Ok(())
    }
}

/// The virtual processor vendor, which determines the hypercall instruction
/// encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Vendor {
    /// Use `vmcall`.
    Intel,
    /// Use `vmmcall`.
    Amd,
}

/// Parameters used when constructing a [`GlobalHv`].
pub struct GlobalHvParams {
    /// The maximum VP count for the VM.
    pub max_vp_count: u32,
    /// The vendor of the virtual processor.
    pub vendor: Vendor,
    /// The TSC frequency.
    pub tsc_frequency: u64,
    /// If true, the reference time is backed by the TSC, with an implicit
    /// offset of zero, and the reference TSC page is published when the
    /// guest enables it.
    pub is_ref_time_backed_by_tsc: bool,
    /// The reference time system to use.
    pub ref_time: Arc<dyn ReferenceTimeSource>,
}

impl GlobalHv {
    /// Returns a new hypervisor emulator instance.
    pub fn new(params: GlobalHvParams) -> Self {
        Self {
            partition_state: Arc::new(GlobalHvState {
                vendor: params.vendor,
                tsc_frequency: params.tsc_frequency,
                is_ref_time_backed_by_tsc: params.is_ref_time_backed_by_tsc,
                ref_time: params.ref_time,
            }),
            mutable_state: Arc::new(Mutex::new(MutableHvState::new())),
            synic: GlobalSynic::new(params.max_vp_count),
        }
    }

    /// Adds a virtual processor.
    pub fn add_vp(&self, vp_index: VpIndex) -> ProcessorHv {
        ProcessorHv {
            vp_index,
            partition_state: self.partition_state.clone(),
            shared_state: self.mutable_state.clone(),
            synic: self.synic.add_vp(vp_index),
            vp_assist_page_reg: HvRegisterVpAssistPage::new(),
        }
    }

    /// Resets the global (but not per-processor) state.
    pub fn reset(&self) {
        *self.mutable_state.lock() = MutableHvState::new();
        // There is no global synic state to reset, since the synic is
        // per-VP.
    }

    /// The current guest_os_id value.
    pub fn guest_os_id(&self) -> viridian_defs::HvGuestOsId {
        self.mutable_state.lock().guest_os_id
    }

    /// Returns the reference time source.
    pub fn ref_time_source(&self) -> &Arc<dyn ReferenceTimeSource> {
        &self.partition_state.ref_time
    }

    /// Publishes a new scale and offset to the reference TSC page.
    ///
    /// This is the global-time owner's path for updating the page, used when
    /// the TSC relationship changes (for example after a migration). Returns
    /// false if the guest has not enabled the page.
    pub fn publish_reference_tsc(
        &self,
        guest_memory: &impl GuestPages,
        tsc_scale: u64,
        tsc_offset: i64,
    ) -> bool {
        let mut mutable = self.mutable_state.lock();
        if !mutable.reference_tsc_reg.enable() {
            return false;
        }
        if let Err(err) = mutable.publish_reference_tsc(guest_memory, tsc_scale, tsc_offset) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to publish reference tsc page"
            );
            return false;
        }
        true
    }
}

/// A virtual processor's hypervisor state.
pub struct ProcessorHv {
    vp_index: VpIndex,
    partition_state: Arc<GlobalHvState>,
    shared_state: Arc<Mutex<MutableHvState>>,
    /// The virtual processor's synic state.
    pub synic: ProcessorSynic,
    vp_assist_page_reg: HvRegisterVpAssistPage,
}

impl ProcessorHv {
    /// The current reference time, in 100ns units.
    pub fn ref_time_now(&self) -> u64 {
        self.partition_state.ref_time.now_100ns()
    }

    /// Resets the processor's state.
    pub fn reset(&mut self) {
        let Self {
            vp_index: _,
            partition_state: _,
            shared_state: _,
            synic,
            vp_assist_page_reg,
        } = self;

        synic.reset();
        *vp_assist_page_reg = HvRegisterVpAssistPage::new();
    }

    /// Emulates an MSR write for the guest OS ID MSR.
    pub fn msr_write_guest_os_id(&mut self, v: u64) {
        self.shared_state.lock().guest_os_id = v.into();
    }

    /// Emulates an MSR write for the VP assist page MSR.
    pub fn msr_write_vp_assist_page(&mut self, v: u64) -> Result<(), MsrError> {
        if v & !u64::from(
            HvRegisterVpAssistPage::new()
                .with_enabled(true)
                .with_gpa_page_number(!0 >> 12),
        ) != 0
        {
            return Err(MsrError::InvalidAccess);
        }
        self.vp_assist_page_reg = HvRegisterVpAssistPage::from(v);
        Ok(())
    }

    /// Emulates a synthetic MSR write.
    pub fn msr_write(
        &mut self,
        guest_memory: &impl GuestPages,
        n: u32,
        v: u64,
    ) -> Result<(), MsrError> {
        match n {
            viridian_defs::HV_X64_MSR_GUEST_OS_ID => {
                self.msr_write_guest_os_id(v);
            }
            viridian_defs::HV_X64_MSR_HYPERCALL => {
                let mut mutable = self.shared_state.lock();
                if mutable.hypercall_reg.locked() {
                    return Err(MsrError::InvalidAccess);
                }
                let hc = MsrHypercallContents::from(v);
                if hc.reserved_p() != 0 {
                    return Err(MsrError::InvalidAccess);
                }
                if hc.enable()
                    && (!mutable.hypercall_reg.enable() || hc.gpn() != mutable.hypercall_reg.gpn())
                {
                    self.write_hypercall_page(guest_memory, hc.gpn())
                        .map_err(|_| MsrError::InvalidAccess)?;
                }
                mutable.hypercall_reg = hc;
            }
            viridian_defs::HV_X64_MSR_VP_INDEX => return Err(MsrError::InvalidAccess),
            viridian_defs::HV_X64_MSR_TIME_REF_COUNT => return Err(MsrError::InvalidAccess),
            viridian_defs::HV_X64_MSR_REFERENCE_TSC => {
                let mut mutable = self.shared_state.lock();
                let v = HvRegisterReferenceTsc::from(v);
                if v.reserved_p() != 0 {
                    return Err(MsrError::InvalidAccess);
                }
                if v.enable()
                    && (!mutable.reference_tsc_reg.enable()
                        || mutable.reference_tsc_reg.gpn() != v.gpn())
                {
                    guest_memory
                        .fill_at(v.gpn() * HV_PAGE_SIZE, 0, HV_PAGE_SIZE_USIZE)
                        .map_err(|_| MsrError::InvalidAccess)?;
                    mutable.reference_tsc_reg = v;
                    if self.partition_state.is_ref_time_backed_by_tsc {
                        let tsc_scale = reference_tsc_scale(self.partition_state.tsc_frequency);
                        mutable
                            .publish_reference_tsc(guest_memory, tsc_scale, 0)
                            .map_err(|_| MsrError::InvalidAccess)?;
                    }
                }
                mutable.reference_tsc_reg = v;
            }
            viridian_defs::HV_X64_MSR_TSC_FREQUENCY => return Err(MsrError::InvalidAccess),
            viridian_defs::HV_X64_MSR_VP_ASSIST_PAGE => self.msr_write_vp_assist_page(v)?,
            viridian_defs::HV_X64_MSR_REENLIGHTENMENT_CONTROL => {
                if v & !u64::from(
                    HvReenlightenmentControl::new()
                        .with_vector(!0)
                        .with_enabled(true)
                        .with_target_vp(!0),
                ) != 0
                {
                    return Err(MsrError::InvalidAccess);
                }
                self.shared_state.lock().reenlightenment_control = v.into();
            }
            viridian_defs::HV_X64_MSR_TSC_EMULATION_CONTROL => {
                if v & !u64::from(HvTscEmulationControl::new().with_enabled(true)) != 0 {
                    return Err(MsrError::InvalidAccess);
                }
                self.shared_state.lock().tsc_emulation_control = v.into();
            }
            viridian_defs::HV_X64_MSR_TSC_EMULATION_STATUS => {
                if v & !u64::from(HvTscEmulationStatus::new().with_in_progress(true)) != 0 {
                    return Err(MsrError::InvalidAccess);
                }
                self.shared_state.lock().tsc_emulation_status = v.into();
            }
            msr @ viridian_defs::HV_X64_MSR_GUEST_CRASH_P0
                ..=viridian_defs::HV_X64_MSR_GUEST_CRASH_P4 => {
                let index = (msr - viridian_defs::HV_X64_MSR_GUEST_CRASH_P0) as usize;
                self.shared_state.lock().crash_parameters[index] = v;
            }
            viridian_defs::HV_X64_MSR_GUEST_CRASH_CTL => {
                let ctl = GuestCrashCtl::from(v);
                let mut mutable = self.shared_state.lock();
                if ctl.crash_notify() {
                    tracing::error!(
                        vp = self.vp_index.index(),
                        p0 = mutable.crash_parameters[0],
                        p1 = mutable.crash_parameters[1],
                        p2 = mutable.crash_parameters[2],
                        p3 = mutable.crash_parameters[3],
                        p4 = mutable.crash_parameters[4],
                        "guest crash notification"
                    );
                }
                mutable.crash_control = ctl;
            }
            msr @ viridian_defs::HV_X64_MSR_SCONTROL
                ..=viridian_defs::HV_X64_MSR_STIMER3_COUNT => {
                self.synic.write_msr(guest_memory, msr, v)?
            }
            _ => return Err(MsrError::Unknown),
        }
        Ok(())
    }

    /// Writes the hypercall instruction sequence into the guest-supplied
    /// hypercall code page.
    fn write_hypercall_page(
        &self,
        guest_memory: &impl GuestPages,
        gpn: u64,
    ) -> Result<(), PageAccessError> {
        let gpa = gpn * HV_PAGE_SIZE;

        // Fill the page with int3 to catch invalid jumps into the page.
        let int3 = 0xcc;
        guest_memory.fill_at(gpa, int3, HV_PAGE_SIZE_USIZE)?;

        let page_contents: &[u8] = match self.partition_state.vendor {
            Vendor::Amd => &AMD_HYPERCALL_PAGE,
            Vendor::Intel => &INTEL_HYPERCALL_PAGE,
        };

        guest_memory.write_at(gpa, page_contents)
    }

    /// Emulates a synthetic MSR read.
    pub fn msr_read(&self, n: u32) -> Result<u64, MsrError> {
        let v = match n {
            viridian_defs::HV_X64_MSR_GUEST_OS_ID => self.shared_state.lock().guest_os_id.into(),
            viridian_defs::HV_X64_MSR_HYPERCALL => self.shared_state.lock().hypercall_reg.into(),
            viridian_defs::HV_X64_MSR_VP_INDEX => self.vp_index.index() as u64,
            viridian_defs::HV_X64_MSR_TIME_REF_COUNT => {
                self.partition_state.ref_time.now_100ns()
            }
            viridian_defs::HV_X64_MSR_REFERENCE_TSC => {
                self.shared_state.lock().reference_tsc_reg.into()
            }
            viridian_defs::HV_X64_MSR_TSC_FREQUENCY => self.partition_state.tsc_frequency,
            viridian_defs::HV_X64_MSR_VP_ASSIST_PAGE => self.vp_assist_page_reg.into(),
            viridian_defs::HV_X64_MSR_REENLIGHTENMENT_CONTROL => {
                self.shared_state.lock().reenlightenment_control.into()
            }
            viridian_defs::HV_X64_MSR_TSC_EMULATION_CONTROL => {
                self.shared_state.lock().tsc_emulation_control.into()
            }
            viridian_defs::HV_X64_MSR_TSC_EMULATION_STATUS => {
                self.shared_state.lock().tsc_emulation_status.into()
            }
            msr @ viridian_defs::HV_X64_MSR_GUEST_CRASH_P0
                ..=viridian_defs::HV_X64_MSR_GUEST_CRASH_P4 => {
                let index = (msr - viridian_defs::HV_X64_MSR_GUEST_CRASH_P0) as usize;
                self.shared_state.lock().crash_parameters[index]
            }
            viridian_defs::HV_X64_MSR_GUEST_CRASH_CTL => {
                self.shared_state.lock().crash_control.into()
            }
            msr @ viridian_defs::HV_X64_MSR_SCONTROL
                ..=viridian_defs::HV_X64_MSR_STIMER3_COUNT => self.synic.read_msr(msr)?,
            _ => {
                return Err(MsrError::Unknown);
            }
        };
        Ok(v)
    }

    /// Returns the current value of the VP assist page register.
    pub fn vp_assist_page(&self) -> u64 {
        self.vp_assist_page_reg.into()
    }

    fn vp_assist_gpa(&self) -> Option<u64> {
        self.vp_assist_page_reg
            .enabled()
            .then(|| self.vp_assist_page_reg.gpa_page_number() * HV_PAGE_SIZE)
    }

    /// Sets the lazy EOI bit in the VP assist page.
    ///
    /// If this returns true, the caller must call `clear_lazy_eoi` after the
    /// next VP exit but before manipulating the APIC.
    #[must_use]
    pub fn set_lazy_eoi(&mut self, guest_memory: &impl GuestPages) -> bool {
        let Some(gpa) = self.vp_assist_gpa() else {
            return false;
        };
        let offset = offset_of!(HvVpAssistPage, apic_assist) as u64;
        let v = 1u32;
        guest_memory.write_plain(gpa + offset, &v).is_ok()
    }

    /// Clears the lazy EOI bit in the VP assist page.
    ///
    /// Must only be called if `set_lazy_eoi` returned true.
    ///
    /// If the bit was already clear, returns true; the caller must then send
    /// an EOI to the APIC.
    #[must_use]
    pub fn clear_lazy_eoi(&mut self, guest_memory: &impl GuestPages) -> bool {
        let gpa = self.vp_assist_gpa().expect("assist page was enabled");
        let offset = offset_of!(HvVpAssistPage, apic_assist) as u64;
        let v: u32 = guest_memory.read_plain(gpa + offset).unwrap_or(0);

        if v & 1 == 0 {
            // The guest cleared the bit. The caller will perform the EOI to
            // the APIC.
            true
        } else {
            // Clear the bit in case the EOI state changes before the guest
            // runs again.
            let v = v & !1;
            let _ = guest_memory.write_plain(gpa + offset, &v);
            false
        }
    }

    /// Returns the nested enlightenments the guest has opted into via the
    /// VP assist page.
    pub fn nested_enlightenments_control(
        &self,
        guest_memory: &impl GuestPages,
    ) -> HvNestedEnlightenmentsControl {
        let Some(gpa) = self.vp_assist_gpa() else {
            return HvNestedEnlightenmentsControl::new();
        };
        let offset = offset_of!(HvVpAssistPage, nested_control) as u64;
        guest_memory
            .read_plain::<u64>(gpa + offset)
            .map_or(HvNestedEnlightenmentsControl::new(), Into::into)
    }

    /// Returns the guest physical address of the currently-loaded
    /// enlightened VMCS, if the guest has armed enlightened VM entry.
    pub fn current_nested_vmcs(&self, guest_memory: &impl GuestPages) -> Option<u64> {
        let gpa = self.vp_assist_gpa()?;
        let enlighten: u8 = guest_memory
            .read_plain(gpa + offset_of!(HvVpAssistPage, enlighten_vm_entry) as u64)
            .ok()?;
        if enlighten == 0 {
            return None;
        }
        guest_memory
            .read_plain(gpa + offset_of!(HvVpAssistPage, current_nested_vmcs) as u64)
            .ok()
    }

    /// Returns the clean-field mask of the current enlightened VMCS: the
    /// state groups the consumer may skip resynchronizing on this VM entry.
    ///
    /// Returns [`EvmcsCleanFields::NONE`] (resynchronize everything) when
    /// enlightened VM entry is not armed or the record's revision is not
    /// recognized.
    pub fn nested_vmcs_clean_fields(&self, guest_memory: &impl GuestPages) -> EvmcsCleanFields {
        let Some(vmcs_gpa) = self.current_nested_vmcs(guest_memory) else {
            return EvmcsCleanFields::NONE;
        };
        match guest_memory.read_plain::<EnlightenedVmcs>(vmcs_gpa) {
            Ok(vmcs) => vmcs.validated_clean_fields(),
            Err(err) => {
                tracing::warn!(
                    gpa = vmcs_gpa,
                    error = &err as &dyn std::error::Error,
                    "failed to read enlightened vmcs"
                );
                EvmcsCleanFields::NONE
            }
        }
    }
}

const fn hypercall_page(use_vmmcall: bool) -> [u8; 4] {
    let [hc0, hc1, hc2] = if use_vmmcall {
        [0x0f, 0x01, 0xd9] // vmmcall
    } else {
        [0x0f, 0x01, 0xc1] // vmcall
    };

    [
        hc0, hc1, hc2, // 0: vmcall/vmmcall
        0xc3, // 3: ret
    ]
}

const AMD_HYPERCALL_PAGE: [u8; 4] = hypercall_page(true);
const INTEL_HYPERCALL_PAGE: [u8; 4] = hypercall_page(false);
