// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Synthetic interrupt controller emulation.
//!
//! Each SINT line moves through three states: masked, armed (unmasked with
//! an empty message slot), and pending (slot written, interrupt owed). A
//! pending slot refuses further messages until the guest completes it with
//! an end-of-message, or, for auto-EOI SINTs, until the interrupt
//! acknowledgment completes it implicitly.

use crate::GuestPages;
use crate::MsrError;
use crate::RequestInterrupt;
use crate::VpIndex;
use parking_lot::RwLock;
use std::array;
use std::sync::Arc;
use viridian_defs::HV_MESSAGE_SIZE;
use viridian_defs::HV_PAGE_SIZE;
use viridian_defs::HV_PAGE_SIZE_USIZE;
use viridian_defs::HV_SYNIC_VERSION;
use viridian_defs::HvMessage;
use viridian_defs::HvMessageHeader;
use viridian_defs::HvMessageType;
use viridian_defs::HvSynicEventFlags;
use viridian_defs::HvSynicSimpSiefp;
use viridian_defs::HvSynicSint;
use viridian_defs::HvSynicStimerConfig;
use viridian_defs::NUM_SINTS;
use viridian_defs::NUM_TIMERS;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// The result of posting a message to a SINT.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Delivery {
    /// The message was written to the slot and the interrupt signaled.
    Delivered,
    /// The slot still holds an unconsumed message. The slot is untouched
    /// except that its pending flag is raised so the guest knows to issue
    /// an end-of-message.
    Busy,
    /// The SynIC or the SINT is disabled; the message cannot be accepted.
    Masked,
}

/// The virtual processor synthetic interrupt controller state.
pub struct ProcessorSynic {
    sints: SintState,
    timers: [Stimer; NUM_TIMERS],
    event_flags: [HvSynicEventFlags; NUM_SINTS],
    dirty_banks: u16,
    shared: Arc<RwLock<SharedProcessorState>>,
}

struct SintState {
    siefp: HvSynicSimpSiefp,
    simp: HvSynicSimpSiefp,
    scontrol: viridian_defs::HvSynicScontrol,
    sint: [HvSynicSint; NUM_SINTS],
    /// SINTs whose message slot is known to be empty.
    ready_sints: u16,
}

impl SintState {
    const AT_RESET: Self = Self {
        siefp: HvSynicSimpSiefp::new(),
        simp: HvSynicSimpSiefp::new(),
        scontrol: viridian_defs::HvSynicScontrol::new().with_enabled(true),
        sint: [HvSynicSint::new().with_masked(true); NUM_SINTS],
        ready_sints: 0,
    };
}

/// Synthetic timer register state. Expiry scheduling belongs to the
/// external timer collaborator, which posts the expiration message itself.
#[derive(Default)]
struct Stimer {
    config: HvSynicStimerConfig,
    count: u64,
}

struct SharedProcessorState {
    online: bool,
    enabled: bool,
    siefp: Option<u64>,
    sint: [HvSynicSint; NUM_SINTS],
}

impl SharedProcessorState {
    const AT_RESET: Self = Self {
        online: true,
        enabled: true,
        siefp: None,
        sint: [HvSynicSint::new().with_masked(true); NUM_SINTS],
    };

    const OFFLINE: Self = Self {
        online: false,
        enabled: false,
        siefp: None,
        sint: [HvSynicSint::new().with_masked(true); NUM_SINTS],
    };
}

/// A partition-wide synthetic interrupt controller.
pub struct GlobalSynic {
    vps: Vec<Arc<RwLock<SharedProcessorState>>>,
}

fn sint_interrupt(request: &mut dyn RequestInterrupt, sint: HvSynicSint) {
    assert!(!sint.masked(), "caller should have verified sint was ready");
    if !sint.polling() {
        request.request_interrupt(sint.vector().into(), sint.auto_eoi());
    }
}

impl GlobalSynic {
    /// Returns a new instance of the synthetic interrupt controller.
    pub fn new(max_vp_count: u32) -> Self {
        Self {
            vps: (0..max_vp_count)
                .map(|_| Arc::new(RwLock::new(SharedProcessorState::OFFLINE)))
                .collect(),
        }
    }

    /// Signals an event to the specified virtual processor by setting its
    /// flag bit in the SIEFP page.
    ///
    /// `interrupt` is called with the target APIC vector while holding a
    /// lock preventing the synic state from changing.
    ///
    /// Returns `true` if the event flag is newly signaled.
    pub fn signal_event(
        &self,
        guest_memory: &impl GuestPages,
        vp: VpIndex,
        sint_index: u8,
        flag: u16,
        interrupt: &mut dyn RequestInterrupt,
    ) -> bool {
        let Some(vp) = self.vps.get(vp.index() as usize) else {
            return false;
        };
        let vp = vp.read();
        let sint_index = sint_index as usize;
        let sint = vp.sint[sint_index];
        if !vp.enabled || sint.masked() {
            return false;
        }
        let Some(siefp) = vp.siefp else {
            return false;
        };
        let flag = flag as usize;
        let byte_gpa = siefp + (sint_index * (HV_PAGE_SIZE_USIZE / NUM_SINTS) + flag / 8) as u64;
        let mask = 1 << (flag % 8);
        let byte: u8 = match guest_memory.read_plain(byte_gpa) {
            Ok(byte) => byte,
            Err(err) => {
                tracing::warn!(
                    gpa = byte_gpa,
                    error = &err as &dyn std::error::Error,
                    "failed to read siefp bit"
                );
                return false;
            }
        };
        if byte & mask != 0 {
            // Already signaled.
            return false;
        }
        if let Err(err) = guest_memory.write_plain(byte_gpa, &(byte | mask)) {
            tracing::warn!(
                gpa = byte_gpa,
                error = &err as &dyn std::error::Error,
                "failed to set siefp bit"
            );
            return false;
        }
        sint_interrupt(interrupt, sint);
        true
    }

    /// Adds a virtual processor to the synthetic interrupt controller state.
    pub fn add_vp(&self, vp_index: VpIndex) -> ProcessorSynic {
        let shared = self.vps[vp_index.index() as usize].clone();
        let old_shared = std::mem::replace(&mut *shared.write(), SharedProcessorState::AT_RESET);
        assert!(!old_shared.online);

        ProcessorSynic {
            sints: SintState::AT_RESET,
            timers: array::from_fn(|_| Stimer::default()),
            event_flags: array::from_fn(|_| HvSynicEventFlags::new_zeroed()),
            dirty_banks: 0,
            shared,
        }
    }
}

impl ProcessorSynic {
    /// Resets the synic state back to its initial state.
    pub fn reset(&mut self) {
        let Self {
            sints,
            timers,
            event_flags,
            dirty_banks,
            shared,
        } = self;
        *sints = SintState::AT_RESET;
        *timers = array::from_fn(|_| Stimer::default());
        *event_flags = array::from_fn(|_| HvSynicEventFlags::new_zeroed());
        *dirty_banks = 0;
        *shared.write() = SharedProcessorState::AT_RESET;
    }

    /// Returns the event flags page register.
    pub fn siefp(&self) -> u64 {
        self.sints.siefp.into()
    }

    /// Returns the message page register.
    pub fn simp(&self) -> u64 {
        self.sints.simp.into()
    }

    /// Returns the `SCONTROL` register.
    pub fn scontrol(&self) -> u64 {
        self.sints.scontrol.into()
    }

    /// Returns the `SVERSION` register.
    pub fn sversion(&self) -> u64 {
        HV_SYNIC_VERSION
    }

    /// Returns the end-of-message register.
    pub fn eom(&self) -> u64 {
        0
    }

    /// Returns the specified `SINT` register.
    pub fn sint(&self, n: u8) -> u64 {
        self.sints.sint[n as usize].into()
    }

    /// Returns the specified synthetic timer configuration register.
    pub fn stimer_config(&self, n: usize) -> u64 {
        self.timers[n].config.into()
    }

    /// Returns the specified synthetic timer count register.
    pub fn stimer_count(&self, n: usize) -> u64 {
        self.timers[n].count
    }

    /// Sets the event flags page register.
    pub fn set_siefp(&mut self, guest_memory: &impl GuestPages, v: u64) {
        let siefp = HvSynicSimpSiefp::from(v);
        tracing::debug!(?siefp, "setting siefp");
        if siefp.enabled()
            && (!self.sints.siefp.enabled() || siefp.base_gpn() != self.sints.siefp.base_gpn())
        {
            // As with the SIMP, clear the page when the base GPN changes.
            if let Err(err) =
                guest_memory.fill_at(siefp.base_gpn() * HV_PAGE_SIZE, 0, HV_PAGE_SIZE_USIZE)
            {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to clear siefp page"
                );
            }
        }
        self.sints.siefp = siefp;
        let mut shared = self.shared.write();
        shared.siefp = siefp.enabled().then_some(siefp.base_gpn() * HV_PAGE_SIZE);
    }

    /// Sets the message page register.
    pub fn set_simp(&mut self, guest_memory: &impl GuestPages, v: u64) {
        let simp = HvSynicSimpSiefp::from(v);
        tracing::debug!(?simp, "setting simp");
        if simp.enabled()
            && (!self.sints.simp.enabled() || simp.base_gpn() != self.sints.simp.base_gpn())
        {
            // Clear the message slots when the SIMP is enabled or moved.
            // Technically an overlay should preserve and restore the
            // underlying page contents, but guests do not rely on it.
            if let Err(err) =
                guest_memory.fill_at(simp.base_gpn() * HV_PAGE_SIZE, 0, HV_PAGE_SIZE_USIZE)
            {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to clear simp page"
                );
            }
            // Every slot on the fresh page is empty.
            self.sints.ready_sints = !0;
        }
        self.sints.simp = simp;
    }

    /// Sets the `SCONTROL` register.
    pub fn set_scontrol(&mut self, v: u64) {
        self.sints.scontrol = v.into();
        self.shared.write().enabled = self.sints.scontrol.enabled();
    }

    /// Performs an end-of-message operation, rescanning the message slots
    /// the guest has released.
    pub fn set_eom(&mut self, guest_memory: &impl GuestPages, _v: u64) {
        if !self.sints.simp.enabled() {
            return;
        }
        for sint in 0..NUM_SINTS as u8 {
            self.sints.check_sint_ready(guest_memory, sint);
        }
    }

    /// Sets the specified `SINT` register.
    pub fn set_sint(&mut self, n: usize, v: u64) {
        let sint = v.into();
        self.sints.sint[n] = sint;
        self.shared.write().sint[n] = sint;
    }

    /// Sets the specified synthetic timer configuration register.
    pub fn set_stimer_config(&mut self, n: usize, v: u64) {
        self.timers[n].config = v.into();
    }

    /// Sets the specified synthetic timer count register.
    pub fn set_stimer_count(&mut self, n: usize, v: u64) {
        self.timers[n].count = v;
        if self.timers[n].config.auto_enable() && self.timers[n].count != 0 {
            let config = self.timers[n].config.with_enabled(true);
            self.timers[n].config = config;
        }
    }

    /// Writes a message to the message page and signals the SINT's vector.
    ///
    /// A `Busy` slot is never overwritten; the occupying message's pending
    /// flag is raised instead, and the slot must be completed before another
    /// message is accepted.
    pub fn post_message(
        &mut self,
        guest_memory: &impl GuestPages,
        sint_index: u8,
        message: &HvMessage,
        interrupt: &mut dyn RequestInterrupt,
    ) -> Delivery {
        let sint = self.sints.sint[sint_index as usize];
        if !self.sints.scontrol.enabled() || !self.sints.simp.enabled() || sint.masked() {
            return Delivery::Masked;
        }
        if !self.sints.check_sint_ready(guest_memory, sint_index) {
            return Delivery::Busy;
        }

        let gpa = self.sints.message_slot_gpa(sint_index);
        if !write_message_page(guest_memory, gpa, message.as_bytes()) {
            return Delivery::Busy;
        }
        self.sints.ready_sints &= !(1 << sint_index);
        sint_interrupt(interrupt, sint);
        Delivery::Delivered
    }

    /// Completes the message in the SINT's slot, rearming it for delivery.
    ///
    /// Idempotent: completing an already-empty slot is a no-op, since a
    /// guest may over-EOM defensively.
    pub fn complete_message(&mut self, guest_memory: &impl GuestPages, sint_index: u8) {
        if !self.sints.simp.enabled() || self.sints.ready_sints & (1 << sint_index) != 0 {
            return;
        }
        let gpa = self.sints.message_slot_gpa(sint_index);
        if write_message_page(guest_memory, gpa, HvMessageHeader::new_zeroed().as_bytes()) {
            self.sints.ready_sints |= 1 << sint_index;
        }
    }

    /// Notification that the interrupt for `sint_index` was acknowledged.
    ///
    /// For an auto-EOI SINT this completes the pending message without an
    /// explicit end-of-message write from the guest.
    pub fn acknowledge_interrupt(&mut self, guest_memory: &impl GuestPages, sint_index: u8) {
        if self.sints.sint[sint_index as usize].auto_eoi() {
            self.complete_message(guest_memory, sint_index);
        }
    }

    /// Sets an event flag in the SINT's bank for the lazy, polled delivery
    /// path, marking the bank dirty for a later [`Self::drain_events`].
    ///
    /// Returns `true` if the flag was newly set.
    pub fn raise_event(&mut self, sint_index: u8, flag: u16) -> bool {
        let newly_set = self.event_flags[sint_index as usize].set(flag);
        if newly_set {
            self.dirty_banks |= 1 << sint_index;
        }
        newly_set
    }

    /// Atomically snapshots and clears the dirty event-flag banks, returning
    /// the `(sint, flag)` pairs that were raised since the last drain.
    pub fn drain_events(&mut self) -> Vec<(u8, u16)> {
        let mut events = Vec::new();
        let mut dirty = std::mem::take(&mut self.dirty_banks);
        while dirty != 0 {
            let sint = dirty.trailing_zeros() as u8;
            dirty &= !(1 << sint);
            let bank = std::mem::replace(
                &mut self.event_flags[sint as usize],
                HvSynicEventFlags::new_zeroed(),
            );
            for (word_index, mut word) in bank.0.into_iter().enumerate() {
                while word != 0 {
                    let bit = word.trailing_zeros();
                    word &= !(1 << bit);
                    events.push((sint, (word_index * 64) as u16 + bit as u16));
                }
            }
        }
        events
    }

    /// Writes an x64 MSR.
    pub fn write_msr(
        &mut self,
        guest_memory: &impl GuestPages,
        msr: u32,
        v: u64,
    ) -> Result<(), MsrError> {
        match msr {
            msr @ viridian_defs::HV_X64_MSR_STIMER0_CONFIG
                ..=viridian_defs::HV_X64_MSR_STIMER3_COUNT => {
                let offset = msr - viridian_defs::HV_X64_MSR_STIMER0_CONFIG;
                let timer = (offset >> 1) as _;
                let is_count = offset & 1 != 0;
                if is_count {
                    self.set_stimer_count(timer, v);
                } else {
                    self.set_stimer_config(timer, v);
                }
            }
            viridian_defs::HV_X64_MSR_SCONTROL => self.set_scontrol(v),
            viridian_defs::HV_X64_MSR_SVERSION => return Err(MsrError::InvalidAccess),
            viridian_defs::HV_X64_MSR_SIEFP => self.set_siefp(guest_memory, v),
            viridian_defs::HV_X64_MSR_SIMP => self.set_simp(guest_memory, v),
            viridian_defs::HV_X64_MSR_EOM => self.set_eom(guest_memory, v),
            msr @ viridian_defs::HV_X64_MSR_SINT0..=viridian_defs::HV_X64_MSR_SINT15 => {
                self.set_sint((msr - viridian_defs::HV_X64_MSR_SINT0) as usize, v)
            }
            _ => return Err(MsrError::Unknown),
        }
        Ok(())
    }

    /// Reads an x64 MSR.
    pub fn read_msr(&self, msr: u32) -> Result<u64, MsrError> {
        let value = match msr {
            msr @ viridian_defs::HV_X64_MSR_STIMER0_CONFIG
                ..=viridian_defs::HV_X64_MSR_STIMER3_COUNT => {
                let offset = msr - viridian_defs::HV_X64_MSR_STIMER0_CONFIG;
                let timer = (offset >> 1) as _;
                let is_count = offset & 1 != 0;
                if is_count {
                    self.stimer_count(timer)
                } else {
                    self.stimer_config(timer)
                }
            }
            viridian_defs::HV_X64_MSR_SCONTROL => self.scontrol(),
            viridian_defs::HV_X64_MSR_SVERSION => self.sversion(),
            viridian_defs::HV_X64_MSR_SIEFP => self.siefp(),
            viridian_defs::HV_X64_MSR_SIMP => self.simp(),
            viridian_defs::HV_X64_MSR_EOM => self.eom(),
            msr @ viridian_defs::HV_X64_MSR_SINT0..=viridian_defs::HV_X64_MSR_SINT15 => {
                self.sint((msr - viridian_defs::HV_X64_MSR_SINT0) as u8)
            }
            _ => return Err(MsrError::Unknown),
        };
        Ok(value)
    }
}

impl SintState {
    fn message_slot_gpa(&self, sint: u8) -> u64 {
        self.simp.base_gpn() * HV_PAGE_SIZE + (sint as usize * HV_MESSAGE_SIZE) as u64
    }

    /// Returns whether the SINT's message slot is free, raising the pending
    /// flag of the occupying message otherwise.
    fn check_sint_ready(&mut self, guest_memory: &impl GuestPages, sint: u8) -> bool {
        if self.ready_sints & (1 << sint) != 0 {
            return true;
        }
        let gpa = self.message_slot_gpa(sint);
        let mut header: HvMessageHeader = match guest_memory.read_plain(gpa) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(
                    gpa,
                    error = &err as &dyn std::error::Error,
                    "failed to read from message page"
                );
                return false;
            }
        };
        if header.typ != HvMessageType::HvMessageTypeNone {
            // The slot is full. Mark the message pending so that the guest
            // forces an EOM.
            if !header.flags.message_pending() {
                header.flags.set_message_pending(true);
                write_message_page(guest_memory, gpa, header.as_bytes());
            }
            return false;
        }
        self.ready_sints |= 1 << sint;
        true
    }
}

fn write_message_page(guest_memory: &impl GuestPages, gpa: u64, data: &[u8]) -> bool {
    if let Err(err) = guest_memory.write_at(gpa, data) {
        tracing::warn!(
            gpa,
            error = &err as &dyn std::error::Error,
            "failed to write to message page"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestMemory;
    use viridian_defs::HvMessagePage;

    const SIMP_GPA: u64 = 0x1000;
    const SIEFP_GPA: u64 = 0x2000;

    struct NoInterrupt;

    impl RequestInterrupt for NoInterrupt {
        fn request_interrupt(&mut self, _vector: u32, _auto_eoi: bool) {
            panic!("unexpected interrupt");
        }
    }

    fn armed_synic(gm: &TestMemory) -> (GlobalSynic, ProcessorSynic) {
        let global = GlobalSynic::new(4);
        let mut synic = global.add_vp(VpIndex::BSP);
        synic.set_simp(
            gm,
            HvSynicSimpSiefp::new()
                .with_enabled(true)
                .with_base_gpn(SIMP_GPA >> 12)
                .into(),
        );
        synic.set_siefp(
            gm,
            HvSynicSimpSiefp::new()
                .with_enabled(true)
                .with_base_gpn(SIEFP_GPA >> 12)
                .into(),
        );
        (global, synic)
    }

    fn unmask_sint(synic: &mut ProcessorSynic, sint: usize, vector: u8, auto_eoi: bool) {
        synic.set_sint(
            sint,
            HvSynicSint::new()
                .with_vector(vector)
                .with_auto_eoi(auto_eoi)
                .into(),
        );
    }

    fn slot(gm: &TestMemory, sint: u8) -> HvMessage {
        let page: HvMessagePage = gm.read_plain(SIMP_GPA).unwrap();
        page.sint_message[sint as usize]
    }

    #[test]
    fn message_slot_protocol() {
        let gm = TestMemory::new(4);
        let (_global, mut synic) = armed_synic(&gm);
        unmask_sint(&mut synic, 2, 0x40, false);

        let message = HvMessage::new(HvMessageType::HvMessageTypeTimerExpired, 0, &[7; 24]);

        let mut vectors = Vec::new();
        assert_eq!(
            synic.post_message(&gm, 2, &message, &mut |vector: u32, _: bool| {
                vectors.push(vector)
            }),
            Delivery::Delivered
        );
        assert_eq!(vectors, [0x40]);
        assert_eq!(
            slot(&gm, 2).header.typ,
            HvMessageType::HvMessageTypeTimerExpired
        );
        assert_eq!(slot(&gm, 2).payload(), [7; 24]);

        // The slot is busy until the guest completes it; the occupying
        // message is not overwritten, but its pending flag is raised.
        let second = HvMessage::new(HvMessageType::HvMessageTypeTimerExpired, 0, &[8; 8]);
        assert_eq!(
            synic.post_message(&gm, 2, &second, &mut NoInterrupt),
            Delivery::Busy
        );
        assert_eq!(slot(&gm, 2).payload(), [7; 24]);
        assert!(slot(&gm, 2).header.flags.message_pending());

        // Completion frees the slot for exactly one more message.
        synic.complete_message(&gm, 2);
        assert_eq!(slot(&gm, 2).header.typ, HvMessageType::HvMessageTypeNone);
        assert_eq!(
            synic.post_message(&gm, 2, &second, &mut |vector: u32, _: bool| {
                vectors.push(vector)
            }),
            Delivery::Delivered
        );
        assert_eq!(
            synic.post_message(&gm, 2, &second, &mut NoInterrupt),
            Delivery::Busy
        );
        assert_eq!(vectors, [0x40, 0x40]);
    }

    #[test]
    fn masked_sint_rejects_messages() {
        let gm = TestMemory::new(4);
        let (_global, mut synic) = armed_synic(&gm);

        let message = HvMessage::new(HvMessageType::HvMessageTypeTimerExpired, 0, &[]);
        // SINTs reset masked.
        assert_eq!(
            synic.post_message(&gm, 3, &message, &mut NoInterrupt),
            Delivery::Masked
        );

        // Disabling SCONTROL masks even an unmasked SINT.
        unmask_sint(&mut synic, 3, 0x41, false);
        synic.set_scontrol(viridian_defs::HvSynicScontrol::new().into());
        assert_eq!(
            synic.post_message(&gm, 3, &message, &mut NoInterrupt),
            Delivery::Masked
        );
    }

    #[test]
    fn guest_clears_slot_and_signals_eom() {
        let gm = TestMemory::new(4);
        let (_global, mut synic) = armed_synic(&gm);
        unmask_sint(&mut synic, 1, 0x42, false);

        let message = HvMessage::new(HvMessageType::HvMessageTypeTimerExpired, 0, &[1]);
        let mut count = 0;
        assert_eq!(
            synic.post_message(&gm, 1, &message, &mut |_: u32, _: bool| count += 1),
            Delivery::Delivered
        );

        // The guest consumes the message, clears the slot itself, and
        // writes the EOM MSR; the slot becomes deliverable again.
        gm.write_plain(
            SIMP_GPA + HV_MESSAGE_SIZE as u64,
            &HvMessageHeader::new_zeroed(),
        )
        .unwrap();
        synic
            .write_msr(&gm, viridian_defs::HV_X64_MSR_EOM, 0)
            .unwrap();
        assert_eq!(
            synic.post_message(&gm, 1, &message, &mut |_: u32, _: bool| count += 1),
            Delivery::Delivered
        );
        assert_eq!(count, 2);
    }

    #[test]
    fn auto_eoi_completes_on_acknowledge() {
        let gm = TestMemory::new(4);
        let (_global, mut synic) = armed_synic(&gm);
        unmask_sint(&mut synic, 4, 0x50, true);

        let message = HvMessage::new(HvMessageType::HvMessageTypeTimerExpired, 0, &[]);
        let mut auto_eois = Vec::new();
        assert_eq!(
            synic.post_message(&gm, 4, &message, &mut |_: u32, auto_eoi: bool| {
                auto_eois.push(auto_eoi)
            }),
            Delivery::Delivered
        );
        assert_eq!(auto_eois, [true]);
        assert_eq!(
            synic.post_message(&gm, 4, &message, &mut NoInterrupt),
            Delivery::Busy
        );

        // Acknowledgment of an auto-EOI interrupt stands in for the EOM.
        synic.acknowledge_interrupt(&gm, 4);
        assert_eq!(
            synic.post_message(&gm, 4, &message, &mut |_: u32, auto_eoi: bool| {
                auto_eois.push(auto_eoi)
            }),
            Delivery::Delivered
        );
        assert_eq!(auto_eois, [true, true]);
    }

    #[test]
    fn complete_message_is_idempotent() {
        let gm = TestMemory::new(4);
        let (_global, mut synic) = armed_synic(&gm);
        unmask_sint(&mut synic, 0, 0x33, false);

        // Over-EOM on an armed slot is harmless.
        synic.complete_message(&gm, 0);
        synic.complete_message(&gm, 0);

        let message = HvMessage::new(HvMessageType::HvMessageTypeTimerExpired, 0, &[]);
        let mut interrupt = |_: u32, _: bool| ();
        assert_eq!(
            synic.post_message(&gm, 0, &message, &mut interrupt),
            Delivery::Delivered
        );
    }

    #[test]
    fn event_flags_to_siefp_page() {
        let gm = TestMemory::new(4);
        let (global, mut synic) = armed_synic(&gm);
        unmask_sint(&mut synic, 5, 0x60, false);

        let mut vectors = Vec::new();
        assert!(global.signal_event(&gm, VpIndex::BSP, 5, 9, &mut |vector: u32, _: bool| {
            vectors.push(vector)
        }));
        // A second signal of the same flag is not newly signaled.
        assert!(!global.signal_event(&gm, VpIndex::BSP, 5, 9, &mut NoInterrupt));
        assert_eq!(vectors, [0x60]);

        // Flag 9 of SINT 5's bank: bank stride is 256 bytes, bit 9 is the
        // second bit of the second byte.
        let byte: u8 = gm.read_plain(SIEFP_GPA + 5 * 256 + 1).unwrap();
        assert_eq!(byte, 0b10);

        // Signaling a masked SINT or an offline VP does nothing.
        assert!(!global.signal_event(&gm, VpIndex::BSP, 6, 0, &mut NoInterrupt));
        assert!(!global.signal_event(&gm, VpIndex::new(9), 5, 0, &mut NoInterrupt));
    }

    #[test]
    fn lazy_event_flags_drain() {
        let gm = TestMemory::new(4);
        let (_global, mut synic) = armed_synic(&gm);

        assert!(synic.raise_event(3, 17));
        assert!(!synic.raise_event(3, 17));
        assert!(synic.raise_event(3, 64));
        assert!(synic.raise_event(15, 2047));

        let events = synic.drain_events();
        assert_eq!(events, [(3, 17), (3, 64), (15, 2047)]);

        // The drain cleared everything.
        assert!(synic.drain_events().is_empty());
        assert!(synic.raise_event(3, 17));
    }

    #[test]
    fn stimer_auto_enable() {
        let gm = TestMemory::new(4);
        let (_global, mut synic) = armed_synic(&gm);

        synic
            .write_msr(
                &gm,
                viridian_defs::HV_X64_MSR_STIMER1_CONFIG,
                HvSynicStimerConfig::new()
                    .with_auto_enable(true)
                    .with_sint(2)
                    .into(),
            )
            .unwrap();
        synic
            .write_msr(&gm, viridian_defs::HV_X64_MSR_STIMER1_COUNT, 0x100)
            .unwrap();

        let config = HvSynicStimerConfig::from(
            synic
                .read_msr(viridian_defs::HV_X64_MSR_STIMER1_CONFIG)
                .unwrap(),
        );
        assert!(config.enabled());
        assert_eq!(
            synic
                .read_msr(viridian_defs::HV_X64_MSR_STIMER1_COUNT)
                .unwrap(),
            0x100
        );

        // SVERSION is read-only.
        assert_eq!(
            synic.write_msr(&gm, viridian_defs::HV_X64_MSR_SVERSION, 1),
            Err(MsrError::InvalidAccess)
        );
        assert_eq!(
            synic.read_msr(viridian_defs::HV_X64_MSR_SVERSION).unwrap(),
            HV_SYNIC_VERSION
        );
    }
}
