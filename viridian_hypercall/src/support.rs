// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Support for parsing and handling hypercalls.

use core::marker::PhantomData;
use thiserror::Error;
use viridian_defs::HV_PAGE_SIZE;
use viridian_defs::HV_PAGE_SIZE_USIZE;
use viridian_defs::HvError;
use viridian_defs::HvResult;
use viridian_defs::HypercallCode;
use viridian_defs::hypercall::Control;
use viridian_defs::hypercall::HypercallOutput;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;

/// A hypercall definition.
#[derive(Copy, Clone)]
pub enum HypercallData {
    /// A non-rep hypercall.
    Simple {
        /// The fixed input size.
        input_size: usize,
        /// The fixed output size.
        output_size: usize,
        /// If true, the input is variable sized.
        is_variable: bool,
    },
    /// A rep hypercall.
    Rep {
        /// The fixed input size.
        header_size: usize,
        /// The input element size.
        input_element_size: usize,
        /// The output element size.
        output_element_size: usize,
        /// If true, the input is variable sized.
        is_variable: bool,
    },
}

/// Parameters to pass to a hypercall dispatch function.
pub struct HypercallParameters<'a> {
    control: Control,
    input: &'a [u8],
    output: &'a mut [u8],
}

/// The resolved guest buffers for a slow hypercall, each starting at the
/// guest physical address the control registers name and extending to the
/// end of its page. Fast hypercalls ignore these; pass
/// [`PageBuffers::empty`].
pub struct PageBuffers<'a> {
    /// The input buffer.
    pub input: &'a [u8],
    /// The output buffer.
    pub output: &'a mut [u8],
}

impl PageBuffers<'_> {
    /// Returns empty buffers, for dispatching fast hypercalls.
    pub fn empty() -> PageBuffers<'static> {
        PageBuffers {
            input: &[],
            output: &mut [],
        }
    }
}

/// `[u64; 2]` buffer aligned to 16 bytes for hypercall inputs.
#[repr(C, align(16))]
#[derive(Copy, Clone)]
struct HypercallAlignedBuf128<const N: usize>([[u64; 2]; N]);

impl<const N: usize> HypercallAlignedBuf128<N> {
    fn new_zeroed() -> Self {
        Self([[0, 0]; N])
    }
}

type HypercallAlignedPage = HypercallAlignedBuf128<{ HV_PAGE_SIZE_USIZE / 16 }>;

/// A helper for dispatching hypercalls.
struct InnerDispatcher<'a, T> {
    control: Control,
    pages: PageBuffers<'a>,
    handler: T,
}

#[derive(Debug, Error)]
enum HypercallParseError {
    #[error("invalid control: {0:?}")]
    InvalidControl(Control),
    #[error("hypercall input too large for fast hypercall")]
    TooBigForFast,
    #[error("input/output straddles a page boundary")]
    Straddle,
    #[error("input/output buffer too small for the declared size")]
    Truncated,
    #[error("unaligned memory access")]
    Unaligned,
}

impl From<HypercallParseError> for HvError {
    fn from(err: HypercallParseError) -> Self {
        tracing::warn!(
            error = &err as &dyn core::error::Error,
            "hypercall parse failure"
        );
        match err {
            HypercallParseError::Unaligned => Self::InvalidAlignment,
            _ => Self::InvalidHypercallInput,
        }
    }
}

/// Trait for getting the handler from the `handler` parameter passed to
/// [`Dispatcher::dispatch`].
///
/// This is useful when the handler parameter is a wrapper that applies a
/// specific hypercall calling convention.
pub trait AsHandler<H> {
    /// Gets the inner handler.
    fn as_handler(&mut self) -> &mut H;
}

impl<'a, T: HypercallIo> InnerDispatcher<'a, T> {
    /// Creates a new dispatcher.
    fn new(pages: PageBuffers<'a>, mut handler: T) -> Self {
        Self {
            control: handler.control().into(),
            pages,
            handler,
        }
    }

    /// Gets the hypercall code being dispatched.
    fn code(&self) -> HypercallCode {
        HypercallCode(self.control.code())
    }

    /// Logs an unsupported hypercall and returns the appropriate error.
    fn unhandled(&self) -> Option<HypercallOutput> {
        tracing::warn!(code = ?self.code(), "no handler for hypercall code");
        Some(HvError::InvalidHypercallCode.into())
    }

    /// Complete hypercall handling.
    fn complete(&mut self, output: Option<HypercallOutput>) {
        if let Some(output) = output {
            if output.call_status() == Err(HvError::Timeout).into() {
                self.handler.retry(
                    self.control
                        .with_rep_start(output.elements_processed())
                        .into(),
                );
            } else {
                self.handler.set_result(output.into());
                self.handler.advance_ip();
            }
        }
    }

    fn dispatch_dyn<H>(
        &mut self,
        data: &HypercallData,
        dispatch: fn(&mut H, HypercallParameters<'_>) -> HypercallOutput,
    ) -> Option<HypercallOutput>
    where
        T: AsHandler<H>,
    {
        self.dispatch_inner(data, dispatch)
            .unwrap_or_else(|err| Some(err.into()))
    }

    fn dispatch_inner<H>(
        &mut self,
        data: &HypercallData,
        dispatch: fn(&mut H, HypercallParameters<'_>) -> HypercallOutput,
    ) -> Result<Option<HypercallOutput>, HvError>
    where
        T: AsHandler<H>,
    {
        tracing::trace!(code = ?self.code(), "hypercall");
        let control = self.control;

        // `truncated` is set when a rep list is longer than one input page
        // can hold. The entries that do fit are still serviced; the guest
        // learns via `HV_STATUS_INSUFFICIENT_BUFFERS` plus the completed
        // count that it must split the request and resume with `rep_start`.
        let (input_len, output_start, output_len, out_elem_size, truncated) = match *data {
            HypercallData::Simple {
                input_size,
                output_size,
                is_variable,
            } => {
                if control.rep_count() != 0
                    || control.rep_start() != 0
                    || (!is_variable && control.variable_header_size() != 0)
                {
                    return Err(HypercallParseError::InvalidControl(control).into());
                }

                let input_size = input_size + control.variable_header_size() * 8;
                if input_size > HV_PAGE_SIZE_USIZE {
                    return Err(HypercallParseError::InvalidControl(control).into());
                }
                (input_size, 0, output_size, 0, false)
            }
            HypercallData::Rep {
                header_size,
                input_element_size,
                output_element_size,
                is_variable,
            } => {
                if control.rep_count() == 0
                    || (!is_variable && control.variable_header_size() != 0)
                    || control.rep_start() >= control.rep_count()
                {
                    return Err(HypercallParseError::InvalidControl(control).into());
                }

                let fixed_len = header_size + control.variable_header_size() * 8;
                if fixed_len >= HV_PAGE_SIZE_USIZE {
                    return Err(HypercallParseError::InvalidControl(control).into());
                }

                // The page capacity bounds the list, not the 12-bit rep
                // count.
                let capacity = (HV_PAGE_SIZE_USIZE - fixed_len) / input_element_size;
                let rep_count = control.rep_count().min(capacity);
                if control.rep_start() >= rep_count {
                    return Err(HvError::InsufficientBuffers);
                }

                let input_len = fixed_len + input_element_size * rep_count;
                let output_start = output_element_size * control.rep_start();
                let output_len = output_element_size * rep_count;
                (
                    input_len,
                    output_start,
                    output_len,
                    output_element_size,
                    rep_count < control.rep_count(),
                )
            }
        };

        let mut input_buffer = HypercallAlignedPage::new_zeroed();
        let mut output_buffer = HypercallAlignedPage::new_zeroed();

        let mut ret = if control.fast() {
            let input_regpairs = input_len.div_ceil(16);
            let output_regpairs = output_len.div_ceil(16);
            if self.handler.fast_register_pair_count() < input_regpairs
                || self.handler.fast_register_pair_count() - input_regpairs < output_regpairs
                || (output_regpairs > 0 && !self.handler.extended_fast_hypercalls_ok())
            {
                return Err(HypercallParseError::TooBigForFast.into());
            }

            let input = &mut input_buffer.0[..input_regpairs];
            let output = &mut output_buffer.0[..output_regpairs];

            // Read in the input.
            let output_start_index = self.handler.fast_input(input, output_regpairs);
            let completed_output_pairs = output_start / 16;
            let (new_output_index, completed_output_pairs) = match output_start % 16 {
                0 => (
                    output_start_index + completed_output_pairs,
                    completed_output_pairs,
                ),
                _ => {
                    // There are some number of completed output pairs, and
                    // one partial pair. Copy the partial register pair from
                    // the previous output to the appropriate location in the
                    // output buffer.
                    let partial_output_index = output_start_index + completed_output_pairs;
                    self.handler.fast_regs(
                        partial_output_index,
                        &mut output[completed_output_pairs..completed_output_pairs + 1],
                    );
                    (partial_output_index, completed_output_pairs)
                }
            };

            let ret = (dispatch)(
                self.handler.as_handler(),
                HypercallParameters {
                    control,
                    input: &input.as_bytes()[..input_len],
                    output: &mut output.as_mut_bytes()[..output_len],
                },
            );

            // For rep hypercalls, always write back the completed number of
            // reps (which may be 0). For simple hypercalls, on success write
            // back all output. On failure (and timeout, which is handled as
            // a failure), nothing is written back.
            let output_end = if out_elem_size > 0 {
                out_elem_size * ret.elements_processed()
            } else if ret.call_status().is_ok() {
                output_len
            } else {
                0
            };

            let output_regpairs = output_end.div_ceil(16);

            // Only need to write back output regpairs that were not
            // previously completely written out, at the new output location.
            let output = &output[completed_output_pairs..output_regpairs];
            self.handler.fast_output(new_output_index, output);
            ret
        } else {
            let check_buffer = |gpa: u64, len: usize, resolved: usize| {
                // All IO must fit within a single page.
                if (len as u64) > (HV_PAGE_SIZE - gpa % HV_PAGE_SIZE) {
                    return Err(HvError::from(HypercallParseError::Straddle));
                }

                // The buffer must be 8 byte aligned.
                if len != 0 && gpa % 8 != 0 {
                    return Err(HvError::from(HypercallParseError::Unaligned));
                }

                // The memory subsystem must have resolved enough of the page.
                if resolved < len {
                    return Err(HvError::from(HypercallParseError::Truncated));
                }

                Ok(())
            };

            check_buffer(self.handler.input_gpa(), input_len, self.pages.input.len())?;
            check_buffer(
                self.handler.output_gpa(),
                output_len,
                self.pages.output.len(),
            )?;

            let input = &mut input_buffer.0.as_mut_bytes()[..input_len];
            let output = &mut output_buffer.0.as_mut_bytes()[..output_len];

            input.copy_from_slice(&self.pages.input[..input_len]);

            let ret = (dispatch)(
                self.handler.as_handler(),
                HypercallParameters {
                    control,
                    input,
                    output,
                },
            );

            // As for fast calls: completed reps for rep hypercalls, all
            // output on success for simple hypercalls, nothing on failure.
            let output_end = if out_elem_size > 0 {
                out_elem_size * ret.elements_processed()
            } else if ret.call_status().is_ok() {
                output_len
            } else {
                0
            };

            self.pages.output[output_start..output_end]
                .copy_from_slice(&output[output_start..output_end]);

            ret
        };

        // A fully-serviced but truncated rep list still reports failure so
        // the guest knows to split the request.
        if truncated && ret.call_status().is_ok() {
            ret = HypercallOutput::from(HvError::InsufficientBuffers)
                .with_elements_processed(ret.elements_processed());
        }

        Ok(Some(ret))
    }
}

/// Provides input and output parameters for a hypercall.
pub trait HypercallIo {
    /// Advances the instruction pointer for a completed hypercall.
    ///
    /// Either `advance_ip` or `retry` will be called.
    fn advance_ip(&mut self);

    /// Retains the instruction pointer at the hypercall point so that the
    /// hypercall will be retried.
    ///
    /// Either `advance_ip` or `retry` will be called.
    /// `control` is the updated hypercall input value to use in the retry.
    fn retry(&mut self, control: u64);

    /// The hypercall input value.
    fn control(&mut self) -> u64;

    /// The guest address of the hypercall input.
    fn input_gpa(&mut self) -> u64;

    /// The guest address of the hypercall output.
    fn output_gpa(&mut self) -> u64;

    /// Returns the maximum number of fast register pairs.
    fn fast_register_pair_count(&mut self) -> usize;

    /// Returns whether extended fast hypercall input/output is allowed.
    fn extended_fast_hypercalls_ok(&mut self) -> bool;

    /// Fills the buffer with fast input parameters. Given an output size in
    /// register pairs, returns the index of the first output register pair.
    fn fast_input(&mut self, buf: &mut [[u64; 2]], output_register_pairs: usize) -> usize;

    /// Writes fast output registers from the buffer.
    fn fast_output(&mut self, starting_pair_index: usize, buf: &[[u64; 2]]);

    /// Sets the hypercall result.
    fn set_result(&mut self, n: u64);

    /// Reads fast input/output registers into a buffer, given the starting
    /// pair index.
    fn fast_regs(&mut self, starting_pair_index: usize, buf: &mut [[u64; 2]]);
}

impl<T: HypercallIo> HypercallIo for &mut T {
    fn advance_ip(&mut self) {
        (**self).advance_ip()
    }

    fn retry(&mut self, control: u64) {
        (**self).retry(control)
    }

    fn control(&mut self) -> u64 {
        (**self).control()
    }

    fn input_gpa(&mut self) -> u64 {
        (**self).input_gpa()
    }

    fn output_gpa(&mut self) -> u64 {
        (**self).output_gpa()
    }

    fn fast_register_pair_count(&mut self) -> usize {
        (**self).fast_register_pair_count()
    }

    fn extended_fast_hypercalls_ok(&mut self) -> bool {
        (**self).extended_fast_hypercalls_ok()
    }

    fn fast_input(&mut self, buf: &mut [[u64; 2]], output_register_pairs: usize) -> usize {
        (**self).fast_input(buf, output_register_pairs)
    }

    fn fast_output(&mut self, starting_pair_index: usize, buf: &[[u64; 2]]) {
        (**self).fast_output(starting_pair_index, buf)
    }

    fn set_result(&mut self, n: u64) {
        (**self).set_result(n)
    }

    fn fast_regs(&mut self, starting_pair_index: usize, buf: &mut [[u64; 2]]) {
        (**self).fast_regs(starting_pair_index, buf)
    }
}

/// A trait defined on dummy objects to provide metadata for a hypercall.
pub trait HypercallDefinition {
    /// The hypercall code.
    const CODE: HypercallCode;
    /// The associated hypercall metadata.
    const DATA: HypercallData;
}

/// A trait to dispatch an individual hypercall.
pub trait HypercallDispatch<T> {
    /// Dispatch this hypercall.
    fn dispatch(&mut self, params: HypercallParameters<'_>) -> HypercallOutput;
}

/// A simple, non-variable hypercall.
pub struct SimpleHypercall<In, Out, const CODE: u16>(PhantomData<(In, Out)>);

impl<In, Out, const CODE: u16> SimpleHypercall<In, Out, CODE>
where
    In: IntoBytes + FromBytes + Immutable + KnownLayout,
    Out: IntoBytes + FromBytes + Immutable + KnownLayout,
{
    /// Parses the hypercall parameters to input and output types.
    pub fn parse(params: HypercallParameters<'_>) -> HvResult<(&In, &mut Out)> {
        Ok((
            In::ref_from_prefix(params.input)
                .map_err(|_| HvError::InvalidHypercallInput)?
                .0,
            Out::mut_from_prefix(params.output)
                .map_err(|_| HvError::InvalidHypercallInput)?
                .0,
        ))
    }

    pub fn run(
        params: HypercallParameters<'_>,
        f: impl FnOnce(&In) -> HvResult<Out>,
    ) -> HypercallOutput {
        let (input, output) = match Self::parse(params) {
            Ok(v) => v,
            Err(e) => return e.into(),
        };
        match f(input) {
            Ok(r) => {
                *output = r;
                HypercallOutput::SUCCESS
            }
            Err(e) => HypercallOutput::from(e),
        }
    }
}

impl<In, Out, const CODE: u16> HypercallDefinition for SimpleHypercall<In, Out, CODE> {
    const CODE: HypercallCode = HypercallCode(CODE);

    const DATA: HypercallData = HypercallData::Simple {
        input_size: size_of::<In>(),
        output_size: size_of::<Out>(),
        is_variable: false,
    };
}

/// A simple variable hypercall.
pub struct VariableHypercall<In, Out, const CODE: u16>(PhantomData<(In, Out)>);

impl<In, Out, const CODE: u16> VariableHypercall<In, Out, CODE>
where
    In: IntoBytes + FromBytes + Immutable + KnownLayout,
    Out: IntoBytes + FromBytes + Immutable + KnownLayout,
{
    /// Parses the hypercall parameters to input and output types.
    pub fn parse(params: HypercallParameters<'_>) -> HvResult<(&In, &[u64], &mut Out)> {
        let (input, rest) =
            Ref::<_, In>::from_prefix(params.input).map_err(|_| HvError::InvalidHypercallInput)?;
        Ok((
            Ref::into_ref(input),
            <[u64]>::ref_from_bytes(rest).map_err(|_| HvError::InvalidHypercallInput)?,
            Out::mut_from_prefix(params.output)
                .map_err(|_| HvError::InvalidHypercallInput)?
                .0,
        ))
    }

    pub fn run(
        params: HypercallParameters<'_>,
        f: impl FnOnce(&In, &[u64]) -> HvResult<Out>,
    ) -> HypercallOutput {
        let (input, var_header, output) = match Self::parse(params) {
            Ok(v) => v,
            Err(e) => return e.into(),
        };
        match f(input, var_header) {
            Ok(r) => {
                *output = r;
                HypercallOutput::SUCCESS
            }
            Err(e) => HypercallOutput::from(e),
        }
    }
}

impl<In, Out, const CODE: u16> HypercallDefinition for VariableHypercall<In, Out, CODE> {
    const CODE: HypercallCode = HypercallCode(CODE);

    const DATA: HypercallData = HypercallData::Simple {
        input_size: size_of::<In>(),
        output_size: size_of::<Out>(),
        is_variable: true,
    };
}

/// A rep hypercall.
pub struct RepHypercall<Hdr, In, Out, const CODE: u16>(PhantomData<(Hdr, In, Out)>);

/// Hypervisor result type for rep hypercalls. These hypercalls have either no
/// or only rep output data, which is passed separately from the result. The
/// error is a tuple consisting of an `HvError` and the number of elements
/// successfully processed prior to the error being returned. An `Ok` result
/// implies that all input elements were processed successfully.
pub type HvRepResult = Result<(), (HvError, usize)>;

impl<Hdr, In, Out, const CODE: u16> RepHypercall<Hdr, In, Out, CODE>
where
    Hdr: IntoBytes + FromBytes + Immutable + KnownLayout,
    In: IntoBytes + FromBytes + Immutable + KnownLayout,
    Out: IntoBytes + FromBytes + Immutable + KnownLayout,
{
    /// Parses the hypercall parameters to input and output types.
    pub fn parse(params: HypercallParameters<'_>) -> HvResult<(&Hdr, &[In], &mut [Out])> {
        let (header, rest) =
            Ref::<_, Hdr>::from_prefix(params.input).map_err(|_| HvError::InvalidHypercallInput)?;
        let input = if size_of::<In>() == 0 {
            &[]
        } else {
            <[In]>::ref_from_bytes(rest)
                .map_err(|_| HvError::InvalidHypercallInput)?
                .get(params.control.rep_start()..)
                .ok_or(HvError::InvalidHypercallInput)?
        };
        let output = if size_of::<Out>() == 0 {
            &mut []
        } else {
            <[Out]>::mut_from_prefix_with_elems(
                params.output,
                params.output.len() / size_of::<Out>(),
            )
            .map_err(|_| HvError::InvalidHypercallInput)?
            .0
            .get_mut(params.control.rep_start()..)
            .ok_or(HvError::InvalidHypercallInput)?
        };

        Ok((Ref::into_ref(header), input, output))
    }

    pub fn run(
        params: HypercallParameters<'_>,
        f: impl FnOnce(&Hdr, &[In], &mut [Out]) -> HvRepResult,
    ) -> HypercallOutput {
        let control = params.control;
        let (header, input, output) = match Self::parse(params) {
            Ok(v) => v,
            Err(e) => return e.into(),
        };
        let given = input.len();
        match f(header, input, output) {
            Ok(()) => {
                HypercallOutput::SUCCESS.with_elements_processed(control.rep_start() + given)
            }
            Err((e, reps)) => {
                assert!(
                    control.rep_start() + reps <= control.rep_count(),
                    "more reps processed than requested"
                );
                HypercallOutput::from(e).with_elements_processed(control.rep_start() + reps)
            }
        }
    }
}

impl<Hdr, In, Out, const CODE: u16> HypercallDefinition for RepHypercall<Hdr, In, Out, CODE> {
    const CODE: HypercallCode = HypercallCode(CODE);

    const DATA: HypercallData = HypercallData::Rep {
        header_size: size_of::<Hdr>(),
        input_element_size: size_of::<In>(),
        output_element_size: size_of::<Out>(),
        is_variable: false,
    };
}

/// A variable rep hypercall.
pub struct VariableRepHypercall<Hdr, In, Out, const CODE: u16>(PhantomData<(Hdr, In, Out)>);

impl<Hdr, In, Out, const CODE: u16> VariableRepHypercall<Hdr, In, Out, CODE>
where
    Hdr: IntoBytes + FromBytes + Immutable + KnownLayout,
    In: IntoBytes + FromBytes + Immutable + KnownLayout,
    Out: IntoBytes + FromBytes + Immutable + KnownLayout,
{
    /// Parses the hypercall parameters to input and output types.
    pub fn parse(params: HypercallParameters<'_>) -> HvResult<(&Hdr, &[u64], &[In], &mut [Out])> {
        let (header, rest) =
            Ref::<_, Hdr>::from_prefix(params.input).map_err(|_| HvError::InvalidHypercallInput)?;
        let (var_header, rest) =
            <[u64]>::ref_from_prefix_with_elems(rest, params.control.variable_header_size())
                .map_err(|_| HvError::InvalidHypercallInput)?;
        let input = if size_of::<In>() == 0 {
            &[]
        } else {
            <[In]>::ref_from_bytes(rest)
                .map_err(|_| HvError::InvalidHypercallInput)?
                .get(params.control.rep_start()..)
                .ok_or(HvError::InvalidHypercallInput)?
        };
        let output = if size_of::<Out>() == 0 {
            &mut []
        } else {
            <[Out]>::mut_from_prefix_with_elems(
                params.output,
                params.output.len() / size_of::<Out>(),
            )
            .map_err(|_| HvError::InvalidHypercallInput)?
            .0
            .get_mut(params.control.rep_start()..)
            .ok_or(HvError::InvalidHypercallInput)?
        };
        Ok((Ref::into_ref(header), var_header, input, output))
    }

    pub fn run(
        params: HypercallParameters<'_>,
        f: impl FnOnce(&Hdr, &[u64], &[In], &mut [Out]) -> HvRepResult,
    ) -> HypercallOutput {
        let control = params.control;
        let (header, var_header, input, output) = match Self::parse(params) {
            Ok(v) => v,
            Err(e) => return e.into(),
        };
        let given = input.len();
        match f(header, var_header, input, output) {
            Ok(()) => {
                HypercallOutput::SUCCESS.with_elements_processed(control.rep_start() + given)
            }
            Err((e, reps)) => {
                assert!(
                    control.rep_start() + reps <= control.rep_count(),
                    "more reps processed than requested"
                );
                HypercallOutput::from(e).with_elements_processed(control.rep_start() + reps)
            }
        }
    }
}

impl<Hdr, In, Out, const CODE: u16> HypercallDefinition
    for VariableRepHypercall<Hdr, In, Out, CODE>
{
    const CODE: HypercallCode = HypercallCode(CODE);

    const DATA: HypercallData = HypercallData::Rep {
        header_size: size_of::<Hdr>(),
        input_element_size: size_of::<In>(),
        output_element_size: size_of::<Out>(),
        is_variable: true,
    };
}

/// Creates a hypercall dispatcher, where the dispatcher can support any of
/// the list of provided hypercalls.
///
/// ```ignore
/// viridian_hypercall::dispatcher!(
///     Self,
///     [
///         viridian_hypercall::HvPostMessage,
///         viridian_hypercall::HvSignalEvent,
///     ],
/// );
/// ```
#[macro_export]
macro_rules! dispatcher {
    ($handler:ty, [ $($(#[$a:meta])* $hc:ty),* $(,)? ] $(,)?) => {
        {
            use $crate::{Dispatcher, HypercallDefinition, HypercallHandler};

            Dispatcher::<$handler>::new(|hc| match hc {
                $(
                $(#[$a])*
                <$hc as HypercallDefinition>::CODE => Some(HypercallHandler::new::<$hc>()),
                )*
                _ => None,
            })
        }
    };
}

/// Hypercall dispatcher.
///
/// Construct with [`dispatcher!`].
pub struct Dispatcher<H> {
    lookup: fn(HypercallCode) -> Option<HypercallHandler<H>>,
}

#[doc(hidden)]
pub struct HypercallHandler<H> {
    data: &'static HypercallData,
    f: fn(&mut H, HypercallParameters<'_>) -> HypercallOutput,
}

impl<H> HypercallHandler<H> {
    pub fn new<C: HypercallDefinition>() -> Self
    where
        H: HypercallDispatch<C>,
    {
        Self {
            data: &C::DATA,
            f: H::dispatch,
        }
    }
}

impl<H> Dispatcher<H> {
    #[doc(hidden)]
    pub const fn new(lookup: fn(HypercallCode) -> Option<HypercallHandler<H>>) -> Self {
        Self { lookup }
    }

    /// Dispatches a hypercall.
    pub fn dispatch(&self, pages: PageBuffers<'_>, handler: impl HypercallIo + AsHandler<H>) {
        let mut dispatcher = InnerDispatcher::new(pages, handler);
        let result = match (self.lookup)(dispatcher.code()) {
            Some(x) => dispatcher.dispatch_dyn(x.data, x.f),
            None => dispatcher.unhandled(),
        };
        dispatcher.complete(result);
    }
}
