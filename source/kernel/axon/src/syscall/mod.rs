// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Completion, Handler, SysResult
//! DEPENDS_ON: cap, mm, syscall::api, axon_abi::{Syscall, rc}
//! INVARIANTS: Fixed syscall window; stable IDs from axon_abi; decode/check/execute discipline;
//!             every error maps to exactly one return code
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod api;

use core::fmt;

use axon_abi::{rc, Syscall, ARG_REGS};

use crate::cap::CapError;
use crate::mm::MapError;
use crate::pd::Resource;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in `gpr[0..ARG_REGS]`.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; ARG_REGS],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; ARG_REGS]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// The caller's Pd does not hold the named capability, or it names nothing.
    InvalidCapability,
    /// The capability names an object of another kind.
    WrongKind,
    /// A quota or kernel table is exhausted.
    OutOfResources(Resource),
    InvalidArgument,
    /// The operation was aborted by destruction or resumption of a peer.
    Cancelled,
    UnhandledFault,
    /// The object is in use on another core.
    Busy,
    /// The target is in a state that does not allow the operation.
    BadState,
    Denied,
}

impl Error {
    /// Return code written to the caller's return register.
    pub const fn code(self) -> isize {
        match self {
            Self::InvalidSyscall => rc::INVALID_SYSCALL,
            Self::InvalidCapability => rc::INVALID_CAPABILITY,
            Self::WrongKind => rc::WRONG_KIND,
            Self::OutOfResources(_) => rc::OUT_OF_RESOURCES,
            Self::InvalidArgument => rc::INVALID_ARGUMENT,
            Self::Cancelled => rc::CANCELLED,
            Self::UnhandledFault => rc::UNHANDLED_FAULT,
            Self::Busy => rc::BUSY,
            Self::BadState => rc::BAD_STATE,
            Self::Denied => rc::DENIED,
        }
    }
}

impl From<CapError> for Error {
    fn from(value: CapError) -> Self {
        match value {
            CapError::Invalid => Self::InvalidCapability,
            CapError::WrongKind { .. } => Self::WrongKind,
            CapError::OutOfResources(resource) => Self::OutOfResources(resource),
        }
    }
}

impl From<MapError> for Error {
    fn from(value: MapError) -> Self {
        match value {
            MapError::NoMemory => Self::OutOfResources(Resource::AddressSpaces),
            _ => Self::InvalidArgument,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a handler left the calling thread.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Finished; the value lands in the secondary return register.
    Done(usize),
    /// The thread blocked; whoever wakes it writes the return registers.
    Blocked,
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<Completion>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; Syscall::COUNT],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; Syscall::COUNT] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: Syscall, handler: Handler) {
        self.handlers[number.as_raw()] = Some(handler);
    }

    /// Executes the handler referenced by `number`.
    pub fn dispatch(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<Completion> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_abi::ObjectKind;

    #[test]
    fn error_codes_are_distinct() {
        let all = [
            Error::InvalidSyscall,
            Error::InvalidCapability,
            Error::WrongKind,
            Error::OutOfResources(Resource::Objects),
            Error::InvalidArgument,
            Error::Cancelled,
            Error::UnhandledFault,
            Error::Busy,
            Error::BadState,
            Error::Denied,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn cap_errors_map_to_codes() {
        let wrong = CapError::WrongKind { expected: ObjectKind::Thread, found: ObjectKind::Pd };
        assert_eq!(Error::from(wrong), Error::WrongKind);
        assert_eq!(Error::from(CapError::Invalid).code(), rc::INVALID_CAPABILITY);
        assert_eq!(Error::from(MapError::NoMemory).code(), rc::OUT_OF_RESOURCES);
    }

    #[test]
    fn unknown_numbers_are_invalid() {
        let table = SyscallTable::new();
        let mut k = crate::state::test_support::TestKernel::new(1);
        let caller = k.state.root_thread();
        let mut ctx = api::Context::new(&mut k.state, &k.platform, crate::types::CpuId::BOOT, caller);
        assert_eq!(table.dispatch(99, &mut ctx, &Args::default()), Err(Error::InvalidSyscall));
        assert_eq!(table.dispatch(0, &mut ctx, &Args::default()), Err(Error::InvalidSyscall));
    }
}
