// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel diagnostics (structured logging, fatal invariant reporting)
//! OWNERS: @kernel-team
//! PUBLIC API: log (log_* macros), fatal()
//! DEPENDS_ON: console
//! INVARIANTS: fatal() never returns; the diagnostic is emitted before the core halts
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#[macro_use]
pub mod log;

use core::fmt::Arguments;

/// Reports a kernel invariant violation and halts the current core.
///
/// The record is written through the raw console path so a violation raised
/// while the console lock is held still leaves a trace.
#[cold]
pub fn fatal(target: &'static str, args: Arguments<'_>) -> ! {
    crate::console::write_line_raw(format_args!("[FATAL {}] {}", target, args));
    panic!("kernel invariant violation ({}): {}", target, args);
}
