// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-wide console sink for kernel diagnostics
//! OWNERS: @kernel-team
//! PUBLIC API: register(), unregister(), ConsoleWriter, with_console(), write_line_raw()
//! DEPENDS_ON: hal::Console, spin::Mutex
//! INVARIANTS: One line is emitted under one lock hold; no sink registered means output is dropped;
//!             the raw path never spins on the sink lock
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt::{self, Write};

use spin::Mutex;

use crate::hal::Console;

static SINK: Mutex<Option<&'static dyn Console>> = Mutex::new(None);

/// Installs the console every subsequent log line goes to.
pub fn register(console: &'static dyn Console) {
    *SINK.lock() = Some(console);
}

/// Removes the registered console. Later log lines are dropped.
pub fn unregister() {
    *SINK.lock() = None;
}

/// Formatter adapter over a registered console.
pub struct ConsoleWriter<'a> {
    console: &'a dyn Console,
}

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.console.write_str(s);
        Ok(())
    }
}

/// Runs `f` with the console locked for the duration of one record.
pub fn with_console(f: impl FnOnce(&mut ConsoleWriter<'_>)) {
    let guard = SINK.lock();
    if let Some(console) = *guard {
        f(&mut ConsoleWriter { console });
    }
}

/// Emits one line without waiting for the sink lock.
///
/// Used on fatal paths where the interrupted code may already hold the sink.
pub fn write_line_raw(args: fmt::Arguments<'_>) {
    if let Some(guard) = SINK.try_lock() {
        if let Some(console) = *guard {
            let mut w = ConsoleWriter { console };
            let _ = w.write_fmt(args);
            let _ = w.write_char('\n');
        }
    }
}
