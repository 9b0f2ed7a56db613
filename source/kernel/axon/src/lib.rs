// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

//! CONTEXT: axon kernel core: capabilities, protection domains, scheduling, IPC, signals,
//!          pager-based fault handling, interrupt and vCPU objects
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, Trap, Next, KernelConfig, KernelState, Platform traits, hal::sim
//! DEPENDS_ON: axon-abi, spin, bitflags, static_assertions; riscv + sbi-rt on bare-metal riscv64
//! INVARIANTS: All mutable kernel state sits behind one KernelLock; host builds use the
//!             simulated platform so every subsystem is testable without hardware
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod cap;
pub mod config;
pub mod console;
pub mod determinism;
pub mod fault;
pub mod hal;
pub mod ipc;
pub mod irq;
pub mod kernel;
pub mod mm;
pub mod pd;
pub mod sched;
pub mod signal;
pub mod smp;
pub mod state;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod types;
pub mod vcpu;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod arch;

pub use config::KernelConfig;
pub use ipc::Message;
pub use kernel::{Kernel, Next, Trap};
pub use state::KernelState;
pub use syscall::Error;
pub use thread::{ThreadState, UserContext};
pub use types::{CapId, CpuId, Priority};
