// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Stable user/kernel boundary of the axon kernel core
//! OWNERS: @runtime
//! PUBLIC API: Syscall, ObjectKind, rc::*, MsgHeader, MsgFlags, FaultKind, FaultRecord,
//!             MapAttrs, CachePolicy, MappingWords, SignalInfo, args::CreateArgs, register layout constants
//! DEPENDS_ON: no_std, bitflags
//! INVARIANTS: Header is 16 bytes LE; syscall numbers and return codes never change meaning
//!             within an ABI version; decoders reject unknown values instead of guessing
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use bitflags::bitflags;

/// Version of the register and message layout described by this crate.
pub const ABI_VERSION: u32 = 1;

/// Number of general purpose registers carried in a user context.
pub const GPR_COUNT: usize = 8;
/// Register holding the syscall number on kernel entry.
pub const SYSCALL_NUMBER_REG: usize = 7;
/// Number of argument registers (`gpr[0..ARG_REGS]`).
pub const ARG_REGS: usize = 6;
/// Register receiving the syscall return code.
pub const RETURN_REG: usize = 0;
/// Register receiving the secondary return value (new capability, signal count, ...).
pub const RETURN_VALUE_REG: usize = 1;

/// Payload words carried by one IPC message.
pub const MSG_WORDS: usize = 8;

/// The invalid capability id. Never names an object.
pub const CAP_INVALID: u32 = 0;

/// Stable syscall numbers.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Syscall {
    /// `create(pd, kind, args...)`
    CreateObject = 0,
    /// `destroy(cap)`
    DestroyObject = 1,
    /// `call(dest)` with the request staged in the caller's message buffer.
    Call = 2,
    /// `wait_for_request()`
    WaitForRequest = 3,
    /// `reply()` to the pending caller.
    Reply = 4,
    /// `reply_and_wait()`: reply, then block for the next request.
    ReplyAndWait = 5,
    /// `submit_signal(context, count)`
    SubmitSignal = 6,
    /// `wait_for_signal(receiver)`
    WaitForSignal = 7,
    /// `ack_irq(interrupt)`
    AckIrq = 8,
    /// `update_pd(pd)`: flush stale translations everywhere the domain is active.
    UpdatePd = 9,
    /// `start_thread(thread, ip, sp)`
    StartThread = 10,
    /// `pause_thread(thread)`
    PauseThread = 11,
    /// `resume_thread(thread)`
    ResumeThread = 12,
    /// `yield_thread()`
    YieldThread = 13,
    /// `set_affinity(thread, cpu)`
    SetAffinity = 14,
    /// `set_pager(thread, pager)`
    SetPager = 15,
    /// `read_register(thread, index)`
    ReadRegister = 16,
    /// `write_register(thread, index, value)`
    WriteRegister = 17,
    /// `run_vcpu(vcpu)`
    RunVcpu = 18,
    /// `pause_vcpu(vcpu)`
    PauseVcpu = 19,
}

impl Syscall {
    /// Number of assigned syscall slots.
    pub const COUNT: usize = 20;

    /// Decodes a raw syscall number.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        Some(match raw {
            0 => Self::CreateObject,
            1 => Self::DestroyObject,
            2 => Self::Call,
            3 => Self::WaitForRequest,
            4 => Self::Reply,
            5 => Self::ReplyAndWait,
            6 => Self::SubmitSignal,
            7 => Self::WaitForSignal,
            8 => Self::AckIrq,
            9 => Self::UpdatePd,
            10 => Self::StartThread,
            11 => Self::PauseThread,
            12 => Self::ResumeThread,
            13 => Self::YieldThread,
            14 => Self::SetAffinity,
            15 => Self::SetPager,
            16 => Self::ReadRegister,
            17 => Self::WriteRegister,
            18 => Self::RunVcpu,
            19 => Self::PauseVcpu,
            _ => return None,
        })
    }

    /// Returns the raw syscall number.
    pub const fn as_raw(self) -> usize {
        self as usize
    }
}

/// Kernel object kinds that `create` accepts.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    /// Schedulable thread.
    Thread = 0,
    /// Protection domain.
    Pd = 1,
    /// Signal context (source of asynchronous notifications).
    SignalContext = 2,
    /// Signal receiver (set of contexts a thread can wait on).
    SignalReceiver = 3,
    /// Interrupt object binding a hardware IRQ to a signal context.
    Interrupt = 4,
    /// Virtual CPU.
    Vcpu = 5,
}

impl ObjectKind {
    /// Decodes a raw kind value.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        Some(match raw {
            0 => Self::Thread,
            1 => Self::Pd,
            2 => Self::SignalContext,
            3 => Self::SignalReceiver,
            4 => Self::Interrupt,
            5 => Self::Vcpu,
            _ => return None,
        })
    }
}

/// Syscall return codes written to [`RETURN_REG`] (as two's complement `isize`).
pub mod rc {
    /// Operation completed.
    pub const OK: isize = 0;
    /// Capability id does not name a live object held by the caller.
    pub const INVALID_CAPABILITY: isize = -1;
    /// A quota (objects, RAM, capability slots, ids) is exhausted.
    pub const OUT_OF_RESOURCES: isize = -2;
    /// Blocking operation was cancelled (partner destroyed, thread resumed).
    pub const CANCELLED: isize = -3;
    /// A fault could not be resolved.
    pub const UNHANDLED_FAULT: isize = -4;
    /// Unknown syscall number.
    pub const INVALID_SYSCALL: isize = -5;
    /// Malformed argument.
    pub const INVALID_ARGUMENT: isize = -6;
    /// Capability names an object of the wrong kind.
    pub const WRONG_KIND: isize = -7;
    /// Object is in use on another core.
    pub const BUSY: isize = -8;
    /// Object is in a state that does not permit the operation.
    pub const BAD_STATE: isize = -9;
    /// Caller lacks the authority for the operation.
    pub const DENIED: isize = -10;

    /// Encodes a return code for a register slot.
    pub const fn encode(code: isize) -> usize {
        code as usize
    }

    /// Decodes a register slot into a return code.
    pub const fn decode(raw: usize) -> isize {
        raw as isize
    }
}

bitflags! {
    /// Flags carried in [`MsgHeader::flags`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MsgFlags: u16 {
        /// The `cap` field carries a transferred capability.
        const CAP = 1 << 0;
        /// The message is a kernel-synthesized fault notification.
        const FAULT = 1 << 1;
        /// A capability was attached but the receiver could not take it.
        const CAP_DROPPED = 1 << 2;
        /// The message is a signal delivery record.
        const SIGNAL = 1 << 3;
    }
}

/// IPC message header shared between kernel and userland.
#[repr(C, align(4))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// Kernel-assigned sender identity. Never chosen by the sender.
    pub badge: u32,
    /// Protocol label chosen by the sender.
    pub label: u16,
    /// Raw [`MsgFlags`].
    pub flags: u16,
    /// Number of valid payload words.
    pub words: u16,
    /// Reserved, zero.
    pub reserved: u16,
    /// Transferred capability id or [`CAP_INVALID`].
    pub cap: u32,
}

impl MsgHeader {
    /// Serialized size of the header.
    pub const SIZE: usize = 16;

    /// Creates a header with the provided fields.
    pub const fn new(badge: u32, label: u16, flags: u16, words: u16, cap: u32) -> Self {
        Self { badge, label, flags, words, reserved: 0, cap }
    }

    /// Decoded view of [`Self::flags`]; unknown bits are dropped.
    pub const fn msg_flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.flags)
    }

    /// Serialises the header to a little-endian byte array.
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut buf = [0_u8; 16];
        buf[0..4].copy_from_slice(&self.badge.to_le_bytes());
        buf[4..6].copy_from_slice(&self.label.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..10].copy_from_slice(&self.words.to_le_bytes());
        buf[10..12].copy_from_slice(&self.reserved.to_le_bytes());
        buf[12..16].copy_from_slice(&self.cap.to_le_bytes());
        buf
    }

    /// Deserialises a little-endian byte array into a header.
    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        let badge = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let label = u16::from_le_bytes([bytes[4], bytes[5]]);
        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        let words = u16::from_le_bytes([bytes[8], bytes[9]]);
        let reserved = u16::from_le_bytes([bytes[10], bytes[11]]);
        let cap = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        Self { badge, label, flags, words, reserved, cap }
    }
}

/// Classification of a synchronous exception.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Translation missing or permission violated.
    PageFault = 0,
    /// Undefined or privileged instruction.
    IllegalInstruction = 1,
    /// Misaligned access.
    Alignment = 2,
    /// Breakpoint instruction.
    Breakpoint = 3,
    /// Any other synchronous exception.
    Unknown = 4,
}

impl FaultKind {
    /// Decodes a raw fault kind.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        Some(match raw {
            0 => Self::PageFault,
            1 => Self::IllegalInstruction,
            2 => Self::Alignment,
            3 => Self::Breakpoint,
            4 => Self::Unknown,
            _ => return None,
        })
    }
}

/// Label of a kernel-synthesized fault message.
pub const FAULT_LABEL: u16 = 0xFA17;
/// Label of a signal delivery record.
pub const SIGNAL_LABEL: u16 = 0x5160;

/// Pager reply label: install the mapping in words `[phys, virt, size, attrs]`.
pub const PAGER_MAP: u16 = 1;
/// Pager reply label: the fault cannot be resolved.
pub const PAGER_DECLINE: u16 = 0;

/// Fault access flag: the faulting access was a write.
pub const FAULT_WRITE: usize = 1 << 0;
/// Fault access flag: the faulting access was an instruction fetch.
pub const FAULT_EXEC: usize = 1 << 1;

/// Fault description delivered to a pager as message payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    /// Exception class.
    pub kind: FaultKind,
    /// Faulting address (data address or instruction pointer).
    pub addr: usize,
    /// Instruction pointer at the time of the fault.
    pub ip: usize,
    /// `FAULT_WRITE` / `FAULT_EXEC` bits.
    pub access: usize,
}

impl FaultRecord {
    /// Payload words used by the record.
    pub const WORDS: usize = 4;

    /// Encodes the record as message payload.
    pub const fn to_words(&self) -> [usize; Self::WORDS] {
        [self.kind as usize, self.addr, self.ip, self.access]
    }

    /// Decodes a record from message payload.
    pub fn from_words(words: &[usize]) -> Option<Self> {
        if words.len() < Self::WORDS {
            return None;
        }
        Some(Self {
            kind: FaultKind::from_raw(words[0])?,
            addr: words[1],
            ip: words[2],
            access: words[3],
        })
    }

    /// Returns true for write accesses.
    pub const fn is_write(&self) -> bool {
        self.access & FAULT_WRITE != 0
    }
}

bitflags! {
    /// Access rights of a mapping.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MapAttrs: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
        /// Accessible from user mode.
        const USER = 1 << 3;
    }
}

/// Cache policy of a mapping.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Normal cached memory.
    Cached = 0,
    /// Device memory.
    Uncached = 1,
    /// Write-combined memory.
    WriteCombined = 2,
}

impl CachePolicy {
    /// Decodes a raw cache policy.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Cached,
            1 => Self::Uncached,
            2 => Self::WriteCombined,
            _ => return None,
        })
    }
}

/// Bit offset of the cache policy inside a packed attribute word.
const CACHE_SHIFT: u32 = 8;

/// Mapping description as carried in pager replies: `[phys, virt, size, attrs | cache << 8]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingWords {
    /// Physical base.
    pub phys: usize,
    /// Virtual base.
    pub virt: usize,
    /// Size in bytes.
    pub size: usize,
    /// Access rights.
    pub attrs: MapAttrs,
    /// Cache policy.
    pub cache: CachePolicy,
}

impl MappingWords {
    /// Payload words used by a mapping description.
    pub const WORDS: usize = 4;

    /// Encodes the mapping as message payload.
    pub fn to_words(&self) -> [usize; Self::WORDS] {
        let packed = self.attrs.bits() | ((self.cache as u32) << CACHE_SHIFT);
        [self.phys, self.virt, self.size, packed as usize]
    }

    /// Decodes a mapping description. Unknown attribute bits or cache policies are rejected.
    pub fn from_words(words: &[usize]) -> Option<Self> {
        if words.len() < Self::WORDS {
            return None;
        }
        let packed = u32::try_from(words[3]).ok()?;
        let attrs = MapAttrs::from_bits(packed & 0xff)?;
        let cache = CachePolicy::from_raw(packed >> CACHE_SHIFT)?;
        Some(Self { phys: words[0], virt: words[1], size: words[2], attrs, cache })
    }
}

/// Result of a signal wait: the context's imprint and the number of coalesced submits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalInfo {
    /// Opaque value chosen when the context was created.
    pub imprint: usize,
    /// Number of submits since the last delivery.
    pub count: u32,
}

impl SignalInfo {
    /// Payload words used by a signal record.
    pub const WORDS: usize = 2;

    /// Encodes the record as message payload.
    pub const fn to_words(&self) -> [usize; Self::WORDS] {
        [self.imprint, self.count as usize]
    }

    /// Decodes a signal record.
    pub fn from_words(words: &[usize]) -> Option<Self> {
        if words.len() < Self::WORDS {
            return None;
        }
        Some(Self { imprint: words[0], count: u32::try_from(words[1]).ok()? })
    }
}

/// Fixed-layout argument blocks for `create_object`.
///
/// Register layout: `gpr[0]` = target Pd, `gpr[1]` = [`ObjectKind`], `gpr[2..6]` = kind-specific
/// words as encoded by [`CreateArgs::to_words`].
pub mod args {
    use super::ObjectKind;

    /// Kind-specific argument words.
    pub const CREATE_WORDS: usize = 4;
    /// Affinity word value meaning "no fixed core".
    pub const NO_AFFINITY: usize = usize::MAX;

    /// Thread creation arguments.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ThreadArgs {
        /// Priority band, `0` is the lowest.
        pub priority: u8,
        /// CPU quota per super-period in ns; `0` selects the full super-period.
        pub quota_ns: u64,
        /// Fixed core, if any.
        pub affinity: Option<u16>,
    }

    /// Protection-domain creation arguments (quotas donated by the parent).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PdArgs {
        /// Maximum live objects charged to the new Pd.
        pub objects: u32,
        /// RAM quota in bytes.
        pub ram: usize,
        /// Maximum capabilities the new Pd may hold.
        pub cap_slots: u32,
    }

    /// Signal-context creation arguments.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SignalContextArgs {
        /// Receiver the context binds to.
        pub receiver: u32,
        /// Opaque value handed back by `wait_for_signal`.
        pub imprint: usize,
    }

    /// Interrupt-object creation arguments.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterruptArgs {
        /// Hardware interrupt line.
        pub irq: u32,
        /// Signal context notified on every occurrence.
        pub context: u32,
    }

    /// Virtual-CPU creation arguments.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VcpuArgs {
        /// Signal context notified on every VM exit.
        pub exit_context: u32,
    }

    /// Decoded `create_object` argument block.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum CreateArgs {
        /// See [`ThreadArgs`].
        Thread(ThreadArgs),
        /// See [`PdArgs`].
        Pd(PdArgs),
        /// See [`SignalContextArgs`].
        SignalContext(SignalContextArgs),
        /// No arguments.
        SignalReceiver,
        /// See [`InterruptArgs`].
        Interrupt(InterruptArgs),
        /// See [`VcpuArgs`].
        Vcpu(VcpuArgs),
    }

    fn cap_word(raw: usize) -> Option<u32> {
        u32::try_from(raw).ok()
    }

    impl CreateArgs {
        /// Object kind the block creates.
        pub const fn kind(&self) -> ObjectKind {
            match self {
                Self::Thread(_) => ObjectKind::Thread,
                Self::Pd(_) => ObjectKind::Pd,
                Self::SignalContext(_) => ObjectKind::SignalContext,
                Self::SignalReceiver => ObjectKind::SignalReceiver,
                Self::Interrupt(_) => ObjectKind::Interrupt,
                Self::Vcpu(_) => ObjectKind::Vcpu,
            }
        }

        /// Encodes the kind-specific words.
        pub fn to_words(&self) -> [usize; CREATE_WORDS] {
            match *self {
                Self::Thread(t) => [
                    t.priority as usize,
                    t.quota_ns as usize,
                    t.affinity.map_or(NO_AFFINITY, usize::from),
                    0,
                ],
                Self::Pd(p) => [p.objects as usize, p.ram, p.cap_slots as usize, 0],
                Self::SignalContext(c) => [c.receiver as usize, c.imprint, 0, 0],
                Self::SignalReceiver => [0; CREATE_WORDS],
                Self::Interrupt(i) => [i.irq as usize, i.context as usize, 0, 0],
                Self::Vcpu(v) => [v.exit_context as usize, 0, 0, 0],
            }
        }

        /// Decodes the kind-specific words. Out-of-range values are rejected.
        pub fn from_words(kind: ObjectKind, words: &[usize; CREATE_WORDS]) -> Option<Self> {
            Some(match kind {
                ObjectKind::Thread => {
                    let affinity = match words[2] {
                        NO_AFFINITY => None,
                        raw => Some(u16::try_from(raw).ok()?),
                    };
                    Self::Thread(ThreadArgs {
                        priority: u8::try_from(words[0]).ok()?,
                        quota_ns: words[1] as u64,
                        affinity,
                    })
                }
                ObjectKind::Pd => Self::Pd(PdArgs {
                    objects: u32::try_from(words[0]).ok()?,
                    ram: words[1],
                    cap_slots: u32::try_from(words[2]).ok()?,
                }),
                ObjectKind::SignalContext => Self::SignalContext(SignalContextArgs {
                    receiver: cap_word(words[0])?,
                    imprint: words[1],
                }),
                ObjectKind::SignalReceiver => Self::SignalReceiver,
                ObjectKind::Interrupt => Self::Interrupt(InterruptArgs {
                    irq: u32::try_from(words[0]).ok()?,
                    context: cap_word(words[1])?,
                }),
                ObjectKind::Vcpu => Self::Vcpu(VcpuArgs { exit_context: cap_word(words[0])? }),
            })
        }
    }
}
