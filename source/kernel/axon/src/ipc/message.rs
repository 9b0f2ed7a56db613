// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-size IPC message (16-byte header + MSG_WORDS payload words)
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: Message::{new, with_cap, payload, label, badge, cap, flags}
//! DEPENDS_ON: axon_abi::{MsgHeader, MsgFlags, MSG_WORDS}
//! INVARIANTS: header.words <= MSG_WORDS; the badge is only ever written by the kernel
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use axon_abi::{MsgFlags, MsgHeader, MSG_WORDS};

use crate::types::{Badge, CapId};

/// One message buffer. Every thread owns exactly one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub header: MsgHeader,
    pub words: [usize; MSG_WORDS],
}

static_assertions::assert_eq_size!(MsgHeader, [u8; MsgHeader::SIZE]);

impl Message {
    /// Builds a message; payload beyond `MSG_WORDS` is truncated.
    pub fn new(label: u16, payload: &[usize]) -> Self {
        let len = payload.len().min(MSG_WORDS);
        let mut words = [0usize; MSG_WORDS];
        words[..len].copy_from_slice(&payload[..len]);
        Self { header: MsgHeader::new(0, label, 0, len as u16, axon_abi::CAP_INVALID), words }
    }

    /// Attaches one capability for transfer.
    pub fn with_cap(mut self, cap: CapId) -> Self {
        self.header.cap = cap.as_raw();
        self.set_flag(MsgFlags::CAP, cap.is_valid());
        self
    }

    pub fn payload(&self) -> &[usize] {
        &self.words[..usize::from(self.header.words).min(MSG_WORDS)]
    }

    #[inline]
    pub fn label(&self) -> u16 {
        self.header.label
    }

    #[inline]
    pub fn badge(&self) -> u32 {
        self.header.badge
    }

    #[inline]
    pub fn flags(&self) -> MsgFlags {
        self.header.msg_flags()
    }

    /// Attached capability, if the CAP flag is set.
    pub fn cap(&self) -> Option<CapId> {
        let cap = CapId::from_raw(self.header.cap);
        (self.flags().contains(MsgFlags::CAP) && cap.is_valid()).then_some(cap)
    }

    pub(crate) fn stamp(&mut self, badge: Badge) {
        self.header.badge = badge.as_raw();
        self.header.reserved = 0;
        if usize::from(self.header.words) > MSG_WORDS {
            self.header.words = MSG_WORDS as u16;
        }
    }

    pub(crate) fn set_flag(&mut self, flag: MsgFlags, on: bool) {
        let mut flags = self.flags();
        flags.set(flag, on);
        self.header.flags = flags.bits();
    }

    /// Removes the attached capability, marking it dropped.
    pub(crate) fn drop_cap(&mut self) {
        self.header.cap = axon_abi::CAP_INVALID;
        self.set_flag(MsgFlags::CAP, false);
        self.set_flag(MsgFlags::CAP_DROPPED, true);
    }
}
