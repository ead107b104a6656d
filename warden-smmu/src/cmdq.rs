//! Command queue
//!
//! The driver produces [`CmdEntry`] slots and the controller consumes them.
//! One lock serializes submission: a caller reserves room, writes its
//! commands, publishes the producer index and (optionally) appends a
//! CMD_SYNC and waits for the consumer to pass it.
//!
//! # Error recovery
//!
//! A command the controller cannot execute stops consumption and raises
//! GERROR.CMDQ_ERR with the reason in CMDQ_CONS.ERR. The waiter notices the
//! active error, and depending on the reason:
//!
//! - **Illegal** (or unknown): the offending slot is overwritten with a
//!   CMD_SYNC so consumption skips it
//! - **Abort**: the fetch is retried as is
//! - **ATC invalidation sync timeout**: consumption resumes as is
//!
//! then acknowledges the error by toggling GERRORN. Everything queued behind
//! the offending command still executes; the sync reports
//! [`SmmuError::HardwareFault`] with the error code.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;
use tock_registers::LocalRegisterCopy;
use warden_common::{FrameAllocator, PhysAddr};
use warden_mmio::{Backoff, PollConfig, Queue, RegisterIo, barrier};

use crate::cmd::{CmdEntry, Command, SyncCompletion};
use crate::config::BATCH_ENTRIES;
use crate::error::SmmuError;
use crate::frames::Frames;
use crate::regs::{
    CMDQ_CONS, GERROR, Q_BASE, SMMU_CMDQ_CONS, SMMU_CMDQ_PROD, SMMU_GERROR, SMMU_GERRORN,
};

/// The command queue of one controller.
pub struct Cmdq {
    queue: Mutex<Queue<CmdEntry>>,
    poll: PollConfig,
    sync_cs: SyncCompletion,
    force_sync: bool,
    _mem: Option<Frames>,
}

impl Cmdq {
    /// Allocate a queue of `2^log2size` entries.
    pub fn new(
        alloc: &Arc<dyn FrameAllocator>,
        log2size: u32,
        poll: PollConfig,
        sync_cs: SyncCompletion,
        force_sync: bool,
    ) -> Result<Self, SmmuError> {
        let mem = Frames::alloc(alloc, Queue::<CmdEntry>::memory_size(log2size) as u64)?;
        // SAFETY: mem covers memory_size(log2size) bytes and lives as long as
        // the queue
        let queue = unsafe {
            Queue::new(
                mem.as_mut_ptr(),
                mem.pa().as_u64(),
                log2size,
                SMMU_CMDQ_PROD,
                SMMU_CMDQ_CONS,
            )
        };
        Ok(Self {
            queue: Mutex::new(queue),
            poll,
            sync_cs,
            force_sync,
            _mem: Some(mem),
        })
    }

    /// Drive a queue whose memory someone else owns.
    ///
    /// # Safety
    ///
    /// `base` must be zeroed memory of at least
    /// `Queue::<CmdEntry>::memory_size(log2size)` bytes, reachable through
    /// the direct map, that outlives the returned queue.
    pub unsafe fn adopt(
        base: PhysAddr,
        log2size: u32,
        poll: PollConfig,
        sync_cs: SyncCompletion,
    ) -> Self {
        // SAFETY: guaranteed by the caller
        let queue = unsafe {
            Queue::new(
                base.to_virt().as_mut_ptr(),
                base.as_u64(),
                log2size,
                SMMU_CMDQ_PROD,
                SMMU_CMDQ_CONS,
            )
        };
        Self {
            queue: Mutex::new(queue),
            poll,
            sync_cs,
            force_sync: false,
            _mem: None,
        }
    }

    /// Value for SMMU_CMDQ_BASE.
    #[must_use]
    pub fn base_register(&self) -> u64 {
        let queue = self.queue.lock();
        let mut reg = LocalRegisterCopy::<u64, Q_BASE::Register>::new(0);
        reg.write(
            Q_BASE::RWA::SET
                + Q_BASE::ADDR.val(queue.base() >> 5)
                + Q_BASE::LOG2SIZE.val(u64::from(queue.log2size())),
        );
        reg.get()
    }

    #[must_use]
    pub fn log2size(&self) -> u32 {
        self.queue.lock().log2size()
    }

    /// Forget all indices after the controller's own were reset to zero.
    pub fn reset_indices(&self) {
        self.queue.lock().set_indices(0, 0);
    }

    /// Publish `cmds`, then, with `sync`, a CMD_SYNC, and wait for it.
    pub fn issue<R: RegisterIo + ?Sized>(
        &self,
        io: &R,
        cmds: &[Command],
        sync: bool,
    ) -> Result<(), SmmuError> {
        let n = cmds.len() + usize::from(sync);
        if n == 0 {
            return Ok(());
        }
        let n = u32::try_from(n).map_err(|_| SmmuError::Configuration)?;

        let mut queue = self.queue.lock();
        let start = queue.reserve(io, n, &self.poll)?;
        for (i, cmd) in cmds.iter().enumerate() {
            log::trace!("cmdq: {cmd:?}");
            let p = queue.advance(start, i as u32);
            queue.write_entry(p, &cmd.encode());
        }
        if sync {
            let p = queue.advance(start, n - 1);
            queue.write_entry(p, &Command::Sync { cs: self.sync_cs }.encode());
        }
        let new_prod = queue.advance(start, n);
        queue.commit(io, new_prod);

        if sync {
            self.wait_for_sync(io, &mut queue)
        } else {
            Ok(())
        }
    }

    /// Issue one command followed by a sync.
    pub fn issue_sync<R: RegisterIo + ?Sized>(&self, io: &R, cmd: Command) -> Result<(), SmmuError> {
        self.issue(io, &[cmd], true)
    }

    /// Wait for everything queued so far.
    pub fn sync<R: RegisterIo + ?Sized>(&self, io: &R) -> Result<(), SmmuError> {
        self.issue(io, &[], true)
    }

    /// Start a batch of commands submitted through this queue.
    #[must_use]
    pub fn batch<'a, R: RegisterIo + ?Sized>(&'a self, io: &'a R) -> CommandBatch<'a, R> {
        CommandBatch {
            cmdq: self,
            io,
            cmds: Vec::with_capacity(BATCH_ENTRIES),
        }
    }

    /// Handle a command queue error reported outside a sync wait.
    ///
    /// Returns the error code when an error was active.
    pub fn recover<R: RegisterIo + ?Sized>(&self, io: &R) -> Option<u8> {
        let mut queue = self.queue.lock();
        self.skip_error(io, &mut queue)
    }

    fn wait_for_sync<R: RegisterIo + ?Sized>(
        &self,
        io: &R,
        queue: &mut Queue<CmdEntry>,
    ) -> Result<(), SmmuError> {
        let mut backoff = Backoff::new(self.poll);
        let mut fault = None;
        loop {
            queue.sync_cons(io);
            if queue.is_empty() {
                return match fault {
                    Some(code) => Err(SmmuError::HardwareFault(code)),
                    None => Ok(()),
                };
            }
            if let Some(code) = self.skip_error(io, queue) {
                fault = Some(code);
                continue;
            }
            if let Err(timeout) = backoff.wait() {
                log::warn!(
                    "cmdq: sync timed out (prod {:#x}, cons {:#x})",
                    queue.prod(),
                    queue.cons()
                );
                return Err(timeout.into());
            }
        }
    }

    fn skip_error<R: RegisterIo + ?Sized>(&self, io: &R, queue: &mut Queue<CmdEntry>) -> Option<u8> {
        let gerror = io.read32(SMMU_GERROR);
        let gerrorn = io.read32(SMMU_GERRORN);
        let active = LocalRegisterCopy::<u32, GERROR::Register>::new(gerror ^ gerrorn);
        if !active.is_set(GERROR::CMDQ_ERR) {
            return None;
        }

        let cons = io.read32(SMMU_CMDQ_CONS);
        let reason = LocalRegisterCopy::<u32, CMDQ_CONS::Register>::new(cons);
        let code = reason.read(CMDQ_CONS::ERR) as u8;
        let bad = queue.read_entry(cons);
        log::error!(
            "cmdq: error {code:#x} at cons {cons:#x}: {:?} ({:#018x} {:#018x})",
            Command::decode(&bad),
            bad.dwords[0],
            bad.dwords[1]
        );

        match reason.read_as_enum(CMDQ_CONS::ERR) {
            Some(CMDQ_CONS::ERR::Value::NoError) => {}
            Some(CMDQ_CONS::ERR::Value::Abort) => log::error!("cmdq: retrying command fetch"),
            Some(CMDQ_CONS::ERR::Value::AtcInvSync) => {
                log::error!("cmdq: ATC invalidation timed out");
            }
            Some(CMDQ_CONS::ERR::Value::Illegal) | None => {
                queue.write_entry(cons, &Command::Sync { cs: self.sync_cs }.encode());
                barrier::write_barrier();
            }
        }

        io.write32(SMMU_GERRORN, gerrorn ^ GERROR::CMDQ_ERR::SET.value);
        Some(code)
    }
}

impl core::fmt::Debug for Cmdq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("Cmdq")
            .field("base", &format_args!("{:#x}", queue.base()))
            .field("log2size", &queue.log2size())
            .field("prod", &queue.prod())
            .field("cons", &queue.cons())
            .finish()
    }
}

/// Commands accumulated for one submission.
///
/// A full batch is published without a sync (with one when the queue needs
/// forced syncs); [`submit`](Self::submit) publishes the rest followed by a
/// sync and waits.
pub struct CommandBatch<'a, R: RegisterIo + ?Sized> {
    cmdq: &'a Cmdq,
    io: &'a R,
    cmds: Vec<Command>,
}

impl<R: RegisterIo + ?Sized> CommandBatch<'_, R> {
    /// Append a command, flushing the batch when it is full.
    pub fn add(&mut self, cmd: Command) -> Result<(), SmmuError> {
        if self.cmds.len() == BATCH_ENTRIES - 1 && self.cmdq.force_sync {
            self.cmdq.issue(self.io, &self.cmds, true)?;
            self.cmds.clear();
        }
        if self.cmds.len() == BATCH_ENTRIES {
            self.cmdq.issue(self.io, &self.cmds, false)?;
            self.cmds.clear();
        }
        self.cmds.push(cmd);
        Ok(())
    }

    /// Commands not yet published.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Publish the remaining commands and a sync, and wait.
    pub fn submit(self) -> Result<(), SmmuError> {
        self.cmdq.issue(self.io, &self.cmds, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::opcode;
    use crate::regs::{CR0, SMMU_CMDQ_BASE, SMMU_CR0};
    use crate::sim::{SimConfig, SimSmmu};
    use warden_common::HeapFrameAllocator;

    fn setup(log2size: u32) -> (SimSmmu, Cmdq) {
        let sim = SimSmmu::new(SimConfig::default());
        let alloc: Arc<dyn FrameAllocator> = Arc::new(HeapFrameAllocator::new());
        let cmdq = Cmdq::new(
            &alloc,
            log2size,
            PollConfig::IMMEDIATE,
            SyncCompletion::None,
            false,
        )
        .unwrap();
        sim.write64(SMMU_CMDQ_BASE, cmdq.base_register());
        sim.write32(SMMU_CR0, CR0::CMDQEN::SET.value);
        (sim, cmdq)
    }

    #[test]
    fn test_issue_with_sync() {
        let (sim, cmdq) = setup(4);
        cmdq.issue(&sim, &[Command::CfgiSte { sid: 3, leaf: true }], true)
            .unwrap();
        assert_eq!(
            sim.commands(),
            [
                Command::CfgiSte { sid: 3, leaf: true },
                Command::Sync { cs: SyncCompletion::None }
            ]
        );
    }

    #[test]
    fn test_sync_times_out_when_controller_stalls() {
        let (sim, cmdq) = setup(4);
        sim.set_stalled(true);
        assert_eq!(cmdq.sync(&sim), Err(SmmuError::Timeout));
    }

    #[test]
    fn test_batch_flushes_when_full() {
        let (sim, cmdq) = setup(8);
        let mut batch = cmdq.batch(&sim);
        for asid in 0..(BATCH_ENTRIES as u16 + 2) {
            batch.add(Command::TlbiNhAsid { asid, vmid: 0 }).unwrap();
        }
        assert_eq!(batch.len(), 2);
        batch.submit().unwrap();

        let batches = sim.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), BATCH_ENTRIES);
        assert!(!batches[0].iter().any(|c| c.opcode() == opcode::CMD_SYNC));
        assert_eq!(batches[1].len(), 3);
    }

    #[test]
    fn test_forced_sync_before_batch_wraps() {
        let sim = SimSmmu::new(SimConfig::default());
        let alloc: Arc<dyn FrameAllocator> = Arc::new(HeapFrameAllocator::new());
        let cmdq = Cmdq::new(&alloc, 8, PollConfig::IMMEDIATE, SyncCompletion::None, true).unwrap();
        sim.write64(SMMU_CMDQ_BASE, cmdq.base_register());
        sim.write32(SMMU_CR0, CR0::CMDQEN::SET.value);

        let mut batch = cmdq.batch(&sim);
        for asid in 0..BATCH_ENTRIES as u16 {
            batch.add(Command::TlbiNhAsid { asid, vmid: 0 }).unwrap();
        }
        batch.submit().unwrap();

        let batches = sim.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), BATCH_ENTRIES);
        assert_eq!(
            batches[0].last().map(Command::opcode),
            Some(opcode::CMD_SYNC)
        );
    }

    #[test]
    fn test_illegal_command_is_skipped() {
        let (sim, cmdq) = setup(4);
        sim.fail_next(opcode::CFGI_CD, 1);

        let result = cmdq.issue(
            &sim,
            &[
                Command::CfgiSte { sid: 1, leaf: true },
                Command::CfgiCd { sid: 1, ssid: 0, leaf: true },
                Command::CfgiSte { sid: 2, leaf: true },
            ],
            true,
        );
        assert_eq!(result, Err(SmmuError::HardwareFault(1)));

        // Everything behind the rejected command executed
        let executed = sim.commands();
        assert!(executed.contains(&Command::CfgiSte { sid: 2, leaf: true }));
        assert!(!executed.iter().any(|c| c.opcode() == opcode::CFGI_CD));
        assert!(!sim.gerror_active());

        // The queue keeps working
        assert_eq!(cmdq.sync(&sim), Ok(()));
    }

    #[test]
    fn test_aborted_fetch_is_retried() {
        let (sim, cmdq) = setup(4);
        sim.fail_next(opcode::CFGI_CD, 2);
        let cd = Command::CfgiCd { sid: 4, ssid: 1, leaf: false };
        assert_eq!(
            cmdq.issue(&sim, &[cd], true),
            Err(SmmuError::HardwareFault(2))
        );
        assert!(sim.commands().contains(&cd));
    }
}
