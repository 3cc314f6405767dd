// Licensed under the Apache-2.0 license

//! Task and frame model.
//!
//! A [`TransferTask`] is one queued operation on a port. It owns its write and
//! read buffers and decomposes into ordered [`TransferFrame`]s, each a segment
//! of address, direction and buffer window with its own cursor. A frame is
//! complete when `access_idx == access_len`; a task is complete when
//! `frame_idx == frame_count`.
//!
//! Tasks live in a fixed [`TaskPool`] and are referred to by [`TaskId`].

use crate::i3c::common::{
    ccc, is_i2c_rate, is_sdr_rate, speed, DeviceMode, PortId, Protocol, TaskPolicy,
    TransferDir, TransferFlags, TransferType, DAA_RECORD_LEN, I3C_BROADCAST_ADDR, I3C_FRAME_MAX,
    I3C_PAYLOAD_SIZE_MAX, I3C_TASK_POOL_SIZE, TIMEOUT_TYPICAL,
};
use crate::i3c::error::I3cError;
use fugit::{HertzU32, MillisDurationU32};
use heapless::Vec;

/// Completion callback, invoked exactly once per task.
pub type TaskCallback = fn(&TaskOutcome<'_>);

/// What a completion callback sees.
#[derive(Debug)]
pub struct TaskOutcome<'a> {
    pub port: PortId,
    pub protocol: Protocol,
    /// Target address, or the requesting device for IBI events.
    pub address: u8,
    pub result: Result<(), I3cError>,
    /// Bytes received by the task.
    pub data: &'a [u8],
}

/// Handle to a task in the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u8);

impl TaskId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which task buffer a frame reads from or writes into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameBuffer {
    None,
    Tx(usize),
    Rx(usize),
}

#[derive(Copy, Clone, Debug)]
pub struct TransferFrame {
    pub flags: TransferFlags,
    pub transfer_type: TransferType,
    pub baudrate: HertzU32,
    pub address: u8,
    pub direction: TransferDir,
    pub hdrcmd: u8,
    pub buffer: FrameBuffer,
    pub access_len: usize,
    pub access_idx: usize,
    pub retry_count: u8,
}

impl TransferFrame {
    fn new(address: u8, direction: TransferDir, baudrate: HertzU32) -> Self {
        Self {
            flags: TransferFlags::NORMAL,
            transfer_type: TransferType::Sdr,
            baudrate,
            address,
            direction,
            hdrcmd: 0,
            buffer: FrameBuffer::None,
            access_len: 0,
            access_idx: 0,
            retry_count: 0,
        }
    }

    fn flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    fn kind(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }

    fn window(mut self, buffer: FrameBuffer, len: usize) -> Self {
        self.buffer = buffer;
        self.access_len = len;
        self
    }

    fn retry(mut self, count: u8) -> Self {
        self.retry_count = count;
        self
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.access_idx == self.access_len
    }
}

/// Routing and bookkeeping for one task.
#[derive(Debug)]
pub struct TaskInfo {
    /// `WouldBlock` until the task reaches a terminal result.
    pub result: nb::Result<(), I3cError>,
    pub callback: Option<TaskCallback>,
    /// Runs on the master engine when set, on the slave engine otherwise.
    pub master_request: bool,
    /// Submitted through the host interface.
    pub hif: bool,
    pub post_init: bool,
    pub sw_timeout: MillisDurationU32,
    pub elapsed: MillisDurationU32,
}

impl TaskInfo {
    fn new(callback: Option<TaskCallback>, hif: bool) -> Self {
        Self {
            result: Err(nb::Error::WouldBlock),
            callback,
            master_request: true,
            hif,
            post_init: false,
            sw_timeout: TIMEOUT_TYPICAL,
            elapsed: MillisDurationU32::from_ticks(0),
        }
    }
}

pub type TaskBuffer = Vec<u8, I3C_PAYLOAD_SIZE_MAX>;

pub struct TransferTask {
    pub port: PortId,
    pub protocol: Protocol,
    pub address: u8,
    pub baudrate: HertzU32,
    pub frames: Vec<TransferFrame, I3C_FRAME_MAX>,
    pub frame_idx: usize,
    pub tx: TaskBuffer,
    pub rx: TaskBuffer,
    /// High-water mark of bytes received into `rx`.
    pub rx_count: usize,
    pub info: TaskInfo,
}

impl TransferTask {
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.frame_idx >= self.frames.len()
    }

    #[must_use]
    pub fn current_frame(&self) -> Option<&TransferFrame> {
        self.frames.get(self.frame_idx)
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut TransferFrame> {
        self.frames.get_mut(self.frame_idx)
    }

    /// The CCC byte of a CCC task.
    #[must_use]
    pub fn ccc(&self) -> Option<u8> {
        if self.protocol.is_ccc() {
            self.tx.first().copied()
        } else {
            None
        }
    }

    #[must_use]
    pub fn received(&self) -> &[u8] {
        self.rx.get(..self.rx_count).unwrap_or(&[])
    }

    /// Bytes a write frame sends.
    #[must_use]
    pub fn frame_tx(&self, frame: &TransferFrame) -> &[u8] {
        let end = |len: usize, offset: usize| len.min(offset + frame.access_len);
        match frame.buffer {
            FrameBuffer::Tx(offset) => self
                .tx
                .get(offset..end(self.tx.len(), offset))
                .unwrap_or(&[]),
            FrameBuffer::Rx(offset) => self
                .rx
                .get(offset..end(self.rx.len(), offset))
                .unwrap_or(&[]),
            FrameBuffer::None => &[],
        }
    }

    /// Destination window of the current read frame.
    pub fn frame_rx_mut(&mut self) -> &mut [u8] {
        let Some(frame) = self.frames.get(self.frame_idx) else {
            return &mut [];
        };
        let (buffer, len) = (frame.buffer, frame.access_len);
        match buffer {
            FrameBuffer::Rx(offset) => {
                let end = self.rx.len().min(offset + len);
                self.rx.get_mut(offset..end).unwrap_or(&mut [])
            }
            FrameBuffer::Tx(offset) => {
                let end = self.tx.len().min(offset + len);
                self.tx.get_mut(offset..end).unwrap_or(&mut [])
            }
            FrameBuffer::None => &mut [],
        }
    }
}

/// Parameters of a task submission.
#[derive(Clone, Debug)]
pub struct TaskRequest<'a> {
    pub protocol: Protocol,
    /// Target address; for direct CCCs the per-target record size.
    pub address: u8,
    /// Length of the CCC header frame.
    pub hsize: usize,
    pub tx: &'a [u8],
    pub rd_len: usize,
    pub baudrate: HertzU32,
    pub timeout: MillisDurationU32,
    pub callback: Option<TaskCallback>,
    pub policy: TaskPolicy,
    pub hif: bool,
}

impl<'a> TaskRequest<'a> {
    #[must_use]
    pub fn new(protocol: Protocol, address: u8) -> Self {
        Self {
            protocol,
            address,
            hsize: 0,
            tx: &[],
            rd_len: 0,
            baudrate: speed::SDR_12P5MHZ,
            timeout: TIMEOUT_TYPICAL,
            callback: None,
            policy: TaskPolicy::AppendLast,
            hif: false,
        }
    }

    #[must_use]
    pub fn write(mut self, tx: &'a [u8]) -> Self {
        self.tx = tx;
        self
    }

    #[must_use]
    pub fn read(mut self, len: usize) -> Self {
        self.rd_len = len;
        self
    }

    #[must_use]
    pub fn header(mut self, hsize: usize) -> Self {
        self.hsize = hsize;
        self
    }

    #[must_use]
    pub fn baudrate(mut self, rate: HertzU32) -> Self {
        self.baudrate = rate;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn callback(mut self, callback: TaskCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn hif(mut self, hif: bool) -> Self {
        self.hif = hif;
        self
    }
}

/// Master tasks must not be slave-initiated protocols and vice versa.
///
/// # Errors
///
/// `ParameterInvalid` when the protocol does not belong to the engine.
pub fn validate_protocol(protocol: Protocol, master_request: bool) -> Result<(), I3cError> {
    if master_request == protocol.is_slave_task() {
        return Err(I3cError::ParameterInvalid);
    }
    Ok(())
}

/// # Errors
///
/// `ParameterInvalid` when the rate is not one the protocol can run at.
pub fn validate_baudrate(protocol: Protocol, rate: HertzU32) -> Result<(), I3cError> {
    let ok = if protocol.is_event() {
        true
    } else if protocol.is_i2c() {
        is_i2c_rate(rate)
    } else if protocol.is_i3c() {
        is_sdr_rate(rate)
    } else {
        rate == speed::I2C_1MHZ
            || rate == speed::I2C_400KHZ
            || is_sdr_rate(rate)
            || rate == speed::SDR_IBI
    };
    if ok {
        Ok(())
    } else {
        Err(I3cError::ParameterInvalid)
    }
}

/// Check buffer lengths against what the protocol needs.
///
/// `fmt` is the target address for private transfers and the per-target
/// record size for direct CCCs.
///
/// # Errors
///
/// `ParameterInvalid` for any inconsistent combination.
pub fn validate_buffer(
    protocol: Protocol,
    fmt: u8,
    hsize: usize,
    tx: &[u8],
    rd_len: usize,
) -> Result<(), I3cError> {
    let wr = tx.len();
    let first = tx.first().copied();
    let ok = match protocol {
        Protocol::DdrRead => matches!(first, Some(cmd) if cmd & 0x80 != 0) && rd_len > 0,
        Protocol::DdrWrite => wr >= 2 && matches!(first, Some(cmd) if cmd & 0x80 == 0),
        Protocol::Entdaa => {
            first == Some(ccc::BROADCAST_ENTDAA) && rd_len >= DAA_RECORD_LEN
        }
        Protocol::CccRead => wr >= 2 && matches!(first, Some(code) if ccc::is_direct(code)),
        Protocol::CccWrite => {
            wr >= 2
                && matches!(first, Some(code) if ccc::is_direct(code))
                && fmt != 0
                && wr >= hsize
                && (wr - hsize) % usize::from(fmt) == 0
        }
        Protocol::CccBroadcast => {
            matches!(first, Some(code) if ccc::is_broadcast(code)) && wr == hsize
        }
        Protocol::I2cWrite | Protocol::I3cWrite | Protocol::I3cW7e => wr >= 1,
        Protocol::I2cRead | Protocol::I3cRead | Protocol::I3cR7e => rd_len > 0,
        Protocol::I2cWriteRead | Protocol::I3cWriteRead | Protocol::I3cW7eRead => {
            wr >= 1 && rd_len > 0
        }
        Protocol::Event | Protocol::Ibi | Protocol::MasterRequest | Protocol::HotJoin => true,
    };
    if ok {
        Ok(())
    } else {
        Err(I3cError::ParameterInvalid)
    }
}

fn push_frame(
    frames: &mut Vec<TransferFrame, I3C_FRAME_MAX>,
    frame: TransferFrame,
) -> Result<(), I3cError> {
    frames.push(frame).map_err(|_| I3cError::OutOfMemory)
}

/// Build a task and its frame list.
///
/// The caller has already validated the request.
///
/// # Errors
///
/// `OutOfMemory` if the buffers or frame list do not fit.
pub fn create_task_node(
    port: PortId,
    req: &TaskRequest<'_>,
    master_request: bool,
) -> Result<TransferTask, I3cError> {
    use TransferFlags as F;

    let mut tx = TaskBuffer::new();
    tx.extend_from_slice(req.tx)
        .map_err(|()| I3cError::OutOfMemory)?;
    let mut rx = TaskBuffer::new();
    rx.resize(req.rd_len, 0)
        .map_err(|()| I3cError::OutOfMemory)?;

    let rate = req.baudrate;
    let addr = req.address;
    let wr = req.tx.len();
    let rd = req.rd_len;
    let hsize = req.hsize;
    let mut frames: Vec<TransferFrame, I3C_FRAME_MAX> = Vec::new();
    let bcast = |dir| TransferFrame::new(I3C_BROADCAST_ADDR, dir, rate);

    match req.protocol {
        Protocol::Entdaa => {
            push_frame(
                &mut frames,
                bcast(TransferDir::Write)
                    .flags(F::NORMAL | F::RETRY_ENABLE)
                    .window(FrameBuffer::Tx(0), wr),
            )?;
            for i in 0..rd / DAA_RECORD_LEN {
                // The responder's NACK ends the round, so these are never retried.
                push_frame(
                    &mut frames,
                    bcast(TransferDir::Read)
                        .flags(F::NORMAL | F::REPEAT_START)
                        .window(FrameBuffer::Rx(i * DAA_RECORD_LEN), DAA_RECORD_LEN - 1),
                )?;
            }
        }
        Protocol::CccBroadcast => {
            push_frame(
                &mut frames,
                bcast(TransferDir::Write)
                    .flags(F::NORMAL | F::RETRY_ENABLE)
                    .window(FrameBuffer::Tx(0), hsize)
                    .retry(3),
            )?;
        }
        Protocol::CccWrite => {
            let fmt = usize::from(addr);
            let count = wr.saturating_sub(hsize) / fmt.max(1);
            push_frame(
                &mut frames,
                bcast(TransferDir::Write)
                    .flags(F::NORMAL | F::RETRY_ENABLE | F::NO_STOP)
                    .window(FrameBuffer::Tx(0), hsize)
                    .retry(3),
            )?;
            for i in 0..count {
                let base = hsize + i * fmt;
                let target = req.tx.get(base).copied().unwrap_or(0);
                let mut flags = F::NORMAL | F::REPEAT_START;
                if i + 1 < count {
                    flags |= F::NO_STOP;
                }
                let buffer = if fmt == 1 {
                    FrameBuffer::None
                } else {
                    FrameBuffer::Tx(base + 1)
                };
                push_frame(
                    &mut frames,
                    TransferFrame::new(target, TransferDir::Write, rate)
                        .flags(flags)
                        .window(buffer, fmt - 1),
                )?;
            }
        }
        Protocol::CccRead => {
            let fmt = usize::from(addr);
            let count = wr.saturating_sub(hsize);
            push_frame(
                &mut frames,
                bcast(TransferDir::Write)
                    .flags(F::NORMAL | F::RETRY_ENABLE | F::NO_STOP)
                    .window(FrameBuffer::Tx(0), hsize)
                    .retry(3),
            )?;
            for i in 0..count {
                let target = req.tx.get(hsize + i).copied().unwrap_or(0);
                let mut flags =
                    F::NORMAL | F::REPEAT_START | F::RETRY_ENABLE | F::RETRY_WITHOUT_STOP;
                if i + 1 < count {
                    flags |= F::NO_STOP;
                }
                push_frame(
                    &mut frames,
                    TransferFrame::new(target, TransferDir::Read, rate)
                        .flags(flags)
                        .window(FrameBuffer::Rx(i * fmt), fmt)
                        .retry(1),
                )?;
            }
        }
        Protocol::Event => {
            push_frame(
                &mut frames,
                bcast(TransferDir::Read)
                    .flags(F::NORMAL | F::RETRY_ENABLE)
                    .window(FrameBuffer::Rx(0), rd)
                    .retry(3),
            )?;
        }
        Protocol::Ibi => {
            let (buffer, len) = if addr == 0 {
                (FrameBuffer::None, 0)
            } else {
                (FrameBuffer::Tx(0), wr)
            };
            push_frame(
                &mut frames,
                bcast(TransferDir::Write)
                    .flags(F::NORMAL | F::RETRY_ENABLE)
                    .window(buffer, len)
                    .retry(3),
            )?;
        }
        Protocol::MasterRequest => {
            push_frame(
                &mut frames,
                bcast(TransferDir::Write)
                    .flags(F::NORMAL | F::RETRY_ENABLE)
                    .retry(3),
            )?;
        }
        Protocol::HotJoin => {
            push_frame(
                &mut frames,
                bcast(TransferDir::Read)
                    .flags(F::NORMAL | F::RETRY_ENABLE)
                    .retry(3),
            )?;
        }
        Protocol::I2cWrite => {
            push_frame(
                &mut frames,
                TransferFrame::new(addr, TransferDir::Write, rate)
                    .kind(TransferType::I2c)
                    .window(FrameBuffer::Tx(0), wr),
            )?;
        }
        Protocol::I3cWrite => {
            push_frame(
                &mut frames,
                TransferFrame::new(addr, TransferDir::Write, rate)
                    .flags(F::NORMAL | F::RETRY_ENABLE)
                    .window(FrameBuffer::Tx(0), wr)
                    .retry(3),
            )?;
        }
        Protocol::DdrWrite => {
            let mut frame = TransferFrame::new(addr, TransferDir::Write, rate)
                .flags(F::NORMAL | F::RETRY_ENABLE)
                .kind(TransferType::Ddr)
                .window(FrameBuffer::Tx(1), wr.saturating_sub(1))
                .retry(3);
            frame.hdrcmd = req.tx.first().copied().unwrap_or(0);
            push_frame(&mut frames, frame)?;
        }
        Protocol::I2cRead => {
            push_frame(
                &mut frames,
                TransferFrame::new(addr, TransferDir::Read, rate)
                    .kind(TransferType::I2c)
                    .window(FrameBuffer::Rx(0), rd),
            )?;
        }
        Protocol::I3cRead => {
            push_frame(
                &mut frames,
                TransferFrame::new(addr, TransferDir::Read, rate)
                    .flags(F::NORMAL | F::RETRY_ENABLE)
                    .window(FrameBuffer::Rx(0), rd)
                    .retry(3),
            )?;
        }
        Protocol::DdrRead => {
            let mut frame = TransferFrame::new(addr, TransferDir::Read, rate)
                .flags(F::NORMAL | F::RETRY_ENABLE)
                .kind(TransferType::Ddr)
                .window(FrameBuffer::Rx(0), rd)
                .retry(3);
            frame.hdrcmd = req.tx.first().copied().unwrap_or(0);
            push_frame(&mut frames, frame)?;
        }
        Protocol::I2cWriteRead => {
            push_frame(
                &mut frames,
                TransferFrame::new(addr, TransferDir::Write, rate)
                    .flags(F::NORMAL | F::NO_STOP)
                    .kind(TransferType::I2c)
                    .window(FrameBuffer::Tx(0), wr),
            )?;
            push_frame(
                &mut frames,
                TransferFrame::new(addr, TransferDir::Read, rate)
                    .flags(F::NORMAL | F::REPEAT_START | F::RETRY_ENABLE)
                    .kind(TransferType::I2c)
                    .window(FrameBuffer::Rx(0), rd)
                    .retry(3),
            )?;
        }
        Protocol::I3cWriteRead => {
            push_frame(
                &mut frames,
                TransferFrame::new(addr, TransferDir::Write, rate)
                    .flags(F::NORMAL | F::NO_STOP | F::RETRY_ENABLE)
                    .window(FrameBuffer::Tx(0), wr)
                    .retry(3),
            )?;
            push_frame(
                &mut frames,
                TransferFrame::new(addr, TransferDir::Read, rate)
                    .flags(F::NORMAL | F::REPEAT_START | F::RETRY_ENABLE)
                    .window(FrameBuffer::Rx(0), rd)
                    .retry(3),
            )?;
        }
        Protocol::I3cW7e | Protocol::I3cR7e | Protocol::I3cW7eRead => {
            push_frame(
                &mut frames,
                bcast(TransferDir::Write)
                    .flags(F::NORMAL | F::NO_STOP | F::RETRY_ENABLE)
                    .retry(3),
            )?;
            if req.protocol != Protocol::I3cR7e {
                let mut flags = F::NORMAL | F::REPEAT_START;
                if req.protocol == Protocol::I3cW7eRead {
                    flags |= F::NO_STOP;
                }
                push_frame(
                    &mut frames,
                    TransferFrame::new(addr, TransferDir::Write, rate)
                        .flags(flags)
                        .window(FrameBuffer::Tx(0), wr),
                )?;
            }
            if req.protocol != Protocol::I3cW7e {
                push_frame(
                    &mut frames,
                    TransferFrame::new(addr, TransferDir::Read, rate)
                        .flags(F::NORMAL | F::REPEAT_START)
                        .window(FrameBuffer::Rx(0), rd),
                )?;
            }
        }
    }

    let mut info = TaskInfo::new(req.callback, req.hif);
    info.master_request = master_request;
    info.sw_timeout = req.timeout;

    Ok(TransferTask {
        port,
        protocol: req.protocol,
        address: addr,
        baudrate: rate,
        frames,
        frame_idx: 0,
        tx,
        rx,
        rx_count: 0,
        info,
    })
}

/// Check a submission and build its task.
///
/// # Errors
///
/// `ParameterInvalid` for a protocol, rate or buffer the engine rejects;
/// `OutOfMemory` if the task does not fit.
pub fn build_task(
    port: PortId,
    mode: DeviceMode,
    req: &TaskRequest<'_>,
    master_request: bool,
) -> Result<TransferTask, I3cError> {
    if mode == DeviceMode::Disable {
        return Err(I3cError::TaskInvalid);
    }
    validate_protocol(req.protocol, master_request)?;
    validate_baudrate(req.protocol, req.baudrate)?;
    validate_buffer(req.protocol, req.address, req.hsize, req.tx, req.rd_len)?;
    create_task_node(port, req, master_request)
}

/// Fixed arena of tasks.
pub struct TaskPool {
    slots: [Option<TransferTask>; I3C_TASK_POOL_SIZE],
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// # Errors
    ///
    /// `OutOfMemory` when every slot is taken.
    pub fn alloc(&mut self, task: TransferTask) -> Result<TaskId, I3cError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(I3cError::OutOfMemory)?;
        *slot = Some(task);
        let index = u8::try_from(index).map_err(|_| I3cError::OutOfMemory)?;
        Ok(TaskId(index))
    }

    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<&TransferTask> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TransferTask> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn take(&mut self, id: TaskId) -> Option<TransferTask> {
        self.slots.get_mut(id.index()).and_then(Option::take)
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
