// Licensed under the Apache-2.0 license

//! Slave engine.
//!
//! Services master reads and writes against a locally hosted slave port and
//! runs the slave-initiated IBI, master-request and hot-join tasks.
//!
//! Private writes from the master land either in the port's register table,
//! when one is installed, or in its message queue.

use crate::common::{i3c_log, Logger};
use crate::i3c::common::{
    event_mask, CmdWidth, PortId, Protocol, I3C_PAYLOAD_SIZE_MAX, MAX_READ_LEN,
};
use crate::i3c::context::I3cContext;
use crate::i3c::device::Request;
use crate::i3c::error::{I3cError, I3cResult};
use crate::i3c::hal::I3cHal;
use crate::i3c::task::{TaskId, TaskOutcome};
use heapless::{Deque, Vec};

pub const REGISTER_MAX: usize = 8;
pub const REGISTER_DATA_MAX: usize = 32;
pub const MQUEUE_DEPTH: usize = 4;
/// Pending-read notification sent with a queued message.
pub const MQUEUE_NOTIFY_MDB: u8 = 0xA0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegAttr {
    /// Two-byte commands are sent most significant byte first.
    pub big_endian: bool,
    pub width: CmdWidth,
    pub write: bool,
    pub read: bool,
}

impl RegAttr {
    #[must_use]
    pub const fn read_only(width: CmdWidth) -> Self {
        Self {
            big_endian: false,
            width,
            write: false,
            read: true,
        }
    }

    #[must_use]
    pub const fn read_write(width: CmdWidth) -> Self {
        Self {
            big_endian: false,
            width,
            write: true,
            read: true,
        }
    }
}

/// One addressable register of a slave port.
#[derive(Clone, Debug)]
pub struct SlaveRegister {
    pub cmd: u16,
    pub attr: RegAttr,
    pub data: Vec<u8, REGISTER_DATA_MAX>,
}

impl SlaveRegister {
    /// # Errors
    ///
    /// `OutOfMemory` if `data` exceeds the register size limit.
    pub fn new(cmd: u16, attr: RegAttr, data: &[u8]) -> Result<Self, I3cError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(data)
            .map_err(|()| I3cError::OutOfMemory)?;
        Ok(Self {
            cmd,
            attr,
            data: buf,
        })
    }

    fn matches(&self, rx: &[u8]) -> Option<bool> {
        match self.attr.width {
            CmdWidth::One => rx.first().map(|&b| u16::from(b) == self.cmd),
            CmdWidth::Two => {
                let (&a, &b) = (rx.first()?, rx.get(1)?);
                let cmd = if self.attr.big_endian {
                    u16::from_be_bytes([a, b])
                } else {
                    u16::from_le_bytes([a, b])
                };
                Some(cmd == self.cmd)
            }
        }
    }
}

pub type RegisterTable = Vec<SlaveRegister, REGISTER_MAX>;
pub type Message = Vec<u8, I3C_PAYLOAD_SIZE_MAX>;
pub type MessageQueue = Deque<Message, MQUEUE_DEPTH>;

/// Find the register a received command addresses.
///
/// # Errors
///
/// `WouldBlock` while too few bytes have arrived to decide, `DataError` when
/// no register matches.
pub fn get_register_index(table: &[SlaveRegister], rx: &[u8]) -> nb::Result<usize, I3cError> {
    let mut undecided = false;
    for (index, reg) in table.iter().enumerate() {
        match reg.matches(rx) {
            Some(true) => return Ok(index),
            Some(false) => {}
            None => undecided = true,
        }
    }
    if undecided {
        Err(nb::Error::WouldBlock)
    } else {
        Err(nb::Error::Other(I3cError::DataError))
    }
}

impl<H: I3cHal, L: Logger> I3cContext<H, L> {
    fn slave_port(&self, port: PortId) -> I3cResult<()> {
        match self.device(port) {
            Some(dev) if dev.mode.is_slave_role() => Ok(()),
            _ => Err(I3cError::ParameterInvalid),
        }
    }

    /// Queue a response for the next master read.
    ///
    /// A response still in flight is aborted and its buffer released first.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for a port not in a slave role, `OutOfMemory` for a
    /// response larger than the payload limit.
    pub fn slave_prepare_response(&mut self, port: PortId, data: &[u8]) -> I3cResult<()> {
        self.slave_port(port)?;
        if data.len() > I3C_PAYLOAD_SIZE_MAX {
            return Err(I3cError::OutOfMemory);
        }
        if !self.hal.slave_tx_free(port) {
            i3c_log!(self.logger, debug, "port {}: abort pending response", port.index());
            self.hal.stop_slave_tx(port);
        }
        let dev = self
            .device_mut(port)
            .ok_or(I3cError::ParameterInvalid)?;
        dev.tx.release();
        dev.tx.load(data)?;
        self.setup_slave_write_dma(port)
    }

    /// Treat the outstanding response as fully sent.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` if no response is outstanding.
    pub fn slave_finish_response(&mut self, port: PortId) -> I3cResult<()> {
        self.slave_port(port)?;
        let dev = self
            .device_mut(port)
            .ok_or(I3cError::ParameterInvalid)?;
        if dev.tx.is_empty() {
            return Err(I3cError::ParameterInvalid);
        }
        let len = dev.tx.len();
        dev.tx.set_offset(len);
        if !self.hal.slave_tx_free(port) {
            self.hal.stop_slave_tx(port);
        }
        Ok(())
    }

    /// Poll until the master has read the whole response, then release it.
    ///
    /// # Errors
    ///
    /// `WouldBlock` while response bytes remain; `ParameterInvalid` for a
    /// port not in a slave role.
    pub fn slave_check_response_complete(&mut self, port: PortId) -> nb::Result<(), I3cError> {
        self.slave_port(port)?;
        let hw_remaining = self.hal.slave_tx_remaining(port);
        let dev = self
            .device_mut(port)
            .ok_or(nb::Error::Other(I3cError::ParameterInvalid))?;
        if dev.tx.is_empty() {
            return Ok(());
        }
        let remaining = if dev.tx.remaining().is_empty() {
            0
        } else {
            hw_remaining.min(dev.tx.remaining().len())
        };
        let sent = dev.tx.len() - remaining;
        dev.tx.set_offset(sent);
        if remaining > 0 {
            return Err(nb::Error::WouldBlock);
        }
        dev.tx.release();
        Ok(())
    }

    /// Set the pending-interrupt status reported to GETSTATUS.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for a port not in a slave role.
    pub fn slave_update_pending(&mut self, port: PortId, mask: u8) -> I3cResult<()> {
        self.slave_port(port)?;
        self.hal.set_pending(port, mask);
        Ok(())
    }

    /// True when the current master has disabled IBIs for this port.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for a port not in a slave role.
    pub fn slave_check_ibidis(&self, port: PortId) -> I3cResult<bool> {
        self.slave_port(port)?;
        Ok(self.hal.event_support(port) & event_mask::ENINT == 0)
    }

    /// Hand the unsent part of the response buffer to the TX DMA.
    ///
    /// # Errors
    ///
    /// `TaskInvalid` for a port that is not configured; errors from the HAL.
    pub fn setup_slave_write_dma(&mut self, port: PortId) -> I3cResult<()> {
        let dev = self
            .devices
            .get(port.index())
            .ok_or(I3cError::TaskInvalid)?;
        if dev.tx.remaining().is_empty() {
            return Ok(());
        }
        self.hal.start_slave_write(port, dev.tx.remaining())
    }

    /// Arm the RX DMA for the unfilled part of the receive buffer.
    ///
    /// # Errors
    ///
    /// `TaskInvalid` for a port that is not configured; errors from the HAL.
    pub fn setup_slave_read_dma(&mut self, port: PortId) -> I3cResult<()> {
        let dev = self.device(port).ok_or(I3cError::TaskInvalid)?;
        let len = dev.rx.remaining().len();
        if len == 0 {
            return Ok(());
        }
        self.hal.start_slave_read(port, len)
    }

    /// Load the unsent IBI payload of the head task.
    ///
    /// # Errors
    ///
    /// `TaskInvalid` when the port has no queued task.
    pub fn setup_slave_ibi_dma(&mut self, port: PortId) -> I3cResult<()> {
        let dev = self
            .devices
            .get(port.index())
            .ok_or(I3cError::TaskInvalid)?;
        if dev.head_task().is_none() {
            return Err(I3cError::TaskInvalid);
        }
        if dev.ibi.remaining().is_empty() {
            return Ok(());
        }
        self.hal.load_ibi_payload(port, dev.ibi.remaining())
    }

    /// Arm reception of the next private write.
    ///
    /// # Errors
    ///
    /// Errors from the HAL.
    pub fn prepare_to_read_command(&mut self, port: PortId) -> I3cResult<()> {
        let dev = self.device_mut(port).ok_or(I3cError::TaskInvalid)?;
        dev.rx.load(&[0; MAX_READ_LEN])?;
        self.setup_slave_read_dma(port)
    }

    /// Read back the address the current master assigned and switch the port
    /// to I3C mode. Returns true if the address changed.
    pub fn update_dynamic_address(&mut self, port: PortId) -> bool {
        let addr = self.hal.dynamic_address(port);
        let Some(dev) = self.device_mut(port) else {
            return false;
        };
        if addr == dev.dynamic_addr {
            return false;
        }
        dev.dynamic_addr = addr;
        dev.run_i3c = addr != 0;
        let run_i3c = dev.run_i3c;
        if let Some(bus) = self.bus_of_mut(port) {
            if let Some(index) = bus.index_by_port(port) {
                if let Some(rec) = bus.devices.get_mut(index) {
                    rec.dynamic_addr = addr;
                    rec.attr.set_run_i3c(run_i3c);
                    if run_i3c && rec.attr.is_pending(Request::HotJoin) {
                        rec.attr.mark_done(Request::HotJoin);
                    }
                }
            }
        }
        i3c_log!(self.logger, debug, "port {}: dynamic address {:#04x}", port.index(), addr);
        true
    }

    /// Start the head task of a slave-role port.
    pub(crate) fn slave_start_request(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        let port = task.port;
        let protocol = task.protocol;
        let started = match protocol {
            Protocol::Ibi => {
                let payload = task.tx.clone();
                match self.device_mut(port) {
                    Some(dev) => dev.ibi.load(&payload),
                    None => Err(I3cError::TaskInvalid),
                }
                .and_then(|()| self.setup_slave_ibi_dma(port))
                .and_then(|()| self.hal.start_ibi(port))
            }
            Protocol::MasterRequest => self.hal.start_master_request(port),
            Protocol::HotJoin => self.hal.start_hot_join(port),
            _ => Err(I3cError::TaskInvalid),
        };
        if let Err(err) = started {
            i3c_log!(self.logger, error, "port {}: slave request failed: {}", port.index(), err);
            self.slave_end_request(port, Err(err));
        }
    }

    /// Final result of the running slave task.
    pub(crate) fn slave_callback(&mut self, port: PortId, result: Result<(), I3cError>) {
        match result {
            Err(I3cError::NackSlvStart) => self.do_nack_slvstart(port),
            _ => self.slave_end_request(port, result),
        }
    }

    /// The master refused the request: tell the requester and free the bus.
    fn do_nack_slvstart(&mut self, port: PortId) {
        i3c_log!(self.logger, debug, "port {}: slave start rejected", port.index());
        let Some(id) = self.bus_of(port).and_then(|bus| bus.slave_task) else {
            return;
        };
        if let Some(task) = self.tasks.get(id) {
            if let Some(notify) = self.device(port).and_then(|dev| dev.callback) {
                notify(&TaskOutcome {
                    port,
                    protocol: task.protocol,
                    address: task.address,
                    result: Err(I3cError::NackSlvStart),
                    data: &[],
                });
            }
        }
        self.slave_end_request(port, Err(I3cError::NackSlvStart));
    }

    /// Finish the slave request `port` has on the bus. Completions for a
    /// request that never started are ignored.
    pub(crate) fn slave_end_request(&mut self, port: PortId, result: Result<(), I3cError>) {
        let running = self
            .bus_of(port)
            .and_then(|bus| bus.slave_task)
            .filter(|&id| self.tasks.get(id).is_some_and(|t| t.port == port));
        let Some(id) = running else {
            i3c_log!(self.logger, error, "port {}: stray slave completion", port.index());
            return;
        };
        if let Some(dev) = self.device_mut(port) {
            if result.is_ok() {
                let len = dev.ibi.len();
                dev.ibi.set_offset(len);
            }
            dev.ibi.release();
        }
        self.complete_task(id, result);
        if let Some(bus) = self.bus_of_mut(port) {
            if bus.slave_task == Some(id) {
                bus.slave_task = None;
            }
        }
    }

    /// A private write from the master has landed.
    pub(crate) fn slave_write_received(&mut self, port: PortId) {
        let Some(dev) = self.devices.get_mut(port.index()) else {
            return;
        };
        let n = self.hal.fetch_slave_read(port, dev.rx.remaining_mut());
        let offset = dev.rx.offset() + n;
        dev.rx.set_offset(offset);
        let mut msg = Message::new();
        if msg.extend_from_slice(dev.rx.consumed()).is_err() {
            i3c_log!(self.logger, error, "port {}: oversized write dropped", port.index());
            return;
        }
        if let Err(err) = self.prepare_to_read_command(port) {
            i3c_log!(self.logger, error, "port {}: rearm failed: {}", port.index(), err);
        }
        if msg.is_empty() {
            return;
        }
        let has_registers = self.device(port).is_some_and(|dev| !dev.registers.is_empty());
        if has_registers {
            if let Err(err) = self.register_access(port, &msg) {
                i3c_log!(self.logger, debug, "port {}: register access: {}", port.index(), err);
            }
        } else if let Some(dev) = self.devices.get_mut(port.index()) {
            if dev.mqueue.is_full() {
                dev.mqueue.pop_front();
                i3c_log!(self.logger, error, "port {}: message queue overrun", port.index());
            }
            let _ = dev.mqueue.push_back(msg);
        }
    }

    /// Install the registers a master addresses by command.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for a port not in a slave role.
    pub fn set_register_table(&mut self, port: PortId, table: RegisterTable) -> I3cResult<()> {
        self.slave_port(port)?;
        let dev = self
            .device_mut(port)
            .ok_or(I3cError::ParameterInvalid)?;
        dev.registers = table;
        dev.cmd_index = None;
        Ok(())
    }

    /// Apply a received command to the register table and arm the response.
    ///
    /// # Errors
    ///
    /// `DataError` when no register matches the command.
    pub fn register_access(&mut self, port: PortId, rx: &[u8]) -> I3cResult<()> {
        let dev = self
            .device_mut(port)
            .ok_or(I3cError::ParameterInvalid)?;
        let index = match get_register_index(&dev.registers, rx) {
            Ok(index) => index,
            Err(nb::Error::WouldBlock) => return Ok(()),
            Err(nb::Error::Other(err)) => {
                dev.cmd_index = None;
                return Err(err);
            }
        };
        dev.cmd_index = Some(index);
        let Some(reg) = dev.registers.get_mut(index) else {
            return Err(I3cError::DataError);
        };
        let width = reg.attr.width.bytes();
        if rx.len() > width && reg.attr.write {
            let data = rx.get(width..).unwrap_or(&[]);
            for (dst, src) in reg.data.iter_mut().zip(data) {
                *dst = *src;
            }
        }
        let response: Message = if reg.attr.read {
            Vec::from_slice(&reg.data).map_err(|()| I3cError::OutOfMemory)?
        } else {
            Message::new()
        };
        self.slave_prepare_response(port, &response)
    }

    /// Oldest private write received by the port.
    pub fn slave_mqueue_read(&mut self, port: PortId) -> Option<Message> {
        self.device_mut(port).and_then(|dev| dev.mqueue.pop_front())
    }

    /// Offer `data` to the master: arm it as the next read response and raise
    /// a pending-read IBI.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for a port not in a slave role; errors from task
    /// creation.
    pub fn slave_mqueue_write(&mut self, port: PortId, data: &[u8]) -> I3cResult<TaskId> {
        self.slave_prepare_response(port, data)?;
        self.insert_task_ibi(port, &[MQUEUE_NOTIFY_MDB])
    }
}
