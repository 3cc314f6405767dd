// Licensed under the Apache-2.0 license

//! Bus enumeration and CCC bookkeeping.
//!
//! The current master of a bus in `Init` issues one enumeration CCC per
//! scheduling pass, in strict priority order:
//!
//! ```text
//! RSTDAA > SETHID > SETDASA > SETAASA > ENTDAA
//! ```
//!
//! ENTDAA is the fallback and the last step; its completion moves the bus to
//! `Idle`. Completion handlers below fold the result of every CCC back into
//! the device registry.

use crate::common::{i3c_log, Logger};
use crate::i3c::common::{
    bcr, ccc, is_setaasa_address, is_valid_dynamic_address, odd_parity, speed, BusState,
    DeviceMode, PortId, Protocol, TaskPolicy, TransferFlags, DAA_RECORD_LEN, DYNAMIC_ADDR_NONE,
    ENTDAA_BUFFER_LEN, I3C_PAYLOAD_SIZE_MAX, I3C_PORT_MAX, STATIC_ADDR_NONE, TIMEOUT_TYPICAL,
};
use crate::i3c::context::I3cContext;
use crate::i3c::device::{DeviceInfoShort, Request};
use crate::i3c::error::{I3cError, I3cResult};
use crate::i3c::hal::I3cHal;
use crate::i3c::task::{build_task, FrameBuffer, TaskId, TaskRequest, TransferTask};
use heapless::Vec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Most SETDASA targets carried by one CCC.
const SETDASA_TARGETS_MAX: usize = 31;

/// One ENTDAA record: what a responder sends, plus the address byte the
/// master answers with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DaaRecord {
    pub pid: [u8; 6],
    pub bcr: u8,
    pub dcr: u8,
    /// Assigned address in bits 7:1, odd parity in bit 0.
    pub addr: u8,
}

impl DaaRecord {
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_bytes(bytes.get(..DAA_RECORD_LEN)?).ok()
    }

    #[must_use]
    pub const fn address_byte(addr: u8) -> u8 {
        (addr << 1) | odd_parity(addr)
    }

    #[must_use]
    pub const fn assigned(&self) -> u8 {
        self.addr >> 1
    }
}

/// Per-target record size of a direct write CCC.
///
/// # Errors
///
/// `HwNotSupport` for a CCC the engine cannot send as a direct write;
/// `ParameterInvalid` when a variable-length payload does not fit one record.
pub fn cccw_format(code: u8, payload: usize) -> I3cResult<u8> {
    let fmt = match code {
        ccc::DIRECT_ENTAS0
        | ccc::DIRECT_ENTAS1
        | ccc::DIRECT_ENTAS2
        | ccc::DIRECT_ENTAS3
        | ccc::DIRECT_RSTDAA
        | ccc::DIRECT_RSTACT
        | ccc::DIRECT_RSTGRPA => 1,
        ccc::DIRECT_ENEC
        | ccc::DIRECT_DISEC
        | ccc::DIRECT_SETDASA
        | ccc::DIRECT_SETNEWDA
        | ccc::DIRECT_ENDXFER
        | ccc::DIRECT_SETGRPA
        | ccc::DIRECT_MLANE => 2,
        ccc::DIRECT_SETMWL => 3,
        // Max read length with or without the IBI payload size byte.
        ccc::DIRECT_SETMRL => {
            if payload % 4 == 0 {
                4
            } else {
                3
            }
        }
        ccc::DIRECT_SETBRGTGT | ccc::DIRECT_SETROUTE | ccc::DIRECT_SETXTIME => {
            return u8::try_from(payload)
                .ok()
                .filter(|&fmt| fmt > 0)
                .ok_or(I3cError::ParameterInvalid)
        }
        _ => return Err(I3cError::HwNotSupport),
    };
    Ok(fmt)
}

/// Bytes each target returns for a direct read CCC.
///
/// # Errors
///
/// `HwNotSupport` for a CCC the engine cannot send as a direct read.
pub fn cccr_format(code: u8, defining: Option<u8>) -> I3cResult<u8> {
    Ok(match code {
        ccc::DIRECT_GETBCR | ccc::DIRECT_GETDCR | ccc::DIRECT_GETACCMST => 1,
        ccc::DIRECT_GETMWL | ccc::DIRECT_GETSTATUS => 2,
        ccc::DIRECT_GETMRL => 3,
        ccc::DIRECT_GETXTIME | ccc::DIRECT_GETCAPS => 4,
        ccc::DIRECT_GETPID => 6,
        ccc::DIRECT_GETMXDS => {
            if defining == Some(0x91) {
                1
            } else {
                5
            }
        }
        _ => return Err(I3cError::HwNotSupport),
    })
}

/// Request flag an enumeration CCC serves.
#[must_use]
pub const fn enumeration_request(code: u8) -> Option<Request> {
    match code {
        ccc::BROADCAST_RSTDAA => Some(Request::Rstdaa),
        ccc::BROADCAST_SETHID => Some(Request::Sethid),
        ccc::DIRECT_SETDASA => Some(Request::Setdasa),
        ccc::BROADCAST_SETAASA => Some(Request::Setaasa),
        _ => None,
    }
}

type CccPayload = Vec<u8, I3C_PAYLOAD_SIZE_MAX>;

impl<H: I3cHal, L: Logger> I3cContext<H, L> {
    /// Issue the next enumeration CCC of the bus `port` masters.
    pub(crate) fn enumerate_step(&mut self, port: PortId) -> bool {
        let Some(bus) = self.bus_of(port) else {
            return false;
        };
        let mut payload = CccPayload::new();
        let (protocol, fmt, hsize, rd_len) = if bus.is_rstdaa_device_present() {
            let _ = payload.push(ccc::BROADCAST_RSTDAA);
            (Protocol::CccBroadcast, 0, 1, 0)
        } else if bus.is_sethid_device_present() {
            let _ = payload.extend_from_slice(&[ccc::BROADCAST_SETHID, 0x00]);
            (Protocol::CccBroadcast, 0, 2, 0)
        } else if bus.is_setdasa_device_present() {
            let _ = payload.push(ccc::DIRECT_SETDASA);
            for dev in bus
                .pending(Request::Setdasa)
                .filter(|dev| dev.has_static_addr())
                .take(SETDASA_TARGETS_MAX)
            {
                let addr = if dev.has_dynamic_addr() {
                    dev.dynamic_addr
                } else {
                    dev.static_addr
                };
                let _ = payload.extend_from_slice(&[dev.static_addr, addr << 1]);
            }
            if payload.len() == 1 {
                self.abandon_enumeration(port, ccc::DIRECT_SETDASA);
                return true;
            }
            (Protocol::CccWrite, 2, 1, 0)
        } else if bus.is_setaasa_device_present() {
            let _ = payload.push(ccc::BROADCAST_SETAASA);
            (Protocol::CccBroadcast, 0, 1, 0)
        } else {
            let _ = payload.push(ccc::BROADCAST_ENTDAA);
            (Protocol::Entdaa, 0, 1, ENTDAA_BUFFER_LEN)
        };

        let rate = if protocol == Protocol::Entdaa {
            speed::I2C_1MHZ
        } else {
            speed::SDR_1MHZ
        };
        let req = TaskRequest::new(protocol, fmt)
            .write(&payload)
            .header(hsize)
            .read(rd_len)
            .baudrate(rate)
            .timeout(TIMEOUT_TYPICAL)
            .policy(TaskPolicy::InsertFirst);
        let code = payload.first().copied().unwrap_or(ccc::BROADCAST_ENTDAA);
        i3c_log!(self.logger, debug, "port {}: enumeration ccc {:#04x}", port.index(), code);
        if let Err(err) = self.start_now(port, &req, TransferFlags::NORMAL) {
            i3c_log!(self.logger, error, "port {}: ccc {:#04x} not started: {}", port.index(), code, err);
            if protocol == Protocol::Entdaa {
                if let Some(bus) = self.bus_of_mut(port) {
                    bus.state = BusState::Idle;
                }
            } else {
                self.abandon_enumeration(port, code);
            }
        }
        true
    }

    /// Queue a master task at the head of the port and start it at once.
    ///
    /// # Errors
    ///
    /// Errors from task validation or queueing.
    pub(crate) fn start_now(
        &mut self,
        port: PortId,
        req: &TaskRequest<'_>,
        first_flags: TransferFlags,
    ) -> I3cResult<TaskId> {
        let mode = self.device(port).ok_or(I3cError::TaskInvalid)?.mode;
        let mut task = build_task(port, mode, req, true)?;
        if let Some(frame) = task.frames.first_mut() {
            frame.flags |= first_flags;
        }
        let id = self.enqueue_task(task, TaskPolicy::InsertFirst)?;
        if let Some(bus) = self.bus_of_mut(port) {
            bus.current_task = Some(id);
        }
        self.master_start_request(id);
        Ok(id)
    }

    /// Give up on the devices an enumeration CCC targeted.
    pub(crate) fn abandon_enumeration(&mut self, port: PortId, code: u8) {
        let Some(req) = enumeration_request(code) else {
            return;
        };
        if let Some(bus) = self.bus_of_mut(port) {
            let count = bus.abandon_request(req);
            i3c_log!(self.logger, debug, "port {}: {} devices dropped ccc {:#04x}", port.index(), count, code);
        }
    }

    /// Answer the ENTDAA record just read with an address and register the
    /// responder.
    ///
    /// # Errors
    ///
    /// `MemoryRanOut` when no dynamic address is left; `DataError` for a
    /// malformed record; errors from the HAL.
    pub(crate) fn daa_assign(&mut self, port: PortId, id: TaskId) -> I3cResult<u8> {
        let task = self.tasks.get(id).ok_or(I3cError::TaskInvalid)?;
        let Some(FrameBuffer::Rx(offset)) = task.current_frame().map(|frame| frame.buffer) else {
            return Err(I3cError::TaskInvalid);
        };
        let record = task
            .rx
            .get(offset..)
            .and_then(DaaRecord::parse)
            .ok_or(I3cError::DataError)?;

        let bus = self.bus_of(port).ok_or(I3cError::TaskInvalid)?;
        let master = bus.current_master;
        let matched = bus.devices.iter().position(|dev| {
            dev.attr.present()
                && !dev.attr.run_i3c()
                && dev.internal != master
                && dev.pid != [0; 6]
                && dev.pid == record.pid
        });
        let preferred = matched.and_then(|index| bus.devices.get(index)).and_then(|dev| {
            let own = dev.has_dynamic_addr()
                && is_valid_dynamic_address(dev.dynamic_addr)
                && bus
                    .devices
                    .iter()
                    .filter(|other| other.dynamic_addr == dev.dynamic_addr)
                    .count()
                    == 1;
            if own {
                Some(dev.dynamic_addr)
            } else if dev.has_static_addr()
                && is_valid_dynamic_address(dev.static_addr)
                && bus.is_dynamic_address_free(dev.static_addr)
            {
                Some(dev.static_addr)
            } else {
                None
            }
        });
        let addr = preferred
            .or_else(|| bus.next_free_dynamic_address())
            .ok_or(I3cError::MemoryRanOut)?;

        if let Some(slot) = self
            .tasks
            .get_mut(id)
            .and_then(|task| task.rx.get_mut(offset + DAA_RECORD_LEN - 1))
        {
            *slot = DaaRecord::address_byte(addr);
        }
        self.hal.assign_dynamic_address(port, addr)?;

        let bus = self.bus_of_mut(port).ok_or(I3cError::TaskInvalid)?;
        let index = match matched {
            Some(index) => index,
            None => bus.new_dev_info(DeviceInfoShort::new(STATIC_ADDR_NONE, addr))?,
        };
        let rec = bus.devices.get_mut(index).ok_or(I3cError::TaskInvalid)?;
        rec.dynamic_addr = addr;
        rec.pid = record.pid;
        rec.bcr = record.bcr;
        rec.dcr = record.dcr;
        rec.attr.set_present(true);
        rec.attr.set_run_i3c(true);
        rec.attr.set_supp_entdaa(true);
        if rec.attr.is_pending(Request::HotJoin) {
            rec.attr.mark_done(Request::HotJoin);
        }
        let internal = rec.internal;
        if let Some(slave) = internal.and_then(|p| self.device_mut(p)) {
            slave.dynamic_addr = addr;
            slave.run_i3c = true;
            slave.ack_ibi = bcr::ibi_capable(record.bcr);
        }
        i3c_log!(self.logger, debug, "port {}: daa {:#04x} bcr {:#04x}", port.index(), addr, record.bcr);
        Ok(addr)
    }

    /// Fold a finished CCC task back into the registry.
    pub(crate) fn ccc_complete(&mut self, task: &TransferTask, result: Result<(), I3cError>) {
        let Some(code) = task.ccc() else {
            return;
        };
        let port = task.port;
        let args = task.tx.get(1..).unwrap_or(&[]);
        if let Err(err) = result {
            if enumeration_request(code).is_none() {
                return;
            }
            i3c_log!(self.logger, debug, "port {}: ccc {:#04x} failed: {}", port.index(), code, err);
            // Frame 0 is the CCC header; frame n addresses SETDASA target n - 1.
            match task.frame_idx.checked_sub(1) {
                Some(failed) if task.protocol == Protocol::CccWrite && code == ccc::DIRECT_SETDASA => {
                    self.setdasa_partial(port, args, failed);
                }
                _ => self.abandon_enumeration(port, code),
            }
            return;
        }
        match (task.protocol, code) {
            (Protocol::CccBroadcast, ccc::BROADCAST_RSTDAA) => self.on_rstdaa(port),
            (Protocol::CccBroadcast, ccc::BROADCAST_SETHID) => {
                self.mark_pending_done(port, Request::Sethid);
            }
            (Protocol::CccBroadcast, ccc::BROADCAST_SETAASA) => self.on_setaasa(port),
            (Protocol::CccWrite, ccc::DIRECT_SETDASA) => {
                for pair in args.chunks_exact(2) {
                    if let [old, new] = *pair {
                        self.move_address(port, old, new >> 1, Some(Request::Setdasa));
                    }
                }
            }
            (Protocol::CccWrite, ccc::DIRECT_SETNEWDA) => {
                if let [old, new, ..] = *args {
                    self.move_address(port, old, new >> 1, None);
                }
            }
            (Protocol::CccRead, ccc::DIRECT_GETACCMST) => {
                let requester = args.first().copied();
                let granted = task.received().first().map(|byte| byte >> 1);
                if let (Some(requester), Some(granted)) = (requester, granted) {
                    if requester == granted {
                        self.hand_off_mastership(port, requester);
                    }
                }
            }
            _ => {}
        }
    }

    /// Targets ahead of `failed` took their address; only the target that
    /// failed is dropped, the rest stay pending for the next SETDASA.
    fn setdasa_partial(&mut self, port: PortId, args: &[u8], failed: usize) {
        let mut pairs = args.chunks_exact(2);
        for pair in pairs.by_ref().take(failed) {
            if let [old, new] = *pair {
                self.move_address(port, old, new >> 1, Some(Request::Setdasa));
            }
        }
        let Some(&[old, _]) = pairs.next() else {
            return;
        };
        if let Some(dev) = self
            .bus_of_mut(port)
            .and_then(|bus| bus.dev_by_static_addr_mut(old))
            .filter(|dev| dev.attr.is_pending(Request::Setdasa))
        {
            dev.attr.set_present(false);
        }
        i3c_log!(self.logger, debug, "port {}: setdasa target {:#04x} dropped", port.index(), old);
    }

    fn mark_pending_done(&mut self, port: PortId, req: Request) {
        if let Some(bus) = self.bus_of_mut(port) {
            for dev in bus
                .devices
                .iter_mut()
                .filter(|dev| dev.attr.present() && dev.attr.is_pending(req))
            {
                dev.attr.mark_done(req);
            }
        }
    }

    /// Every target loses its dynamic address; internal slaves fall back to
    /// I2C mode and lose their queued requests.
    fn on_rstdaa(&mut self, port: PortId) {
        let Some(bus) = self.bus_of_mut(port) else {
            return;
        };
        let mut slaves: Vec<PortId, I3C_PORT_MAX> = Vec::new();
        for index in 0..bus.devices.len() {
            let Some(dev) = bus.devices.get_mut(index) else {
                continue;
            };
            if dev.internal == Some(port) || !dev.attr.present() {
                continue;
            }
            if dev.attr.is_pending(Request::Rstdaa) {
                dev.attr.mark_done(Request::Rstdaa);
            }
            if let Some(slave) = dev.internal {
                let _ = slaves.push(slave);
            }
            bus.reset_dev_info(index);
        }
        for slave in slaves {
            if let Some(dev) = self.device_mut(slave) {
                dev.dynamic_addr = DYNAMIC_ADDR_NONE;
                dev.run_i3c = false;
                dev.ack_ibi = false;
            }
            self.clean_tasks(slave, I3cError::Term);
        }
    }

    fn on_setaasa(&mut self, port: PortId) {
        let Some(bus) = self.bus_of_mut(port) else {
            return;
        };
        for dev in bus
            .devices
            .iter_mut()
            .filter(|dev| dev.attr.present() && dev.attr.is_pending(Request::Setaasa))
        {
            if is_setaasa_address(dev.static_addr) {
                dev.dynamic_addr = dev.static_addr;
                dev.attr.set_run_i3c(true);
            }
            dev.attr.mark_done(Request::Setaasa);
        }
    }

    /// Give the device answering at `old` the dynamic address `new`.
    fn move_address(&mut self, port: PortId, old: u8, new: u8, done: Option<Request>) {
        let Some(bus) = self.bus_of_mut(port) else {
            return;
        };
        let index = match done {
            Some(_) => bus.index_by_static_addr(old),
            None => bus.index_by_dynamic_addr(old),
        };
        let Some(dev) = index.and_then(|index| bus.devices.get_mut(index)) else {
            return;
        };
        dev.dynamic_addr = new;
        dev.attr.set_run_i3c(true);
        if let Some(req) = done {
            dev.attr.mark_done(req);
        }
        let bcr = dev.bcr;
        if let Some(slave) = dev.internal.and_then(|p| self.device_mut(p)) {
            slave.dynamic_addr = new;
            slave.run_i3c = true;
            slave.ack_ibi = bcr::ibi_capable(bcr);
        }
    }

    /// The device at `requester` accepted mastership of the bus `port`
    /// currently masters.
    fn hand_off_mastership(&mut self, port: PortId, requester: u8) {
        let Some(bus) = self.bus_of_mut(port) else {
            return;
        };
        let next = bus.dev_by_addr(requester).and_then(|dev| dev.internal);
        bus.current_master = next;
        bus.state = BusState::Idle;
        if let Some(dev) = self.device_mut(port) {
            dev.mode = DeviceMode::SecondaryMaster;
            dev.enable_sw_timeout = false;
        }
        self.hal.set_master_role(port, false);
        if let Some(next) = next {
            if let Some(dev) = self.device_mut(next) {
                dev.mode = DeviceMode::CurrentMaster;
                dev.enable_sw_timeout = true;
            }
            self.hal.set_master_role(next, true);
        }
        i3c_log!(self.logger, debug, "port {}: mastership to {:#04x}", port.index(), requester);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_daa_record_layout() {
        let bytes = hex!("08 2C 12 34 56 78 66 CC 00");
        let rec = DaaRecord::parse(&bytes).unwrap();
        assert_eq!(rec.pid, hex!("08 2C 12 34 56 78"));
        assert_eq!(rec.bcr, 0x66);
        assert_eq!(rec.dcr, 0xCC);
        assert_eq!(rec.as_bytes(), &bytes);
        assert!(DaaRecord::parse(&bytes[..8]).is_none());
    }

    #[test]
    fn test_daa_address_byte_parity() {
        // 0x08 has one bit set, so parity is 0.
        assert_eq!(DaaRecord::address_byte(0x08), 0x10);
        assert_eq!(DaaRecord::address_byte(0x09), 0x13);
        let rec = DaaRecord {
            addr: DaaRecord::address_byte(0x30),
            ..DaaRecord::default()
        };
        assert_eq!(rec.assigned(), 0x30);
    }

    #[test]
    fn test_cccw_format_table() {
        assert_eq!(cccw_format(ccc::DIRECT_RSTDAA, 1), Ok(1));
        assert_eq!(cccw_format(ccc::DIRECT_SETDASA, 4), Ok(2));
        assert_eq!(cccw_format(ccc::DIRECT_SETMWL, 3), Ok(3));
        assert_eq!(cccw_format(ccc::DIRECT_SETMRL, 8), Ok(4));
        assert_eq!(cccw_format(ccc::DIRECT_SETMRL, 6), Ok(3));
        assert_eq!(cccw_format(ccc::DIRECT_SETROUTE, 5), Ok(5));
        assert_eq!(cccw_format(ccc::DIRECT_SETROUTE, 0), Err(I3cError::ParameterInvalid));
        assert_eq!(cccw_format(ccc::DIRECT_GETPID, 2), Err(I3cError::HwNotSupport));
    }

    #[test]
    fn test_cccr_format_table() {
        assert_eq!(cccr_format(ccc::DIRECT_GETPID, None), Ok(6));
        assert_eq!(cccr_format(ccc::DIRECT_GETACCMST, None), Ok(1));
        assert_eq!(cccr_format(ccc::DIRECT_GETMRL, None), Ok(3));
        assert_eq!(cccr_format(ccc::DIRECT_GETMXDS, None), Ok(5));
        assert_eq!(cccr_format(ccc::DIRECT_GETMXDS, Some(0x91)), Ok(1));
        assert_eq!(cccr_format(ccc::DIRECT_SETDASA, None), Err(I3cError::HwNotSupport));
    }

    #[test]
    fn test_enumeration_request_map() {
        assert_eq!(enumeration_request(ccc::BROADCAST_RSTDAA), Some(Request::Rstdaa));
        assert_eq!(enumeration_request(ccc::DIRECT_SETDASA), Some(Request::Setdasa));
        assert_eq!(enumeration_request(ccc::BROADCAST_ENEC), None);
    }
}
