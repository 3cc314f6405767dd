// Licensed under the Apache-2.0 license

//! Public entry points: bring-up, registry and task submission.
//!
//! Caller errors (`ParameterInvalid`, `TaskInvalid`) are returned here and
//! never enter a task queue. Everything that happens on the wire is reported
//! later through the task callback.

use crate::common::{i3c_log, Logger};
use crate::i3c::ccc::{cccr_format, cccw_format};
use crate::i3c::common::{
    ccc, is_i2c_rate, is_sdr_rate, is_valid_dynamic_address, is_valid_static_address, speed,
    BusId, BusState, DeviceMode, InitMode, PortId, Protocol, TaskPolicy, DAA_RECORD_LEN,
    DYNAMIC_ADDR_NONE, I3C_BROADCAST_ADDR, I3C_BUS_COUNT_MAX, I3C_HOT_JOIN_ADDR, I3C_PAYLOAD_SIZE_MAX, I3C_TASK_MAX,
    IBI_PAYLOAD_SIZE_MAX, STATIC_ADDR_NONE,
};
use crate::i3c::config::{ExternalDevice, PortConfig, SystemConfig};
use crate::i3c::context::I3cContext;
use crate::i3c::device::{DeviceInfo, DeviceInfoShort, Request};
use crate::i3c::error::{I3cError, I3cResult};
use crate::i3c::hal::I3cHal;
use crate::i3c::task::{build_task, TaskCallback, TaskId, TaskRequest};

/// Largest CCC payload: one command byte plus 68 data bytes.
const CCC_PAYLOAD_MAX: usize = I3C_PAYLOAD_SIZE_MAX - 1;
/// Largest target list of a direct CCC.
const CCC_TARGET_BYTES_MAX: usize = 63;
const CCC_READ_MAX: usize = 64;

fn address_ok(static_addr: u8) -> bool {
    static_addr == STATIC_ADDR_NONE || (static_addr <= 0x7F && is_valid_static_address(static_addr))
}

impl<H: I3cHal, L: Logger> I3cContext<H, L> {
    /// One-time bring-up of every configured port, bus and external device.
    ///
    /// A port whose configuration the hardware rejects stays disabled and is
    /// logged; the rest of the system still comes up.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for a bus number out of range; `OutOfMemory` if a
    /// bus runs out of device records.
    pub fn start(&mut self, config: &SystemConfig) -> I3cResult<()> {
        for port in PortId::all() {
            let Some(cfg) = config.ports.get(port.index()).and_then(Option::as_ref) else {
                continue;
            };
            if let Err(err) = self.setup_internal_device(port, cfg) {
                i3c_log!(self.logger, error, "port {}: setup failed: {}", port.index(), err);
                continue;
            }
            if cfg.mode == DeviceMode::Disable {
                continue;
            }
            let bus = BusId::new(cfg.bus).ok_or(I3cError::ParameterInvalid)?;
            self.connect_bus(port, bus)?;
        }
        for (bus, dev) in &config.devices {
            let bus = BusId::new(*bus).ok_or(I3cError::ParameterInvalid)?;
            self.declare_device(bus, dev)?;
        }
        for bus in (0..I3C_BUS_COUNT_MAX).filter_map(|n| u8::try_from(n).ok().and_then(BusId::new)) {
            self.setup_bus(bus);
        }
        Ok(())
    }

    /// Reset a port to its default setting and apply `cfg`.
    ///
    /// # Errors
    ///
    /// `HwNotSupport` for a mode the port cannot run (the port stays
    /// disabled); `ParameterInvalid` for an invalid address or rate.
    pub fn setup_internal_device(&mut self, port: PortId, cfg: &PortConfig) -> I3cResult<()> {
        let capability = self.hal.capability(port);
        let dev = self
            .devices
            .get_mut(port.index())
            .ok_or(I3cError::ParameterInvalid)?;
        *dev = DeviceInfo::new(port);
        dev.capability = capability;
        if cfg.mode == DeviceMode::Disable {
            self.hal.disable(port);
            return Ok(());
        }
        if !capability.supports(cfg.mode) {
            return Err(I3cError::HwNotSupport);
        }
        let dynamic_ok = cfg.dynamic_addr == DYNAMIC_ADDR_NONE || is_valid_dynamic_address(cfg.dynamic_addr);
        if !address_ok(cfg.static_addr) || !dynamic_ok {
            return Err(I3cError::ParameterInvalid);
        }
        if !is_sdr_rate(cfg.sdr_rate) || !is_i2c_rate(cfg.i2c_rate) {
            return Err(I3cError::ParameterInvalid);
        }

        dev.static_addr = cfg.static_addr;
        dev.vendor_id = cfg.vendor_id;
        dev.part_number = cfg.part_number;
        dev.pid = cfg.pid();
        dev.bcr = cfg.bcr;
        dev.dcr = cfg.dcr;
        dev.sdr_rate = cfg.sdr_rate;
        dev.i2c_rate = cfg.i2c_rate;
        dev.accept_hot_join = cfg.accept_hot_join;
        dev.accept_master_request = cfg.accept_master_request;
        dev.stop_split_read = cfg.stop_split_read;
        dev.callback = cfg.callback;
        if cfg.mode == DeviceMode::CurrentMaster {
            dev.dynamic_addr = cfg.dynamic_addr;
            dev.run_i3c = true;
            dev.enable_sw_timeout = true;
            dev.enable_open_drain_high = true;
        }
        dev.mode = cfg.mode;

        if let Err(err) = self.hal.init_port(port, dev) {
            dev.mode = DeviceMode::Disable;
            return Err(err);
        }
        self.hal.enable(port);
        if cfg.mode.is_slave_role() {
            self.prepare_to_read_command(port)?;
        }
        i3c_log!(self.logger, debug, "port {}: up as {:?}", port.index(), cfg.mode);
        Ok(())
    }

    /// Attach an internal port to a bus and publish its bus record.
    ///
    /// # Errors
    ///
    /// `TaskInvalid` for a disabled port; `ParameterInvalid` if the bus
    /// already has a current master and the port wants to be one.
    pub fn connect_bus(&mut self, port: PortId, bus: BusId) -> I3cResult<()> {
        let dev = self.get_inode(port).ok_or(I3cError::TaskInvalid)?;
        let mode = dev.mode;
        let mut rec = DeviceInfoShort::new(dev.static_addr, DYNAMIC_ADDR_NONE);
        rec.pid = dev.pid;
        rec.bcr = dev.bcr;
        rec.dcr = dev.dcr;
        rec.internal = Some(port);
        rec.attr.set_present(true);
        match mode {
            DeviceMode::CurrentMaster => {
                rec.dynamic_addr = dev.dynamic_addr;
                rec.attr.set_supp_mst(true);
                rec.attr.set_default_mst(true);
                rec.attr.set_run_i3c(true);
            }
            DeviceMode::SlaveOnly | DeviceMode::SecondaryMaster => {
                rec.attr.set_supp_slv(true);
                rec.attr.set_supp_entdaa(true);
                rec.attr.set_supp_mst(mode == DeviceMode::SecondaryMaster);
                if rec.has_static_addr() {
                    rec.attr.request(Request::Setdasa);
                }
            }
            DeviceMode::Disable => return Err(I3cError::TaskInvalid),
        }

        let info = self.bus_mut(bus).ok_or(I3cError::ParameterInvalid)?;
        if mode == DeviceMode::CurrentMaster {
            if info.current_master.is_some_and(|owner| owner != port) {
                return Err(I3cError::ParameterInvalid);
            }
            info.current_master = Some(port);
        }
        if let Some(index) = info.index_by_port(port) {
            info.remove_dev_info(index);
        }
        info.new_dev_info(rec)?;
        if let Some(dev) = self.device_mut(port) {
            dev.bus = Some(bus);
        }
        Ok(())
    }

    /// Move a fresh bus with a local current master into enumeration.
    pub fn setup_bus(&mut self, bus: BusId) {
        if let Some(info) = self.bus_mut(bus) {
            if info.state == BusState::Default && info.current_master.is_some() {
                info.state = BusState::Init;
            }
        }
    }

    /// Register a device that no local port hosts.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for an invalid address; `OutOfMemory` when the bus
    /// is full.
    pub fn declare_device(&mut self, bus: BusId, dev: &ExternalDevice) -> I3cResult<usize> {
        let preferred_ok =
            dev.dynamic_addr == DYNAMIC_ADDR_NONE || is_valid_dynamic_address(dev.dynamic_addr);
        if !address_ok(dev.static_addr) || !preferred_ok {
            return Err(I3cError::ParameterInvalid);
        }
        let mut rec = DeviceInfoShort::new(dev.static_addr, dev.dynamic_addr);
        rec.pid = dev.pid;
        rec.bcr = dev.bcr;
        rec.dcr = dev.dcr;
        rec.attr.set_present(true);
        let mode = dev.init_mode;
        for (flag, req) in [
            (InitMode::RSTDAA, Request::Rstdaa),
            (InitMode::SETHID, Request::Sethid),
            (InitMode::SETDASA, Request::Setdasa),
            (InitMode::SETAASA, Request::Setaasa),
        ] {
            if mode.contains(flag) {
                rec.attr.request(req);
            }
        }
        rec.attr.set_supp_entdaa(mode.contains(InitMode::ENTDAA));
        if mode.contains(InitMode::POST_INIT) && dev.post_init.is_some() {
            rec.post_init = dev.post_init.clone();
            rec.attr.request(Request::PostInit);
        }
        self.bus_mut(bus)
            .ok_or(I3cError::ParameterInvalid)?
            .new_dev_info(rec)
    }

    /// Bus record of the device with static address `addr`.
    #[must_use]
    pub fn get_dev_info_by_static_addr(&self, bus: BusId, addr: u8) -> Option<&DeviceInfoShort> {
        self.bus(bus).and_then(|info| info.dev_by_static_addr(addr))
    }

    /// Bus record of the device with dynamic address `addr`.
    #[must_use]
    pub fn get_dev_info_by_dynamic_addr(&self, bus: BusId, addr: u8) -> Option<&DeviceInfoShort> {
        self.bus(bus).and_then(|info| info.dev_by_dynamic_addr(addr))
    }

    /// Queue a master-side task.
    ///
    /// # Errors
    ///
    /// `TaskInvalid` for a disabled or unconnected port; `OutOfMemory` when
    /// the port already holds the maximum number of tasks; `ParameterInvalid`
    /// for a request the engine rejects.
    pub fn master_create_task(&mut self, port: PortId, req: &TaskRequest<'_>) -> I3cResult<TaskId> {
        self.create_task(port, req, true)
    }

    /// Queue a slave-initiated IBI, hot-join or master request.
    ///
    /// # Errors
    ///
    /// As [`Self::master_create_task`], plus `ParameterInvalid` for a port
    /// not in a slave role.
    pub fn slave_create_task(&mut self, port: PortId, req: &TaskRequest<'_>) -> I3cResult<TaskId> {
        if !self.device(port).is_some_and(|dev| dev.mode.is_slave_role()) {
            return Err(I3cError::ParameterInvalid);
        }
        self.create_task(port, req, false)
    }

    fn create_task(
        &mut self,
        port: PortId,
        req: &TaskRequest<'_>,
        master_request: bool,
    ) -> I3cResult<TaskId> {
        let dev = self.get_inode(port).ok_or(I3cError::TaskInvalid)?;
        if dev.bus.is_none() {
            return Err(I3cError::TaskInvalid);
        }
        if dev.task_count() >= I3C_TASK_MAX {
            return Err(I3cError::OutOfMemory);
        }
        let task = build_task(port, dev.mode, req, master_request)?;
        self.enqueue_task(task, req.policy)
    }

    /// Queue an ENTDAA round with room for `rx_len / 9` responders.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` if `rx_len` cannot hold one record.
    pub fn insert_task_entdaa(
        &mut self,
        port: PortId,
        rx_len: usize,
        callback: Option<TaskCallback>,
        policy: TaskPolicy,
    ) -> I3cResult<TaskId> {
        if rx_len < DAA_RECORD_LEN {
            return Err(I3cError::ParameterInvalid);
        }
        let rx_len = (rx_len / DAA_RECORD_LEN) * DAA_RECORD_LEN;
        let mut req = TaskRequest::new(Protocol::Entdaa, 0)
            .write(&[ccc::BROADCAST_ENTDAA])
            .header(1)
            .read(rx_len)
            .baudrate(speed::I2C_1MHZ)
            .policy(policy);
        req.callback = callback;
        self.master_create_task(port, &req)
    }

    /// Queue a broadcast CCC. `payload` starts with the CCC byte.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for an empty or oversized payload.
    pub fn insert_task_cccb(
        &mut self,
        port: PortId,
        payload: &[u8],
        callback: Option<TaskCallback>,
        policy: TaskPolicy,
    ) -> I3cResult<TaskId> {
        if payload.is_empty() || payload.len() > CCC_PAYLOAD_MAX {
            return Err(I3cError::ParameterInvalid);
        }
        let mut req = TaskRequest::new(Protocol::CccBroadcast, 0)
            .write(payload)
            .header(payload.len())
            .baudrate(self.ccc_rate(port))
            .policy(policy);
        req.callback = callback;
        self.master_create_task(port, &req)
    }

    /// Queue a direct write CCC. `tx` is the `hsize`-byte header followed by
    /// one record per target.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for a malformed header or target list;
    /// `HwNotSupport` for a CCC that cannot be sent as a direct write.
    pub fn insert_task_cccw(
        &mut self,
        port: PortId,
        tx: &[u8],
        hsize: usize,
        callback: Option<TaskCallback>,
        policy: TaskPolicy,
    ) -> I3cResult<TaskId> {
        let size = tx.len().saturating_sub(hsize);
        if hsize == 0 || !(1..=CCC_TARGET_BYTES_MAX).contains(&size) {
            return Err(I3cError::ParameterInvalid);
        }
        let code = tx.first().copied().ok_or(I3cError::ParameterInvalid)?;
        let fmt = cccw_format(code, size)?;
        let mut req = TaskRequest::new(Protocol::CccWrite, fmt)
            .write(tx)
            .header(hsize)
            .baudrate(self.ccc_rate(port))
            .policy(policy);
        req.callback = callback;
        self.master_create_task(port, &req)
    }

    /// Queue a direct read CCC. `tx` is the header followed by one target
    /// address per byte; `rx_len` must hold every target's answer.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for inconsistent lengths; `HwNotSupport` for a CCC
    /// that cannot be sent as a direct read.
    pub fn insert_task_cccr(
        &mut self,
        port: PortId,
        tx: &[u8],
        hsize: usize,
        rx_len: usize,
        callback: Option<TaskCallback>,
        policy: TaskPolicy,
    ) -> I3cResult<TaskId> {
        if hsize == 0
            || !(1..=CCC_TARGET_BYTES_MAX).contains(&tx.len())
            || !(1..=CCC_READ_MAX).contains(&rx_len)
        {
            return Err(I3cError::ParameterInvalid);
        }
        let code = tx.first().copied().ok_or(I3cError::ParameterInvalid)?;
        let defining = if hsize > 1 { tx.get(1).copied() } else { None };
        let fmt = cccr_format(code, defining)?;
        let targets = tx.len().saturating_sub(hsize);
        if targets == 0 || rx_len < targets * usize::from(fmt) {
            return Err(I3cError::ParameterInvalid);
        }
        let mut req = TaskRequest::new(Protocol::CccRead, fmt)
            .write(tx)
            .header(hsize)
            .read(rx_len)
            .baudrate(self.ccc_rate(port))
            .policy(policy);
        req.callback = callback;
        self.master_create_task(port, &req)
    }

    /// Queue ENEC (`enable`) or DISEC with the event `mask`, broadcast when
    /// `target` is `None`.
    ///
    /// # Errors
    ///
    /// Errors from [`Self::insert_task_cccb`] or [`Self::insert_task_cccw`].
    pub fn insert_task_events(
        &mut self,
        port: PortId,
        enable: bool,
        target: Option<u8>,
        mask: u8,
        callback: Option<TaskCallback>,
    ) -> I3cResult<TaskId> {
        match target {
            None => {
                let code = if enable { ccc::BROADCAST_ENEC } else { ccc::BROADCAST_DISEC };
                self.insert_task_cccb(port, &[code, mask], callback, TaskPolicy::AppendLast)
            }
            Some(addr) => {
                let code = if enable { ccc::DIRECT_ENEC } else { ccc::DIRECT_DISEC };
                self.insert_task_cccw(port, &[code, addr, mask], 1, callback, TaskPolicy::AppendLast)
            }
        }
    }

    /// Queue SETNEWDA moving the target at dynamic address `old` to `new`.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` if `old` is unknown on the bus or `new` is not a
    /// free, valid dynamic address.
    pub fn insert_task_setnewda(
        &mut self,
        port: PortId,
        old: u8,
        new: u8,
        callback: Option<TaskCallback>,
    ) -> I3cResult<TaskId> {
        let bus = self.bus_of(port).ok_or(I3cError::ParameterInvalid)?;
        if bus.dev_by_dynamic_addr(old).is_none()
            || !is_valid_dynamic_address(new)
            || !bus.is_dynamic_address_free(new)
        {
            return Err(I3cError::ParameterInvalid);
        }
        let tx = [ccc::DIRECT_SETNEWDA, old, new << 1];
        self.insert_task_cccw(port, &tx, 1, callback, TaskPolicy::AppendLast)
    }

    /// Queue a host-requested EVENT read of up to `rx_len` IBI bytes.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` without a read buffer.
    pub fn insert_task_event(
        &mut self,
        port: PortId,
        rx_len: usize,
        callback: Option<TaskCallback>,
    ) -> I3cResult<TaskId> {
        if rx_len == 0 {
            return Err(I3cError::ParameterInvalid);
        }
        let mut req = TaskRequest::new(Protocol::Event, I3C_BROADCAST_ADDR)
            .read(rx_len)
            .baudrate(speed::SDR_IBI)
            .hif(true);
        req.callback = callback;
        self.master_create_task(port, &req)
    }

    /// Queue an IBI carrying `payload` (mandatory data byte first).
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` for an unaddressed port or an oversized payload.
    pub fn insert_task_ibi(&mut self, port: PortId, payload: &[u8]) -> I3cResult<TaskId> {
        let dev = self.device(port).ok_or(I3cError::ParameterInvalid)?;
        if dev.dynamic_addr == DYNAMIC_ADDR_NONE || payload.len() > IBI_PAYLOAD_SIZE_MAX {
            return Err(I3cError::ParameterInvalid);
        }
        let req = TaskRequest::new(Protocol::Ibi, dev.dynamic_addr)
            .write(payload)
            .baudrate(dev.sdr_rate);
        self.slave_create_task(port, &req)
    }

    /// Queue a hot-join request from an unaddressed slave port.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` if the port already has a dynamic address.
    pub fn insert_task_hot_join(&mut self, port: PortId) -> I3cResult<TaskId> {
        let dev = self.device(port).ok_or(I3cError::ParameterInvalid)?;
        if dev.dynamic_addr != DYNAMIC_ADDR_NONE {
            return Err(I3cError::ParameterInvalid);
        }
        let req = TaskRequest::new(Protocol::HotJoin, I3C_HOT_JOIN_ADDR).baudrate(dev.sdr_rate);
        let id = self.slave_create_task(port, &req)?;
        if let Some(bus) = self.bus_of_mut(port) {
            if let Some(rec) = bus.index_by_port(port).and_then(|i| bus.devices.get_mut(i)) {
                rec.attr.request(Request::HotJoin);
            }
        }
        Ok(id)
    }

    /// Queue a request for the master role from a secondary master.
    ///
    /// # Errors
    ///
    /// `ParameterInvalid` unless the port is an addressed secondary master.
    pub fn insert_task_master_request(&mut self, port: PortId) -> I3cResult<TaskId> {
        let dev = self.device(port).ok_or(I3cError::ParameterInvalid)?;
        if dev.mode != DeviceMode::SecondaryMaster || dev.dynamic_addr == DYNAMIC_ADDR_NONE {
            return Err(I3cError::ParameterInvalid);
        }
        let req = TaskRequest::new(Protocol::MasterRequest, dev.dynamic_addr).baudrate(dev.sdr_rate);
        self.slave_create_task(port, &req)
    }

    fn ccc_rate(&self, port: PortId) -> fugit::HertzU32 {
        self.device(port).map_or(speed::SDR_1MHZ, |dev| dev.sdr_rate)
    }
}
