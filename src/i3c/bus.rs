// Licensed under the Apache-2.0 license

//! Logical bus records and the device registry attached to each bus.

use crate::i3c::common::{
    is_valid_dynamic_address, BusId, BusState, BusType, BusVersion, PortId, DYNAMIC_ADDR_NONE,
    I3C_BUS_DEVICE_MAX,
};
use crate::i3c::device::{DeviceInfoShort, Request};
use crate::i3c::error::I3cError;
use crate::i3c::task::TaskId;
use heapless::Vec;

pub type DeviceList = Vec<DeviceInfoShort, I3C_BUS_DEVICE_MAX>;

pub struct BusInfo {
    pub id: BusId,
    pub bus_type: BusType,
    pub version: BusVersion,
    pub state: BusState,
    /// Master-side transaction owning the bus.
    pub current_task: Option<TaskId>,
    /// IBI, master or hot-join request in flight from an internal slave port.
    pub slave_task: Option<TaskId>,
    pub current_master: Option<PortId>,
    /// Attached devices in enumeration order.
    pub devices: DeviceList,
}

impl BusInfo {
    #[must_use]
    pub fn new(id: BusId) -> Self {
        Self {
            id,
            bus_type: BusType::PureI3c,
            version: BusVersion::V1_1,
            state: BusState::Default,
            current_task: None,
            slave_task: None,
            current_master: None,
            devices: Vec::new(),
        }
    }

    /// No new task may start while either side holds the bus.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.current_task.is_some() || self.slave_task.is_some()
    }

    /// Holding a reset or clear sequence.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self.state, BusState::WaitResetDone | BusState::WaitClearDone)
    }

    /// Append a device record.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the bus already holds the maximum number of devices.
    pub fn new_dev_info(&mut self, dev: DeviceInfoShort) -> Result<usize, I3cError> {
        self.devices.push(dev).map_err(|_| I3cError::OutOfMemory)?;
        Ok(self.devices.len() - 1)
    }

    /// Remove a device record, keeping the order of the others.
    pub fn remove_dev_info(&mut self, index: usize) -> Option<DeviceInfoShort> {
        if index < self.devices.len() {
            Some(self.devices.remove(index))
        } else {
            None
        }
    }

    /// Forget the dynamic address of a device.
    pub fn reset_dev_info(&mut self, index: usize) {
        if let Some(dev) = self.devices.get_mut(index) {
            dev.dynamic_addr = DYNAMIC_ADDR_NONE;
            dev.attr.set_run_i3c(false);
        }
    }

    #[must_use]
    pub fn index_by_static_addr(&self, addr: u8) -> Option<usize> {
        self.devices
            .iter()
            .position(|dev| dev.has_static_addr() && dev.static_addr == addr)
    }

    #[must_use]
    pub fn index_by_dynamic_addr(&self, addr: u8) -> Option<usize> {
        if addr == DYNAMIC_ADDR_NONE {
            return None;
        }
        self.devices.iter().position(|dev| dev.dynamic_addr == addr)
    }

    #[must_use]
    pub fn index_by_port(&self, port: PortId) -> Option<usize> {
        self.devices.iter().position(|dev| dev.internal == Some(port))
    }

    #[must_use]
    pub fn dev_by_static_addr(&self, addr: u8) -> Option<&DeviceInfoShort> {
        self.index_by_static_addr(addr)
            .and_then(|i| self.devices.get(i))
    }

    pub fn dev_by_static_addr_mut(&mut self, addr: u8) -> Option<&mut DeviceInfoShort> {
        self.index_by_static_addr(addr)
            .and_then(|i| self.devices.get_mut(i))
    }

    #[must_use]
    pub fn dev_by_dynamic_addr(&self, addr: u8) -> Option<&DeviceInfoShort> {
        self.index_by_dynamic_addr(addr)
            .and_then(|i| self.devices.get(i))
    }

    pub fn dev_by_dynamic_addr_mut(&mut self, addr: u8) -> Option<&mut DeviceInfoShort> {
        self.index_by_dynamic_addr(addr)
            .and_then(|i| self.devices.get_mut(i))
    }

    /// Record of the device that answers at `addr`, by dynamic address first.
    #[must_use]
    pub fn dev_by_addr(&self, addr: u8) -> Option<&DeviceInfoShort> {
        self.dev_by_dynamic_addr(addr)
            .or_else(|| self.dev_by_static_addr(addr))
    }

    #[must_use]
    pub fn is_dynamic_address_free(&self, addr: u8) -> bool {
        is_valid_dynamic_address(addr) && self.index_by_dynamic_addr(addr).is_none()
    }

    /// Lowest valid dynamic address nobody on the bus holds.
    #[must_use]
    pub fn next_free_dynamic_address(&self) -> Option<u8> {
        (0x08..=0x77).find(|&addr| self.is_dynamic_address_free(addr))
    }

    /// Any addressed device running in I3C mode.
    #[must_use]
    pub fn is_i3c_device_present(&self) -> bool {
        self.devices
            .iter()
            .any(|dev| dev.attr.present() && dev.attr.run_i3c())
    }

    fn is_request_present(&self, req: Request) -> bool {
        self.devices
            .iter()
            .any(|dev| dev.attr.present() && dev.attr.is_pending(req))
    }

    #[must_use]
    pub fn is_rstdaa_device_present(&self) -> bool {
        self.is_request_present(Request::Rstdaa)
    }

    #[must_use]
    pub fn is_sethid_device_present(&self) -> bool {
        self.is_request_present(Request::Sethid)
    }

    #[must_use]
    pub fn is_setdasa_device_present(&self) -> bool {
        self.is_request_present(Request::Setdasa)
    }

    #[must_use]
    pub fn is_setaasa_device_present(&self) -> bool {
        self.is_request_present(Request::Setaasa)
    }

    /// Present devices with `req` still outstanding.
    pub fn pending(&self, req: Request) -> impl Iterator<Item = &DeviceInfoShort> + '_ {
        self.devices
            .iter()
            .filter(move |dev| dev.attr.present() && dev.attr.is_pending(req))
    }

    /// Drop `req` from every device still waiting for it by marking the
    /// devices absent, so enumeration can move on.
    pub fn abandon_request(&mut self, req: Request) -> usize {
        let mut count = 0;
        for dev in self
            .devices
            .iter_mut()
            .filter(|dev| dev.attr.present() && dev.attr.is_pending(req))
        {
            dev.attr.set_present(false);
            count += 1;
        }
        count
    }
}
