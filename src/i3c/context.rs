// Licensed under the Apache-2.0 license

//! The engine context.
//!
//! [`I3cContext`] owns the HAL, the port and bus registries and the task pool.
//! One context is built at startup and every engine entry point runs through
//! it; nothing in the engine is global.

use crate::common::{Logger, NoOpLogger};
use crate::i3c::bus::BusInfo;
use crate::i3c::common::{BusId, PortId, I3C_BUS_COUNT_MAX, I3C_PORT_MAX};
use crate::i3c::device::{DeviceInfo, DeviceInfoShort};
use crate::i3c::hal::I3cHal;
use crate::i3c::task::{TaskId, TaskPool, TransferTask};

pub struct I3cContext<H: I3cHal, L: Logger = NoOpLogger> {
    pub hal: H,
    pub logger: L,
    pub(crate) devices: [DeviceInfo; I3C_PORT_MAX],
    pub(crate) buses: [BusInfo; I3C_BUS_COUNT_MAX],
    pub(crate) tasks: TaskPool,
    /// The single post-init transfer allowed in flight.
    pub(crate) post_init: Option<TaskId>,
}

impl<H: I3cHal> I3cContext<H, NoOpLogger> {
    #[must_use]
    pub fn new(hal: H) -> Self {
        Self::with_logger(hal, NoOpLogger)
    }
}

impl<H: I3cHal, L: Logger> I3cContext<H, L> {
    #[must_use]
    pub fn with_logger(hal: H, logger: L) -> Self {
        let mut ports = PortId::all();
        let mut bus_ids = (0..).filter_map(BusId::new);
        Self {
            hal,
            logger,
            devices: core::array::from_fn(|_| {
                DeviceInfo::new(ports.next().unwrap_or(PortId::FIRST))
            }),
            buses: core::array::from_fn(|_| BusInfo::new(bus_ids.next().unwrap_or(BusId::FIRST))),
            tasks: TaskPool::new(),
            post_init: None,
        }
    }

    #[must_use]
    pub fn device(&self, port: PortId) -> Option<&DeviceInfo> {
        self.devices.get(port.index())
    }

    pub fn device_mut(&mut self, port: PortId) -> Option<&mut DeviceInfo> {
        self.devices.get_mut(port.index())
    }

    #[must_use]
    pub fn bus(&self, id: BusId) -> Option<&BusInfo> {
        self.buses.get(id.index())
    }

    pub fn bus_mut(&mut self, id: BusId) -> Option<&mut BusInfo> {
        self.buses.get_mut(id.index())
    }

    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&TransferTask> {
        self.tasks.get(id)
    }

    /// Bus a port is connected to.
    #[must_use]
    pub fn get_bus_from_port(&self, port: PortId) -> Option<BusId> {
        self.device(port).and_then(|dev| dev.bus)
    }

    pub(crate) fn bus_of_mut(&mut self, port: PortId) -> Option<&mut BusInfo> {
        let id = self.get_bus_from_port(port)?;
        self.buses.get_mut(id.index())
    }

    pub(crate) fn bus_of(&self, port: PortId) -> Option<&BusInfo> {
        let id = self.get_bus_from_port(port)?;
        self.buses.get(id.index())
    }

    /// Port holding mastership of the bus `port` sits on.
    #[must_use]
    pub fn get_current_master_from_port(&self, port: PortId) -> Option<PortId> {
        self.bus_of(port).and_then(|bus| bus.current_master)
    }

    /// Internal device record of a port.
    #[must_use]
    pub fn get_inode(&self, port: PortId) -> Option<&DeviceInfo> {
        self.device(port).filter(|dev| dev.is_enabled())
    }

    /// Internal port answering at `addr` on `bus`.
    #[must_use]
    pub fn get_iport(&self, bus: BusId, addr: u8) -> Option<PortId> {
        self.bus(bus)
            .and_then(|b| b.dev_by_addr(addr))
            .and_then(|dev| dev.internal)
    }

    /// True when `port` is a locally hosted device.
    #[must_use]
    pub fn is_internal_device(&self, port: PortId) -> bool {
        self.get_inode(port).is_some_and(|dev| dev.bus.is_some())
    }

    /// Bus record of the device a task addresses.
    #[must_use]
    pub fn get_dev_info_by_task(&self, id: TaskId) -> Option<&DeviceInfoShort> {
        let task = self.tasks.get(id)?;
        self.bus_of(task.port)?.dev_by_addr(task.address)
    }

    /// Head task queued on a port.
    #[must_use]
    pub fn head_task(&self, port: PortId) -> Option<TaskId> {
        self.device(port).and_then(DeviceInfo::head_task)
    }
}
