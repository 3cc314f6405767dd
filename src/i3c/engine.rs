// Licensed under the Apache-2.0 license

//! Scheduler and event dispatch.
//!
//! Interrupt adapters never call into the engine directly. They push
//! [`I3cEvent`]s into a `heapless::spsc::Queue`; the owner of the
//! [`I3cContext`] drains the consumer with [`I3cContext::process_events`] and
//! then runs [`I3cContext::task_engine`] to start whatever became runnable.

use crate::common::{i3c_log, Logger};
use crate::i3c::common::{
    speed, BusState, PortId, Protocol, TaskPolicy, DYNAMIC_ADDR_NONE, I3C_PORT_MAX,
};
use crate::i3c::context::I3cContext;
use crate::i3c::device::Request;
use crate::i3c::error::{I3cError, I3cResult};
use crate::i3c::hal::I3cHal;
use crate::i3c::task::{TaskId, TaskOutcome, TaskRequest, TransferTask};
use fugit::MillisDurationU32;
use heapless::spsc::{Consumer, Queue};
use heapless::Deque;

/// Kind of in-band request that won arbitration on a master port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IbiKind {
    Interrupt,
    HotJoin,
    MasterRequest,
}

/// Hardware notifications consumed by [`I3cContext::handle_event`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum I3cEvent {
    /// The current frame of the master task finished.
    FrameComplete { port: PortId },
    /// The current frame of the master task failed.
    TransferError { port: PortId, error: I3cError },
    /// A slave pulled SDA low to request the bus.
    SlaveStart { port: PortId },
    /// Address header of an in-band request received.
    IbiRequest { port: PortId, addr: u8, kind: IbiKind },
    /// A slave-initiated request finished on a slave port.
    SlaveTaskComplete {
        port: PortId,
        result: Result<(), I3cError>,
    },
    /// A private write from the master landed on a slave port.
    SlaveWriteReceived { port: PortId },
    DynamicAddressUpdated { port: PortId },
    BusResetDone { port: PortId },
    BusClearDone { port: PortId },
    /// Software time base.
    Tick { elapsed: MillisDurationU32 },
}

pub type EventQueue<const N: usize> = Queue<I3cEvent, N>;

/// Drop `id` from a port queue, keeping the order of the rest.
pub(crate) fn unlink<const N: usize>(queue: &mut Deque<TaskId, N>, id: TaskId) -> bool {
    let mut found = false;
    for _ in 0..queue.len() {
        if let Some(queued) = queue.pop_front() {
            if queued == id {
                found = true;
            } else {
                let _ = queue.push_back(queued);
            }
        }
    }
    found
}

impl<H: I3cHal, L: Logger> I3cContext<H, L> {
    /// Drain the event queue, handling events in arrival order.
    ///
    /// # Returns
    ///
    /// The number of events handled.
    pub fn process_events<const N: usize>(
        &mut self,
        events: &mut Consumer<'_, I3cEvent, N>,
    ) -> usize {
        let mut handled = 0;
        while let Some(event) = events.dequeue() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Single step of the engine for one hardware event.
    pub fn handle_event(&mut self, event: I3cEvent) {
        match event {
            I3cEvent::FrameComplete { port } => self.master_frame_complete(port),
            I3cEvent::TransferError { port, error } => self.master_transfer_error(port, error),
            I3cEvent::SlaveStart { port } => self.master_slave_start(port),
            I3cEvent::IbiRequest { port, addr, kind } => self.master_ibi_request(port, addr, kind),
            I3cEvent::SlaveTaskComplete { port, result } => self.slave_callback(port, result),
            I3cEvent::SlaveWriteReceived { port } => self.slave_write_received(port),
            I3cEvent::DynamicAddressUpdated { port } => {
                self.update_dynamic_address(port);
            }
            I3cEvent::BusResetDone { port } => self.bus_reset_done(port),
            I3cEvent::BusClearDone { port } => self.bus_clear_done(port),
            I3cEvent::Tick { elapsed } => self.tick(elapsed),
        }
    }

    /// One scheduling pass over every port.
    ///
    /// # Returns
    ///
    /// `true` if any setup step ran or any task was started.
    pub fn task_engine(&mut self) -> bool {
        let mut acted = false;
        for port in PortId::all() {
            acted |= self.schedule_port(port);
        }
        acted
    }

    fn schedule_port(&mut self, port: PortId) -> bool {
        let Some(mode) = self.get_inode(port).map(|dev| dev.mode) else {
            return false;
        };
        let Some(bus) = self.bus_of(port) else {
            return false;
        };
        if bus.is_waiting() || bus.is_busy() {
            return false;
        }
        let state = bus.state;
        let owns_bus = bus.current_master == Some(port);

        if mode.is_slave_role() && !owns_bus {
            let mut acted = false;
            let unaddressed = self
                .device(port)
                .is_some_and(|dev| dev.dynamic_addr == DYNAMIC_ADDR_NONE);
            if unaddressed && self.update_dynamic_address(port) {
                if let Some(bus) = self.bus_of_mut(port) {
                    if bus.state == BusState::Default {
                        bus.state = BusState::Idle;
                    }
                }
                acted = true;
            }
            return self.dispatch_head(port, false) || acted;
        }
        if !owns_bus {
            return false;
        }
        match state {
            BusState::Default => {
                if let Some(bus) = self.bus_of_mut(port) {
                    bus.state = BusState::Init;
                }
                true
            }
            BusState::Init => self.enumerate_step(port),
            BusState::Idle => {
                let acted = self.post_init_step(port);
                self.dispatch_head(port, true) || acted
            }
            BusState::WaitResetDone | BusState::WaitClearDone => false,
        }
    }

    /// Start the head task of a port if it belongs to the engine side given.
    fn dispatch_head(&mut self, port: PortId, master: bool) -> bool {
        let Some(id) = self.head_task(port) else {
            return false;
        };
        if !self
            .tasks
            .get(id)
            .is_some_and(|task| task.info.master_request == master)
        {
            return false;
        }
        let Some(bus) = self.bus_of_mut(port) else {
            return false;
        };
        if master {
            bus.current_task = Some(id);
            self.master_start_request(id);
        } else {
            bus.slave_task = Some(id);
            self.slave_start_request(id);
        }
        true
    }

    /// Queue the follow-up write of one device whose address is settled.
    fn post_init_step(&mut self, port: PortId) -> bool {
        if self.post_init.is_some() {
            return false;
        }
        let Some(bus) = self.bus_of(port) else {
            return false;
        };
        let Some((addr, data)) = bus
            .pending(Request::PostInit)
            .filter(|dev| dev.has_dynamic_addr() && dev.attr.run_i3c())
            .find_map(|dev| Some((dev.dynamic_addr, dev.post_init.clone()?)))
        else {
            return false;
        };
        let rate = self.device(port).map_or(speed::SDR_12P5MHZ, |dev| dev.sdr_rate);
        let req = TaskRequest::new(Protocol::I3cWrite, addr)
            .write(&data)
            .baudrate(rate)
            .policy(TaskPolicy::InsertFirst);
        match self.master_create_task(port, &req) {
            Ok(id) => {
                if let Some(task) = self.tasks.get_mut(id) {
                    task.info.post_init = true;
                }
                self.post_init = Some(id);
                i3c_log!(self.logger, debug, "port {}: post-init to {:#04x}", port.index(), addr);
            }
            Err(err) => {
                i3c_log!(self.logger, error, "post-init to {:#04x} dropped: {}", addr, err);
                if let Some(dev) = self
                    .bus_of_mut(port)
                    .and_then(|bus| bus.dev_by_dynamic_addr_mut(addr))
                {
                    dev.attr.mark_done(Request::PostInit);
                }
            }
        }
        true
    }

    /// Link a built task into its port queue.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when the pool or the port queue is full.
    pub(crate) fn enqueue_task(
        &mut self,
        task: TransferTask,
        policy: TaskPolicy,
    ) -> I3cResult<TaskId> {
        let port = task.port;
        let id = self.tasks.alloc(task)?;
        let Some(dev) = self.devices.get_mut(port.index()) else {
            self.tasks.take(id);
            return Err(I3cError::TaskInvalid);
        };
        let linked = match policy {
            TaskPolicy::InsertFirst => dev.tasks.push_front(id),
            TaskPolicy::AppendLast => dev.tasks.push_back(id),
        };
        if linked.is_err() {
            self.tasks.take(id);
            return Err(I3cError::OutOfMemory);
        }
        Ok(id)
    }

    /// Take a task out of the pool and its port queue.
    pub(crate) fn detach_task(&mut self, id: TaskId) -> Option<TransferTask> {
        let task = self.tasks.take(id)?;
        if let Some(dev) = self.devices.get_mut(task.port.index()) {
            unlink(&mut dev.tasks, id);
        }
        Some(task)
    }

    /// Record the final result of a detached task and run its callback.
    pub(crate) fn notify_task(task: &mut TransferTask, result: Result<(), I3cError>) {
        task.info.result = result.map_err(nb::Error::Other);
        if let Some(callback) = task.info.callback {
            callback(&TaskOutcome {
                port: task.port,
                protocol: task.protocol,
                address: task.address,
                result,
                data: task.received(),
            });
        }
    }

    /// Unlink a task, record its result and run its callback.
    ///
    /// Bus slots are left to the caller.
    pub(crate) fn complete_task(
        &mut self,
        id: TaskId,
        result: Result<(), I3cError>,
    ) -> Option<TransferTask> {
        let mut task = self.detach_task(id)?;
        Self::notify_task(&mut task, result);
        Some(task)
    }

    /// Discard every queued task of a port, failing each with `error`.
    pub fn clean_tasks(&mut self, port: PortId, error: I3cError) -> usize {
        let mut count = 0;
        while let Some(id) = self.head_task(port) {
            if let Some(bus) = self.bus_of_mut(port) {
                if bus.slave_task == Some(id) {
                    bus.slave_task = None;
                }
                if bus.current_task == Some(id) {
                    bus.current_task = None;
                }
            }
            if self.complete_task(id, Err(error)).is_none() {
                if let Some(dev) = self.devices.get_mut(port.index()) {
                    dev.tasks.pop_front();
                }
            }
            count += 1;
        }
        if count > 0 {
            i3c_log!(self.logger, debug, "port {}: {} tasks discarded", port.index(), count);
        }
        count
    }

    /// Advance software timeouts of every running task. Master tasks only
    /// time out on ports with the software timeout enabled.
    pub fn tick(&mut self, elapsed: MillisDurationU32) {
        for index in 0..self.buses.len() {
            let Some(bus) = self.buses.get(index) else {
                continue;
            };
            let (master_task, slave_task) = (bus.current_task, bus.slave_task);
            let timed = master_task
                .and_then(|id| self.tasks.get(id))
                .and_then(|task| self.device(task.port))
                .is_some_and(|dev| dev.enable_sw_timeout);
            if let Some(id) = master_task.filter(|_| timed) {
                if self.charge(id, elapsed) {
                    self.master_timeout(id);
                }
            }
            if let Some(id) = slave_task {
                if self.charge(id, elapsed) {
                    if let Some(port) = self.tasks.get(id).map(|t| t.port) {
                        i3c_log!(self.logger, debug, "port {}: slave request timed out", port.index());
                        self.slave_end_request(port, Err(I3cError::SwTimeout));
                    }
                }
            }
        }
    }

    /// Add `elapsed` to a task and report whether it ran out of time.
    fn charge(&mut self, id: TaskId, elapsed: MillisDurationU32) -> bool {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        task.info.elapsed = MillisDurationU32::from_ticks(
            task.info.elapsed.ticks().saturating_add(elapsed.ticks()),
        );
        task.info.elapsed >= task.info.sw_timeout
    }

    /// Issue a bus reset. Queued tasks on the bus are failed with `Term`.
    ///
    /// # Errors
    ///
    /// `BusBusy` while a task owns the bus; errors from the HAL.
    pub fn reset_bus(&mut self, port: PortId) -> I3cResult<()> {
        let bus = self.bus_of(port).ok_or(I3cError::ParameterInvalid)?;
        if bus.is_busy() {
            return Err(I3cError::BusBusy);
        }
        let bus_id = bus.id;
        self.hal.start_bus_reset(port)?;
        if let Some(bus) = self.bus_of_mut(port) {
            bus.state = BusState::WaitResetDone;
        }
        for other in PortId::all() {
            if self.get_bus_from_port(other) == Some(bus_id) {
                self.clean_tasks(other, I3cError::Term);
            }
        }
        i3c_log!(self.logger, debug, "bus {}: reset", bus_id.number());
        Ok(())
    }

    fn bus_reset_done(&mut self, port: PortId) {
        let Some(bus) = self.bus_of_mut(port) else {
            return;
        };
        if bus.state != BusState::WaitResetDone {
            return;
        }
        let master = bus.current_master;
        for index in 0..bus.devices.len() {
            if bus.devices.get(index).is_some_and(|dev| dev.internal.is_some() && dev.internal == master) {
                continue;
            }
            bus.reset_dev_info(index);
            if let Some(dev) = bus.devices.get_mut(index) {
                for req in [Request::Setdasa, Request::Setaasa, Request::Sethid] {
                    let done = match req {
                        Request::Setdasa => dev.attr.done_setdasa(),
                        Request::Setaasa => dev.attr.done_setaasa(),
                        _ => dev.attr.done_sethid(),
                    };
                    if done {
                        dev.attr.request(req);
                    }
                }
            }
        }
        bus.state = BusState::Default;
        let internal: heapless::Vec<PortId, I3C_PORT_MAX> = bus
            .devices
            .iter()
            .filter_map(|dev| dev.internal)
            .filter(|&p| Some(p) != bus.current_master)
            .collect();
        for slave in internal {
            if let Some(dev) = self.device_mut(slave) {
                dev.dynamic_addr = DYNAMIC_ADDR_NONE;
                dev.run_i3c = false;
            }
        }
        i3c_log!(self.logger, debug, "port {}: reset done", port.index());
    }

    /// Issue a bus clear, failing the running master task with `BusError`.
    ///
    /// # Errors
    ///
    /// Errors from the HAL.
    pub fn clear_bus(&mut self, port: PortId) -> I3cResult<()> {
        let current = self
            .bus_of(port)
            .ok_or(I3cError::ParameterInvalid)?
            .current_task;
        if let Some(id) = current {
            self.hal.stop(port);
            self.finish_master_task(id, Err(I3cError::BusError));
        }
        self.hal.start_bus_clear(port)?;
        if let Some(bus) = self.bus_of_mut(port) {
            bus.state = BusState::WaitClearDone;
        }
        Ok(())
    }

    fn bus_clear_done(&mut self, port: PortId) {
        if let Some(bus) = self.bus_of_mut(port) {
            if bus.state == BusState::WaitClearDone {
                bus.state = BusState::Idle;
            }
        }
    }
}
