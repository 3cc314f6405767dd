// Licensed under the Apache-2.0 license

//! Master engine.
//!
//! Drives the current task of a bus frame by frame. The HAL reports each
//! frame through [`I3cEvent`](crate::i3c::engine::I3cEvent)s; the handlers
//! here either start the next frame, retry the current one or finish the
//! task. Finishing a task clears exactly one bus slot and runs its callback
//! exactly once.

use crate::common::{i3c_log, Logger};
use crate::i3c::common::{
    bcr, ccc, event_mask, speed, BusState, PortId, Protocol, TransferDir, TransferFlags,
    ENTDAA_BUFFER_LEN, I3C_BROADCAST_ADDR, IBI_PAYLOAD_SIZE_MAX,
};
use crate::i3c::context::I3cContext;
use crate::i3c::device::Request;
use crate::i3c::engine::IbiKind;
use crate::i3c::error::I3cError;
use crate::i3c::hal::I3cHal;
use crate::i3c::task::{FrameBuffer, TaskId, TaskOutcome, TaskRequest};
use fugit::MillisDurationU32;

impl<H: I3cHal, L: Logger> I3cContext<H, L> {
    fn current_task_of(&self, port: PortId) -> Option<TaskId> {
        self.bus_of(port).and_then(|bus| bus.current_task)
    }

    /// Begin the task the scheduler made current.
    pub(crate) fn master_start_request(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.info.elapsed = MillisDurationU32::from_ticks(0);
        }
        self.start_frame(id);
    }

    /// Program the HAL for the current frame of a task.
    fn start_frame(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        let port = task.port;
        let Some(frame) = task.current_frame() else {
            self.finish_master_task(id, Ok(()));
            return;
        };
        if let Err(err) = self.hal.start_frame(port, frame, task.frame_tx(frame)) {
            i3c_log!(self.logger, error, "port {}: frame start failed: {}", port.index(), err);
            self.finish_master_task(id, Err(err));
        }
    }

    /// The current frame finished on the wire.
    pub(crate) fn master_frame_complete(&mut self, port: PortId) {
        let Some(id) = self.current_task_of(port) else {
            i3c_log!(self.logger, error, "port {}: stray frame completion", port.index());
            return;
        };
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let Some(frame) = task.current_frame().copied() else {
            return;
        };
        if frame.direction == TransferDir::Read {
            let n = self.hal.fetch_read(port, task.frame_rx_mut());
            let offset = match frame.buffer {
                FrameBuffer::Rx(offset) => offset,
                _ => 0,
            };
            task.rx_count = task.rx_count.max(offset + n);
        }
        if let Some(frame) = task.current_frame_mut() {
            frame.access_idx = frame.access_len;
        }
        if task.protocol == Protocol::Entdaa && task.frame_idx > 0 {
            let record_end = match frame.buffer {
                FrameBuffer::Rx(offset) => offset + frame.access_len + 1,
                _ => 0,
            };
            task.rx_count = task.rx_count.max(record_end);
            if let Err(err) = self.daa_assign(port, id) {
                i3c_log!(self.logger, error, "port {}: daa failed: {}", port.index(), err);
                self.hal.stop(port);
                self.finish_master_task(id, Err(err));
                return;
            }
        }
        self.run_next_frame(id);
    }

    fn run_next_frame(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        task.frame_idx += 1;
        if let Some(frame) = task.current_frame_mut() {
            frame.access_idx = 0;
            self.start_frame(id);
            return;
        }
        if task.protocol == Protocol::Entdaa {
            // Every record slot was used; run another round for the rest.
            let port = task.port;
            task.frame_idx = 0;
            task.rx_count = 0;
            for frame in task.frames.iter_mut() {
                frame.access_idx = 0;
            }
            i3c_log!(self.logger, debug, "port {}: daa buffer full, next round", port.index());
            self.hal.stop(port);
            self.start_frame(id);
            return;
        }
        self.finish_master_task(id, Ok(()));
    }

    /// The current frame failed.
    pub(crate) fn master_transfer_error(&mut self, port: PortId, error: I3cError) {
        let Some(id) = self.current_task_of(port) else {
            i3c_log!(self.logger, error, "port {}: stray error {}", port.index(), error);
            return;
        };
        match error {
            I3cError::Nack => self.do_nack(port, id),
            _ => {
                i3c_log!(self.logger, debug, "port {}: transfer error {}", port.index(), error);
                self.hal.stop(port);
                self.finish_master_task(id, Err(error));
            }
        }
    }

    fn do_nack(&mut self, port: PortId, id: TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let protocol = task.protocol;
        let frame_idx = task.frame_idx;
        let Some(frame) = task.current_frame_mut() else {
            return;
        };
        let address = frame.address;
        if frame.direction == TransferDir::Write && frame_idx != 0 {
            i3c_log!(self.logger, debug, "port {}: {:#04x} nacked", port.index(), address);
            self.hal.stop(port);
            self.finish_master_task(id, Err(I3cError::Nack));
            return;
        }
        if !frame.flags.contains(TransferFlags::RETRY_ENABLE) || frame.retry_count == 0 {
            self.hal.stop(port);
            if protocol == Protocol::Entdaa {
                // Nobody else is asking for an address.
                self.finish_master_task(id, Ok(()));
            } else {
                i3c_log!(self.logger, debug, "port {}: {:#04x} nacked", port.index(), address);
                self.finish_master_task(id, Err(I3cError::Nack));
            }
            return;
        }
        frame.retry_count -= 1;
        frame.access_idx = 0;
        if frame.flags.contains(TransferFlags::RETRY_WITHOUT_STOP) {
            frame.flags |= TransferFlags::REPEAT_START;
        } else {
            self.hal.stop(port);
        }
        i3c_log!(self.logger, debug, "port {}: retry {:#04x}", port.index(), address);
        self.start_frame(id);
    }

    /// A slave is requesting the bus: yield it and open an EVENT task.
    pub(crate) fn master_slave_start(&mut self, port: PortId) {
        let Some(bus) = self.bus_of(port) else {
            return;
        };
        if bus.current_master != Some(port) {
            i3c_log!(self.logger, error, "port {}: slave start on non-master", port.index());
            return;
        }
        if let Some(id) = bus.current_task {
            let Some(task) = self.tasks.get_mut(id) else {
                return;
            };
            if task.protocol == Protocol::Event {
                return;
            }
            self.hal.stop(port);
            let requeue = task.current_frame_mut().is_some_and(|frame| {
                let retry = frame.flags.contains(TransferFlags::RETRY_ENABLE) && frame.retry_count > 0;
                if retry {
                    frame.retry_count -= 1;
                    frame.access_idx = 0;
                }
                retry
            });
            if requeue {
                i3c_log!(self.logger, debug, "port {}: task preempted by slave start", port.index());
                if let Some(bus) = self.bus_of_mut(port) {
                    bus.current_task = None;
                }
            } else {
                self.finish_master_task(id, Err(I3cError::SlvStart));
            }
        }
        let req = TaskRequest::new(Protocol::Event, I3C_BROADCAST_ADDR)
            .read(IBI_PAYLOAD_SIZE_MAX)
            .baudrate(speed::SDR_IBI);
        if let Err(err) = self.start_now(port, &req, TransferFlags::NORMAL) {
            i3c_log!(self.logger, error, "port {}: event task failed: {}", port.index(), err);
            self.hal.ibi_nack(port);
        }
    }

    /// The address of an in-band request won arbitration.
    pub(crate) fn master_ibi_request(&mut self, port: PortId, addr: u8, kind: IbiKind) {
        let event = self
            .current_task_of(port)
            .filter(|&id| self.tasks.get(id).is_some_and(|t| t.protocol == Protocol::Event));
        let Some(id) = event else {
            i3c_log!(self.logger, error, "port {}: ibi without event task", port.index());
            self.hal.ibi_nack(port);
            return;
        };
        if let Some(task) = self.tasks.get_mut(id) {
            task.address = addr;
        }
        let Some(master) = self.device(port) else {
            return;
        };
        let (accept_hj, accept_mr) = (master.accept_hot_join, master.accept_master_request);
        let record = self
            .bus_of(port)
            .and_then(|bus| bus.dev_by_dynamic_addr(addr))
            .map(|dev| (dev.bcr, dev.internal));
        let slave_acks = |internal: Option<PortId>| {
            internal
                .and_then(|p| self.device(p))
                .map_or(true, |dev| dev.ack_ibi)
        };
        let accept = addr != 0
            && match kind {
                IbiKind::Interrupt => record.is_some_and(|(dev_bcr, internal)| {
                    bcr::ibi_capable(dev_bcr) && slave_acks(internal)
                }),
                IbiKind::HotJoin => accept_hj,
                IbiKind::MasterRequest => accept_mr && record.is_some(),
            };
        if !accept {
            self.reject_ibi(port, id, addr, kind);
            return;
        }
        match kind {
            IbiKind::Interrupt => {
                let dev_bcr = record.map_or(0, |(dev_bcr, _)| dev_bcr);
                if bcr::ibi_with_payload(dev_bcr) {
                    // Payload arrives with the EVENT read frame.
                    self.hal.ibi_ack(port, true);
                } else {
                    self.hal.ibi_ack(port, false);
                    self.hal.stop(port);
                    self.finish_master_task(id, Ok(()));
                }
            }
            IbiKind::HotJoin => {
                self.hal.ibi_ack(port, false);
                self.hal.stop(port);
                self.finish_master_task(id, Err(I3cError::Hj));
                i3c_log!(self.logger, debug, "port {}: hot-join accepted", port.index());
                let req = TaskRequest::new(Protocol::Entdaa, 0)
                    .write(&[ccc::BROADCAST_ENTDAA])
                    .header(1)
                    .read(ENTDAA_BUFFER_LEN)
                    .baudrate(speed::I2C_1MHZ);
                if let Err(err) = self.start_now(port, &req, TransferFlags::NORMAL) {
                    i3c_log!(self.logger, error, "port {}: entdaa after hot-join: {}", port.index(), err);
                }
            }
            IbiKind::MasterRequest => {
                self.hal.ibi_ack(port, false);
                self.hal.stop(port);
                self.finish_master_task(id, Err(I3cError::Mr));
                i3c_log!(self.logger, debug, "port {}: master request from {:#04x}", port.index(), addr);
                let rate = self.device(port).map_or(speed::SDR_12P5MHZ, |dev| dev.sdr_rate);
                let getaccmst = [ccc::DIRECT_GETACCMST, addr];
                let req = TaskRequest::new(Protocol::CccRead, 1)
                    .write(&getaccmst)
                    .header(1)
                    .read(1)
                    .baudrate(rate);
                if let Err(err) = self.start_now(port, &req, TransferFlags::NORMAL) {
                    i3c_log!(self.logger, error, "port {}: getaccmst: {}", port.index(), err);
                }
            }
        }
    }

    /// Refuse an in-band request and tell the requester to stop asking.
    fn reject_ibi(&mut self, port: PortId, id: TaskId, addr: u8, kind: IbiKind) {
        i3c_log!(self.logger, debug, "port {}: ibi from {:#04x} nacked", port.index(), addr);
        self.hal.ibi_nack(port);
        self.finish_master_task(id, Ok(()));

        let mut payload: heapless::Vec<u8, 3> = heapless::Vec::new();
        let protocol = match (addr, kind) {
            (0, _) => {
                let _ = payload.extend_from_slice(&[ccc::BROADCAST_DISEC, event_mask::ENINT]);
                Protocol::CccBroadcast
            }
            (_, IbiKind::HotJoin) => {
                let _ = payload.extend_from_slice(&[ccc::BROADCAST_DISEC, event_mask::ENHJ]);
                Protocol::CccBroadcast
            }
            (_, IbiKind::Interrupt) => {
                let _ = payload.extend_from_slice(&[ccc::DIRECT_DISEC, addr, event_mask::ENINT]);
                Protocol::CccWrite
            }
            (_, IbiKind::MasterRequest) => {
                let _ = payload.extend_from_slice(&[ccc::DIRECT_DISEC, addr, event_mask::ENMR]);
                Protocol::CccWrite
            }
        };
        let (fmt, hsize) = if protocol == Protocol::CccWrite {
            (2, 1)
        } else {
            (0, payload.len())
        };
        let req = TaskRequest::new(protocol, fmt)
            .write(&payload)
            .header(hsize)
            .baudrate(speed::SDR_1MHZ);
        if let Err(err) = self.start_now(port, &req, TransferFlags::REPEAT_START) {
            i3c_log!(self.logger, error, "port {}: disec after nack: {}", port.index(), err);
        }
    }

    /// Software timeout of the running master task.
    pub(crate) fn master_timeout(&mut self, id: TaskId) {
        let Some(port) = self.tasks.get(id).map(|task| task.port) else {
            return;
        };
        i3c_log!(self.logger, debug, "port {}: task timed out", port.index());
        self.hal.stop(port);
        self.finish_master_task(id, Err(I3cError::SwTimeout));
    }

    /// Terminal step of every master task.
    pub(crate) fn finish_master_task(&mut self, id: TaskId, result: Result<(), I3cError>) {
        let Some(mut task) = self.detach_task(id) else {
            return;
        };
        let port = task.port;
        self.ccc_complete(&task, result);

        if task.info.post_init {
            if let Some(dev) = self
                .bus_of_mut(port)
                .and_then(|bus| bus.dev_by_dynamic_addr_mut(task.address))
            {
                dev.attr.mark_done(Request::PostInit);
            }
            self.post_init = None;
        }
        if task.protocol == Protocol::Event {
            if let Some(notify) = self.device(port).and_then(|dev| dev.callback) {
                notify(&TaskOutcome {
                    port,
                    protocol: Protocol::Event,
                    address: task.address,
                    result,
                    data: task.received(),
                });
            }
        }
        Self::notify_task(&mut task, result);

        let keep_init = task.protocol != Protocol::Entdaa;
        if let Some(bus) = self.bus_of_mut(port) {
            if bus.current_task == Some(id) {
                bus.current_task = None;
            }
            bus.state = match bus.state {
                BusState::Init if keep_init => BusState::Init,
                BusState::Init | BusState::Idle => BusState::Idle,
                other => other,
            };
        }
    }
}
