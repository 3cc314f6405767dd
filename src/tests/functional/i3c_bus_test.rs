// Licensed under the Apache-2.0 license

//! End-to-end bus scenarios over the loopback controller.
//!
//! Each scenario brings up a fresh context, drives it to quiescence with
//! [`settle`] and checks what both ends of the wire observed. Results are
//! reported line by line on the console passed in.

use crate::i3c::common::{
    ccc, speed, BusId, BusState, DeviceMode, InitMode, PortId, Protocol, TaskPolicy, TransferDir,
    DYNAMIC_ADDR_NONE, I3C_PAYLOAD_SIZE_MAX, STATIC_ADDR_NONE,
};
use crate::i3c::config::{ExternalDevice, PortConfigBuilder, SystemConfig};
use crate::i3c::context::I3cContext;
use crate::i3c::device::{PostInitWrite, Request};
use crate::i3c::engine::I3cEvent;
use crate::i3c::error::{I3cError, I3cResult};
use crate::i3c::hal::I3cHardwareCore;
use crate::i3c::slave::MQUEUE_NOTIFY_MDB;
use crate::i3c::task::{TaskOutcome, TaskRequest};
use crate::tests::loopback_hal::{settle, Call, LoopbackHal, Target};
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use embedded_io::{ErrorType, Write, WriteFmtError};
use fugit::MillisDurationU32;

type Report<W> = Result<(), WriteFmtError<<W as ErrorType>::Error>>;

const NO_RESULT: u32 = u32::MAX;

/// Last completion seen by a callback.
struct Recorder {
    count: AtomicUsize,
    result: AtomicU32,
    address: AtomicU8,
    len: AtomicUsize,
    data: [AtomicU8; I3C_PAYLOAD_SIZE_MAX],
}

impl Recorder {
    const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            result: AtomicU32::new(NO_RESULT),
            address: AtomicU8::new(0),
            len: AtomicUsize::new(0),
            data: [const { AtomicU8::new(0) }; I3C_PAYLOAD_SIZE_MAX],
        }
    }

    fn record(&self, outcome: &TaskOutcome<'_>) {
        let code = match outcome.result {
            Ok(()) => 0,
            Err(err) => err.code(),
        };
        self.result.store(code, Ordering::Relaxed);
        self.address.store(outcome.address, Ordering::Relaxed);
        self.len.store(outcome.data.len(), Ordering::Relaxed);
        for (slot, byte) in self.data.iter().zip(outcome.data) {
            slot.store(*byte, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.result.store(NO_RESULT, Ordering::Relaxed);
        self.address.store(0, Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);
        for slot in &self.data {
            slot.store(0, Ordering::Relaxed);
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn result(&self) -> Option<Result<(), I3cError>> {
        match self.result.load(Ordering::Relaxed) {
            NO_RESULT => None,
            0 => Some(Ok(())),
            code => I3cError::from_code(code).map(Err),
        }
    }

    fn address(&self) -> u8 {
        self.address.load(Ordering::Relaxed)
    }

    fn data_matches(&self, expected: &[u8]) -> bool {
        self.len.load(Ordering::Relaxed) == expected.len()
            && self
                .data
                .iter()
                .zip(expected)
                .all(|(slot, byte)| slot.load(Ordering::Relaxed) == *byte)
    }
}

static TASKS: Recorder = Recorder::new();
static EVENTS: Recorder = Recorder::new();

fn on_task(outcome: &TaskOutcome<'_>) {
    TASKS.record(outcome);
}

fn on_event(outcome: &TaskOutcome<'_>) {
    EVENTS.record(outcome);
}

const MASTER: PortId = PortId::FIRST;

fn port(n: u8) -> PortId {
    match PortId::new(n) {
        Some(port) => port,
        None => panic!("no port {n}"),
    }
}

fn ok<T>(result: I3cResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("unexpected error: {err}"),
    }
}

/// Evaluation board with the bus 0 master reporting events to [`on_event`].
fn board() -> SystemConfig {
    let mut config = SystemConfig::npcm400f_evb();
    if let Some(master) = config.ports.first_mut().and_then(Option::as_mut) {
        master.callback = Some(on_event);
        master.accept_hot_join = true;
        master.accept_master_request = true;
    }
    config
}

fn bring_up(config: &SystemConfig, hal: LoopbackHal) -> I3cContext<LoopbackHal> {
    TASKS.reset();
    EVENTS.reset();
    let mut ctx = I3cContext::new(hal);
    ok(ctx.start(config));
    settle(&mut ctx);
    ctx
}

fn slave_addr(ctx: &I3cContext<LoopbackHal>, slave: PortId) -> u8 {
    ctx.device(slave).map_or(DYNAMIC_ADDR_NONE, |dev| dev.dynamic_addr)
}

pub fn run_i3c_bus_tests<W: Write>(uart: &mut W) -> Report<W> {
    writeln!(uart, "\r\n=== I3C Bus Tests ===\r")?;

    test_setdasa_before_entdaa(uart)?;
    test_setdasa_partial_nack(uart)?;
    test_post_init_write(uart)?;
    test_queued_task_waits_for_bus(uart)?;
    test_response_replaced(uart)?;
    test_software_timeout(uart)?;
    test_nack_retries_then_fails(uart)?;
    test_discarded_tasks_terminated(uart)?;
    test_ibi_accept_and_reject(uart)?;
    test_mqueue_round_trip(uart)?;
    test_hot_join(uart)?;
    test_master_handoff(uart)?;
    test_bus_reset_reenumerates(uart)?;

    writeln!(uart, "\r\n=== All I3C Bus Tests Passed ===\r")?;
    Ok(())
}

fn test_setdasa_before_entdaa<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing SETDASA before ENTDAA... ")?;

    let pid = [0x04, 0x16, 0x00, 0x00, 0x00, 0x42];
    let mut config = board();
    let declared = ExternalDevice::new(STATIC_ADDR_NONE, InitMode::I3C | InitMode::ENTDAA)
        .identity(pid, 0x06, 0x00)
        .dynamic_addr(0x30);
    assert!(config.add_device(0, declared).is_ok());
    let mut hal = LoopbackHal::new();
    assert!(hal
        .add_target(Target::new(0, STATIC_ADDR_NONE).identity(pid, 0x06, 0x00).entdaa())
        .is_ok());

    let ctx = bring_up(&config, hal);

    assert_eq!(slave_addr(&ctx, port(1)), 0x21);
    assert_eq!(ctx.hal.dynamic_address(port(1)), 0x21);
    assert_eq!(ctx.hal.target(0).map(|t| t.dynamic_addr), Some(0x30));

    let setdasa = ctx
        .hal
        .calls()
        .position(|call| matches!(call, Call::StartFrame { addr: 0x21, dir: TransferDir::Write, .. }));
    let assign = ctx
        .hal
        .calls()
        .position(|call| matches!(call, Call::AssignAddress { addr: 0x30, .. }));
    assert!(setdasa.is_some());
    assert!(assign.is_some());
    assert!(setdasa < assign);

    let bus = ctx.bus(BusId::FIRST);
    assert_eq!(bus.map(|bus| bus.state), Some(BusState::Idle));
    let rec = ctx.get_dev_info_by_dynamic_addr(BusId::FIRST, 0x30);
    assert!(rec.is_some_and(|rec| rec.attr.run_i3c() && rec.pid == pid));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_setdasa_partial_nack<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing SETDASA with a missing target... ")?;

    let mut config = board();
    for addr in [0x50, 0x52] {
        assert!(config
            .add_device(0, ExternalDevice::new(addr, InitMode::I3C | InitMode::SETDASA))
            .is_ok());
    }
    let mut hal = LoopbackHal::new();
    assert!(hal.add_target(Target::new(0, 0x52)).is_ok());

    let ctx = bring_up(&config, hal);

    // 0x21 answered ahead of the missing 0x50 and keeps its address.
    assert_eq!(ctx.hal.dynamic_address(port(1)), 0x21);
    let slave = ctx.get_dev_info_by_static_addr(BusId::FIRST, 0x21);
    assert!(slave.is_some_and(|rec| rec.attr.present() && rec.attr.done_setdasa()));
    assert!(slave.is_some_and(|rec| !rec.attr.is_pending(Request::Setdasa)));

    let missing = ctx.get_dev_info_by_static_addr(BusId::FIRST, 0x50);
    assert!(missing.is_some_and(|rec| !rec.attr.present() && !rec.attr.done_setdasa()));

    // 0x52 sat behind the NACK and is served by the next SETDASA.
    assert_eq!(ctx.hal.target(0).map(|t| t.dynamic_addr), Some(0x52));
    let late = ctx.get_dev_info_by_static_addr(BusId::FIRST, 0x52);
    assert!(late.is_some_and(|rec| rec.attr.present() && rec.attr.done_setdasa()));

    let to = |addr: u8| move |call: &Call| matches!(call, Call::StartFrame { addr: a, dir: TransferDir::Write, .. } if *a == addr);
    assert_eq!(ctx.hal.count_calls(to(0x50)), 1);
    assert_eq!(ctx.hal.count_calls(to(0x52)), 1);
    assert_eq!(ctx.hal.count_calls(to(0x21)), 1);
    let bus = ctx.bus(BusId::FIRST);
    assert_eq!(bus.map(|bus| bus.state), Some(BusState::Idle));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_post_init_write<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing post-init write... ")?;

    let mut config = board();
    let Ok(setup) = PostInitWrite::from_slice(&[0x10, 0x01]) else {
        panic!("post-init write too long");
    };
    let declared = ExternalDevice::new(0x52, InitMode::I3C | InitMode::SETDASA | InitMode::POST_INIT)
        .post_init(setup);
    assert!(config.add_device(0, declared).is_ok());
    let mut hal = LoopbackHal::new();
    assert!(hal.add_target(Target::new(0, 0x52)).is_ok());

    let ctx = bring_up(&config, hal);

    assert_eq!(ctx.hal.target(0).map(|t| t.memory.as_slice()), Some([0x10u8, 0x01].as_slice()));
    let rec = ctx.get_dev_info_by_dynamic_addr(BusId::FIRST, 0x52);
    assert!(rec.is_some_and(|rec| rec.attr.done_post_init() && !rec.attr.is_pending(Request::PostInit)));
    let write = |call: &Call| matches!(call, Call::StartFrame { addr: 0x52, dir: TransferDir::Write, len: 2, .. });
    assert_eq!(ctx.hal.count_calls(write), 1);

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_queued_task_waits_for_bus<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing queued task waits for the bus... ")?;

    let mut ctx = bring_up(&board(), LoopbackHal::new());
    let target = slave_addr(&ctx, port(1));
    ctx.hal.clear_calls();
    ctx.hal.stall(true);

    let req = TaskRequest::new(Protocol::I3cWrite, target)
        .write(&[0x11, 0x22])
        .baudrate(speed::SDR_12P5MHZ)
        .callback(on_task);
    let first = ok(ctx.master_create_task(MASTER, &req));
    let second = ok(ctx.master_create_task(MASTER, &req));

    assert!(ctx.task_engine());
    assert!(!ctx.task_engine());
    let running = ctx.bus(BusId::FIRST).and_then(|bus| bus.current_task);
    assert_eq!(running, Some(first));
    assert!(ctx.task(second).is_some());
    assert_eq!(ctx.hal.count_calls(|call| matches!(call, Call::StartFrame { .. })), 1);

    ctx.hal.stall(false);
    ctx.handle_event(I3cEvent::FrameComplete { port: MASTER });
    assert_eq!(TASKS.count(), 1);
    settle(&mut ctx);

    assert_eq!(TASKS.count(), 2);
    assert_eq!(TASKS.result(), Some(Ok(())));
    assert!(ctx.task(second).is_none());
    assert_eq!(ctx.slave_mqueue_read(port(1)).as_deref(), Some([0x11u8, 0x22].as_slice()));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_response_replaced<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing pending response replacement... ")?;

    let mut ctx = bring_up(&board(), LoopbackHal::new());
    let slave = port(1);
    let target = slave_addr(&ctx, slave);

    ok(ctx.slave_prepare_response(slave, &[1, 2, 3]));
    assert_eq!(ctx.slave_check_response_complete(slave), Err(nb::Error::WouldBlock));
    ok(ctx.slave_prepare_response(slave, &[4, 5]));
    assert_eq!(
        ctx.hal.count_calls(|call| matches!(call, Call::StopSlaveTx(p) if *p == slave)),
        1
    );

    let req = TaskRequest::new(Protocol::I3cRead, target)
        .read(2)
        .baudrate(speed::SDR_12P5MHZ)
        .callback(on_task);
    ok(ctx.master_create_task(MASTER, &req));
    settle(&mut ctx);

    assert_eq!(TASKS.result(), Some(Ok(())));
    assert!(TASKS.data_matches(&[4, 5]));
    assert_eq!(ctx.slave_check_response_complete(slave), Ok(()));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_software_timeout<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing software timeout... ")?;

    let mut ctx = bring_up(&board(), LoopbackHal::new());
    let target = slave_addr(&ctx, port(1));
    ctx.hal.stall(true);

    let req = TaskRequest::new(Protocol::I3cWrite, target)
        .write(&[0xAA])
        .baudrate(speed::SDR_12P5MHZ)
        .timeout(MillisDurationU32::from_ticks(50))
        .callback(on_task);
    let id = ok(ctx.master_create_task(MASTER, &req));
    assert!(ctx.task_engine());

    ctx.handle_event(I3cEvent::Tick {
        elapsed: MillisDurationU32::from_ticks(20),
    });
    assert_eq!(TASKS.count(), 0);
    ctx.handle_event(I3cEvent::Tick {
        elapsed: MillisDurationU32::from_ticks(40),
    });

    assert_eq!(TASKS.result(), Some(Err(I3cError::SwTimeout)));
    assert!(ctx.task(id).is_none());
    let bus = ctx.bus(BusId::FIRST);
    assert!(bus.is_some_and(|bus| bus.current_task.is_none()));
    assert!(ctx.hal.calls().any(|call| *call == Call::Stop(MASTER)));

    // Without the software timeout the same task waits for the wire.
    if let Some(dev) = ctx.device_mut(MASTER) {
        dev.enable_sw_timeout = false;
    }
    TASKS.reset();
    let id = ok(ctx.master_create_task(MASTER, &req));
    assert!(ctx.task_engine());
    ctx.handle_event(I3cEvent::Tick {
        elapsed: MillisDurationU32::from_ticks(500),
    });
    assert_eq!(TASKS.count(), 0);
    assert!(ctx.task(id).is_some());
    ctx.hal.stall(false);
    ctx.handle_event(I3cEvent::FrameComplete { port: MASTER });
    assert_eq!(TASKS.result(), Some(Ok(())));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_nack_retries_then_fails<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing NACK retries... ")?;

    let mut ctx = bring_up(&board(), LoopbackHal::new());
    ctx.hal.clear_calls();

    let req = TaskRequest::new(Protocol::I3cWrite, 0x6A)
        .write(&[0x01])
        .baudrate(speed::SDR_12P5MHZ)
        .callback(on_task);
    let id = ok(ctx.master_create_task(MASTER, &req));
    settle(&mut ctx);

    // One attempt plus three retries, then a single failure report.
    let attempt = |call: &Call| matches!(call, Call::StartFrame { addr: 0x6A, .. });
    assert_eq!(ctx.hal.count_calls(attempt), 4);
    assert_eq!(TASKS.count(), 1);
    assert_eq!(TASKS.result(), Some(Err(I3cError::Nack)));
    assert!(ctx.task(id).is_none());
    let bus = ctx.bus(BusId::FIRST);
    assert!(bus.is_some_and(|bus| bus.current_task.is_none()));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_discarded_tasks_terminated<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing discarded tasks report Term... ")?;

    let mut ctx = bring_up(&board(), LoopbackHal::new());
    let slave = port(1);
    let addr = slave_addr(&ctx, slave);

    // A queued IBI is dropped once RSTDAA takes the slave's address away.
    let ibi = TaskRequest::new(Protocol::Ibi, addr)
        .write(&[0xAE])
        .baudrate(speed::SDR_12P5MHZ)
        .callback(on_task);
    let pending = ok(ctx.slave_create_task(slave, &ibi));
    ok(ctx.insert_task_cccb(MASTER, &[ccc::BROADCAST_RSTDAA], None, TaskPolicy::InsertFirst));
    settle(&mut ctx);

    assert_eq!(TASKS.count(), 1);
    assert_eq!(TASKS.result(), Some(Err(I3cError::Term)));
    assert!(ctx.task(pending).is_none());
    assert_eq!(slave_addr(&ctx, slave), DYNAMIC_ADDR_NONE);
    assert_eq!(EVENTS.count(), 0);

    // A bus reset fails everything still queued on the bus.
    TASKS.reset();
    let write = TaskRequest::new(Protocol::I2cWrite, 0x21)
        .write(&[0x01])
        .baudrate(speed::I2C_400KHZ)
        .callback(on_task);
    ok(ctx.master_create_task(MASTER, &write));
    ok(ctx.master_create_task(MASTER, &write));
    ok(ctx.reset_bus(MASTER));

    assert_eq!(TASKS.count(), 2);
    assert_eq!(TASKS.result(), Some(Err(I3cError::Term)));
    assert!(ctx.head_task(MASTER).is_none());

    settle(&mut ctx);
    assert_eq!(slave_addr(&ctx, slave), 0x21);
    assert_eq!(TASKS.count(), 2);

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_ibi_accept_and_reject<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing IBI accept and reject... ")?;

    let mut ctx = bring_up(&board(), LoopbackHal::new());
    let slave = port(1);
    let addr = slave_addr(&ctx, slave);

    ok(ctx.insert_task_ibi(slave, &[0xAE, 0x01, 0x02]));
    settle(&mut ctx);

    assert_eq!(EVENTS.count(), 1);
    assert_eq!(EVENTS.result(), Some(Ok(())));
    assert_eq!(EVENTS.address(), addr);
    assert!(EVENTS.data_matches(&[0xAE, 0x01, 0x02]));
    assert!(ctx.head_task(slave).is_none());
    assert!(ctx.hal.calls().any(|call| *call == Call::IbiAck { port: MASTER, with_mdb: true }));

    if let Some(dev) = ctx.device_mut(slave) {
        dev.ack_ibi = false;
    }
    ok(ctx.insert_task_ibi(slave, &[0xAE]));
    settle(&mut ctx);

    assert!(ctx.hal.calls().any(|call| *call == Call::IbiNack(MASTER)));
    assert!(ctx.head_task(slave).is_none());
    assert_eq!(ctx.slave_check_ibidis(slave), Ok(true));

    // Disabled by DISEC: the next request fails locally and is dropped.
    ok(ctx.insert_task_ibi(slave, &[0xAE]));
    settle(&mut ctx);
    assert!(ctx.head_task(slave).is_none());
    assert_eq!(ctx.hal.count_calls(|call| *call == Call::IbiNack(MASTER)), 1);

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_mqueue_round_trip<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing message queue round trip... ")?;

    let mut ctx = bring_up(&board(), LoopbackHal::new());
    let slave = port(1);
    let target = slave_addr(&ctx, slave);
    let mut message = [0u8; I3C_PAYLOAD_SIZE_MAX];
    for (byte, value) in message.iter_mut().zip(0u8..) {
        *byte = value.wrapping_mul(7) ^ 0x5A;
    }

    let write = TaskRequest::new(Protocol::I3cWrite, target)
        .write(&message)
        .baudrate(speed::SDR_12P5MHZ)
        .callback(on_task);
    ok(ctx.master_create_task(MASTER, &write));
    settle(&mut ctx);
    assert_eq!(TASKS.result(), Some(Ok(())));
    assert_eq!(ctx.slave_mqueue_read(slave).as_deref(), Some(message.as_slice()));
    assert!(ctx.slave_mqueue_read(slave).is_none());

    ok(ctx.slave_mqueue_write(slave, &message));
    settle(&mut ctx);
    assert_eq!(EVENTS.address(), target);
    assert!(EVENTS.data_matches(&[MQUEUE_NOTIFY_MDB]));

    TASKS.reset();
    let read = TaskRequest::new(Protocol::I3cRead, target)
        .read(I3C_PAYLOAD_SIZE_MAX)
        .baudrate(speed::SDR_12P5MHZ)
        .callback(on_task);
    ok(ctx.master_create_task(MASTER, &read));
    settle(&mut ctx);
    assert_eq!(TASKS.result(), Some(Ok(())));
    assert!(TASKS.data_matches(&message));
    assert_eq!(ctx.slave_check_response_complete(slave), Ok(()));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_hot_join<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing hot-join... ")?;

    let mut config = board();
    if let Some(slot) = config.ports.get_mut(1) {
        *slot = None;
    }
    let mut ctx = bring_up(&config, LoopbackHal::new());
    let slave = port(1);
    let late = PortConfigBuilder::new()
        .mode(DeviceMode::SlaveOnly)
        .bus(0)
        .vendor_id(0x0416)
        .part_number(0x0000_1001)
        .bcr(0x06)
        .dcr(0x00)
        .build();
    ok(ctx.setup_internal_device(slave, &late));
    ok(ctx.connect_bus(slave, BusId::FIRST));

    ok(ctx.insert_task_hot_join(slave));
    settle(&mut ctx);

    let addr = slave_addr(&ctx, slave);
    assert_ne!(addr, DYNAMIC_ADDR_NONE);
    assert_eq!(ctx.hal.dynamic_address(slave), addr);
    assert!(ctx.head_task(slave).is_none());
    assert!(ctx.hal.calls().any(|call| *call == Call::IbiAck { port: MASTER, with_mdb: false }));
    assert!(ctx.hal.calls().any(|call| matches!(call, Call::AssignAddress { addr: a, .. } if *a == addr)));
    assert_eq!(EVENTS.result(), Some(Err(I3cError::Hj)));
    assert_eq!(ctx.insert_task_hot_join(slave), Err(I3cError::ParameterInvalid));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_master_handoff<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing master handoff... ")?;

    let mut config = board();
    if let Some(secondary) = config.ports.get_mut(1).and_then(Option::as_mut) {
        secondary.mode = DeviceMode::SecondaryMaster;
    }
    let mut ctx = bring_up(&config, LoopbackHal::new());
    let requester = port(1);
    assert_eq!(slave_addr(&ctx, requester), 0x21);

    ok(ctx.insert_task_master_request(requester));
    settle(&mut ctx);

    assert_eq!(ctx.get_current_master_from_port(MASTER), Some(requester));
    assert_eq!(ctx.device(requester).map(|dev| dev.mode), Some(DeviceMode::CurrentMaster));
    assert_eq!(ctx.device(MASTER).map(|dev| dev.mode), Some(DeviceMode::SecondaryMaster));
    assert!(ctx
        .hal
        .calls()
        .any(|call| *call == Call::MasterRole { port: requester, master: true }));
    assert!(ctx.head_task(requester).is_none());

    // The new master can drive the bus, the old one now answers as a slave.
    let req = TaskRequest::new(Protocol::CccBroadcast, 0)
        .write(&[ccc::BROADCAST_ENEC, 0x01])
        .header(2)
        .baudrate(speed::SDR_1MHZ)
        .callback(on_task)
        .policy(TaskPolicy::AppendLast);
    TASKS.reset();
    ok(ctx.master_create_task(requester, &req));
    settle(&mut ctx);
    assert_eq!(TASKS.result(), Some(Ok(())));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

fn test_bus_reset_reenumerates<W: Write>(uart: &mut W) -> Report<W> {
    write!(uart, "Testing bus reset and re-enumeration... ")?;

    let mut ctx = bring_up(&board(), LoopbackHal::new());
    let slave = port(1);
    assert_eq!(slave_addr(&ctx, slave), 0x21);
    ctx.hal.clear_calls();

    let req = TaskRequest::new(Protocol::I3cWrite, 0x21)
        .write(&[0x01])
        .baudrate(speed::SDR_12P5MHZ)
        .callback(on_task);
    ctx.hal.stall(true);
    ok(ctx.master_create_task(MASTER, &req));
    ok(ctx.master_create_task(MASTER, &req));
    ctx.task_engine();
    assert_eq!(ctx.reset_bus(MASTER), Err(I3cError::BusBusy));
    ok(ctx.clear_bus(MASTER));
    assert_eq!(TASKS.result(), Some(Err(I3cError::BusError)));
    ctx.hal.stall(false);
    settle(&mut ctx);
    assert_eq!(ctx.hal.count_calls(|call| matches!(call, Call::BusClear(_))), 1);
    assert_eq!(TASKS.count(), 2);
    assert_eq!(TASKS.result(), Some(Ok(())));

    ctx.hal.clear_calls();
    ok(ctx.reset_bus(MASTER));
    assert_eq!(ctx.hal.dynamic_address(slave), DYNAMIC_ADDR_NONE);
    settle(&mut ctx);

    assert_eq!(ctx.hal.count_calls(|call| matches!(call, Call::BusReset(_))), 1);
    let setdasa = |call: &Call| matches!(call, Call::StartFrame { addr: 0x21, dir: TransferDir::Write, .. });
    assert_eq!(ctx.hal.count_calls(setdasa), 1);
    assert_eq!(slave_addr(&ctx, slave), 0x21);
    assert_eq!(ctx.hal.dynamic_address(slave), 0x21);
    assert_eq!(ctx.device(MASTER).map(|dev| dev.dynamic_addr), Some(0x20));
    let bus = ctx.bus(BusId::FIRST);
    assert_eq!(bus.map(|bus| bus.state), Some(BusState::Idle));

    writeln!(uart, "PASSED\r")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    struct Console(String);

    impl ErrorType for Console {
        type Error = Infallible;
    }

    impl Write for Console {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.0.push_str(&String::from_utf8_lossy(buf));
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_bus_scenarios_pass() {
        let mut console = Console(String::new());
        assert!(run_i3c_bus_tests(&mut console).is_ok());
        assert_eq!(console.0.matches("PASSED").count(), 13);
        assert!(console.0.contains("All I3C Bus Tests Passed"));
    }
}
