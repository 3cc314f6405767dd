// Licensed under the Apache-2.0 license

//! Device records.
//!
//! [`DeviceInfo`] describes one internal controller port. [`DeviceInfoShort`] is
//! a bus-level record of an attached device, which may alias an internal port
//! when two internal ports share a bus.

use crate::i3c::common::{
    BusId, DeviceMode, PortId, DYNAMIC_ADDR_NONE, I3C_PAYLOAD_SIZE_MAX,
    I3C_TASK_QUEUE_DEPTH, IBI_PAYLOAD_SIZE_MAX, STATIC_ADDR_NONE,
};
use crate::i3c::slave::{MessageQueue, RegisterTable};
use crate::i3c::task::{TaskCallback, TaskId};
use fugit::HertzU32;
use heapless::{Deque, Vec};

/// Per-device request/done and capability flags.
///
/// Each `req_*` flag pairs with a `done_*` flag; [`DeviceAttrib::mark_done`]
/// clears the request in the same step that records completion.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceAttrib(u32);

macro_rules! attrib_flags {
    ($($name:ident = $bit:expr),+ $(,)?) => {
        paste::paste! {
            impl DeviceAttrib {
                $(
                    pub const [<$name:upper>]: u32 = 1 << $bit;

                    #[must_use]
                    pub const fn $name(self) -> bool {
                        self.0 & Self::[<$name:upper>] != 0
                    }

                    pub fn [<set_ $name>](&mut self, on: bool) {
                        if on {
                            self.0 |= Self::[<$name:upper>];
                        } else {
                            self.0 &= !Self::[<$name:upper>];
                        }
                    }
                )+
            }
        }
    };
}

attrib_flags! {
    req_setaasa = 0,
    req_setdasa = 1,
    req_rstdaa = 2,
    req_sethid = 3,
    req_hot_join = 4,
    req_post_init = 5,
    done_setaasa = 6,
    done_setdasa = 7,
    done_rstdaa = 8,
    done_sethid = 9,
    done_hot_join = 10,
    done_post_init = 11,
    supp_mst = 12,
    supp_slv = 13,
    default_mst = 14,
    supp_entdaa = 15,
    present = 16,
    run_i3c = 17,
}

/// Requests that pair a `req_*` flag with a `done_*` flag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Setaasa,
    Setdasa,
    Rstdaa,
    Sethid,
    HotJoin,
    PostInit,
}

impl Request {
    const fn bits(self) -> (u32, u32) {
        match self {
            Self::Setaasa => (DeviceAttrib::REQ_SETAASA, DeviceAttrib::DONE_SETAASA),
            Self::Setdasa => (DeviceAttrib::REQ_SETDASA, DeviceAttrib::DONE_SETDASA),
            Self::Rstdaa => (DeviceAttrib::REQ_RSTDAA, DeviceAttrib::DONE_RSTDAA),
            Self::Sethid => (DeviceAttrib::REQ_SETHID, DeviceAttrib::DONE_SETHID),
            Self::HotJoin => (DeviceAttrib::REQ_HOT_JOIN, DeviceAttrib::DONE_HOT_JOIN),
            Self::PostInit => (DeviceAttrib::REQ_POST_INIT, DeviceAttrib::DONE_POST_INIT),
        }
    }
}

impl DeviceAttrib {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Raise a request and forget any earlier completion.
    pub fn request(&mut self, req: Request) {
        let (req_bit, done_bit) = req.bits();
        self.0 = (self.0 | req_bit) & !done_bit;
    }

    pub fn mark_done(&mut self, req: Request) {
        let (req_bit, done_bit) = req.bits();
        self.0 = (self.0 & !req_bit) | done_bit;
    }

    /// Requested and not yet completed.
    #[must_use]
    pub const fn is_pending(self, req: Request) -> bool {
        let (req_bit, done_bit) = req.bits();
        self.0 & req_bit != 0 && self.0 & done_bit == 0
    }
}

/// Follow-up private write issued once a device has its address.
pub type PostInitWrite = Vec<u8, 16>;

/// Bus-level record of an attached device.
#[derive(Clone, Debug)]
pub struct DeviceInfoShort {
    pub static_addr: u8,
    pub dynamic_addr: u8,
    pub pid: [u8; 6],
    pub bcr: u8,
    pub dcr: u8,
    pub attr: DeviceAttrib,
    /// Internal port hosting this device, if any.
    pub internal: Option<PortId>,
    pub post_init: Option<PostInitWrite>,
}

impl DeviceInfoShort {
    #[must_use]
    pub fn new(static_addr: u8, dynamic_addr: u8) -> Self {
        Self {
            static_addr,
            dynamic_addr,
            pid: [0; 6],
            bcr: 0,
            dcr: 0,
            attr: DeviceAttrib::default(),
            internal: None,
            post_init: None,
        }
    }

    #[must_use]
    pub fn has_dynamic_addr(&self) -> bool {
        self.dynamic_addr != DYNAMIC_ADDR_NONE
    }

    #[must_use]
    pub fn has_static_addr(&self) -> bool {
        self.static_addr != STATIC_ADDR_NONE
    }
}

/// Hardware capability of one controller port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capability {
    pub master: bool,
    pub slave: bool,
}

impl Capability {
    #[must_use]
    pub const fn supports(self, mode: DeviceMode) -> bool {
        match mode {
            DeviceMode::Disable => true,
            DeviceMode::CurrentMaster => self.master,
            DeviceMode::SlaveOnly => self.slave,
            DeviceMode::SecondaryMaster => self.master && self.slave,
        }
    }
}

/// Slave-side DMA buffer with a transfer cursor. `offset <= len` always holds.
#[derive(Clone, Debug, Default)]
pub struct SlaveBuffer<const N: usize> {
    data: Vec<u8, N>,
    offset: usize,
}

impl<const N: usize> SlaveBuffer<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            offset: 0,
        }
    }

    /// Replace the contents and rewind the cursor.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if `bytes` does not fit.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), crate::i3c::error::I3cError> {
        self.data.clear();
        self.offset = 0;
        self.data
            .extend_from_slice(bytes)
            .map_err(|()| crate::i3c::error::I3cError::OutOfMemory)
    }

    pub fn release(&mut self) {
        self.data.clear();
        self.offset = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset.min(self.data.len());
    }

    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        self.data.get(self.offset..).unwrap_or(&[])
    }

    /// Bytes already transferred.
    #[must_use]
    pub fn consumed(&self) -> &[u8] {
        self.data.get(..self.offset).unwrap_or(&[])
    }

    pub fn remaining_mut(&mut self) -> &mut [u8] {
        self.data.get_mut(self.offset..).unwrap_or(&mut [])
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// One internal controller port.
pub struct DeviceInfo {
    pub port: PortId,
    pub bus: Option<BusId>,
    pub mode: DeviceMode,
    pub capability: Capability,
    pub static_addr: u8,
    pub dynamic_addr: u8,
    pub vendor_id: u16,
    pub part_number: u32,
    pub pid: [u8; 6],
    pub bcr: u8,
    pub dcr: u8,
    pub sdr_rate: HertzU32,
    pub i2c_rate: HertzU32,
    pub run_i3c: bool,
    pub ack_ibi: bool,
    pub accept_hot_join: bool,
    pub accept_master_request: bool,
    pub enable_open_drain_high: bool,
    pub enable_sw_timeout: bool,
    pub stop_split_read: bool,
    pub tasks: Deque<TaskId, I3C_TASK_QUEUE_DEPTH>,
    /// Receives IBI payloads, master requests and rejected slave starts.
    pub callback: Option<TaskCallback>,
    pub tx: SlaveBuffer<I3C_PAYLOAD_SIZE_MAX>,
    pub rx: SlaveBuffer<I3C_PAYLOAD_SIZE_MAX>,
    pub ibi: SlaveBuffer<IBI_PAYLOAD_SIZE_MAX>,
    pub registers: RegisterTable,
    pub cmd_index: Option<usize>,
    pub mqueue: MessageQueue,
}

impl DeviceInfo {
    /// Power-on setting of a port: disabled, unaddressed, no tasks.
    #[must_use]
    pub fn new(port: PortId) -> Self {
        Self {
            port,
            bus: None,
            mode: DeviceMode::Disable,
            capability: Capability::default(),
            static_addr: STATIC_ADDR_NONE,
            dynamic_addr: DYNAMIC_ADDR_NONE,
            vendor_id: 0,
            part_number: 0,
            pid: [0; 6],
            bcr: 0,
            dcr: 0,
            sdr_rate: crate::i3c::common::speed::SDR_12P5MHZ,
            i2c_rate: crate::i3c::common::speed::I2C_400KHZ,
            run_i3c: false,
            ack_ibi: false,
            accept_hot_join: false,
            accept_master_request: false,
            enable_open_drain_high: false,
            enable_sw_timeout: false,
            stop_split_read: false,
            tasks: Deque::new(),
            callback: None,
            tx: SlaveBuffer::new(),
            rx: SlaveBuffer::new(),
            ibi: SlaveBuffer::new(),
            registers: RegisterTable::new(),
            cmd_index: None,
            mqueue: MessageQueue::new(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.mode != DeviceMode::Disable
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn head_task(&self) -> Option<TaskId> {
        self.tasks.front().copied()
    }
}
