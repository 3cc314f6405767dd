// Licensed under the Apache-2.0 license

//! Common types and constants for the NPCM4xx I3C engine.
//!
//! Protocol codes, transfer flags, Common Command Codes, bus/device states and
//! address rules shared by the registry, task model and engines.

use core::ops::{BitOr, BitOrAssign};
use fugit::{HertzU32, MillisDurationU32};

pub const I3C_PORT_MAX: usize = 6;
pub const I3C_BUS_COUNT_MAX: usize = 6;
/// Tasks a caller may have queued on one port.
pub const I3C_TASK_MAX: usize = 10;
/// Queue depth per port, leaving room for follow-up CCCs the engine inserts.
pub const I3C_TASK_QUEUE_DEPTH: usize = 16;
pub const I3C_TASK_POOL_SIZE: usize = 24;
pub const I3C_FRAME_MAX: usize = 64;
pub const I3C_PAYLOAD_SIZE_MAX: usize = 69;
pub const IBI_PAYLOAD_SIZE_MAX: usize = 8;
pub const MAX_READ_LEN: usize = I3C_PAYLOAD_SIZE_MAX;
pub const I3C_BUS_DEVICE_MAX: usize = 16;

/// PID[6] + BCR + DCR + assigned address.
pub const DAA_RECORD_LEN: usize = 9;
/// Seven DAA records per ENTDAA round.
pub const ENTDAA_BUFFER_LEN: usize = 63;

pub const I3C_BROADCAST_ADDR: u8 = 0x7E;
pub const I3C_HOT_JOIN_ADDR: u8 = 0x02;
pub const DYNAMIC_ADDR_NONE: u8 = 0x00;
pub const STATIC_ADDR_NONE: u8 = 0xFF;

pub const CMD_DEFAULT: u8 = 0xFD;
pub const CMD_INVALID: u8 = 0xFE;

pub const TIMEOUT_TYPICAL: MillisDurationU32 = MillisDurationU32::from_ticks(100);

pub mod speed {
    use fugit::HertzU32;

    pub const SDR_12P5MHZ: HertzU32 = HertzU32::from_raw(12_500_000);
    pub const SDR_8MHZ: HertzU32 = HertzU32::from_raw(8_000_000);
    pub const SDR_6MHZ: HertzU32 = HertzU32::from_raw(6_000_000);
    pub const SDR_4MHZ: HertzU32 = HertzU32::from_raw(4_000_000);
    pub const SDR_2MHZ: HertzU32 = HertzU32::from_raw(2_000_000);
    pub const SDR_1MHZ: HertzU32 = HertzU32::from_raw(1_000_000);
    pub const SDR_IBI: HertzU32 = HertzU32::from_raw(1_000_000);
    pub const I2C_1MHZ: HertzU32 = HertzU32::from_raw(1_000_000);
    pub const I2C_400KHZ: HertzU32 = HertzU32::from_raw(400_000);
    pub const I2C_100KHZ: HertzU32 = HertzU32::from_raw(100_000);

    pub const SDR_RATES: [HertzU32; 6] =
        [SDR_12P5MHZ, SDR_8MHZ, SDR_6MHZ, SDR_4MHZ, SDR_2MHZ, SDR_1MHZ];
    pub const I2C_RATES: [HertzU32; 3] = [I2C_1MHZ, I2C_400KHZ, I2C_100KHZ];
}

/// Common Command Codes.
pub mod ccc {
    pub const BROADCAST_ENEC: u8 = 0x00;
    pub const BROADCAST_DISEC: u8 = 0x01;
    pub const BROADCAST_ENTAS0: u8 = 0x02;
    pub const BROADCAST_ENTAS1: u8 = 0x03;
    pub const BROADCAST_ENTAS2: u8 = 0x04;
    pub const BROADCAST_ENTAS3: u8 = 0x05;
    pub const BROADCAST_RSTDAA: u8 = 0x06;
    pub const BROADCAST_ENTDAA: u8 = 0x07;
    pub const BROADCAST_DEFSLVS: u8 = 0x08;
    pub const BROADCAST_SETMWL: u8 = 0x09;
    pub const BROADCAST_SETMRL: u8 = 0x0A;
    pub const BROADCAST_ENTTM: u8 = 0x0B;
    pub const BROADCAST_SETBUSCON: u8 = 0x0C;
    pub const BROADCAST_ENDXFER: u8 = 0x12;
    pub const BROADCAST_ENTHDR0: u8 = 0x20;
    pub const BROADCAST_ENTHDR7: u8 = 0x27;
    pub const BROADCAST_SETXTIME: u8 = 0x28;
    pub const BROADCAST_SETAASA: u8 = 0x29;
    pub const BROADCAST_RSTACT: u8 = 0x2A;
    pub const BROADCAST_DEFGRPA: u8 = 0x2B;
    pub const BROADCAST_RSTGRPA: u8 = 0x2C;
    pub const BROADCAST_MLANE: u8 = 0x2D;
    pub const BROADCAST_SETHID: u8 = 0x61;
    pub const BROADCAST_DEVCTRL: u8 = 0x62;

    pub const DIRECT_ENEC: u8 = 0x80;
    pub const DIRECT_DISEC: u8 = 0x81;
    pub const DIRECT_ENTAS0: u8 = 0x82;
    pub const DIRECT_ENTAS1: u8 = 0x83;
    pub const DIRECT_ENTAS2: u8 = 0x84;
    pub const DIRECT_ENTAS3: u8 = 0x85;
    pub const DIRECT_RSTDAA: u8 = 0x86;
    pub const DIRECT_SETDASA: u8 = 0x87;
    pub const DIRECT_SETNEWDA: u8 = 0x88;
    pub const DIRECT_SETMWL: u8 = 0x89;
    pub const DIRECT_SETMRL: u8 = 0x8A;
    pub const DIRECT_GETMWL: u8 = 0x8B;
    pub const DIRECT_GETMRL: u8 = 0x8C;
    pub const DIRECT_GETPID: u8 = 0x8D;
    pub const DIRECT_GETBCR: u8 = 0x8E;
    pub const DIRECT_GETDCR: u8 = 0x8F;
    pub const DIRECT_GETSTATUS: u8 = 0x90;
    /// GETACCMST in I3C 1.0, GETACCCR in 1.1.
    pub const DIRECT_GETACCMST: u8 = 0x91;
    pub const DIRECT_ENDXFER: u8 = 0x92;
    pub const DIRECT_SETBRGTGT: u8 = 0x93;
    pub const DIRECT_GETMXDS: u8 = 0x94;
    pub const DIRECT_GETCAPS: u8 = 0x95;
    pub const DIRECT_SETROUTE: u8 = 0x96;
    pub const DIRECT_SETXTIME: u8 = 0x98;
    pub const DIRECT_GETXTIME: u8 = 0x99;
    pub const DIRECT_RSTACT: u8 = 0x9A;
    pub const DIRECT_SETGRPA: u8 = 0x9B;
    pub const DIRECT_RSTGRPA: u8 = 0x9C;
    pub const DIRECT_MLANE: u8 = 0x9D;

    #[must_use]
    pub const fn is_broadcast(code: u8) -> bool {
        code <= 0x7F
    }

    #[must_use]
    pub const fn is_direct(code: u8) -> bool {
        code >= 0x80 && code <= 0xFE
    }
}

/// ENEC/DISEC event bits.
pub mod event_mask {
    pub const ENINT: u8 = 0x01;
    pub const ENMR: u8 = 0x02;
    pub const ENHJ: u8 = 0x08;
}

/// Bus Characteristics Register fields.
pub mod bcr {
    pub const DEVICE_ROLE_MASK: u8 = 0xC0;
    pub const DEVICE_ROLE_MASTER: u8 = 0x40;
    pub const HDR_CAPABLE: u8 = 0x20;
    pub const BRIDGE: u8 = 0x10;
    pub const OFFLINE_CAPABLE: u8 = 0x08;
    pub const IBI_PAYLOAD: u8 = 0x04;
    pub const IBI_REQUEST_CAPABLE: u8 = 0x02;
    pub const MAX_DATA_SPEED_LIMIT: u8 = 0x01;

    const IBI_FIELD: u8 = IBI_PAYLOAD | IBI_REQUEST_CAPABLE;

    /// IBI with a mandatory data byte.
    #[must_use]
    pub const fn ibi_with_payload(bcr: u8) -> bool {
        bcr & IBI_FIELD == IBI_FIELD
    }

    /// IBI without a mandatory data byte.
    #[must_use]
    pub const fn ibi_without_payload(bcr: u8) -> bool {
        bcr & IBI_FIELD == IBI_REQUEST_CAPABLE
    }

    #[must_use]
    pub const fn ibi_capable(bcr: u8) -> bool {
        bcr & IBI_REQUEST_CAPABLE != 0
    }
}

/// Physical I3C port (controller instance), 0-based.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(u8);

impl PortId {
    pub const FIRST: Self = Self(0);

    #[must_use]
    pub const fn new(port: u8) -> Option<Self> {
        if (port as usize) < I3C_PORT_MAX {
            Some(Self(port))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = PortId> {
        (0..I3C_PORT_MAX as u8).map(PortId)
    }
}

/// Logical bus number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusId(u8);

impl BusId {
    pub const FIRST: Self = Self(0);

    #[must_use]
    pub const fn new(bus: u8) -> Option<Self> {
        if (bus as usize) < I3C_BUS_COUNT_MAX {
            Some(Self(bus))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn number(self) -> u8 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    Disable,
    CurrentMaster,
    SlaveOnly,
    SecondaryMaster,
}

impl DeviceMode {
    #[must_use]
    pub const fn is_slave_role(self) -> bool {
        matches!(self, Self::SlaveOnly | Self::SecondaryMaster)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusState {
    Default,
    WaitResetDone,
    WaitClearDone,
    Init,
    Idle,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusType {
    PureI3c,
    PureI2c,
    Mixed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusVersion {
    V1_0,
    V1_1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferDir {
    Write,
    Read,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferType {
    Sdr,
    I2c,
    Ddr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskPolicy {
    InsertFirst,
    AppendLast,
}

/// Width of the register index a master sends ahead of slave register data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmdWidth {
    One,
    Two,
}

impl CmdWidth {
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    I2cWrite = 0x00,
    I2cRead = 0x01,
    I2cWriteRead = 0x02,

    I3cWrite = 0x10,
    I3cRead = 0x11,
    I3cWriteRead = 0x12,
    I3cW7e = 0x13,
    I3cR7e = 0x14,
    I3cW7eRead = 0x15,

    DdrWrite = 0x20,
    DdrRead = 0x21,

    /// Broadcast CCC.
    CccBroadcast = 0x40,
    /// Direct CCC write.
    CccWrite = 0x41,
    /// Direct CCC read.
    CccRead = 0x42,
    Entdaa = 0x43,

    /// Master side of an IBI, hot-join or master request.
    Event = 0x80,
    Ibi = 0x81,
    MasterRequest = 0x82,
    HotJoin = 0x84,
}

impl Protocol {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn is_i2c(self) -> bool {
        self.code() & 0xF0 == 0x00
    }

    #[must_use]
    pub const fn is_i3c(self) -> bool {
        self.code() & 0xF0 == 0x10
    }

    #[must_use]
    pub const fn is_ddr(self) -> bool {
        self.code() & 0xF0 == 0x20
    }

    #[must_use]
    pub const fn is_ccc(self) -> bool {
        self.code() & 0xF0 == 0x40
    }

    #[must_use]
    pub const fn is_event(self) -> bool {
        self.code() & 0xF0 == 0x80
    }

    /// Tasks a slave-role port sends toward the current master.
    #[must_use]
    pub const fn is_slave_task(self) -> bool {
        matches!(self, Self::Ibi | Self::MasterRequest | Self::HotJoin)
    }

    #[must_use]
    pub const fn is_write(self) -> bool {
        self.code() & 0xCF == 0x00
    }

    #[must_use]
    pub const fn is_read(self) -> bool {
        self.code() & 0xCF == 0x01
    }

    #[must_use]
    pub const fn is_write_read(self) -> bool {
        self.code() & 0xCF == 0x02
    }

    #[must_use]
    pub const fn is_w7e(self) -> bool {
        self.code() & 0xCF == 0x03
    }

    #[must_use]
    pub const fn is_r7e(self) -> bool {
        self.code() & 0xCF == 0x04
    }

    #[must_use]
    pub const fn is_w7e_read(self) -> bool {
        self.code() & 0xCF == 0x05
    }
}

/// Per-frame transfer control bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferFlags(u16);

impl TransferFlags {
    pub const NORMAL: Self = Self(0x0000);
    pub const NO_STOP: Self = Self(0x0001);
    pub const REPEAT_START: Self = Self(0x0002);
    pub const NO_START: Self = Self(0x0004);
    pub const RETRY_ENABLE: Self = Self(0x0008);
    pub const RETRY_WITHOUT_STOP: Self = Self(0x0010);
    pub const WORD_WIDTH: Self = Self(0x0020);
    pub const MESSAGE_MODE: Self = Self(0x0040);
    pub const NAK: Self = Self(0x0100);

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for TransferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TransferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// How an externally attached device is brought up on its bus.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InitMode(u16);

impl InitMode {
    pub const I2C: Self = Self(0x0000);
    pub const I3C: Self = Self(0x0001);
    pub const BUSRESET: Self = Self(0x0002);
    pub const DEVCTRL: Self = Self(0x0004);
    pub const SETHID: Self = Self(0x0008);
    pub const SETAASA: Self = Self(0x0010);
    pub const SETDASA: Self = Self(0x0020);
    pub const ENTDAA: Self = Self(0x0040);
    pub const POWERON: Self = Self(0x0080);
    pub const POST_INIT: Self = Self(0x0100);
    pub const RSTDAA: Self = Self(0x0200);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for InitMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Dynamic addresses a master may hand out: 0x08..=0x77 minus the broadcast
/// address and its single-bit-error neighbours.
#[must_use]
pub const fn is_valid_dynamic_address(addr: u8) -> bool {
    matches!(addr, 0x08..=0x3D | 0x3F..=0x5D | 0x5F..=0x6D | 0x6F..=0x75 | 0x77)
}

#[must_use]
pub const fn is_valid_static_address(addr: u8) -> bool {
    addr != I3C_BROADCAST_ADDR
}

/// Static addresses a SETAASA broadcast adopts as dynamic addresses.
#[must_use]
pub const fn is_setaasa_address(addr: u8) -> bool {
    matches!(addr, 0x50..=0x57)
}

/// Odd parity bit over the low seven bits, as carried in the DAA address byte.
#[must_use]
pub const fn odd_parity(addr: u8) -> u8 {
    if (addr & 0x7F).count_ones() % 2 == 0 {
        1
    } else {
        0
    }
}

/// Rates accepted for an I2C transfer.
#[must_use]
pub fn is_i2c_rate(rate: HertzU32) -> bool {
    speed::I2C_RATES.contains(&rate)
}

/// Rates accepted for an SDR transfer.
#[must_use]
pub fn is_sdr_rate(rate: HertzU32) -> bool {
    speed::SDR_RATES.contains(&rate)
}
