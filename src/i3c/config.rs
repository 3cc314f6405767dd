// Licensed under the Apache-2.0 license

//! Port and board configuration.

use crate::i3c::common::{
    speed, DeviceMode, InitMode, DYNAMIC_ADDR_NONE, I3C_BUS_DEVICE_MAX, I3C_PORT_MAX,
    STATIC_ADDR_NONE,
};
use crate::i3c::device::PostInitWrite;
use crate::i3c::task::TaskCallback;
use fugit::HertzU32;
use heapless::Vec;

/// Configuration of one internal controller port.
#[derive(Clone, Debug)]
pub struct PortConfig {
    pub mode: DeviceMode,
    pub bus: u8,
    pub static_addr: u8,
    /// Own address when running as current master; slaves get theirs from the bus.
    pub dynamic_addr: u8,
    pub vendor_id: u16,
    pub part_number: u32,
    pub bcr: u8,
    pub dcr: u8,
    pub sdr_rate: HertzU32,
    pub i2c_rate: HertzU32,
    pub accept_hot_join: bool,
    pub accept_master_request: bool,
    pub stop_split_read: bool,
    /// Receives IBI payloads and other unsolicited events for this port.
    pub callback: Option<TaskCallback>,
}

impl PortConfig {
    /// Provisional ID: vendor in the top 15 bits, then the part number.
    #[must_use]
    pub fn pid(&self) -> [u8; 6] {
        let vendor = self.vendor_id.to_be_bytes();
        let part = self.part_number.to_be_bytes();
        [
            (vendor[0] << 1) | (vendor[1] >> 7),
            vendor[1] << 1,
            part[0],
            part[1],
            part[2],
            part[3],
        ]
    }
}

pub struct PortConfigBuilder {
    config: PortConfig,
}

impl Default for PortConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PortConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PortConfig {
                mode: DeviceMode::Disable,
                bus: 0,
                static_addr: STATIC_ADDR_NONE,
                dynamic_addr: DYNAMIC_ADDR_NONE,
                vendor_id: 0,
                part_number: 0,
                bcr: 0,
                dcr: 0,
                sdr_rate: speed::SDR_12P5MHZ,
                i2c_rate: speed::I2C_400KHZ,
                accept_hot_join: false,
                accept_master_request: false,
                stop_split_read: false,
                callback: None,
            },
        }
    }
    #[must_use]
    pub fn mode(mut self, mode: DeviceMode) -> Self {
        self.config.mode = mode;
        self
    }
    #[must_use]
    pub fn bus(mut self, bus: u8) -> Self {
        self.config.bus = bus;
        self
    }
    #[must_use]
    pub fn static_addr(mut self, addr: u8) -> Self {
        self.config.static_addr = addr;
        self
    }
    #[must_use]
    pub fn dynamic_addr(mut self, addr: u8) -> Self {
        self.config.dynamic_addr = addr;
        self
    }
    #[must_use]
    pub fn vendor_id(mut self, id: u16) -> Self {
        self.config.vendor_id = id;
        self
    }
    #[must_use]
    pub fn part_number(mut self, part: u32) -> Self {
        self.config.part_number = part;
        self
    }
    #[must_use]
    pub fn bcr(mut self, bcr: u8) -> Self {
        self.config.bcr = bcr;
        self
    }
    #[must_use]
    pub fn dcr(mut self, dcr: u8) -> Self {
        self.config.dcr = dcr;
        self
    }
    #[must_use]
    pub fn sdr_rate(mut self, rate: HertzU32) -> Self {
        self.config.sdr_rate = rate;
        self
    }
    #[must_use]
    pub fn i2c_rate(mut self, rate: HertzU32) -> Self {
        self.config.i2c_rate = rate;
        self
    }
    #[must_use]
    pub fn accept_hot_join(mut self, enabled: bool) -> Self {
        self.config.accept_hot_join = enabled;
        self
    }
    #[must_use]
    pub fn accept_master_request(mut self, enabled: bool) -> Self {
        self.config.accept_master_request = enabled;
        self
    }
    #[must_use]
    pub fn stop_split_read(mut self, enabled: bool) -> Self {
        self.config.stop_split_read = enabled;
        self
    }
    #[must_use]
    pub fn callback(mut self, callback: TaskCallback) -> Self {
        self.config.callback = Some(callback);
        self
    }
    #[must_use]
    pub fn build(self) -> PortConfig {
        self.config
    }
}

/// A device on a bus that no local port hosts.
#[derive(Clone, Debug)]
pub struct ExternalDevice {
    pub static_addr: u8,
    /// Preferred dynamic address, `0x00` for none.
    pub dynamic_addr: u8,
    pub pid: [u8; 6],
    pub bcr: u8,
    pub dcr: u8,
    pub init_mode: InitMode,
    /// Private write sent once the device has its address.
    pub post_init: Option<PostInitWrite>,
}

impl ExternalDevice {
    #[must_use]
    pub fn new(static_addr: u8, init_mode: InitMode) -> Self {
        Self {
            static_addr,
            dynamic_addr: DYNAMIC_ADDR_NONE,
            pid: [0; 6],
            bcr: 0,
            dcr: 0,
            init_mode,
            post_init: None,
        }
    }

    #[must_use]
    pub fn identity(mut self, pid: [u8; 6], bcr: u8, dcr: u8) -> Self {
        self.pid = pid;
        self.bcr = bcr;
        self.dcr = dcr;
        self
    }

    #[must_use]
    pub fn dynamic_addr(mut self, addr: u8) -> Self {
        self.dynamic_addr = addr;
        self
    }

    #[must_use]
    pub fn post_init(mut self, write: PostInitWrite) -> Self {
        self.post_init = Some(write);
        self
    }
}

/// Everything brought up by `start`.
#[derive(Clone, Debug, Default)]
pub struct SystemConfig {
    pub ports: [Option<PortConfig>; I3C_PORT_MAX],
    /// External devices and the bus number each sits on.
    pub devices: Vec<(u8, ExternalDevice), I3C_BUS_DEVICE_MAX>,
}

impl SystemConfig {
    /// Evaluation board layout: the first port of each pair is the current
    /// master, the second a slave on the same bus.
    #[must_use]
    pub fn npcm400f_evb() -> Self {
        let mut config = Self::default();
        for (index, slot) in config.ports.iter_mut().enumerate() {
            let Ok(number) = u8::try_from(index) else {
                continue;
            };
            let mode = if index % 2 == 0 {
                DeviceMode::CurrentMaster
            } else {
                DeviceMode::SlaveOnly
            };
            *slot = Some(
                PortConfigBuilder::new()
                    .mode(mode)
                    .bus(number / 2)
                    .static_addr(0x20 + number)
                    .dynamic_addr(0x20 + number)
                    .vendor_id(0x0000)
                    .part_number(0x1234_5678)
                    .bcr(0x66)
                    .dcr(0xCC)
                    .sdr_rate(speed::SDR_12P5MHZ)
                    .i2c_rate(speed::I2C_400KHZ)
                    .build(),
            );
        }
        config
    }

    #[must_use]
    pub fn port(mut self, index: usize, config: PortConfig) -> Self {
        if let Some(slot) = self.ports.get_mut(index) {
            *slot = Some(config);
        }
        self
    }

    /// # Errors
    ///
    /// Returns the device back if the list is full.
    pub fn add_device(&mut self, bus: u8, dev: ExternalDevice) -> Result<(), ExternalDevice> {
        self.devices.push((bus, dev)).map_err(|(_, dev)| dev)
    }
}
