// Licensed under the Apache-2.0 license

//! # I3C Hardware Abstraction Traits
//!
//! The engine never touches registers. Everything it needs from a controller
//! port is expressed by the composable traits below, split by role:
//!
//! ```text
//! I3cHardwareCore (port bring-up, capability, address readback, bus recovery)
//!     ├── I3cMasterHal (frame transfers, IBI ack/nack, DAA address, role switch)
//!     └── I3cSlaveHal  (response/receive DMA, IBI/MR/HJ requests, pending status)
//!
//! I3cHal = I3cMasterHal + I3cSlaveHal
//! ```
//!
//! Completion is never reported through these calls. The interrupt side of a
//! HAL pushes [`I3cEvent`](crate::i3c::engine::I3cEvent)s into the engine's
//! event queue instead.

use crate::i3c::common::PortId;
use crate::i3c::device::{Capability, DeviceInfo};
use crate::i3c::error::I3cResult;
use crate::i3c::task::TransferFrame;

/// Foundation trait every I3C controller implementation provides.
pub trait I3cHardwareCore {
    /// Report what the port's silicon supports.
    fn capability(&self, port: PortId) -> Capability;

    /// Program a port from its device record: role, addresses, PID, BCR, DCR
    /// and rates.
    ///
    /// # Errors
    ///
    /// Returns `HwNotSupport` if the hardware cannot run the requested role.
    fn init_port(&mut self, port: PortId, device: &DeviceInfo) -> I3cResult<()>;

    /// Enable the interface and its interrupts.
    fn enable(&mut self, port: PortId);

    /// Disable the interface and mask its interrupts.
    fn disable(&mut self, port: PortId);

    /// Dynamic address the port was given by the current master, or `0x00`.
    fn dynamic_address(&self, port: PortId) -> u8;

    /// Begin a bus reset. Completion is reported with `BusResetDone`.
    ///
    /// # Errors
    ///
    /// Returns `BusBusy` if the bus cannot be reset now.
    fn start_bus_reset(&mut self, port: PortId) -> I3cResult<()>;

    /// Begin a bus clear. Completion is reported with `BusClearDone`.
    ///
    /// # Errors
    ///
    /// Returns `BusBusy` if the bus cannot be cleared now.
    fn start_bus_clear(&mut self, port: PortId) -> I3cResult<()>;
}

/// Master-role operations.
pub trait I3cMasterHal: I3cHardwareCore {
    /// Issue one frame: START or repeated START, address and direction,
    /// then the write payload or an armed read of `frame.access_len` bytes.
    ///
    /// # Arguments
    ///
    /// * `port` - Controller port running the frame
    /// * `frame` - Address, direction, type, flags and rate of the frame
    /// * `tx` - Bytes to send for a write frame; empty for reads
    ///
    /// # Errors
    ///
    /// Returns `BusBusy` if the controller is not idle, or `HwNotSupport` for a
    /// transfer type the port cannot generate.
    fn start_frame(&mut self, port: PortId, frame: &TransferFrame, tx: &[u8]) -> I3cResult<()>;

    /// Copy out the bytes received by the last read frame.
    ///
    /// # Returns
    ///
    /// The number of bytes written to `buf`.
    fn fetch_read(&mut self, port: PortId, buf: &mut [u8]) -> usize;

    /// Emit STOP and return the controller to idle.
    fn stop(&mut self, port: PortId);

    /// Acknowledge the IBI that won arbitration.
    ///
    /// # Arguments
    ///
    /// * `with_mdb` - Read the mandatory data byte and payload after the ACK
    fn ibi_ack(&mut self, port: PortId, with_mdb: bool);

    /// Reject the IBI that won arbitration.
    fn ibi_nack(&mut self, port: PortId);

    /// Send the address byte of an ENTDAA round.
    ///
    /// # Errors
    ///
    /// Returns `Nack` if the responder did not accept the address.
    fn assign_dynamic_address(&mut self, port: PortId, addr: u8) -> I3cResult<()>;

    /// Switch the controller between master and slave role after a handoff.
    fn set_master_role(&mut self, port: PortId, master: bool);
}

/// Slave-role operations.
pub trait I3cSlaveHal: I3cHardwareCore {
    /// True when no response bytes are left in the TX path.
    fn slave_tx_free(&self, port: PortId) -> bool;

    /// Abort an outstanding response and flush the TX FIFO.
    fn stop_slave_tx(&mut self, port: PortId);

    /// Arm the response a master will read.
    ///
    /// # Errors
    ///
    /// Returns `BusBusy` if the TX path is still in use.
    fn start_slave_write(&mut self, port: PortId, data: &[u8]) -> I3cResult<()>;

    /// Arm reception of up to `len` bytes written by the master.
    ///
    /// # Errors
    ///
    /// Returns `BusBusy` if reception is already armed.
    fn start_slave_read(&mut self, port: PortId, len: usize) -> I3cResult<()>;

    /// Copy out bytes written by the master since the last arm.
    ///
    /// # Returns
    ///
    /// The number of bytes written to `buf`.
    fn fetch_slave_read(&mut self, port: PortId, buf: &mut [u8]) -> usize;

    /// Response bytes the master has not read yet.
    fn slave_tx_remaining(&self, port: PortId) -> usize;

    /// Update the pending-interrupt status returned by GETSTATUS.
    fn set_pending(&mut self, port: PortId, mask: u8);

    /// Load the mandatory data byte and payload sent after an accepted IBI.
    ///
    /// # Errors
    ///
    /// Returns `MemoryRanOut` if the payload exceeds the IBI FIFO.
    fn load_ibi_payload(&mut self, port: PortId, payload: &[u8]) -> I3cResult<()>;

    /// Request an IBI.
    ///
    /// # Errors
    ///
    /// Returns `HwNotSupport` if IBI is disabled by the current master.
    fn start_ibi(&mut self, port: PortId) -> I3cResult<()>;

    /// Request the master role.
    ///
    /// # Errors
    ///
    /// Returns `HwNotSupport` if master requests are disabled.
    fn start_master_request(&mut self, port: PortId) -> I3cResult<()>;

    /// Request a hot-join.
    ///
    /// # Errors
    ///
    /// Returns `HwNotSupport` if hot-join is disabled.
    fn start_hot_join(&mut self, port: PortId) -> I3cResult<()>;

    /// ENEC/DISEC event mask currently enabled for the port.
    fn event_support(&self, port: PortId) -> u8;
}

/// Complete controller: every port may run as master or slave.
pub trait I3cHal: I3cMasterHal + I3cSlaveHal {}

impl<T: I3cMasterHal + I3cSlaveHal> I3cHal for T {}
