// Licensed under the Apache-2.0 license

//! NPCM4xx I3C bus-transaction engine.
//!
//! This module hosts the master/slave transaction engine for the NPCM4xx I3C
//! controllers. The engine owns a registry of internal ports and logical buses,
//! queues transfer tasks per port, enumerates each bus with the CCC sequence
//! (RSTDAA, SETHID, SETDASA, SETAASA, ENTDAA) and services in-band interrupts,
//! hot-join and master handoff.
//!
//! All register access goes through the [`hal`] traits; interrupt handlers feed
//! [`engine::I3cEvent`]s through a single-producer/single-consumer queue that the
//! scheduler drains with [`I3cContext::process_events`].

pub mod api;
pub mod bus;
pub mod ccc;
pub mod common;
pub mod config;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod hal;
pub mod master;
pub mod slave;
pub mod task;

pub use common::*;
pub use config::{PortConfig, PortConfigBuilder, SystemConfig};
pub use context::I3cContext;
pub use device::{DeviceAttrib, DeviceInfo, DeviceInfoShort};
pub use engine::{I3cEvent, IbiKind};
pub use error::{I3cError, I3cResult};
pub use hal::{I3cHal, I3cHardwareCore, I3cMasterHal, I3cSlaveHal};
pub use task::{TaskCallback, TaskId, TaskOutcome};
