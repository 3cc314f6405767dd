// Licensed under the Apache-2.0 license

//! I3C engine error taxonomy.
//!
//! Success is `Ok(..)` and "call again" is `nb::Error::WouldBlock`; everything
//! else is an [`I3cError`] whose discriminant matches the controller firmware's
//! numeric error code.

use core::fmt;
use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum I3cError {
    OutOfMemory = 2,
    ParameterInvalid = 4,
    TaskInvalid = 8,
    MemoryRanOut = 16,
    DataError = 32,
    SwTimeout = 64,
    HwNotSupport = 65,
    BusError = 66,
    /// Master error or warning reported by the controller.
    Merrwarn = 67,
    Nack = 68,
    Term = 69,
    /// Write aborted by the target.
    Wrabt = 70,
    /// Slave error or warning.
    Errwarn = 71,
    HwTimeout = 72,
    BusBusy = 73,
    SlvStart = 74,
    Ibi = 75,
    Mr = 76,
    Hj = 77,
    NackSlvStart = 78,
}

pub type I3cResult<T> = Result<T, I3cError>;

impl I3cError {
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            2 => Self::OutOfMemory,
            4 => Self::ParameterInvalid,
            8 => Self::TaskInvalid,
            16 => Self::MemoryRanOut,
            32 => Self::DataError,
            64 => Self::SwTimeout,
            65 => Self::HwNotSupport,
            66 => Self::BusError,
            67 => Self::Merrwarn,
            68 => Self::Nack,
            69 => Self::Term,
            70 => Self::Wrabt,
            71 => Self::Errwarn,
            72 => Self::HwTimeout,
            73 => Self::BusBusy,
            74 => Self::SlvStart,
            75 => Self::Ibi,
            76 => Self::Mr,
            77 => Self::Hj,
            78 => Self::NackSlvStart,
            _ => return None,
        })
    }

    /// Caller misuse, reported synchronously and never queued.
    #[must_use]
    pub const fn is_caller_error(self) -> bool {
        matches!(self, Self::ParameterInvalid | Self::TaskInvalid)
    }

    /// Faults raised by the bus or a target during a transfer.
    #[must_use]
    pub const fn is_bus_fault(self) -> bool {
        self.code() >= Self::SwTimeout.code()
    }
}

impl fmt::Display for I3cError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::OutOfMemory => "out of memory",
            Self::ParameterInvalid => "invalid parameter",
            Self::TaskInvalid => "invalid task",
            Self::MemoryRanOut => "buffer exhausted",
            Self::DataError => "data error",
            Self::SwTimeout => "software timeout",
            Self::HwNotSupport => "not supported by hardware",
            Self::BusError => "bus error",
            Self::Merrwarn => "master error",
            Self::Nack => "not acknowledged",
            Self::Term => "terminated",
            Self::Wrabt => "write aborted",
            Self::Errwarn => "slave error",
            Self::HwTimeout => "hardware timeout",
            Self::BusBusy => "bus busy",
            Self::SlvStart => "slave start request",
            Self::Ibi => "in-band interrupt",
            Self::Mr => "master request",
            Self::Hj => "hot-join",
            Self::NackSlvStart => "slave start not acknowledged",
        };
        write!(f, "{} ({})", text, self.code())
    }
}

impl embedded_hal::i2c::Error for I3cError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Nack | Self::NackSlvStart => {
                ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown)
            }
            Self::BusError | Self::BusBusy => ErrorKind::Bus,
            Self::Merrwarn => ErrorKind::ArbitrationLoss,
            Self::OutOfMemory | Self::MemoryRanOut => ErrorKind::Overrun,
            _ => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::Error;

    #[test]
    fn test_codes_match_firmware_values() {
        assert_eq!(I3cError::OutOfMemory.code(), 2);
        assert_eq!(I3cError::SwTimeout.code(), 64);
        assert_eq!(I3cError::Nack.code(), 68);
        assert_eq!(I3cError::NackSlvStart.code(), 78);
        for code in 0..100 {
            if let Some(err) = I3cError::from_code(code) {
                assert_eq!(err.code(), code);
            }
        }
        assert_eq!(I3cError::from_code(1), None);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            I3cError::Nack.kind(),
            ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown)
        );
        assert_eq!(I3cError::Merrwarn.kind(), ErrorKind::ArbitrationLoss);
        assert_eq!(I3cError::Term.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_classification() {
        assert!(I3cError::ParameterInvalid.is_caller_error());
        assert!(!I3cError::Nack.is_caller_error());
        assert!(I3cError::Nack.is_bus_fault());
        assert!(!I3cError::DataError.is_bus_fault());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", I3cError::Nack), "not acknowledged (68)");
    }
}
