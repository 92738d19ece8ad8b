//! Result codes carried through the module, requests and coordinator
//! messages.
//!
//! An [`HResult`] packs an error flag, the facility which produced the code
//! and a signed 16 bit code into one `u32`, which is the form the
//! coordinator expects on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

const ERROR_BIT: u32 = 1 << 31;
const FACILITY_SHIFT: u32 = 16;
const FACILITY_MASK: u32 = 0x7fff;

/// The subsystem that produced an [`HResult`] code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Facility {
    /// UDP socket errors, the code is the negated OS error when known.
    Socket = 1,
    /// Coordinator transport errors and HTTP status codes.
    Http = 2,
    /// Module and request status codes.
    Qos = 3,
}

impl Facility {
    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Facility::Socket),
            2 => Some(Facility::Http),
            3 => Some(Facility::Qos),
            _ => None,
        }
    }
}

/// A packed status or error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HResult(u32);

impl HResult {
    /// Packs a facility, a code and the error flag.
    pub fn new(facility: Facility, code: i16, failure: bool) -> Self {
        let mut raw = ((facility as u32) & FACILITY_MASK) << FACILITY_SHIFT;
        raw |= code as u16 as u32;
        if failure {
            raw |= ERROR_BIT;
        }

        HResult(raw)
    }

    /// Wraps a raw value received from the coordinator.
    pub fn from_raw(raw: u32) -> Self {
        HResult(raw)
    }

    /// The packed value.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// The same value with the error flag set.
    pub fn into_error(self) -> Self {
        HResult(self.0 | ERROR_BIT)
    }

    /// Returns true when the error flag is set.
    pub fn is_error(&self) -> bool {
        self.0 & ERROR_BIT != 0
    }

    /// The facility, if it is one this client knows about.
    pub fn facility(&self) -> Option<Facility> {
        Facility::from_raw(((self.0 >> FACILITY_SHIFT) & FACILITY_MASK) as u16)
    }

    /// The signed code in the low 16 bits.
    pub fn code(&self) -> i16 {
        self.0 as u16 as i16
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Codes recorded by module state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum ModuleStatus {
    Init = 2000,
    ProcessStarted,
    TestConfigReceived,
    RawResultsReady,
    ResultsReceived,
    ReportComplete,

    TestConfigUnusable = -2000,
    RpcDecode,
    RpcEncode,
    UnknownState,
    ConfigProducedNoRequests,
    FailedAllocRecvBuffer,
    RecvBufferNeededTooLarge,
    FailedAllocSendBuffer,
    FailedAllocSendBufferFatal,
    SendBufferNeededTooLarge,
    SerializedPacketUnexpectedSize,
    Timeout,
    UnrecoveredError,
}

impl ModuleStatus {
    /// The numeric code.
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Returns true for the negative, error codes.
    pub fn is_error(self) -> bool {
        self.code() < 0
    }
}

/// Codes recorded by request state transitions and probe validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum RequestStatus {
    Init = 1000,
    SocketLookupSuccess,
    InitSyncSuccess,
    SendNextProbe,
    SendLostProbes,
    SendSuccess,
    SendTryAgain,
    CompleteAcceptable,
    Complete,

    SocketLookupAlloc = -1000,
    SocketLookupUpdate,
    Timeout,
    SentMaxProbes,
    SiteInvalid,
    TestInvalid,
    ExternalAddressMismatch,
    ProbeVersion,
    ProbeUpTooSmall,
    ProbeDownTooSmall,
    ProbeUpTooLarge,
    ProbeDownTooLarge,
    ProbeMyAddress,
    ProbeServerTime,
    ProbeDownTooMany,
    ProbeUpTooMany,
    ProbeServiceRequestId,
    ProbeAlreadyComplete,
    ProbeAlreadyReceived,
    ProbeHmac,
    ProbeProtocol,
    TimeoutPartial,
}

impl RequestStatus {
    /// The numeric code.
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Returns true for the negative, error codes.
    pub fn is_error(self) -> bool {
        self.code() < 0
    }
}
