//! Error types for the signalling engine

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, TelsigError>;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum TelsigError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("MTP3 error: {0}")]
    Mtp3(#[from] Mtp3Error),

    #[error("ISUP error: {0}")]
    Isup(#[from] IsupError),

    #[error("SCCP error: {0}")]
    Sccp(#[from] SccpError),

    #[error("TCAP error: {0}")]
    Tcap(#[from] TcapError),

    #[error("ISDN error: {0}")]
    Isdn(#[from] IsdnError),

    #[error("SIGTRAN error: {0}")]
    Sigtran(#[from] SigtranError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine stopped")]
    EngineStopped,
}

/// Layer 1 / layer 2 link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link down")]
    LinkDown,

    #[error("link not aligned")]
    NotAligned,

    #[error("remote processor outage")]
    ProcessorOutage,

    #[error("remote busy")]
    RemoteBusy,

    #[error("congestion level {0}")]
    Congestion(u8),

    #[error("oversized packet: {0} octets")]
    Oversize(usize),

    #[error("malformed frame: {0}")]
    BadFrame(String),

    #[error("transmit failed: {0}")]
    TransmitFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MTP3 network layer errors
#[derive(Debug, Error)]
pub enum Mtp3Error {
    #[error("no route to destination {0}")]
    NoRoute(u32),

    #[error("route prohibited to {0}")]
    RouteProhibited(u32),

    #[error("no selectable link in linkset")]
    NoLink,

    #[error("user part unavailable: SI {0}")]
    UserPartUnavailable(u8),

    #[error("bad routing label: {0}")]
    BadLabel(String),

    #[error("payload exceeds route maximum ({0} octets)")]
    Oversize(usize),

    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

/// ISUP errors, cause values per Q.850 where applicable
#[derive(Debug, Error)]
pub enum IsupError {
    #[error("bad configuration: {0}")]
    Config(String),

    #[error("missing mandatory parameter {0:#04x}")]
    MissingMandatory(u8),

    #[error("unknown mandatory parameter {0:#04x}")]
    UnknownMandatory(u8),

    #[error("bad parameter length for {0:#04x}")]
    BadParameterLength(u8),

    #[error("message too short")]
    Underflow,

    #[error("unknown message type {0:#04x}")]
    UnknownMessage(u8),

    #[error("unknown circuit {0}")]
    UnknownCircuit(u32),

    #[error("no circuit available")]
    NoCircuit,

    #[error("circuit {0} not in required state")]
    CircuitState(u32),

    #[error("unexpected message {0:#04x} in state {1}")]
    UnexpectedMessage(u8, &'static str),

    #[error("MTP3 error: {0}")]
    Mtp3(#[from] Mtp3Error),
}

/// SCCP errors carrying the return cause where one applies
#[derive(Debug, Error)]
pub enum SccpError {
    #[error("no translation for this address")]
    NoTranslation,

    #[error("no translation for address of this nature")]
    NoTranslationForNature,

    #[error("subsystem failure: SSN {0}")]
    SubsystemFailure(u8),

    #[error("subsystem congestion: SSN {0}")]
    SubsystemCongestion(u8),

    #[error("MTP failure")]
    MtpFailure,

    #[error("network congestion")]
    NetworkCongestion,

    #[error("hop counter violation")]
    HopCounterViolation,

    #[error("segmentation failed")]
    SegmentationFailed,

    #[error("reassembly failed")]
    ReassemblyFailed,

    #[error("message too large for any transport: {0} octets")]
    Oversize(usize),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("MTP3 error: {0}")]
    Mtp3(#[from] Mtp3Error),
}

/// TCAP errors mapping onto the Q.773 problem taxonomy
#[derive(Debug, Error)]
pub enum TcapError {
    #[error("transaction not found: {0}")]
    TransactionNotFound(u32),

    #[error("transaction pool exhausted")]
    NoTransactionId,

    #[error("invalid transaction state: {0}")]
    InvalidState(&'static str),

    #[error("BER encoding error: {0}")]
    Ber(String),

    #[error("dialogue error: {0}")]
    Dialogue(String),

    #[error("duplicate invoke ID {0}")]
    DuplicateInvokeId(i32),

    #[error("unrecognized operation")]
    UnrecognizedOperation,

    #[error("abort received")]
    Abort,

    #[error("SCCP error: {0}")]
    Sccp(#[from] SccpError),
}

/// ISDN Q.921/Q.931 errors
#[derive(Debug, Error)]
pub enum IsdnError {
    #[error("data link not established")]
    NotEstablished,

    #[error("no TEI assigned")]
    NoTei,

    #[error("TEI pool exhausted")]
    NoTeiAvailable,

    #[error("malformed frame: {0}")]
    BadFrame(String),

    #[error("frame rejected (FRMR)")]
    FrameReject,

    #[error("mandatory IE missing: {0:#04x}")]
    MissingIe(u8),

    #[error("bad information element {0:#04x}")]
    BadIe(u8),

    #[error("unknown message type {0:#04x}")]
    UnknownMessage(u8),

    #[error("unknown call reference {0}")]
    UnknownCallRef(u16),

    #[error("unexpected message {0:#04x} in state {1}")]
    UnexpectedMessage(u8, &'static str),
}

/// SIGTRAN adaptation layer errors
#[derive(Debug, Error)]
pub enum SigtranError {
    #[error("association failed: {0}")]
    AssociationFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("ASP state error: {0}")]
    AspState(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("protocol error code {0}")]
    ProtocolError(u32),

    #[error("unsupported version {0}")]
    BadVersion(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
