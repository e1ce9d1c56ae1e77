//! Identifier aliases.
//!
//! All fleet entities are addressed by positive 64-bit integers. Device ids
//! in particular appear as a topic segment on the wire, where anything that
//! does not parse as a positive integer is rejected.

/// Device identifier.
pub type DeviceId = i64;

/// Command identifier.
pub type CommandId = i64;

/// OTA job identifier.
pub type OtaJobId = i64;

/// Firmware release identifier.
pub type ReleaseId = i64;
