//! Common types and error definitions for pack
//!
//! This module contains the core address/position aliases and the error
//! hierarchy used throughout the engine.

use thiserror::Error;

/// A stable 64-bit identifier for a block. Equal to the file offset of its
/// indirection slot inside an address page.
pub type Address = u64;

/// A page-aligned byte offset into the backing file.
pub type Position = u64;

/// Sentinel meaning "address slot is free".
pub const FREE_SLOT: u64 = 0;

/// Sentinel meaning "address slot is reserved but not yet committed".
pub const RESERVED_SLOT: u64 = u64::MAX;

/// Errors raised by the pack engine.
#[derive(Error, Debug)]
pub enum PackError {
    #[error("failed to read position {position}: {source}")]
    IoRead {
        position: Position,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write position {position}: {source}")]
    IoWrite {
        position: Position,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to truncate file to {size} bytes: {source}")]
    IoTruncate {
        size: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to force durability: {source}")]
    IoForce {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to close file: {source}")]
    IoClose {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to determine file size: {source}")]
    IoSize {
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("bad signature: expected {expected:#x}, found {found:#x}")]
    Signature { expected: u64, found: u64 },

    #[error("file was not cleanly shut down; run recovery before opening normally")]
    Shutdown,

    #[error("file size {actual} is smaller than the minimum header size {minimum}")]
    FileSize { actual: u64, minimum: u64 },

    #[error("header corrupt: {message}")]
    HeaderCorrupt { message: String },

    #[error("block page at {position} is corrupt: {message}")]
    BlockPageCorrupt { position: Position, message: String },

    #[error("journal page at {position} failed its checksum")]
    JournalChecksum { position: Position },

    #[error("data corruption detected: {message}")]
    Corrupt { message: String },

    #[error("address {address} has been freed")]
    FreedAddress { address: Address },

    #[error("address {address} is a static address and cannot be freed")]
    FreedStaticAddress { address: Address },

    #[error("no address pages available to satisfy reserve()")]
    AddressPoolExhausted,

    #[error("allocation failed for size {size}")]
    AllocationFailed { size: u32 },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("unknown static block uri: {uri}")]
    UnknownStaticBlock { uri: String },

    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

impl PackError {
    /// Whether retrying the operation (in a fresh mutator) might succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PackError::IoRead { .. }
                | PackError::IoWrite { .. }
                | PackError::AddressPoolExhausted
                | PackError::AllocationFailed { .. }
        )
    }

    /// Whether this error indicates on-disk corruption (engine should refuse
    /// to continue operating on this file).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            PackError::Signature { .. }
                | PackError::FileSize { .. }
                | PackError::HeaderCorrupt { .. }
                | PackError::BlockPageCorrupt { .. }
                | PackError::JournalChecksum { .. }
                | PackError::Corrupt { .. }
        )
    }

    /// Whether this error is a caller mistake rather than an engine fault.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PackError::FreedAddress { .. }
                | PackError::FreedStaticAddress { .. }
                | PackError::UnknownStaticBlock { .. }
                | PackError::InvalidConfig { .. }
        )
    }

    /// Category label, stable across variants, suitable for metrics tags.
    pub fn category(&self) -> &'static str {
        match self {
            PackError::IoRead { .. }
            | PackError::IoWrite { .. }
            | PackError::IoTruncate { .. }
            | PackError::IoForce { .. }
            | PackError::IoClose { .. }
            | PackError::IoSize { .. }
            | PackError::Io(_) => "io",
            PackError::FileNotFound { .. } => "not_found",
            PackError::Signature { .. }
            | PackError::FileSize { .. }
            | PackError::HeaderCorrupt { .. }
            | PackError::BlockPageCorrupt { .. }
            | PackError::JournalChecksum { .. }
            | PackError::Corrupt { .. } => "corruption",
            PackError::Shutdown => "shutdown",
            PackError::FreedAddress { .. } | PackError::FreedStaticAddress { .. } => "addressing",
            PackError::AddressPoolExhausted => "resource_exhausted",
            PackError::AllocationFailed { .. } => "allocation",
            PackError::InvalidConfig { .. } => "configuration",
            PackError::UnknownStaticBlock { .. } => "not_found",
            PackError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, PackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_is_stable_for_io_variants() {
        let err = PackError::IoRead {
            position: 4096,
            source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        };
        assert_eq!(err.category(), "io");
        assert!(err.is_recoverable());
        assert!(!err.is_corruption());
    }

    #[test]
    fn corruption_variants_are_not_recoverable() {
        let err = PackError::Signature {
            expected: 1,
            found: 2,
        };
        assert!(err.is_corruption());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn user_errors_are_flagged() {
        let err = PackError::FreedAddress { address: 8192 };
        assert!(err.is_user_error());
        assert_eq!(err.category(), "addressing");
    }

    #[test]
    fn display_messages_name_the_offending_value() {
        let err = PackError::FreedStaticAddress { address: 64 };
        assert!(err.to_string().contains("64"));
        let err = PackError::BlockPageCorrupt {
            position: 1024,
            message: "bad checksum".to_string(),
        };
        assert!(err.to_string().contains("1024"));
        assert!(err.to_string().contains("bad checksum"));
    }
}
