//! Engine error codes returned by bucket and vBucket operations.
//!
//! These map one-to-one onto the wire-level status codes the external framer
//! reports to clients, so they are a plain enum rather than an error chain.

use std::fmt;

/// Error returned synchronously by engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineError {
    /// The vBucket is not in a state that accepts this operation.
    NotMyVBucket,
    /// No bucket selected / bucket does not exist.
    NoBucket,
    /// Caller lacks access to the bucket.
    AccessDenied,
    /// The durability requirement can never be met with the current topology.
    DurabilityImpossible,
    /// The durability level is not supported by this bucket type.
    DurabilityInvalidLevel,
    /// Document or key exceeds the configured maximum size.
    TooBig,
    /// Malformed or inconsistent arguments.
    InvalidArguments,
    /// A SyncWrite for this key is in flight under another cookie.
    SyncWriteInProgress,
    /// A SyncWrite for this key is awaiting majority acknowledgement.
    SyncWritePending,
    /// A completed SyncWrite for this key is still being re-committed.
    SyncWriteReCommitInProgress,
    /// Transient resource shortage; retry later.
    TemporaryFailure,
    /// The operation parked a cookie and will complete asynchronously.
    WouldBlock,
    /// Key not found in the committed key space.
    KeyNotFound,
    /// Key already exists (add).
    KeyExists,
    /// Key is locked by another holder.
    Locked,
    /// CAS supplied does not match the stored document.
    CasMismatch,
    /// The mutation could not be stored.
    NotStored,
    /// Memory allocation failed or quota exceeded.
    NoMemory,
    /// Engine is busy; retry.
    Busy,
    /// Collection id is unknown in the current manifest.
    UnknownCollection,
    /// Scope id is unknown in the current manifest.
    UnknownScope,
    /// Extended-attribute payload failed validation.
    XattrInvalid,
    /// The requested combination of features is deliberately unsupported.
    NotSupported,
}

impl EngineError {
    /// True for errors raised while admitting a request, before any state
    /// change.
    #[inline]
    pub const fn is_admission(&self) -> bool {
        matches!(
            self,
            EngineError::NotMyVBucket
                | EngineError::NoBucket
                | EngineError::AccessDenied
                | EngineError::DurabilityImpossible
                | EngineError::DurabilityInvalidLevel
                | EngineError::TooBig
                | EngineError::InvalidArguments
        )
    }

    /// True for errors caused by concurrent activity on the same key or
    /// vBucket.
    #[inline]
    pub const fn is_concurrency(&self) -> bool {
        matches!(
            self,
            EngineError::SyncWriteInProgress
                | EngineError::SyncWritePending
                | EngineError::SyncWriteReCommitInProgress
                | EngineError::TemporaryFailure
                | EngineError::WouldBlock
        )
    }

    /// True for errors describing the current state of the key.
    #[inline]
    pub const fn is_key_state(&self) -> bool {
        matches!(
            self,
            EngineError::KeyNotFound
                | EngineError::KeyExists
                | EngineError::Locked
                | EngineError::CasMismatch
                | EngineError::NotStored
        )
    }

    /// True when the caller may retry the identical request later.
    #[inline]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TemporaryFailure | EngineError::Busy | EngineError::NoMemory
        )
    }

    /// Stable textual name of the code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EngineError::NotMyVBucket => "NotMyVBucket",
            EngineError::NoBucket => "NoBucket",
            EngineError::AccessDenied => "AccessDenied",
            EngineError::DurabilityImpossible => "DurabilityImpossible",
            EngineError::DurabilityInvalidLevel => "DurabilityInvalidLevel",
            EngineError::TooBig => "TooBig",
            EngineError::InvalidArguments => "InvalidArguments",
            EngineError::SyncWriteInProgress => "SyncWriteInProgress",
            EngineError::SyncWritePending => "SyncWritePending",
            EngineError::SyncWriteReCommitInProgress => "SyncWriteReCommitInProgress",
            EngineError::TemporaryFailure => "TemporaryFailure",
            EngineError::WouldBlock => "WouldBlock",
            EngineError::KeyNotFound => "KeyNotFound",
            EngineError::KeyExists => "KeyExists",
            EngineError::Locked => "Locked",
            EngineError::CasMismatch => "CasMismatch",
            EngineError::NotStored => "NotStored",
            EngineError::NoMemory => "NoMemory",
            EngineError::Busy => "Busy",
            EngineError::UnknownCollection => "UnknownCollection",
            EngineError::UnknownScope => "UnknownScope",
            EngineError::XattrInvalid => "XattrInvalid",
            EngineError::NotSupported => "NotSupported",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_predicates() {
        assert!(EngineError::NotMyVBucket.is_admission());
        assert!(EngineError::DurabilityImpossible.is_admission());
        assert!(!EngineError::KeyNotFound.is_admission());

        assert!(EngineError::SyncWriteInProgress.is_concurrency());
        assert!(EngineError::WouldBlock.is_concurrency());
        assert!(!EngineError::CasMismatch.is_concurrency());

        assert!(EngineError::KeyExists.is_key_state());
        assert!(EngineError::CasMismatch.is_key_state());
        assert!(!EngineError::Busy.is_key_state());

        assert!(EngineError::TemporaryFailure.is_retryable());
        assert!(EngineError::NoMemory.is_retryable());
        assert!(!EngineError::KeyNotFound.is_retryable());
    }

    #[test]
    fn test_display_matches_name() {
        assert_eq!(format!("{}", EngineError::WouldBlock), "WouldBlock");
        assert_eq!(
            format!("{}", EngineError::SyncWriteReCommitInProgress),
            "SyncWriteReCommitInProgress"
        );
        assert_eq!(EngineError::NotSupported.as_str(), "NotSupported");
    }
}
