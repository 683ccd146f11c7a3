//! Macros for creating and returning [`crate::error::SyncError`] values.

/// Creates a [`crate::error::SyncError`] from an error kind and description.
///
/// Accepts an optional dynamic detail (positional, formatted with `to_string`, or `detail =` to
/// move an owned value) and an optional `source:` error.
#[macro_export]
macro_rules! sync_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::SyncError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::SyncError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::SyncError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr, source: $source:expr) => {
        $crate::error::SyncError::from(($kind, $desc, $detail)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::SyncError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::SyncError::from(($kind, $desc, $detail.to_string())).with_source($source)
    };
}

/// Creates a [`crate::error::SyncError`] and returns it from the current function.
///
/// Supports the same arguments as [`sync_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc, source: $source))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc, detail = $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::sync_error!($kind, $desc, $detail))
    };
}
