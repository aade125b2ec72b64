//! Error construction macros.

/// Creates a [`crate::error::MoltError`] from an error kind and description,
/// optionally with a dynamic detail string.
#[macro_export]
macro_rules! molt_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::MoltError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::MoltError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns a [`crate::error::MoltError`] from the current
/// function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::molt_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::molt_error!($kind, $desc, $detail))
    };
}
