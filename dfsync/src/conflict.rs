//! Decides which side of a transfer holds the authoritative copy.
//!
//! | destination | checksums | mtimes            | outcome        |
//! |-------------|-----------|-------------------|----------------|
//! | absent      | -         | -                 | Proceed        |
//! | present     | equal     | any               | AlreadySynced  |
//! | present     | differ    | dest newer        | StaleSource    |
//! | present     | differ    | source newer      | Proceed        |
//! | present     | differ    | equal             | Proceed (warn) |
//!
//! "Destination" is the copy about to be overwritten: the server's for a
//! store, the client's for a fetch.

use crate::protocol::FileVersion;

/// Which way bytes would flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → server
    Store,
    /// Server → client
    Fetch,
}

/// Outcome of a conflict check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Transfer the source copy
    Proceed,
    /// Both copies are byte-identical
    AlreadySynced,
    /// The destination copy is newer than the source
    StaleSource,
}

/// Resolve a transfer of `source` over `destination`.
///
/// Differing content with identical mtimes resolves to `Proceed`.
pub fn resolve(
    direction: Direction,
    destination: Option<FileVersion>,
    source: FileVersion,
) -> Resolution {
    let Some(destination) = destination else {
        return Resolution::Proceed;
    };

    if destination.checksum == source.checksum {
        return Resolution::AlreadySynced;
    }

    if destination.mtime > source.mtime {
        return Resolution::StaleSource;
    }

    if destination.mtime == source.mtime {
        log::warn!(
            "{direction:?}: checksums differ ({:#010x} vs {:#010x}) but mtimes are both {}; transferring",
            destination.checksum,
            source.checksum,
            source.mtime
        );
    }
    Resolution::Proceed
}
