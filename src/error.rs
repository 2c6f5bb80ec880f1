// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error type shared by every store operation.

use core::fmt::Debug;

/// Shorthand for results carrying a store [`Error`] over device error `E`.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Things that can go wrong in the store. `E` is the error type of the
/// underlying flash device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error<E: Debug> {
    /// Malformed key, size, flags or buffer. Never retried; the caller has to
    /// fix the argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The device reported an error while reading.
    #[error("flash read failed: {0:?}")]
    ReadFailed(E),
    /// The device reported an error while programming or erasing.
    #[error("flash write failed: {0:?}")]
    WriteFailed(E),
    /// A header, CRC or reserved-data trailer did not check out.
    #[error("invalid data detected")]
    InvalidData,
    #[error("item not found")]
    NotFound,
    /// No room for the record, even after garbage collection.
    #[error("media full")]
    MediaFull,
    /// Attempt to overwrite or remove a write-once item, or to set reserved
    /// data twice.
    #[error("write protected")]
    WriteProtected,
    /// Operation issued before `init` (or after `deinit`).
    #[error("store not initialized")]
    NotReady,
    /// The device can't hold two areas' worth of reserved metadata.
    #[error("device too small")]
    DeviceTooSmall,
    /// The RAM index could not grow.
    #[error("out of memory")]
    OutOfMemory,
}

impl<E: Debug> Error<E> {
    /// Whether this error came out of the device itself, as opposed to a
    /// logical failure detected by the store.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::ReadFailed(_) | Self::WriteFailed(_))
    }
}
