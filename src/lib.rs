// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A power-loss resilient key-value store for raw flash.
//!
//! The device is split into two areas. One is active at a time and holds an
//! append-only log of records, each protected by a CRC; the other is kept in
//! reserve. When the active area fills up, the live records are copied into
//! the reserve area, which then becomes active. A RAM index maps key hashes to
//! record offsets so lookups don't have to scan the log.
//!
//! Every write is ordered so that losing power at any point leaves the
//! previous state of the store intact and mountable.

pub mod config;
mod control;
pub mod error;
pub mod geometry;
mod index;
mod iter;
pub mod low_level;

#[cfg(test)]
mod fake_flash;

use parking_lot::{Mutex, MutexGuard};

use crate::control::write::{self, PendingWrite, WriteState};
use crate::control::{gc, Control};

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::geometry::AreaId;
pub use crate::iter::IterHandle;
pub use crate::low_level::{Flags, Flash, MAX_KEY_SIZE, RESERVED_DATA_MAX};

/// Size and flags of a stored value, from [`Store::get_info`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Info {
    pub size: u32,
    pub flags: Flags,
}

/// Snapshot of the store's bookkeeping, from [`Store::status`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Status {
    pub active: AreaId,
    /// Version in the active area's master record.
    pub version: u16,
    /// Area-relative offset where the next record goes.
    pub free_offset: u32,
    /// Bytes of the active area the log may use. On devices whose areas
    /// differ in size this is the smaller of the two.
    pub area_size: u32,
    /// Number of live keys.
    pub keys: usize,
}

/// A key-value store on top of flash device `F`.
///
/// All methods take `&self`; the store can be shared between threads if `F`
/// can. Mutations are serialized by a writer lock that is held for the whole
/// of a write, including across the chunks of an [`IncrementalWrite`]. Reads
/// only hold the (separate) control lock while they run, so they can proceed
/// while a streaming write is in progress, seeing the old value until it
/// finalizes.
///
/// Holding an `IncrementalWrite` and calling another mutating method from the
/// same thread deadlocks.
pub struct Store<F: Flash> {
    control: Mutex<Control<F>>,
    writer: Mutex<()>,
}

impl<F: Flash> Store<F> {
    /// Wraps `flash` with the default configuration. Call `init` before
    /// anything else.
    pub fn new(flash: F) -> Self {
        Self::with_config(flash, Config::default())
    }

    pub fn with_config(flash: F, config: Config) -> Self {
        Self {
            control: Mutex::new(Control::new(flash, config)),
            writer: Mutex::new(()),
        }
    }

    /// Mounts the device: finds the active area, rebuilds the RAM index and
    /// repairs the aftermath of any interrupted write. Blank devices are
    /// formatted. Does nothing if already mounted.
    pub fn init(&self) -> Result<(), F::Error> {
        let _w = self.writer.lock();
        self.control.lock().mount()
    }

    /// Drops all in-RAM state, including open iterators. Further operations
    /// fail with `NotReady` until the next `init`.
    pub fn deinit(&self) {
        let _w = self.writer.lock();
        self.control.lock().unmount();
    }

    /// Erases the whole device, reserved data included, and starts over with
    /// an empty store. Works whether or not the store is mounted, and leaves
    /// it mounted.
    pub fn reset(&self) -> Result<(), F::Error> {
        let _w = self.writer.lock();
        self.control.lock().reset()
    }

    /// Stores `value` under `key`, replacing any existing value.
    pub fn set(&self, key: &[u8], value: &[u8], flags: Flags) -> Result<(), F::Error> {
        let size = u32::try_from(value.len())
            .map_err(|_| Error::InvalidArgument("value too large"))?;
        let mut w = self.set_start(key, size, flags)?;
        w.add_data(value)?;
        w.finalize()
    }

    /// Reads the value of `key` into `out`, starting `offset` bytes into the
    /// value. Returns the number of bytes read, which is less than `out.len()`
    /// if the value ends first (and zero if `offset` is the value's length).
    pub fn get(&self, key: &[u8], out: &mut [u8], offset: u32) -> Result<usize, F::Error> {
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;
        control::get(&*flash, m, key, out, offset)
    }

    pub fn get_info(&self, key: &[u8]) -> Result<Info, F::Error> {
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;
        control::get_info(&*flash, m, key)
    }

    /// Deletes `key` by writing a tombstone for it.
    pub fn remove(&self, key: &[u8]) -> Result<(), F::Error> {
        let _w = self.writer.lock();
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;

        let pending = write::start(flash, m, key, 0, Flags::DELETE)?;
        write::finalize(flash, m, pending)
    }

    /// Starts writing a `size` byte value for `key` in pieces.
    ///
    /// The returned guard holds the writer lock until it is finalized or
    /// dropped. Dropping it without finalizing leaves the old value in place.
    pub fn set_start(
        &self,
        key: &[u8],
        size: u32,
        flags: Flags,
    ) -> Result<IncrementalWrite<'_, F>, F::Error> {
        let flags = Flags::from_bits(flags.bits())
            .ok_or(Error::InvalidArgument("unsupported flags"))?;

        let writer = self.writer.lock();
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;
        let pending = write::start(flash, m, key, size, flags.bits())?;

        Ok(IncrementalWrite {
            control: &self.control,
            pending: Some(pending),
            _writer: writer,
        })
    }

    /// Opens an iterator over the keys starting with `prefix` (or all keys).
    ///
    /// Keys come out in index order, not sorted. Keys added or removed while
    /// the iterator is open may or may not be seen, but keys present
    /// throughout are returned exactly once.
    pub fn iterator_open(&self, prefix: Option<&[u8]>) -> Result<IterHandle, F::Error> {
        let mut ctl = self.control.lock();
        let (_, m) = ctl.parts()?;
        Ok(m.iters.open(prefix))
    }

    /// Returns the next key, or `NotFound` when there are no more.
    pub fn iterator_next(&self, handle: &IterHandle) -> Result<Vec<u8>, F::Error> {
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;
        control::iterator_next(&*flash, m, handle)
    }

    pub fn iterator_close(&self, handle: IterHandle) -> Result<(), F::Error> {
        let mut ctl = self.control.lock();
        let (_, m) = ctl.parts()?;
        if m.iters.close(handle) {
            Ok(())
        } else {
            Err(Error::InvalidArgument("unknown iterator"))
        }
    }

    /// Copies the reserved data blob into `out` and returns its length.
    /// Fails with `NotFound` if none has been set.
    pub fn reserved_data_get(&self, out: &mut [u8]) -> Result<usize, F::Error> {
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;
        control::reserved_get(&*flash, m, out)
    }

    /// Sets the reserved data blob (at most `RESERVED_DATA_MAX` bytes). It
    /// can be set only once; later attempts fail with `WriteProtected`.
    pub fn reserved_data_set(&self, data: &[u8]) -> Result<(), F::Error> {
        let _w = self.writer.lock();
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;
        control::reserved_set(flash, m, data)
    }

    /// Compacts the store into the other area now, rather than waiting for
    /// a write to run out of room.
    pub fn garbage_collection(&self) -> Result<(), F::Error> {
        let _w = self.writer.lock();
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;
        gc::collect(flash, m)
    }

    pub fn status(&self) -> Result<Status, F::Error> {
        let mut ctl = self.control.lock();
        let (_, m) = ctl.parts()?;
        Ok(m.status())
    }

    /// Gives the device back.
    pub fn into_inner(self) -> F {
        self.control.into_inner().flash
    }
}

#[cfg(test)]
impl<F: Flash> Store<F> {
    /// Runs `f` on the device underneath a mounted store.
    pub(crate) fn with_flash<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        f(&mut self.control.lock().flash)
    }
}

/// A value being written in pieces; see [`Store::set_start`].
pub struct IncrementalWrite<'s, F: Flash> {
    control: &'s Mutex<Control<F>>,
    /// Taken by `finalize`, or dropped when the write fails.
    pending: Option<PendingWrite>,
    _writer: MutexGuard<'s, ()>,
}

impl<F: Flash> IncrementalWrite<'_, F> {
    /// Appends the next piece of the value.
    ///
    /// A device error aborts the write: the store is repaired, the old value
    /// stays, and every further call fails.
    pub fn add_data(&mut self, data: &[u8]) -> Result<(), F::Error> {
        let pending = self.pending.as_mut()
            .ok_or(Error::InvalidArgument("write is no longer in progress"))?;
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;

        let result = write::append(flash, m, pending, data);
        if pending.state() == WriteState::Aborted {
            self.pending = None;
        }
        result
    }

    /// Completes the write. Fails with `InvalidArgument` if fewer bytes were
    /// added than were declared to `set_start`.
    pub fn finalize(mut self) -> Result<(), F::Error> {
        let pending = self.pending.take()
            .ok_or(Error::InvalidArgument("write is no longer in progress"))?;
        let mut ctl = self.control.lock();
        let (flash, m) = ctl.parts()?;
        write::finalize(flash, m, pending)
    }
}

impl<F: Flash> Drop for IncrementalWrite<'_, F> {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            // The tail is already marked dirty; the next write cleans up.
            tracing::debug!(
                key = ?String::from_utf8_lossy(pending.key()),
                "incremental write abandoned",
            );
        }
    }
}
