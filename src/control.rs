// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control block: everything the store knows about a mounted device, and
//! the operations on it that don't need the writer lock.
//!
//! The write pipeline, garbage collector and recovery scanner live in their
//! own files but operate on the same `Mounted` state.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::geometry::{Area, AreaId, Geometry};
use crate::index::{Lookup, RamIndex};
use crate::iter::{IterHandle, OpenIterators};
use crate::low_level::{
    align_up, check_key, encode_reserved, hash_key, load_reserved, read_record,
    Check, Flags, Flash, ReservedStatus, RESERVED_DATA_MAX,
};
use crate::{Info, Status};

pub(crate) mod gc;
pub(crate) mod recovery;
pub(crate) mod write;

/// Owner of the device, plus the mounted state once `init` has succeeded.
pub(crate) struct Control<F: Flash> {
    pub flash: F,
    pub config: Config,
    pub mounted: Option<Mounted>,
}

impl<F: Flash> Control<F> {
    pub fn new(flash: F, config: Config) -> Self {
        Self {
            flash,
            config,
            mounted: None,
        }
    }

    /// Splits out the device and the mounted state, or fails with `NotReady`
    /// if we haven't been mounted.
    pub fn parts(&mut self) -> Result<(&mut F, &mut Mounted), F::Error> {
        match &mut self.mounted {
            Some(m) => Ok((&mut self.flash, m)),
            None => Err(Error::NotReady),
        }
    }

    /// Mounts the device if it isn't already.
    pub fn mount(&mut self) -> Result<(), F::Error> {
        if self.mounted.is_none() {
            self.mounted = Some(recovery::mount(&mut self.flash, &self.config)?);
        }
        Ok(())
    }

    pub fn unmount(&mut self) {
        self.mounted = None;
    }

    /// Wipes both areas completely and formats area 0 from scratch. Open
    /// iterators survive, rewound to the (now empty) start.
    pub fn reset(&mut self) -> Result<(), F::Error> {
        let iters = self.mounted.take().map(|m| m.iters);

        let geometry = Geometry::new(&self.flash)?;
        for id in AreaId::ALL {
            prepare(&mut self.flash, &geometry, id, 0, geometry.area(id).size)?;
        }
        self.mount()?;

        if let (Some(mut iters), Some(m)) = (iters, self.mounted.as_mut()) {
            iters.rewind_all();
            m.iters = iters;
        }
        tracing::info!("store reset");
        Ok(())
    }
}

/// State of a mounted store.
#[derive(Debug)]
pub(crate) struct Mounted {
    pub geometry: Geometry,
    /// Area holding the authoritative master record.
    pub active: AreaId,
    /// Version from the active area's master record.
    pub version: u16,
    /// Area-relative offset where the next record will be written.
    pub free: u32,
    pub index: RamIndex,
    pub iters: OpenIterators,
    /// Set while something may have been programmed at or past `free`. The
    /// next writer must garbage collect before appending.
    pub tail_dirty: bool,
    /// Bounce buffer for compares, copies and CRC checks; a whole number of
    /// program units long.
    pub scratch: Vec<u8>,
    pub verify_writes: bool,
}

impl Mounted {
    pub fn new<E: core::fmt::Debug>(
        geometry: Geometry,
        active: AreaId,
        version: u16,
        config: &Config,
    ) -> Result<Self, E> {
        let program_size = geometry.layout.program_size;
        let scratch_len = config.copy_buffer_size.max(program_size as usize) as u32;
        let scratch_len = align_up(scratch_len, program_size)
            .ok_or(Error::InvalidArgument("copy buffer too large"))?;

        let mut index = RamIndex::new(config.initial_index_capacity);
        index.grow_capacity().map_err(|_| Error::OutOfMemory)?;

        Ok(Self {
            geometry,
            active,
            version,
            free: geometry.layout.first_record,
            index,
            iters: OpenIterators::default(),
            tail_dirty: false,
            scratch: vec![0; scratch_len as usize],
            verify_writes: config.verify_writes,
        })
    }

    pub fn active_area(&self) -> Area {
        self.geometry.area(self.active)
    }

    pub fn status(&self) -> Status {
        Status {
            active: self.active,
            version: self.version,
            free_offset: self.free,
            area_size: self.geometry.usable_size,
            keys: self.index.len(),
        }
    }
}

/// Erases every erase unit of area `id` that starts within `off..=off + size`
/// (area-relative), so that a record of `size` bytes can be written at `off`
/// and the unit holding the following offset is blank from there on.
///
/// The unit containing `off` itself is assumed to be erased from `off`
/// onwards already and is left alone unless it starts exactly at `off`.
pub(crate) fn prepare<F: Flash>(
    flash: &mut F,
    geometry: &Geometry,
    id: AreaId,
    off: u32,
    size: u32,
) -> Result<(), F::Error> {
    let base = geometry.area(id).address;
    let end = off.saturating_add(size).saturating_add(1);

    // Coalesce adjacent units into as few erase calls as we can.
    let mut run: Option<(u32, u32)> = None;
    for (start, len) in geometry.units_starting_in(&*flash, id, off, end) {
        run = match run {
            Some((s, l)) if s + l == start => Some((s, l + len)),
            Some((s, l)) => {
                flash.erase(base + s, l).map_err(Error::WriteFailed)?;
                Some((start, len))
            }
            None => Some((start, len)),
        };
    }
    if let Some((s, l)) = run {
        flash.erase(base + s, l).map_err(Error::WriteFailed)?;
    }
    Ok(())
}

/// Erases the reserved data region and master record of area `id`, plus the
/// unit where its first record would go.
pub(crate) fn erase_metadata<F: Flash>(
    flash: &mut F,
    geometry: &Geometry,
    id: AreaId,
) -> Result<(), F::Error> {
    prepare(flash, geometry, id, 0, geometry.layout.first_record)
}

/// Looks `key` up in the RAM index, confirming hash hits against the key
/// bytes on flash.
pub(crate) fn find<F: Flash>(flash: &F, m: &mut Mounted, key: &[u8]) -> Result<Lookup, F::Error> {
    let Mounted { geometry, active, index, scratch, .. } = m;
    let area = geometry.area(*active);
    let layout = geometry.layout;

    index.find(hash_key(key), |offset| {
        let view = read_record(flash, &layout, area, offset, Check::Header, &mut scratch[..])?;
        view.key_matches(flash, key, &mut scratch[..])
    })
}

/// Folds a freshly written (or freshly scanned) record into the RAM index:
/// inserts a new key, repoints an existing one, or drops it for a tombstone.
/// Open iterators are shifted to match.
pub(crate) fn apply_record<F: Flash>(
    flash: &F,
    m: &mut Mounted,
    key: &[u8],
    offset: u32,
    deleted: bool,
) -> Result<(), F::Error> {
    match find(flash, m, key)? {
        Lookup::Found(pos) => {
            if deleted {
                m.index.remove_at(pos);
                m.iters.index_removed(pos);
            } else {
                m.index.set_offset(pos, offset);
            }
        }
        Lookup::Vacant(pos) => {
            if !deleted {
                m.index.insert_at(pos, hash_key(key), offset)
                    .map_err(|_| Error::OutOfMemory)?;
                m.iters.index_inserted(pos);
            }
        }
    }
    Ok(())
}

/// Reads part of the value stored under `key`, starting `offset` bytes in.
/// Reads from the start of a value check the whole record's CRC first.
pub(crate) fn get<F: Flash>(
    flash: &F,
    m: &mut Mounted,
    key: &[u8],
    out: &mut [u8],
    offset: u32,
) -> Result<usize, F::Error> {
    check_key(key)?;
    let pos = match find(flash, m, key)? {
        Lookup::Found(pos) => pos,
        Lookup::Vacant(_) => return Err(Error::NotFound),
    };
    let entry = m.index.get(pos).ok_or(Error::NotFound)?;

    let check = if offset == 0 { Check::Full } else { Check::Header };
    let view = read_record(flash, &m.geometry.layout, m.active_area(), entry.offset, check, &mut m.scratch)?;
    view.read_data(flash, offset, out)
}

pub(crate) fn get_info<F: Flash>(flash: &F, m: &mut Mounted, key: &[u8]) -> Result<Info, F::Error> {
    check_key(key)?;
    let pos = match find(flash, m, key)? {
        Lookup::Found(pos) => pos,
        Lookup::Vacant(_) => return Err(Error::NotFound),
    };
    let entry = m.index.get(pos).ok_or(Error::NotFound)?;
    let view = read_record(flash, &m.geometry.layout, m.active_area(), entry.offset, Check::Header, &mut m.scratch)?;

    Ok(Info {
        size: view.data_len(),
        flags: Flags::from_stored(view.header.flags.get()),
    })
}

/// Returns the next key for iterator `handle`, or `NotFound` once it has run
/// off the end of the index.
pub(crate) fn iterator_next<F: Flash>(
    flash: &F,
    m: &mut Mounted,
    handle: &IterHandle,
) -> Result<Vec<u8>, F::Error> {
    let area = m.active_area();
    let Mounted { geometry, index, iters, scratch, .. } = m;
    let cursor = iters.get_mut(handle)
        .ok_or(Error::InvalidArgument("unknown iterator"))?;

    while let Some(entry) = index.get(cursor.position) {
        let view = read_record(flash, &geometry.layout, area, entry.offset, Check::Header, &mut scratch[..])?;
        let mut key = vec![0; view.key_len() as usize];
        view.read_key(flash, &mut key)?;

        cursor.position += 1;
        if cursor.accepts(&key) {
            return Ok(key);
        }
    }
    Err(Error::NotFound)
}

/// Copies the active area's reserved data into `out`, returning its length.
pub(crate) fn reserved_get<F: Flash>(
    flash: &F,
    m: &Mounted,
    out: &mut [u8],
) -> Result<usize, F::Error> {
    let (image, status) = load_reserved(flash, &m.geometry.layout, m.active_area())?;
    match status {
        ReservedStatus::Valid(len) => {
            let len = len as usize;
            let dest = out.get_mut(..len)
                .ok_or(Error::InvalidArgument("buffer smaller than reserved data"))?;
            dest.copy_from_slice(&image[..len]);
            Ok(len)
        }
        ReservedStatus::Erased => Err(Error::NotFound),
        ReservedStatus::Corrupt => Err(Error::InvalidData),
    }
}

/// Stores `data` as the reserved data blob. This can only happen once per
/// device lifetime (or until `reset`); garbage collection carries the blob
/// along from then on.
pub(crate) fn reserved_set<F: Flash>(
    flash: &mut F,
    m: &mut Mounted,
    data: &[u8],
) -> Result<(), F::Error> {
    if data.is_empty() || data.len() > RESERVED_DATA_MAX {
        return Err(Error::InvalidArgument("reserved data must be 1 to 64 bytes"));
    }
    let area = m.active_area();
    let layout = m.geometry.layout;

    let (_, status) = load_reserved(&*flash, &layout, area)?;
    if status != ReservedStatus::Erased {
        return Err(Error::WriteProtected);
    }

    let image = encode_reserved(&layout, data, flash.erase_value())
        .ok_or(Error::InvalidArgument("reserved data too large"))?;
    let result = flash.program(area.address, &image)
        .and_then(|()| flash.sync())
        .map_err(Error::WriteFailed)
        .and_then(|()| {
            if !m.verify_writes {
                return Ok(());
            }
            match load_reserved(&*flash, &layout, area)?.1 {
                ReservedStatus::Valid(n) if n as usize == data.len() => Ok(()),
                _ => Err(Error::InvalidData),
            }
        });

    result.map_err(|e| write::repair(flash, m, e))
}
