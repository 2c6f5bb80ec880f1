// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Splitting a flash device into the two areas used by the store, and the
//! fixed offsets of the metadata at the start of each area.

use core::mem::size_of;

use crate::error::{Error, Result};
use crate::low_level::{
    align_up, Flash, MasterData, RecordHeader, ReservedTrailer, MASTER_KEY,
    RESERVED_DATA_MAX,
};

/// Offsets are stored in 32 bits, so we never use more than this much of a
/// device.
pub const MAX_DEVICE_SIZE: u64 = 1 << 31;

/// Largest program granularity we're willing to lay records out against.
pub const MAX_PROGRAM_SIZE: u32 = 4096;

/// One of the two halves of the device that take turns holding the log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AreaId {
    Zero = 0,
    One = 1,
}

impl AreaId {
    pub const ALL: [Self; 2] = [Self::Zero, Self::One];

    /// Given an area, get the _other_ one.
    pub fn other(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }
}

impl From<AreaId> for usize {
    fn from(a: AreaId) -> Self {
        match a {
            AreaId::Zero => 0,
            AreaId::One => 1,
        }
    }
}

/// A contiguous, erase-unit-aligned range of the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Area {
    /// Device address of the first byte.
    pub address: u32,
    /// Length in bytes; always a whole number of erase units.
    pub size: u32,
}

/// Fixed positions within every area, derived from the program size.
///
/// ```text
/// 0                 master_offset          first_record
/// | reserved data + trailer | master record | records ... -> area end
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    /// Device program granularity; every record starts on a multiple of it.
    pub program_size: u32,
    /// Bytes set aside for a record header, which is programmed on its own.
    pub header_slot: u32,
    /// Length of the reserved data region, trailer included.
    pub reserved_region: u32,
    pub master_offset: u32,
    /// Offset of the first ordinary record, just past the master record.
    pub first_record: u32,
}

impl Layout {
    pub fn new(program_size: u32) -> Self {
        // These can't overflow: program_size is capped at MAX_PROGRAM_SIZE.
        let align = |x: usize| (x as u32 + program_size - 1) / program_size * program_size;

        let header_slot = align(size_of::<RecordHeader>());
        let reserved_region = align(RESERVED_DATA_MAX + size_of::<ReservedTrailer>());
        let master_size = header_slot + align(MASTER_KEY.len() + size_of::<MasterData>());

        Self {
            program_size,
            header_slot,
            reserved_region,
            master_offset: reserved_region,
            first_record: reserved_region + master_size,
        }
    }

    /// On-media footprint of a record with the given key and value lengths,
    /// padding included, or `None` if it doesn't fit in 32 bits.
    pub fn record_size(&self, key_len: u32, data_len: u32) -> Option<u32> {
        let contents = key_len.checked_add(data_len)?;
        align_up(contents, self.program_size)?.checked_add(self.header_slot)
    }
}

/// Everything the store needs to know about where things live on a device.
#[derive(Copy, Clone, Debug)]
pub struct Geometry {
    pub areas: [Area; 2],
    /// Erase unit size, if every unit in both areas has the same size. When
    /// this is `None` unit boundaries are found by walking the device.
    pub uniform_erase_size: Option<u32>,
    pub layout: Layout,
    /// How much of either area the log may occupy: the size of the smaller
    /// area, so that whatever fits in one always fits in the other.
    pub usable_size: u32,
}

impl Geometry {
    /// Measures `flash` and lays out the two areas.
    ///
    /// Fails if the program size is unusable, or if either area can't hold
    /// the reserved metadata plus at least one record header.
    pub fn new<F: Flash>(flash: &F) -> Result<Self, F::Error> {
        let program_size = flash.program_size();
        if !program_size.is_power_of_two() || program_size > MAX_PROGRAM_SIZE {
            return Err(Error::InvalidArgument("unsupported program size"));
        }
        let layout = Layout::new(program_size);

        let (areas, uniform_erase_size) = compute_areas(flash);

        let minimum = layout.first_record + layout.header_slot;
        if areas.iter().any(|a| a.size < minimum) {
            return Err(Error::DeviceTooSmall);
        }

        Ok(Self {
            areas,
            uniform_erase_size,
            layout,
            usable_size: areas[0].size.min(areas[1].size),
        })
    }

    pub fn area(&self, id: AreaId) -> Area {
        self.areas[usize::from(id)]
    }

    /// Lists the erase units of area `id` whose first byte falls in
    /// `start..end` (area-relative), as `(offset, size)` pairs.
    pub fn units_starting_in<F: Flash>(
        &self,
        flash: &F,
        id: AreaId,
        start: u32,
        end: u32,
    ) -> Vec<(u32, u32)> {
        let area = self.area(id);
        let end = end.min(area.size);
        let mut units = vec![];

        match self.uniform_erase_size {
            Some(unit) => {
                let mut u = (start + unit - 1) / unit * unit;
                while u < end {
                    units.push((u, unit));
                    u += unit;
                }
            }
            None => {
                let mut u = 0;
                while u < end {
                    let unit = flash.erase_size_at(area.address + u);
                    if unit == 0 {
                        break;
                    }
                    if u >= start {
                        units.push((u, unit));
                    }
                    u += unit;
                }
            }
        }

        units
    }

    /// Finds the erase unit of area `id` containing area-relative `offset`,
    /// as an `(offset, size)` pair.
    pub fn unit_containing<F: Flash>(
        &self,
        flash: &F,
        id: AreaId,
        offset: u32,
    ) -> (u32, u32) {
        match self.uniform_erase_size {
            Some(unit) => (offset / unit * unit, unit),
            None => {
                let area = self.area(id);
                let mut u = 0;
                loop {
                    let unit = flash.erase_size_at(area.address + u);
                    if unit == 0 || offset < u + unit || u + unit >= area.size {
                        return (u, unit);
                    }
                    u += unit;
                }
            }
        }
    }
}

/// Splits the device into two areas made of whole erase units.
///
/// Area 0 accumulates units from address 0 until it covers at least half of
/// the (clamped) device; area 1 takes whole units from there on, up to the
/// size of area 0 or the end of the device, whichever comes first.
///
/// Also reports the erase unit size if it turned out to be uniform.
pub fn compute_areas<F: Flash>(flash: &F) -> ([Area; 2], Option<u32>) {
    let size = flash.size().min(MAX_DEVICE_SIZE) as u32;

    let mut uniform = Some(flash.erase_size_at(0));
    let mut next_unit = |at: u32| -> Option<u32> {
        let unit = flash.erase_size_at(at);
        let end = at.checked_add(unit)?;
        if unit == 0 || end > size {
            return None;
        }
        if uniform != Some(unit) {
            uniform = None;
        }
        Some(end)
    };

    let mut end0 = 0;
    while u64::from(end0) * 2 < u64::from(size) {
        match next_unit(end0) {
            Some(end) => end0 = end,
            None => break,
        }
    }

    let mut end1 = end0;
    while end1 - end0 < end0 {
        match next_unit(end1) {
            Some(end) => end1 = end,
            None => break,
        }
    }

    let areas = [
        Area { address: 0, size: end0 },
        Area { address: end0, size: end1 - end0 },
    ];
    (areas, uniform)
}
