// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Garbage collection: copying live records into the standby area.

use super::{erase_metadata, prepare, Mounted};
use crate::error::{Error, Result};
use crate::low_level::{
    check_master, load_reserved, read_record, write_master, Check, Flash,
    MasterStatus, ReservedStatus,
};

/// Copies the reserved data and every live record from the active area into
/// the other one, writes a master record with the next version there, and
/// switches over.
///
/// Until the new master record is in place, nothing in the active area is
/// touched, so losing power at any point leaves a mountable store. The RAM
/// index and active area only change once the new area is complete.
pub(crate) fn collect<F: Flash>(flash: &mut F, m: &mut Mounted) -> Result<(), F::Error> {
    let geometry = m.geometry;
    let layout = geometry.layout;
    let from = m.active;
    let to = from.other();
    let src = geometry.area(from);
    let dst = geometry.area(to);

    tracing::debug!(?from, ?to, live = m.index.len(), "garbage collection starting");

    erase_metadata(flash, &geometry, to)?;

    let (image, status) = load_reserved(&*flash, &layout, src)?;
    match status {
        ReservedStatus::Valid(_) => {
            flash.program(dst.address, &image).map_err(Error::WriteFailed)?;
        }
        ReservedStatus::Corrupt => {
            tracing::warn!(area = ?from, "dropping corrupt reserved data");
        }
        ReservedStatus::Erased => (),
    }

    let mut offsets = Vec::new();
    offsets.try_reserve_exact(m.index.len()).map_err(|_| Error::OutOfMemory)?;

    let mut next = layout.first_record;
    for entry in m.index.entries() {
        let view = read_record(&*flash, &layout, src, entry.offset, Check::Header, &mut m.scratch)?;
        if next + view.size > dst.size {
            // Only possible when the standby area is the smaller one.
            return Err(Error::MediaFull);
        }
        prepare(flash, &geometry, to, next, view.size)?;
        flash.copy(src.address + entry.offset, dst.address + next, view.size, &mut m.scratch)?;
        offsets.push(next);
        next += view.size;
    }
    // Leave the unit holding the new free offset blank from there on.
    prepare(flash, &geometry, to, next, 0)?;

    let version = m.version.wrapping_add(1);
    write_master(flash, &layout, dst, version)?;
    flash.sync().map_err(Error::WriteFailed)?;
    if m.verify_writes {
        match check_master(&*flash, &layout, dst, &mut m.scratch)? {
            MasterStatus::Valid(v) if v == version => (),
            _ => return Err(Error::InvalidData),
        }
    }

    // The new area is authoritative from here on.
    m.index.relocate(&offsets);
    m.active = to;
    m.version = version;
    m.free = next;
    m.tail_dirty = false;

    tracing::debug!(
        area = ?to,
        version,
        bytes = next - layout.first_record,
        "garbage collection finished",
    );

    erase_metadata(flash, &geometry, from)?;
    flash.sync().map_err(Error::WriteFailed)
}
