// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mounting: choosing the active area and rebuilding the RAM index from it.

use super::{apply_record, erase_metadata, gc, Mounted};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::geometry::{AreaId, Geometry};
use crate::low_level::{
    check_master, is_erased, load_reserved, read_record, version_is_newer,
    write_master, Check, Flash, MasterStatus, ReservedStatus, MAX_KEY_SIZE,
};

/// Mounts `flash`, formatting it if neither area holds a valid master record,
/// and repairing (by garbage collection) any torn data found at the end of
/// the active area.
pub(crate) fn mount<F: Flash>(flash: &mut F, config: &Config) -> Result<Mounted, F::Error> {
    let geometry = Geometry::new(&*flash)?;
    let (active, version) = select_area(flash, &geometry, config)?;

    let mut m = Mounted::new::<F::Error>(geometry, active, version, config)?;
    let clean = rebuild_index(flash, &mut m)?;

    let (_, reserved) = load_reserved(&*flash, &geometry.layout, m.active_area())?;
    if reserved == ReservedStatus::Corrupt {
        tracing::warn!(area = ?active, "reserved data is corrupt");
    }

    if !clean || reserved == ReservedStatus::Corrupt {
        m.tail_dirty = true;
        gc::collect(flash, &mut m)?;
    }

    tracing::info!(
        area = ?m.active,
        version = m.version,
        keys = m.index.len(),
        free = m.free,
        "store mounted",
    );
    Ok(m)
}

/// Classifies both areas' master records and decides which one is active,
/// cleaning up the loser. Formats area 0 if neither is usable.
fn select_area<F: Flash>(
    flash: &mut F,
    geometry: &Geometry,
    config: &Config,
) -> Result<(AreaId, u16), F::Error> {
    let layout = geometry.layout;
    let mut scratch = vec![0; config.copy_buffer_size.max(1)];

    let mut status = [MasterStatus::Erased; 2];
    for id in AreaId::ALL {
        let s = check_master(&*flash, &layout, geometry.area(id), &mut scratch)?;
        if s == MasterStatus::Corrupt {
            tracing::warn!(area = ?id, "master record is corrupt, erasing it");
            erase_metadata(flash, geometry, id)?;
        }
        status[usize::from(id)] = match s {
            MasterStatus::Corrupt => MasterStatus::Erased,
            s => s,
        };
    }

    let selected = match status {
        [MasterStatus::Valid(v0), MasterStatus::Valid(v1)] => {
            // A tie goes to area 0.
            let winner = if version_is_newer(v1, v0) { AreaId::One } else { AreaId::Zero };
            tracing::debug!(v0, v1, ?winner, "both areas hold a master record");
            erase_metadata(flash, geometry, winner.other())?;
            (winner, if winner == AreaId::One { v1 } else { v0 })
        }
        [MasterStatus::Valid(v0), _] => (AreaId::Zero, v0),
        [_, MasterStatus::Valid(v1)] => (AreaId::One, v1),
        _ => {
            tracing::info!("no master record found, formatting");
            erase_metadata(flash, geometry, AreaId::Zero)?;
            write_master(flash, &layout, geometry.area(AreaId::Zero), 1)?;
            flash.sync().map_err(Error::WriteFailed)?;
            (AreaId::Zero, 1)
        }
    };
    Ok(selected)
}

/// Replays every record in the active area into the RAM index, exactly as
/// the write pipeline would have applied them, and sets the free offset to
/// where the records stop.
///
/// Returns `false` if the records stop at something that is neither a valid
/// record nor blank space. That's either corruption or a write that never
/// finished; either way the caller has to collect before writing again.
fn rebuild_index<F: Flash>(flash: &mut F, m: &mut Mounted) -> Result<bool, F::Error> {
    let layout = m.geometry.layout;
    let area = m.active_area();
    let mut key_buf = [0; MAX_KEY_SIZE];

    let mut offset = layout.first_record;
    loop {
        let view = match read_record(&*flash, &layout, area, offset, Check::Full, &mut m.scratch) {
            Ok(view) => view,
            Err(Error::InvalidData) => break,
            Err(e) => return Err(e),
        };
        let key = &mut key_buf[..view.key_len() as usize];
        view.read_key(&*flash, key)?;
        apply_record(&*flash, m, key, offset, view.is_delete())?;
        offset = view.next_offset();
    }
    m.free = offset;

    // Everything from the free offset to the end of its erase unit must be
    // blank. Later units get erased before they're written.
    if offset >= area.size {
        return Ok(true);
    }
    let (unit, unit_size) = m.geometry.unit_containing(&*flash, m.active, offset);
    let end = (unit + unit_size).min(area.size);
    let clean = end <= offset
        || is_erased(&*flash, area.address + offset, end - offset, &mut m.scratch)?;
    if !clean {
        tracing::warn!(offset, "unexpected data past the last record");
    }
    Ok(clean)
}
