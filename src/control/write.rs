// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming record writes.
//!
//! A write is started with the final value size known, fed any number of
//! chunks, and finalized. Key and value bytes go to flash as they arrive; the
//! header, which carries the CRC over everything, is programmed last. Until
//! then the record is invisible to both readers and the recovery scan.

use super::{apply_record, find, gc, prepare, Mounted};
use crate::error::{Error, Result};
use crate::index::Lookup;
use crate::low_level::{
    check_key, program_header, read_record, Check, Flags, Flash, ProgramStream,
    RecordHeader,
};

/// Where a streaming write is in its life.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WriteState {
    /// Key written, no value bytes yet.
    Started,
    Writing,
    Finalized,
    /// A device error (or a failed check) ended the write. Nothing more may
    /// be appended.
    Aborted,
}

/// A record in the middle of being written to the active area.
pub(crate) struct PendingWrite {
    /// Area-relative offset of the record header.
    base: u32,
    /// On-media size of the whole record.
    size: u32,
    header: RecordHeader,
    digest: crc::Digest<'static, u32>,
    stream: ProgramStream,
    written: u32,
    key: Vec<u8>,
    state: WriteState,
}

impl PendingWrite {
    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

/// Makes room for and begins a record for `key` with a value of `data_size`
/// bytes. `flags` may include the internal delete flag.
///
/// Garbage collects first if a previous write left the tail dirty, or if the
/// record won't fit in what's left of the active area.
pub(crate) fn start<F: Flash>(
    flash: &mut F,
    m: &mut Mounted,
    key: &[u8],
    data_size: u32,
    flags: u32,
) -> Result<PendingWrite, F::Error> {
    check_key(key)?;
    let layout = m.geometry.layout;
    let size = layout
        .record_size(key.len() as u32, data_size)
        .ok_or(Error::InvalidArgument("value too large"))?;
    let usable = m.geometry.usable_size;
    if size > usable - layout.first_record {
        return Err(Error::MediaFull);
    }

    let deleting = flags & Flags::DELETE != 0;
    match find(&*flash, m, key)? {
        Lookup::Found(pos) => {
            let offset = m.index.entries()[pos].offset;
            let current = read_record(&*flash, &layout, m.active_area(), offset, Check::Header, &mut m.scratch)?;
            if Flags::from_stored(current.header.flags.get()).contains(Flags::WRITE_ONCE) {
                return Err(Error::WriteProtected);
            }
        }
        Lookup::Vacant(_) if deleting => return Err(Error::NotFound),
        Lookup::Vacant(_) => (),
    }

    // Make sure finalize won't have to allocate.
    if !deleting {
        m.index.grow_capacity().map_err(|_| Error::OutOfMemory)?;
    }

    if m.tail_dirty {
        tracing::debug!(free = m.free, "tail is dirty, collecting before write");
        gc::collect(flash, m)?;
    }
    if m.free + size > usable {
        gc::collect(flash, m)?;
        if m.free + size > usable {
            return Err(Error::MediaFull);
        }
    }

    let base = m.free;
    prepare(flash, &m.geometry, m.active, base, size)?;
    m.tail_dirty = true;

    let header = RecordHeader::new(&layout, key.len() as u16, data_size, flags);
    let mut digest = header.start_crc();
    digest.update(key);

    let key_addr = m.active_area().address + base + layout.header_slot;
    let mut stream = ProgramStream::new(key_addr, layout.program_size);
    if let Err(e) = stream.write(flash, key) {
        return Err(repair(flash, m, e));
    }

    Ok(PendingWrite {
        base,
        size,
        header,
        digest,
        stream,
        written: 0,
        key: key.to_vec(),
        state: WriteState::Started,
    })
}

/// Appends `data` to the value of `pw`.
pub(crate) fn append<F: Flash>(
    flash: &mut F,
    m: &mut Mounted,
    pw: &mut PendingWrite,
    data: &[u8],
) -> Result<(), F::Error> {
    match pw.state {
        WriteState::Started | WriteState::Writing => (),
        WriteState::Finalized | WriteState::Aborted => {
            return Err(Error::InvalidArgument("write is no longer in progress"));
        }
    }
    let left = pw.header.data_size.get() - pw.written;
    if data.len() as u64 > u64::from(left) {
        return Err(Error::InvalidArgument("more data than declared"));
    }

    if let Err(e) = pw.stream.write(flash, data) {
        pw.state = WriteState::Aborted;
        return Err(repair(flash, m, e));
    }
    pw.digest.update(data);
    pw.written += data.len() as u32;
    pw.state = WriteState::Writing;
    Ok(())
}

/// Completes `pw`: programs the header, makes everything durable, checks it
/// back if configured to, and publishes the record in the RAM index.
pub(crate) fn finalize<F: Flash>(
    flash: &mut F,
    m: &mut Mounted,
    mut pw: PendingWrite,
) -> Result<(), F::Error> {
    if pw.state == WriteState::Aborted || pw.state == WriteState::Finalized {
        return Err(Error::InvalidArgument("write is no longer in progress"));
    }
    if pw.written != pw.header.data_size.get() {
        pw.state = WriteState::Aborted;
        return Err(Error::InvalidArgument("value shorter than declared"));
    }

    let layout = m.geometry.layout;
    let area = m.active_area();
    let fill = flash.erase_value();
    pw.header.crc = pw.digest.finalize().into();

    let result = pw.stream.flush(flash, fill)
        .and_then(|_| program_header(flash, &layout, area.address + pw.base, &pw.header))
        .and_then(|()| flash.sync().map_err(Error::WriteFailed))
        .and_then(|()| {
            if m.verify_writes {
                let view = read_record(&*flash, &layout, area, pw.base, Check::Full, &mut m.scratch)?;
                if view.size != pw.size {
                    return Err(Error::InvalidData);
                }
            }
            Ok(())
        });
    if let Err(e) = result {
        return Err(repair(flash, m, e));
    }

    // A durable record that can't be indexed must not survive; collecting
    // leaves it behind.
    if let Err(e) = apply_record(&*flash, m, &pw.key, pw.base, pw.header.is_delete()) {
        pw.state = WriteState::Aborted;
        return Err(repair(flash, m, e));
    }
    m.free = pw.base + pw.size;
    m.tail_dirty = false;
    pw.state = WriteState::Finalized;
    Ok(())
}

/// Tries to clean up after a failed write by garbage collecting, which
/// leaves any partial record behind in the retired area. Hands back `err`,
/// which is what the caller should report either way.
pub(crate) fn repair<F: Flash>(flash: &mut F, m: &mut Mounted, err: Error<F::Error>) -> Error<F::Error> {
    m.tail_dirty = true;
    tracing::warn!(error = ?err, free = m.free, "write failed, collecting garbage to repair");
    if let Err(gc_err) = gc::collect(flash, m) {
        tracing::warn!(error = ?gc_err, "repair failed; will retry before the next write");
    }
    err
}
