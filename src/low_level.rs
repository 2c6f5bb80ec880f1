// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt::Debug;
use core::mem::size_of;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::{Error, Result};
use crate::geometry::{Area, Layout};

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

/// Views the start of `bytes` as a `T`, or `None` if there aren't enough.
pub fn cast_prefix<T>(bytes: &[u8]) -> Option<(&T, &[u8])>
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)?;
    Some((lv.into_ref(), rest))
}

fn cast_prefix_mut<T>(bytes: &mut [u8]) -> Option<(&mut T, &mut [u8])>
    where T: AsBytes + FromBytes + Unaligned,
{
    let (lv, rest) = LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)?;
    Some((lv.into_mut(), rest))
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
pub type U16LE = zerocopy::U16<byteorder::LittleEndian>;
/// Shorthand for a `u32` in little-endian representation.
pub type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// CRC-32 (ISO-HDLC, the zlib convention) used for records, the master
/// record, the reserved data trailer and key hashes alike.
pub static CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Keys must be strictly shorter than this.
pub const MAX_KEY_SIZE: usize = 128;

/// Bytes that may not appear in a user key.
const FORBIDDEN_KEY_BYTES: &[u8] = b"*?:;\"|<>\\/\0";

/// Key of the master record. It contains a forbidden byte, so no user key can
/// ever be mistaken for it.
pub const MASTER_KEY: &[u8] = b"*master";

/// Maximum size of the reserved data blob.
pub const RESERVED_DATA_MAX: usize = 64;

/// Header at the start of every record.
///
/// The header is programmed _last_, after the key and value, and sits alone in
/// a slot of `header_size` bytes so that programming it never touches bytes
/// that were already written.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct RecordHeader {
    /// Always `EXPECTED_MAGIC`.
    pub magic: U32LE,
    /// Size of the header slot, which is the offset of the key from the start
    /// of the record.
    pub header_size: U16LE,
    /// Format revision; see `FormatRevision`.
    pub revision: U16LE,
    /// User flags plus internal flags; see `Flags`.
    pub flags: U32LE,
    pub key_size: U16LE,
    /// Reserved padding, must be zero.
    pub reserved: U16LE,
    pub data_size: U32LE,
    /// CRC32 of the header up to this field, then the key, then the value.
    pub crc: U32LE,
}

impl RecordHeader {
    /// Marks the start of a record header.
    pub const EXPECTED_MAGIC: u32 = 0x6b76_a5d3;
    /// Number of header bytes covered by the CRC.
    pub const CRC_COVERED: usize = size_of::<Self>() - size_of::<U32LE>();

    /// Builds a header for a record with the given shape. The CRC is left
    /// zero; it gets filled in once the value has streamed past.
    pub fn new(layout: &Layout, key_size: u16, data_size: u32, flags: u32) -> Self {
        Self {
            magic: Self::EXPECTED_MAGIC.into(),
            header_size: (layout.header_slot as u16).into(),
            revision: (FormatRevision::V1 as u16).into(),
            flags: flags.into(),
            key_size: key_size.into(),
            reserved: 0.into(),
            data_size: data_size.into(),
            crc: 0.into(),
        }
    }

    /// Starts a CRC digest over the header fields. Continue it with the key
    /// and then the value.
    pub fn start_crc(&self) -> crc::Digest<'static, u32> {
        let mut digest = CRC32.digest();
        digest.update(&self.as_bytes()[..Self::CRC_COVERED]);
        digest
    }

    pub fn is_delete(&self) -> bool {
        self.flags.get() & Flags::DELETE != 0
    }
}

/// Parses a record header out of `bytes`, checking the fields that can be
/// checked without knowing where the record lives.
pub fn decode_header<E: Debug>(bytes: &[u8]) -> Result<RecordHeader, E> {
    let (header, _) = cast_prefix::<RecordHeader>(bytes).ok_or(Error::InvalidData)?;

    if header.magic.get() != RecordHeader::EXPECTED_MAGIC
        || FormatRevision::from_u16(header.revision.get()).is_none()
        || header.reserved.get() != 0
        || header.key_size.get() == 0
        || usize::from(header.key_size.get()) >= MAX_KEY_SIZE
    {
        return Err(Error::InvalidData);
    }
    if header.is_delete() && header.data_size.get() != 0 {
        return Err(Error::InvalidData);
    }

    Ok(*header)
}

/// Defined values for the `revision` fields of records and master records.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum FormatRevision {
    // Note: 0 is reserved.
    V1 = 1,
}

/// Record flags. The user-settable bits are exposed as constants; the delete
/// bit is internal to the store.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Self = Self(0);
    /// Once set, the key can be neither overwritten nor removed.
    pub const WRITE_ONCE: Self = Self(1 << 0);
    /// Recorded for upper layers; not enforced by the store.
    pub const REQUIRE_CONFIDENTIALITY: Self = Self(1 << 1);
    /// Recorded for upper layers; not enforced by the store.
    pub const REQUIRE_REPLAY_PROTECTION: Self = Self(1 << 3);

    /// Tombstone marker.
    pub(crate) const DELETE: u32 = 1 << 31;

    const USER_BITS: u32 = Self::WRITE_ONCE.0
        | Self::REQUIRE_CONFIDENTIALITY.0
        | Self::REQUIRE_REPLAY_PROTECTION.0;

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Converts raw bits, refusing anything but the user flags.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::USER_BITS != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    /// Converts raw bits from a header, dropping internal flags.
    pub(crate) const fn from_stored(bits: u32) -> Self {
        Self(bits & Self::USER_BITS)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Payload of the master record.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct MasterData {
    /// Generation of the area. Compared using sequence number arithmetic so
    /// it may wrap.
    pub version: U16LE,
    /// Format revision of the store; see `FormatRevision`.
    pub format_revision: U16LE,
    /// Reserved, must be zero.
    pub reserved: U32LE,
}

/// Trailer following the reserved data blob at the start of each area.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct ReservedTrailer {
    /// Size of this trailer (`SIZE`), to help distinguish it from goo.
    pub trailer_size: U32LE,
    /// Number of valid bytes in the blob.
    pub data_size: U32LE,
    /// CRC32 of the first `data_size` bytes of the blob.
    pub crc: U32LE,
}

impl ReservedTrailer {
    pub const SIZE: u32 = size_of::<Self>() as u32;
}

/// Computes the hash value used to sort keys in the RAM index.
pub fn hash_key(key: &[u8]) -> u32 {
    CRC32.checksum(key)
}

/// Checks that `key` is acceptable as a user key.
pub fn check_key<E: Debug>(key: &[u8]) -> Result<(), E> {
    if key.is_empty() || key.len() >= MAX_KEY_SIZE {
        return Err(Error::InvalidArgument("key length out of range"));
    }
    if key.iter().any(|b| FORBIDDEN_KEY_BYTES.contains(b)) {
        return Err(Error::InvalidArgument("key contains a forbidden character"));
    }
    Ok(())
}

/// Rounds `x` up to a multiple of `to`, which must be a power of two.
pub fn align_up(x: u32, to: u32) -> Option<u32> {
    Some(x.checked_add(to - 1)? & !(to - 1))
}

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// Result of a raw device operation, carrying the driver's own error.
pub type DeviceResult<T, E> = core::result::Result<T, E>;

/// Trait describing a raw, erase-before-write flash device.
///
/// All addresses are device byte addresses. The store only ever programs
/// whole multiples of `program_size` at aligned addresses, only erases whole
/// erase units, and never programs a byte twice without erasing it in
/// between. Reads may be of any length at any address.
pub trait Flash {
    /// Whatever the driver reports when an access fails.
    type Error: Debug;

    /// Total size of the device in bytes. Only the first 2 GiB are used.
    fn size(&self) -> u64;

    /// Program granularity in bytes. Must be a power of two.
    fn program_size(&self) -> u32;

    /// Size of the erase unit containing `addr`. Devices with non-uniform
    /// erase units are supported; return 0 for addresses past the end.
    fn erase_size_at(&self, addr: u32) -> u32;

    /// The value every byte reads as after an erase.
    fn erase_value(&self) -> u8 {
        0xFF
    }

    /// Reads `dest.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, dest: &mut [u8]) -> DeviceResult<(), Self::Error>;

    /// Programs `data` at `addr`.
    ///
    /// On error, the range _may or may not_ contain the data, or part of it.
    fn program(&mut self, addr: u32, data: &[u8]) -> DeviceResult<(), Self::Error>;

    /// Erases `len` bytes starting at `addr`, which span whole erase units.
    fn erase(&mut self, addr: u32, len: u32) -> DeviceResult<(), Self::Error>;

    /// Makes sure everything programmed so far is durable. Called at the end
    /// of every write sequence the store relies on.
    fn sync(&mut self) -> DeviceResult<(), Self::Error> {
        Ok(())
    }

    /// Checks whether the `data.len()` bytes at `addr` equal `data`.
    ///
    /// Memory-mapped parts can override this to compare in place. The
    /// default reads through `scratch` a chunk at a time; its contents are
    /// garbage afterwards.
    fn compare_contents(
        &self,
        mut addr: u32,
        mut data: &[u8],
        scratch: &mut [u8],
    ) -> DeviceResult<bool, Self::Error> {
        while !data.is_empty() {
            let n = usize::min(scratch.len(), data.len());
            let (chunk, rest) = data.split_at(n);
            self.read(addr, &mut scratch[..n])?;
            if scratch[..n] != *chunk {
                return Ok(false);
            }
            addr += n as u32;
            data = rest;
        }

        Ok(true)
    }

    /// Copies `len` bytes from `from` to `to`. Both addresses and `len` are
    /// multiples of the program size, as is `scratch.len()`.
    ///
    /// Garbage collection moves every live record with this. The default
    /// bounces the bytes through `scratch`; override it if the part has a
    /// native copy command.
    fn copy(
        &mut self,
        mut from: u32,
        mut to: u32,
        mut len: u32,
        scratch: &mut [u8],
    ) -> Result<(), Self::Error> {
        while len > 0 {
            let n = len.min(scratch.len() as u32);
            let chunk = &mut scratch[..n as usize];
            self.read(from, chunk).map_err(Error::ReadFailed)?;
            self.program(to, chunk).map_err(Error::WriteFailed)?;
            from += n;
            to += n;
            len -= n;
        }
        Ok(())
    }
}

/// Checks whether `len` bytes at `addr` all read as the erase value.
pub fn is_erased<F: Flash>(
    flash: &F,
    mut addr: u32,
    len: u32,
    scratch: &mut [u8],
) -> Result<bool, F::Error> {
    let erased = flash.erase_value();
    let mut left = len as usize;
    while left > 0 {
        let n = usize::min(scratch.len(), left);
        let chunk = &mut scratch[..n];
        flash.read(addr, chunk).map_err(Error::ReadFailed)?;
        if chunk.iter().any(|&b| b != erased) {
            return Ok(false);
        }
        addr += n as u32;
        left -= n;
    }
    Ok(true)
}

//////////////////////////////////////////////////////////////////////////////
// Reading records.

/// How much of a record `read_record` should verify.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Check {
    /// Decode and bounds-check the header only. Used for records that were
    /// fully checked when they were indexed.
    Header,
    /// Also recompute the CRC over header, key and value.
    Full,
}

/// A record located in an area, with its header decoded.
///
/// All reads through a view are confined to the record's key and value.
#[derive(Copy, Clone, Debug)]
pub struct RecordView {
    pub area: Area,
    /// Area-relative offset of the header.
    pub offset: u32,
    pub header: RecordHeader,
    /// On-media size including header slot and padding.
    pub size: u32,
}

impl RecordView {
    pub fn key_len(&self) -> u32 {
        u32::from(self.header.key_size.get())
    }

    pub fn data_len(&self) -> u32 {
        self.header.data_size.get()
    }

    pub fn is_delete(&self) -> bool {
        self.header.is_delete()
    }

    /// Area-relative offset just past this record, where the next one starts.
    pub fn next_offset(&self) -> u32 {
        self.offset + self.size
    }

    fn key_addr(&self) -> u32 {
        self.area.address + self.offset + u32::from(self.header.header_size.get())
    }

    /// Reads the key into `out`, which must be exactly `key_len()` long.
    pub fn read_key<F: Flash>(&self, flash: &F, out: &mut [u8]) -> Result<(), F::Error> {
        if out.len() != self.key_len() as usize {
            return Err(Error::InvalidArgument("key buffer has the wrong length"));
        }
        flash.read(self.key_addr(), out).map_err(Error::ReadFailed)
    }

    /// Checks whether this record's key is `key`.
    pub fn key_matches<F: Flash>(
        &self,
        flash: &F,
        key: &[u8],
        scratch: &mut [u8],
    ) -> Result<bool, F::Error> {
        if key.len() != self.key_len() as usize {
            return Ok(false);
        }
        flash.compare_contents(self.key_addr(), key, scratch)
            .map_err(Error::ReadFailed)
    }

    /// Reads value bytes starting `offset` bytes into the value.
    ///
    /// This works somewhat like POSIX read: it fills as much of `out` as
    /// there is value left past `offset` and returns the count, which is zero
    /// when `offset` is exactly the value length. Offsets _past_ the end are
    /// an error.
    pub fn read_data<F: Flash>(
        &self,
        flash: &F,
        offset: u32,
        out: &mut [u8],
    ) -> Result<usize, F::Error> {
        let len_after_offset = self.data_len()
            .checked_sub(offset)
            .ok_or(Error::InvalidArgument("offset beyond end of value"))?;
        let xfer_len = usize::min(len_after_offset as usize, out.len());

        let addr = self.key_addr() + self.key_len() + offset;
        flash.read(addr, &mut out[..xfer_len]).map_err(Error::ReadFailed)?;
        Ok(xfer_len)
    }
}

/// Reads the record whose header is at `offset` in `area`.
///
/// Fails with `InvalidData` if there's no plausible record there: bad magic
/// number, unknown revision, nonsensical sizes, a record running off the end
/// of the area, or (with `Check::Full`) a CRC mismatch. `scratch` will be
/// scribbled upon.
pub fn read_record<F: Flash>(
    flash: &F,
    layout: &Layout,
    area: Area,
    offset: u32,
    check: Check,
    scratch: &mut [u8],
) -> Result<RecordView, F::Error> {
    let slot_end = offset.checked_add(layout.header_slot).ok_or(Error::InvalidData)?;
    if slot_end > area.size {
        return Err(Error::InvalidData);
    }

    let mut raw = [0; size_of::<RecordHeader>()];
    flash.read(area.address + offset, &mut raw).map_err(Error::ReadFailed)?;
    let header = decode_header(&raw)?;

    if u32::from(header.header_size.get()) != layout.header_slot {
        return Err(Error::InvalidData);
    }
    let size = layout
        .record_size(u32::from(header.key_size.get()), header.data_size.get())
        .ok_or(Error::InvalidData)?;
    match offset.checked_add(size) {
        Some(end) if end <= area.size => (),
        _ => return Err(Error::InvalidData),
    }

    let view = RecordView {
        area,
        offset,
        header,
        size,
    };

    if check == Check::Full {
        let mut digest = header.start_crc();
        let mut addr = view.key_addr();
        let mut left = (view.key_len() + view.data_len()) as usize;
        while left > 0 {
            let n = usize::min(scratch.len(), left);
            flash.read(addr, &mut scratch[..n]).map_err(Error::ReadFailed)?;
            digest.update(&scratch[..n]);
            addr += n as u32;
            left -= n;
        }
        if digest.finalize() != header.crc.get() {
            return Err(Error::InvalidData);
        }
    }

    Ok(view)
}

//////////////////////////////////////////////////////////////////////////////
// Writing records.

/// Streams bytes into flash at program-size granularity, staging any
/// unaligned tail in RAM until more data (or `flush`) completes it.
#[derive(Debug)]
pub struct ProgramStream {
    /// Device address of the next program operation.
    addr: u32,
    program_size: usize,
    stage: Vec<u8>,
}

impl ProgramStream {
    pub fn new(addr: u32, program_size: u32) -> Self {
        Self {
            addr,
            program_size: program_size as usize,
            stage: Vec::with_capacity(program_size as usize),
        }
    }

    /// Appends `data`, programming every program unit it completes.
    pub fn write<F: Flash>(&mut self, flash: &mut F, mut data: &[u8]) -> Result<(), F::Error> {
        // Top up a partially staged unit first.
        if !self.stage.is_empty() {
            let n = usize::min(self.program_size - self.stage.len(), data.len());
            let (head, rest) = data.split_at(n);
            self.stage.extend_from_slice(head);
            data = rest;

            if self.stage.len() < self.program_size {
                return Ok(());
            }
            flash.program(self.addr, &self.stage).map_err(Error::WriteFailed)?;
            self.addr += self.program_size as u32;
            self.stage.clear();
        }

        // Whole units go straight from the caller's buffer.
        let whole = data.len() / self.program_size * self.program_size;
        if whole > 0 {
            let (head, rest) = data.split_at(whole);
            flash.program(self.addr, head).map_err(Error::WriteFailed)?;
            self.addr += whole as u32;
            data = rest;
        }

        self.stage.extend_from_slice(data);
        Ok(())
    }

    /// Pads any staged bytes out to a full unit with `fill` and programs them.
    /// Returns the address just past the last programmed byte.
    pub fn flush<F: Flash>(&mut self, flash: &mut F, fill: u8) -> Result<u32, F::Error> {
        if !self.stage.is_empty() {
            self.stage.resize(self.program_size, fill);
            flash.program(self.addr, &self.stage).map_err(Error::WriteFailed)?;
            self.addr += self.program_size as u32;
            self.stage.clear();
        }
        Ok(self.addr)
    }
}

/// Programs `header` into its slot at device address `addr`, padding the rest
/// of the slot with the erase value.
pub fn program_header<F: Flash>(
    flash: &mut F,
    layout: &Layout,
    addr: u32,
    header: &RecordHeader,
) -> Result<(), F::Error> {
    let mut slot = vec![flash.erase_value(); layout.header_slot as usize];
    slot[..size_of::<RecordHeader>()].copy_from_slice(header.as_bytes());
    flash.program(addr, &slot).map_err(Error::WriteFailed)
}

/// Writes a complete record for `key` and `data` at `offset` in `area`, in
/// one go. The target range must already be erased.
///
/// Key and value are programmed first and the header last, so that the record
/// is only valid once all of it has been written. Returns the offset just
/// past the record.
pub fn write_record<F: Flash>(
    flash: &mut F,
    layout: &Layout,
    area: Area,
    offset: u32,
    key: &[u8],
    data: &[u8],
    flags: u32,
) -> Result<u32, F::Error> {
    let key_size = u16::try_from(key.len())
        .map_err(|_| Error::InvalidArgument("key too long"))?;
    let data_size = u32::try_from(data.len())
        .map_err(|_| Error::InvalidArgument("value too long"))?;
    let size = layout.record_size(u32::from(key_size), data_size)
        .ok_or(Error::InvalidArgument("value too long"))?;
    if offset.checked_add(size).map_or(true, |end| end > area.size) {
        return Err(Error::MediaFull);
    }

    let mut header = RecordHeader::new(layout, key_size, data_size, flags);
    let mut digest = header.start_crc();
    digest.update(key);
    digest.update(data);
    header.crc = digest.finalize().into();

    let base = area.address + offset;
    let mut stream = ProgramStream::new(base + layout.header_slot, layout.program_size);
    stream.write(flash, key)?;
    stream.write(flash, data)?;
    let fill = flash.erase_value();
    stream.flush(flash, fill)?;
    program_header(flash, layout, base, &header)?;

    Ok(offset + size)
}

//////////////////////////////////////////////////////////////////////////////
// Master record.

/// What `check_master` found in an area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MasterStatus {
    /// A valid master record carrying this version.
    Valid(u16),
    /// The master record span is blank; the area has never been activated
    /// (or has been retired).
    Erased,
    /// Something is there but it isn't a valid master record, typically a
    /// torn write.
    Corrupt,
}

/// Writes the master record for `version` into `area`.
pub fn write_master<F: Flash>(
    flash: &mut F,
    layout: &Layout,
    area: Area,
    version: u16,
) -> Result<(), F::Error> {
    let master = MasterData {
        version: version.into(),
        format_revision: (FormatRevision::V1 as u16).into(),
        reserved: 0.into(),
    };
    write_record(
        flash,
        layout,
        area,
        layout.master_offset,
        MASTER_KEY,
        master.as_bytes(),
        0,
    )?;
    Ok(())
}

/// Reads and classifies the master record of `area`.
pub fn check_master<F: Flash>(
    flash: &F,
    layout: &Layout,
    area: Area,
    scratch: &mut [u8],
) -> Result<MasterStatus, F::Error> {
    match read_record(flash, layout, area, layout.master_offset, Check::Full, scratch) {
        Ok(view) => {
            let mut raw = [0; size_of::<MasterData>()];
            if view.is_delete()
                || view.data_len() != raw.len() as u32
                || !view.key_matches(flash, MASTER_KEY, scratch)?
            {
                return Ok(MasterStatus::Corrupt);
            }
            view.read_data(flash, 0, &mut raw)?;
            let master = match cast_prefix::<MasterData>(&raw) {
                Some((master, _)) => *master,
                None => return Ok(MasterStatus::Corrupt),
            };
            match FormatRevision::from_u16(master.format_revision.get()) {
                Some(FormatRevision::V1) => Ok(MasterStatus::Valid(master.version.get())),
                None => Ok(MasterStatus::Corrupt),
            }
        }
        Err(Error::InvalidData) => {
            let span = layout.first_record - layout.master_offset;
            if is_erased(flash, area.address + layout.master_offset, span, scratch)? {
                Ok(MasterStatus::Erased)
            } else {
                Ok(MasterStatus::Corrupt)
            }
        }
        Err(e) => Err(e),
    }
}

/// Sequence number comparison for master record versions: `true` if `a` was
/// issued after `b`. Correct across wraparound as long as the two are less
/// than half the number space apart, which always holds since the areas
/// differ by one GC cycle.
pub fn version_is_newer(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

//////////////////////////////////////////////////////////////////////////////
// Reserved data.

/// What `load_reserved` found in an area's reserved data region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReservedStatus {
    /// The whole region, trailer included, is blank.
    Erased,
    /// Valid blob of the given length.
    Valid(u32),
    /// Programmed but failing the trailer checks.
    Corrupt,
}

/// Reads the entire reserved data region of `area`, returning its raw bytes
/// together with their classification.
pub fn load_reserved<F: Flash>(
    flash: &F,
    layout: &Layout,
    area: Area,
) -> Result<(Vec<u8>, ReservedStatus), F::Error> {
    let mut image = vec![0; layout.reserved_region as usize];
    flash.read(area.address, &mut image).map_err(Error::ReadFailed)?;

    let erased = flash.erase_value();
    if image.iter().all(|&b| b == erased) {
        return Ok((image, ReservedStatus::Erased));
    }

    let status = match cast_prefix::<ReservedTrailer>(&image[RESERVED_DATA_MAX..]) {
        Some((trailer, _))
            if trailer.trailer_size.get() == ReservedTrailer::SIZE
                && trailer.data_size.get() as usize <= RESERVED_DATA_MAX
                && trailer.crc.get()
                    == CRC32.checksum(&image[..trailer.data_size.get() as usize]) =>
        {
            ReservedStatus::Valid(trailer.data_size.get())
        }
        _ => ReservedStatus::Corrupt,
    };
    Ok((image, status))
}

/// Builds the on-media image of the reserved data region holding `data`.
pub fn encode_reserved(layout: &Layout, data: &[u8], erase_value: u8) -> Option<Vec<u8>> {
    if data.len() > RESERVED_DATA_MAX {
        return None;
    }

    let mut image = vec![erase_value; layout.reserved_region as usize];
    image[..data.len()].copy_from_slice(data);
    let (trailer, _) = cast_prefix_mut::<ReservedTrailer>(&mut image[RESERVED_DATA_MAX..])?;
    *trailer = ReservedTrailer {
        trailer_size: ReservedTrailer::SIZE.into(),
        data_size: (data.len() as u32).into(),
        crc: CRC32.checksum(data).into(),
    };
    Some(image)
}
