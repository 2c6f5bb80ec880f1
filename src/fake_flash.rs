// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-RAM flash device for tests, with power loss and fault injection.

use std::cell::Cell;

use crate::low_level::{DeviceResult, Flash};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FakeFlashError {
    /// The device lost power before (or during) the operation.
    PowerLost,
    /// A single program or erase failed; the device keeps working.
    Glitch,
    ReadFault,
}

/// A NOR-ish flash simulator.
///
/// Misaligned programs and erases, and programming bytes that aren't erased,
/// are bugs in the store and cause a panic rather than an error.
#[derive(Clone, Debug)]
pub struct FakeFlash {
    contents: Vec<u8>,
    /// Start address and size of every erase unit, in address order.
    units: Vec<(u32, u32)>,
    program_size: u32,

    programs: usize,
    erases: usize,
    /// Number of mutating operations left before power goes away.
    budget: Option<usize>,
    /// Number of mutating operations left before one of them fails.
    glitch: Option<usize>,
    /// Number of reads left before one of them fails.
    read_fault: Cell<Option<usize>>,
}

impl FakeFlash {
    pub const ERASED: u8 = 0xFF;

    /// Makes a device of `size` bytes with uniform erase units.
    pub fn new(size: u32, erase_size: u32, program_size: u32) -> Self {
        let units = vec![erase_size; (size / erase_size) as usize];
        Self::with_units(&units, program_size)
    }

    /// Makes a device out of erase units of the given sizes, in order.
    pub fn with_units(sizes: &[u32], program_size: u32) -> Self {
        let mut units = Vec::with_capacity(sizes.len());
        let mut addr = 0;
        for &size in sizes {
            units.push((addr, size));
            addr += size;
        }
        Self {
            contents: vec![Self::ERASED; addr as usize],
            units,
            program_size,
            programs: 0,
            erases: 0,
            budget: None,
            glitch: None,
            read_fault: Cell::new(None),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.contents
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.contents
    }

    /// Number of successful program operations so far.
    pub fn programs(&self) -> usize {
        self.programs
    }

    /// Number of successful erase operations so far.
    pub fn erases(&self) -> usize {
        self.erases
    }

    /// Lets `ops` more programs or erases succeed; the next one after that is
    /// torn, and everything from then on fails.
    pub fn lose_power_after(&mut self, ops: usize) {
        self.budget = Some(ops);
    }

    pub fn restore_power(&mut self) {
        self.budget = None;
    }

    /// Lets `ops` more programs or erases succeed, then fails (and tears) the
    /// next one only.
    pub fn fail_once_after(&mut self, ops: usize) {
        self.glitch = Some(ops);
    }

    /// Lets `reads` more reads succeed, then fails the next one only.
    pub fn fail_read_after(&mut self, reads: usize) {
        self.read_fault.set(Some(reads));
    }

    /// Accounts for one mutating operation, deciding whether it fails.
    fn spend(&mut self) -> Result<(), FakeFlashError> {
        match self.budget {
            Some(0) => return Err(FakeFlashError::PowerLost),
            Some(n) => self.budget = Some(n - 1),
            None => (),
        }
        match self.glitch {
            Some(0) => {
                self.glitch = None;
                Err(FakeFlashError::Glitch)
            }
            Some(n) => {
                self.glitch = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Flash for FakeFlash {
    type Error = FakeFlashError;

    fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    fn program_size(&self) -> u32 {
        self.program_size
    }

    fn erase_size_at(&self, addr: u32) -> u32 {
        self.units
            .iter()
            .find(|&&(start, size)| addr >= start && addr < start + size)
            .map_or(0, |&(_, size)| size)
    }

    fn read(&self, addr: u32, dest: &mut [u8]) -> DeviceResult<(), Self::Error> {
        match self.read_fault.get() {
            Some(0) => {
                self.read_fault.set(None);
                return Err(FakeFlashError::ReadFault);
            }
            Some(n) => self.read_fault.set(Some(n - 1)),
            None => (),
        }
        let addr = addr as usize;
        dest.copy_from_slice(&self.contents[addr..addr + dest.len()]);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> DeviceResult<(), Self::Error> {
        assert_eq!(addr % self.program_size, 0, "misaligned program at {addr:#x}");
        assert_eq!(
            data.len() % self.program_size as usize,
            0,
            "program of {} bytes at {addr:#x} is not whole units",
            data.len(),
        );

        let start = addr as usize;
        let end = start + data.len();
        if let Some(i) = self.contents[start..end].iter().position(|&b| b != Self::ERASED) {
            panic!("programming non-erased byte at {:#x}", start + i);
        }

        let outcome = self.spend();
        let target = &mut self.contents[start..end];
        if let Err(e) = outcome {
            // Tear the write: the first half lands, the rest doesn't.
            let torn = data.len() / 2;
            target[..torn].copy_from_slice(&data[..torn]);
            return Err(e);
        }

        target.copy_from_slice(data);
        self.programs += 1;
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> DeviceResult<(), Self::Error> {
        let first = self.units.iter().position(|&(start, _)| start == addr);
        assert!(first.is_some(), "erase at {addr:#x} is not on a unit boundary");
        let end = addr + len;
        assert!(
            self.units.iter().any(|&(start, size)| start + size == end),
            "erase ending at {end:#x} is not on a unit boundary",
        );

        self.spend()?;

        self.contents[addr as usize..end as usize].fill(Self::ERASED);
        self.erases += 1;
        Ok(())
    }
}
