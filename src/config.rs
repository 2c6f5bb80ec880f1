// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Store configuration.

/// Tunables for a [`Store`](crate::Store). None of these affect the on-media
/// format; two stores with different configs can mount the same device.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of RAM index entries reserved at mount. The index doubles from
    /// here when it fills up.
    pub initial_index_capacity: usize,

    /// Size of the scratch buffer used to copy and checksum records. Rounded
    /// up to the device program size at mount.
    pub copy_buffer_size: usize,

    /// Read every finalized record back and check its CRC before indexing it.
    pub verify_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_index_capacity: 16,
            copy_buffer_size: 256,
            verify_writes: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn initial_index_capacity(mut self, entries: usize) -> Self {
        self.config.initial_index_capacity = entries;
        self
    }

    pub fn copy_buffer_size(mut self, bytes: usize) -> Self {
        self.config.copy_buffer_size = bytes;
        self
    }

    pub fn verify_writes(mut self, verify: bool) -> Self {
        self.config.verify_writes = verify;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
