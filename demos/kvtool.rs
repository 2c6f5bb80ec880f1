// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use rustyline::error::ReadlineError;
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing_subscriber::{fmt, EnvFilter};

use pingpong_kv::geometry::{AreaId, Geometry};
use pingpong_kv::low_level::{
    check_master, load_reserved, read_record, version_is_newer, Check, DeviceResult,
    MasterStatus,
};
use pingpong_kv::{Error, Flags, Flash, Store};

#[derive(Parser)]
struct Kvtool {
    /// Erase unit size of the simulated device.
    #[clap(short, long, default_value_t = 4096)]
    erase_size: u32,

    /// Program granularity of the simulated device.
    #[clap(short, long, default_value_t = 8)]
    program_size: u32,

    /// Log what the store is doing.
    #[clap(short, long)]
    verbose: bool,

    image_file: std::path::PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Creates a blank (all 0xFF) image of the given size in bytes.
    Create { size: u64 },
    /// Reports the state of both areas without mounting.
    Check,
    /// Erases the whole image and formats a fresh store.
    Format,
    Set {
        key: String,
        value: String,
        /// Mark the key write-once.
        #[clap(long)]
        write_once: bool,
    },
    Get { key: String },
    Rm { key: String },
    Ls { prefix: Option<String> },
    Gc,
    /// Lists every record in the active area, including superseded ones.
    Dump,
    ReservedGet,
    ReservedSet { value: String },
    /// Runs commands interactively against the mounted store.
    Shell,
}

/// Commands accepted by the interactive shell.
#[derive(Parser)]
#[clap(no_binary_name = true)]
struct ShellLine {
    #[clap(subcommand)]
    cmd: Cmd,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Kvtool::parse();

    let filter = if args.verbose { "pingpong_kv=debug" } else { "pingpong_kv=warn" };
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Cmd::Create { size } = args.cmd {
        let mut f = std::fs::File::create(&args.image_file)
            .with_context(|| format!("creating {}", args.image_file.display()))?;
        f.write_all(&vec![0xFF; size as usize])?;
        println!("created {} byte image", size);
        return Ok(());
    }

    let img = FlashImage::open(&args.image_file, args.erase_size, args.program_size)
        .with_context(|| format!("opening image file {}", args.image_file.display()))?;

    match args.cmd {
        Cmd::Check => check(&img)?,
        Cmd::Dump => dump(&img)?,
        Cmd::Shell => {
            let store = Store::new(img);
            mount(&store)?;
            shell(&store)?;
        }
        cmd => {
            let store = Store::new(img);
            if !matches!(cmd, Cmd::Format) {
                mount(&store)?;
            }
            run(&store, cmd)?;
        }
    }

    Ok(())
}

fn mount(store: &Store<FlashImage>) -> anyhow::Result<()> {
    store.init().map_err(|e| anyhow!("could not mount: {e}"))
}

/// Executes one store command, reporting store errors without failing.
fn run(store: &Store<FlashImage>, cmd: Cmd) -> anyhow::Result<()> {
    let result = match cmd {
        Cmd::Format => store.reset().map(|()| println!("formatted")),
        Cmd::Set { key, value, write_once } => {
            let flags = if write_once { Flags::WRITE_ONCE } else { Flags::NONE };
            store.set(key.as_bytes(), value.as_bytes(), flags).map(|()| println!("ok"))
        }
        Cmd::Get { key } => get(store, &key),
        Cmd::Rm { key } => store.remove(key.as_bytes()).map(|()| println!("ok")),
        Cmd::Ls { prefix } => ls(store, prefix.as_deref()),
        Cmd::Gc => store.garbage_collection().and_then(|()| {
            let status = store.status()?;
            println!("now in area {:?}, version {}", status.active, status.version);
            Ok(())
        }),
        Cmd::ReservedGet => {
            let mut buf = [0; pingpong_kv::RESERVED_DATA_MAX];
            store.reserved_data_get(&mut buf)
                .map(|n| println!("{}", pretty_hex::pretty_hex(&&buf[..n])))
        }
        Cmd::ReservedSet { value } => {
            store.reserved_data_set(value.as_bytes()).map(|()| println!("ok"))
        }
        Cmd::Create { .. } | Cmd::Check | Cmd::Dump | Cmd::Shell => {
            bail!("not available here");
        }
    };

    match result {
        Ok(()) => (),
        Err(Error::NotFound) => println!("not found"),
        Err(e) if e.is_device_error() => {
            return Err(anyhow!("image access failed: {e}"));
        }
        Err(e) => println!("error: {e}"),
    }
    Ok(())
}

fn get(store: &Store<FlashImage>, key: &str) -> pingpong_kv::Result<(), std::io::Error> {
    let info = store.get_info(key.as_bytes())?;
    let mut value = vec![0; info.size as usize];
    store.get(key.as_bytes(), &mut value, 0)?;
    println!("flags {:#x}", info.flags.bits());
    println!("{}", pretty_hex::pretty_hex(&value));
    Ok(())
}

fn ls(store: &Store<FlashImage>, prefix: Option<&str>) -> pingpong_kv::Result<(), std::io::Error> {
    let it = store.iterator_open(prefix.map(str::as_bytes))?;
    let mut count = 0;
    loop {
        match store.iterator_next(&it) {
            Ok(key) => {
                println!("{}", String::from_utf8_lossy(&key));
                count += 1;
            }
            Err(Error::NotFound) => break,
            Err(e) => {
                store.iterator_close(it)?;
                return Err(e);
            }
        }
    }
    store.iterator_close(it)?;
    println!("{count} keys");
    Ok(())
}

fn shell(store: &Store<FlashImage>) -> anyhow::Result<()> {
    let mut rl = rustyline::Editor::<()>::new()?;

    loop {
        match rl.readline("kv> ") {
            Ok(line) => {
                let words: Vec<&str> = line.split_whitespace().collect();
                if words.is_empty() {
                    continue;
                }
                rl.add_history_entry(line.as_str());
                match ShellLine::try_parse_from(words) {
                    Ok(ShellLine { cmd: Cmd::Shell }) => println!("already in a shell"),
                    Ok(ShellLine { cmd: Cmd::Check | Cmd::Dump | Cmd::Create { .. } }) => {
                        println!("only available from the command line");
                    }
                    Ok(ShellLine { cmd }) => run(store, cmd)?,
                    Err(e) => println!("{e}"),
                }
            }
            Err(ReadlineError::Eof) => {
                println!("exiting.");
                break;
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn check(img: &FlashImage) -> anyhow::Result<()> {
    let geometry = Geometry::new(img).map_err(|e| anyhow!("bad geometry: {e}"))?;
    let layout = geometry.layout;
    let mut scratch = vec![0; 256];

    for id in AreaId::ALL {
        let area = geometry.area(id);
        println!("area {id:?}: {:#x} bytes at {:#x}", area.size, area.address);

        let master = check_master(img, &layout, area, &mut scratch)
            .map_err(|e| anyhow!("reading master record: {e}"))?;
        match master {
            MasterStatus::Valid(v) => println!("- master record version {v}"),
            MasterStatus::Erased => println!("- no master record"),
            MasterStatus::Corrupt => println!("- master record is CORRUPT"),
        }

        let (_, reserved) = load_reserved(img, &layout, area)
            .map_err(|e| anyhow!("reading reserved data: {e}"))?;
        println!("- reserved data {reserved:?}");
    }
    Ok(())
}

fn dump(img: &FlashImage) -> anyhow::Result<()> {
    let geometry = Geometry::new(img).map_err(|e| anyhow!("bad geometry: {e}"))?;
    let layout = geometry.layout;
    let mut scratch = vec![0; 256];

    let mut versions = [None; 2];
    for id in AreaId::ALL {
        if let Ok(MasterStatus::Valid(v)) = check_master(img, &layout, geometry.area(id), &mut scratch) {
            versions[usize::from(id)] = Some(v);
        }
    }
    let active = match versions {
        [Some(v0), Some(v1)] if version_is_newer(v1, v0) => AreaId::One,
        [Some(_), _] => AreaId::Zero,
        [None, Some(_)] => AreaId::One,
        [None, None] => bail!("no valid master record in either area"),
    };
    let area = geometry.area(active);
    println!("dumping records in area {active:?}");

    let mut seen_keys = std::collections::HashMap::new();
    let mut offset = layout.first_record;
    loop {
        let view = match read_record(img, &layout, area, offset, Check::Full, &mut scratch) {
            Ok(view) => view,
            Err(Error::InvalidData) => break,
            Err(e) => bail!("failed to read record at {offset:#x}: {e}"),
        };
        println!("record at {offset:#x}, {} bytes", view.size);
        println!("- flags {:#010x}", view.header.flags.get());

        let mut key = vec![0; view.key_len() as usize];
        view.read_key(img, &mut key).map_err(|e| anyhow!("failed to read key: {e}"))?;
        if let Some(prev) = seen_keys.insert(key.clone(), offset) {
            println!("- supersedes record at {prev:#x}");
        }
        println!("Key {}", pretty_hex::pretty_hex(&key));

        if view.is_delete() {
            println!("- this record deletes the key");
        } else {
            let mut val = vec![0; view.data_len() as usize];
            view.read_data(img, 0, &mut val).map_err(|e| anyhow!("failed to read value: {e}"))?;
            println!("Value {}", pretty_hex::pretty_hex(&val));
        }
        println!();

        offset = view.next_offset();
    }
    println!("free space starts at {offset:#x}");
    Ok(())
}

/// A flash device simulated by an image file.
struct FlashImage {
    file: RefCell<std::fs::File>,
    size: u64,
    erase_size: u32,
    program_size: u32,
}

impl FlashImage {
    fn open(
        path: impl AsRef<std::path::Path>,
        erase_size: u32,
        program_size: u32,
    ) -> Result<Self, anyhow::Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let size = file.metadata()?.len();

        if erase_size == 0 || size % u64::from(erase_size) != 0 {
            bail!("file is not a whole number of erase units in length");
        }

        Ok(Self {
            file: file.into(),
            size,
            erase_size,
            program_size,
        })
    }

    fn write_at(&self, addr: u32, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.write_all(data)
    }
}

impl Flash for FlashImage {
    type Error = std::io::Error;

    fn size(&self) -> u64 {
        self.size
    }

    fn program_size(&self) -> u32 {
        self.program_size
    }

    fn erase_size_at(&self, addr: u32) -> u32 {
        if u64::from(addr) < self.size {
            self.erase_size
        } else {
            0
        }
    }

    fn read(&self, addr: u32, dest: &mut [u8]) -> DeviceResult<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.read_exact(dest)
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> DeviceResult<(), Self::Error> {
        self.write_at(addr, data)
    }

    fn erase(&mut self, addr: u32, len: u32) -> DeviceResult<(), Self::Error> {
        self.write_at(addr, &vec![0xFF; len as usize])
    }

    fn sync(&mut self) -> DeviceResult<(), Self::Error> {
        self.file.get_mut().sync_data()
    }
}
