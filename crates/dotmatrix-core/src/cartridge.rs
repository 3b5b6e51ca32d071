use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CartridgeError {
    /// Header type/size codes outside the supported set.
    #[error("unsupported cartridge (header byte {code:#04x})")]
    UnsupportedCartridge { code: u8 },

    /// ROM image shorter than the header-declared size.
    #[error("truncated ROM: header declares {expected} bytes, image has {actual}")]
    TruncatedRom { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    RomOnly,
    Mbc1,
    Mbc3,
    Mbc5,
}

/// Opaque mapper metadata exchanged with the save-persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MapperMetadata {
    #[serde(rename = "mbc3_rtc_v1")]
    Mbc3RtcV1 { rtc: RtcSnapshot },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcSnapshot {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub days: u16,
    pub carry: bool,
    pub halt: bool,
    #[serde(rename = "lastUnixSeconds")]
    pub last_unix_seconds: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    /// 9-bit day counter.
    days: u16,
    halt: bool,
    carry: bool,
}

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }
}

/// MBC3 real-time clock, advanced from wall-clock deltas on each access.
#[derive(Debug, Clone)]
struct Mbc3Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    last_unix_seconds: u64,
}

impl Mbc3Rtc {
    fn new(now: u64) -> Self {
        let regs = RtcRegisters::default();
        Self {
            regs,
            latched: regs,
            last_unix_seconds: now,
        }
    }

    /// Fold elapsed wall-clock time into the registers. A host clock that
    /// went backwards resets the reference point without advancing.
    fn sync(&mut self, now: u64) {
        if now < self.last_unix_seconds {
            self.last_unix_seconds = now;
            return;
        }
        let elapsed = now - self.last_unix_seconds;
        self.last_unix_seconds = now;
        if !self.regs.halt && elapsed > 0 {
            self.advance_seconds(elapsed);
        }
    }

    fn advance_seconds(&mut self, seconds: u64) {
        let total = self.regs.seconds as u64 + seconds;
        self.regs.seconds = (total % 60) as u8;

        let minutes = self.regs.minutes as u64 + total / 60;
        self.regs.minutes = (minutes % 60) as u8;

        let hours = self.regs.hours as u64 + minutes / 60;
        self.regs.hours = (hours % 24) as u8;

        let days = self.regs.days as u64 + hours / 24;
        if days > 0x1FF {
            self.regs.carry = true;
        }
        self.regs.days = (days & 0x1FF) as u16;
    }

    fn latch(&mut self) {
        self.latched = self.regs;
    }

    fn read_latched(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds,
            0x09 => self.latched.minutes,
            0x0A => self.latched.hours,
            0x0B => (self.latched.days & 0x00FF) as u8,
            0x0C => self.latched.control_byte(),
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => self.regs.seconds = value & 0x3F,
            0x09 => self.regs.minutes = value & 0x3F,
            0x0A => self.regs.hours = value & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x0100) | value as u16,
            0x0C => {
                self.regs.days = (self.regs.days & 0x00FF) | (((value & 0x01) as u16) << 8);
                self.regs.halt = value & 0x40 != 0;
                self.regs.carry = value & 0x80 != 0;
            }
            _ => {}
        }
        self.latch();
    }

    fn snapshot(&self) -> RtcSnapshot {
        RtcSnapshot {
            seconds: self.regs.seconds,
            minutes: self.regs.minutes,
            hours: self.regs.hours,
            days: self.regs.days,
            carry: self.regs.carry,
            halt: self.regs.halt,
            last_unix_seconds: self.last_unix_seconds,
        }
    }

    fn restore(&mut self, snap: &RtcSnapshot) {
        self.regs = RtcRegisters {
            seconds: snap.seconds.min(59),
            minutes: snap.minutes.min(59),
            hours: snap.hours.min(23),
            days: snap.days & 0x1FF,
            halt: snap.halt,
            carry: snap.carry,
        };
        self.last_unix_seconds = snap.last_unix_seconds;
        // Importing discards any latched view.
        self.latched = self.regs;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug)]
enum MbcState {
    RomOnly,
    Mbc1 {
        rom_bank: u8,
        ram_bank: u8,
        mode: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Mbc3Rtc>,
        latch_pending: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
}

#[derive(Debug)]
pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub title: String,
    cart_type: u8,
    dirty: bool,
    save_path: Option<PathBuf>,
    rtc_path: Option<PathBuf>,
    mbc_state: MbcState,
}

impl Cartridge {
    /// Parse and validate a cartridge image.
    pub fn load(data: Vec<u8>) -> Result<Self, CartridgeError> {
        let header = Header::parse(&data)?;
        let mbc = header.mbc_type()?;
        let ram_size = header.ram_size()?;

        let expected = header.rom_size()?;
        if data.len() < expected {
            return Err(CartridgeError::TruncatedRom {
                expected,
                actual: data.len(),
            });
        }

        let cart_type = header.cart_type();
        let has_rtc = header.has_rtc();
        let title = header.title();

        let mbc_state = match mbc {
            MbcType::RomOnly => MbcState::RomOnly,
            MbcType::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank: 0,
                mode: 0,
                ram_enable: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: has_rtc.then(|| Mbc3Rtc::new(unix_now())),
                latch_pending: false,
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
        };

        Ok(Self {
            rom: data,
            ram: vec![0; ram_size],
            mbc,
            title,
            cart_type,
            dirty: false,
            save_path: None,
            rtc_path: None,
            mbc_state,
        })
    }

    /// Load a cartridge from disk, picking up `<rom>.sav` / `<rom>.rtc`
    /// sidecars when the cartridge is battery-backed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let data = fs::read(&path)?;
        let mut cart = Self::load(data).map_err(io::Error::other)?;

        if cart.has_battery() {
            let save = PathBuf::from(path.as_ref()).with_extension("sav");
            if let Ok(bytes) = fs::read(&save) {
                cart.import_ram(&bytes);
            }
            cart.save_path = Some(save);
        }

        if cart.has_rtc() {
            let rtc_path = PathBuf::from(path.as_ref()).with_extension("rtc");
            if let Ok(bytes) = fs::read(&rtc_path) {
                match serde_json::from_slice::<MapperMetadata>(&bytes) {
                    Ok(meta) => cart.import_metadata(&meta),
                    Err(e) => {
                        log::warn!("ignoring malformed RTC sidecar {}: {e}", rtc_path.display())
                    }
                }
            }
            cart.rtc_path = Some(rtc_path);
        }

        log::info!("loaded ROM: {} (MBC: {:?})", cart.title, cart.mbc);
        Ok(cart)
    }

    /// Write battery RAM and RTC state back to the sidecar files.
    pub fn save_ram(&mut self) -> io::Result<()> {
        if let (true, Some(path)) = (self.has_battery(), &self.save_path)
            && !self.ram.is_empty()
        {
            fs::write(path, &self.ram)?;
        }
        if let (Some(path), Some(meta)) = (self.rtc_path.clone(), self.export_metadata()) {
            fs::write(path, serde_json::to_vec_pretty(&meta)?)?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        let rom_bank_count = (self.rom.len() / 0x4000).max(1);
        match (&mut self.mbc_state, addr) {
            (MbcState::RomOnly, 0x0000..=0x7FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc1 { ram_bank, mode, .. }, 0x0000..=0x3FFF) => {
                let bank = if *mode == 0 {
                    0
                } else {
                    (((*ram_bank as usize) & 0x03) << 5) % rom_bank_count
                };
                let offset = bank * 0x4000 + addr as usize;
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (
                MbcState::Mbc1 {
                    rom_bank, ram_bank, ..
                },
                0x4000..=0x7FFF,
            ) => {
                let high = ((*ram_bank as usize) & 0x03) << 5;
                let mut bank = high | (*rom_bank as usize & 0x1F);
                if bank & 0x1F == 0 {
                    bank += 1;
                }
                let offset = (bank % rom_bank_count) * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc3 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let bank = if *rom_bank == 0 { 1 } else { *rom_bank } as usize;
                let offset = (bank % rom_bank_count) * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc5 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let bank = (*rom_bank as usize) % rom_bank_count;
                let offset = bank * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::RomOnly, 0xA000..=0xBFFF) => self
                .ram
                .get(addr as usize - 0xA000)
                .copied()
                .unwrap_or(0xFF),
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    let idx = self.ram_index(addr);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if !*ram_enable {
                    0xFF
                } else {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                            self.ram.get(idx).copied().unwrap_or(0xFF)
                        }
                        0x08..=0x0C => match rtc.as_mut() {
                            Some(rtc) => {
                                rtc.sync(unix_now());
                                rtc.read_latched(*ram_bank)
                            }
                            None => 0xFF,
                        },
                        _ => 0xFF,
                    }
                }
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    let idx = self.ram_index(addr);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match (&mut self.mbc_state, addr) {
            // Writes into ROM space on a plain ROM are dropped.
            (MbcState::RomOnly, 0x0000..=0x7FFF) => {}
            (MbcState::RomOnly, 0xA000..=0xBFFF) => {
                let idx = addr as usize - 0xA000;
                if let Some(b) = self.ram.get_mut(idx) {
                    *b = val;
                    self.dirty = true;
                }
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x1F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc1 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01;
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    let idx = self.ram_index(addr);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                        self.dirty = true;
                    }
                }
            }
            (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x7F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc3 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val;
            }
            (
                MbcState::Mbc3 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => {
                // Writing 0 then 1 snapshots the live clock.
                if val == 0 {
                    *latch_pending = true;
                } else if val == 1 && *latch_pending {
                    if let Some(rtc) = rtc {
                        rtc.sync(unix_now());
                        rtc.latch();
                    }
                    *latch_pending = false;
                } else {
                    *latch_pending = false;
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_enable {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                            if let Some(b) = self.ram.get_mut(idx) {
                                *b = val;
                                self.dirty = true;
                            }
                        }
                        0x08..=0x0C => {
                            if let Some(rtc) = rtc.as_mut() {
                                rtc.sync(unix_now());
                                rtc.write_register(*ram_bank, val);
                                self.dirty = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | val as u16;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x0F;
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    let idx = self.ram_index(addr);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                        self.dirty = true;
                    }
                }
            }
            _ => {}
        }
    }

    fn ram_index(&self, addr: u16) -> usize {
        let ram_bank_count = self.ram.len().div_ceil(0x2000);
        match &self.mbc_state {
            MbcState::RomOnly => addr as usize - 0xA000,
            MbcState::Mbc1 { ram_bank, mode, .. } => {
                if *mode == 0 || ram_bank_count == 0 {
                    addr as usize - 0xA000
                } else {
                    let bank = (*ram_bank as usize) % ram_bank_count;
                    bank * 0x2000 + addr as usize - 0xA000
                }
            }
            MbcState::Mbc3 { ram_bank, .. } => {
                ((*ram_bank as usize) & 0x03) * 0x2000 + addr as usize - 0xA000
            }
            MbcState::Mbc5 { ram_bank, .. } => {
                (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000
            }
        }
    }

    pub fn has_battery(&self) -> bool {
        matches!(self.cart_type, 0x03 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E)
    }

    pub fn has_rtc(&self) -> bool {
        matches!(self.cart_type, 0x0F | 0x10)
    }

    /// True once external RAM or RTC registers were written.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn export_ram(&self) -> Option<Vec<u8>> {
        (!self.ram.is_empty()).then(|| self.ram.clone())
    }

    pub fn import_ram(&mut self, data: &[u8]) {
        for (dst, src) in self.ram.iter_mut().zip(data.iter()) {
            *dst = *src;
        }
    }

    pub fn export_metadata(&mut self) -> Option<MapperMetadata> {
        match &mut self.mbc_state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => {
                rtc.sync(unix_now());
                Some(MapperMetadata::Mbc3RtcV1 {
                    rtc: rtc.snapshot(),
                })
            }
            _ => None,
        }
    }

    pub fn import_metadata(&mut self, meta: &MapperMetadata) {
        let MapperMetadata::Mbc3RtcV1 { rtc: snap } = meta;
        if let MbcState::Mbc3 {
            rtc: Some(rtc),
            latch_pending,
            ..
        } = &mut self.mbc_state
        {
            rtc.restore(snap);
            *latch_pending = false;
        }
    }
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, CartridgeError> {
        if data.len() < 0x150 {
            return Err(CartridgeError::TruncatedRom {
                expected: 0x150,
                actual: data.len(),
            });
        }
        Ok(Self { data })
    }

    fn title(&self) -> String {
        let mut slice = &self.data[0x0134..0x0144];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn cart_type(&self) -> u8 {
        self.data[0x0147]
    }

    fn mbc_type(&self) -> Result<MbcType, CartridgeError> {
        match self.cart_type() {
            0x00 => Ok(MbcType::RomOnly),
            0x01..=0x03 => Ok(MbcType::Mbc1),
            0x0F..=0x13 => Ok(MbcType::Mbc3),
            0x19..=0x1E => Ok(MbcType::Mbc5),
            code => Err(CartridgeError::UnsupportedCartridge { code }),
        }
    }

    fn has_rtc(&self) -> bool {
        matches!(self.cart_type(), 0x0F | 0x10)
    }

    fn rom_size(&self) -> Result<usize, CartridgeError> {
        match self.data[0x0148] {
            code @ 0x00..=0x08 => Ok(0x8000 << code),
            code => Err(CartridgeError::UnsupportedCartridge { code }),
        }
    }

    fn ram_size(&self) -> Result<usize, CartridgeError> {
        match self.data[0x0149] {
            0x00 => Ok(0),
            0x01 => Ok(0x800),   // 2KB
            0x02 => Ok(0x2000),  // 8KB
            0x03 => Ok(0x8000),  // 32KB (4 banks)
            0x04 => Ok(0x20000), // 128KB (16 banks)
            0x05 => Ok(0x10000), // 64KB (8 banks)
            code => Err(CartridgeError::UnsupportedCartridge { code }),
        }
    }
}
