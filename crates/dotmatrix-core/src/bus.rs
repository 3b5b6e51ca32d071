use crate::{
    apu::Apu,
    cartridge::Cartridge,
    interrupts::Interrupts,
    joypad::{Button, Joypad},
    ppu::Ppu,
    serial::Serial,
    timer::Timer,
};

const WRAM_SIZE: usize = 0x2000;
const HRAM_SIZE: usize = 0x7F;

/// Cycles between the 0xFF46 write and the first byte moving.
const OAM_DMA_START_DELAY: u16 = 12;
/// Cycles between the 0xFF46 write and the bus block asserting (one M-cycle).
const OAM_DMA_BLOCK_DELAY: u16 = 4;
const OAM_DMA_BYTES: u16 = 0xA0;

struct OamDma {
    active: bool,
    source: u16,
    index: u16,
    cycles: u16,
    start_delay: u16,
    block_delay: u16,
    /// Last page written to 0xFF46, for register readback.
    reg: u8,
}

impl OamDma {
    fn new() -> Self {
        Self {
            active: false,
            source: 0,
            index: 0,
            cycles: 0,
            start_delay: 0,
            block_delay: 0,
            reg: 0xFF,
        }
    }
}

pub struct Bus {
    pub wram: [u8; WRAM_SIZE],
    pub hram: [u8; HRAM_SIZE],
    pub cart: Option<Cartridge>,
    pub interrupts: Interrupts,
    pub serial: Serial,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub joypad: Joypad,
    dma: OamDma,
}

impl Bus {
    pub fn new() -> Self {
        let mut timer = Timer::new();
        // Post-boot DIV phase, as measured on DMG hardware.
        timer.div = 0xABCC;

        Self {
            wram: [0; WRAM_SIZE],
            hram: [0; HRAM_SIZE],
            cart: None,
            interrupts: Interrupts::new(),
            serial: Serial::new(),
            ppu: Ppu::new(),
            apu: Apu::new(),
            timer,
            joypad: Joypad::new(),
            dma: OamDma::new(),
        }
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    pub fn save_cart_ram(&mut self) {
        if let Some(cart) = &mut self.cart
            && let Err(e) = cart.save_ram()
        {
            log::warn!("failed to save cartridge RAM: {e}");
        }
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.joypad.set_button(button, pressed, &mut self.interrupts);
    }

    /// Advance every subsystem by `cycles` CPU cycles, timer bucket first.
    pub fn tick(&mut self, cycles: u16) {
        self.timer.step(cycles, &mut self.interrupts);
        self.dma_step(cycles);
        self.ppu.step(cycles as u32, &mut self.interrupts);
        self.serial.step(cycles, &mut self.interrupts);
        self.apu.step(cycles);
    }

    /// True while an OAM DMA transfer is in flight (including the start
    /// delay).
    pub fn dma_active(&self) -> bool {
        self.dma.active
    }

    /// True once the transfer blocks the bus; the block lags the triggering
    /// write by one M-cycle.
    fn dma_blocking(&self) -> bool {
        self.dma.active && self.dma.block_delay == 0
    }

    fn dma_source_in_vram(&self) -> bool {
        (0x8000..=0x9FFF).contains(&self.dma.source)
    }

    /// The byte the DMA engine currently drives on the external bus.
    fn dma_bus_byte(&mut self) -> u8 {
        let addr = self.dma.source.wrapping_add(self.dma.index.min(OAM_DMA_BYTES - 1));
        self.dma_read(addr)
    }

    /// Read for the DMA engine itself: ignores mode/DMA gating, and folds the
    /// region above echo RAM back down onto it.
    fn dma_read(&mut self, addr: u16) -> u8 {
        let addr = if addr >= 0xFE00 {
            addr.wrapping_sub(0x2000)
        } else {
            addr
        };
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                self.cart.as_mut().map(|c| c.read(addr)).unwrap_or(0xFF)
            }
            0x8000..=0x9FFF => self.ppu.vram[(addr - 0x8000) as usize],
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize],
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize],
            _ => 0xFF,
        }
    }

    /// Advance the ongoing OAM DMA transfer if active.
    pub fn dma_step(&mut self, cycles: u16) {
        for _ in 0..cycles {
            if !self.dma.active {
                return;
            }
            if self.dma.block_delay > 0 {
                self.dma.block_delay -= 1;
            }
            if self.dma.start_delay > 0 {
                self.dma.start_delay -= 1;
                continue;
            }
            self.dma.cycles += 1;
            if self.dma.cycles >= 4 {
                self.dma.cycles -= 4;
                let byte = self.dma_read(self.dma.source.wrapping_add(self.dma.index));
                // The engine's OAM writes always land, even while CPU access
                // is blocked.
                self.ppu.oam[self.dma.index as usize] = byte;
                self.dma.index += 1;
                if self.dma.index == OAM_DMA_BYTES {
                    self.dma.active = false;
                }
            }
        }
    }

    fn start_dma(&mut self, page: u8) {
        let restart = self.dma.active;
        self.dma.reg = page;
        self.dma.source = (page as u16) << 8;
        self.dma.index = 0;
        self.dma.cycles = 0;
        self.dma.start_delay = OAM_DMA_START_DELAY;
        if !restart {
            self.dma.block_delay = OAM_DMA_BLOCK_DELAY;
        }
        // On restart the block stays asserted through the new delay.
        self.dma.active = true;
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        if self.dma_blocking() {
            match addr {
                0xFE00..=0xFEFF => return 0xFF,
                0x8000..=0x9FFF if self.dma_source_in_vram() => return 0xFF,
                0xFF80..=0xFFFE => {}
                _ if !self.dma_source_in_vram() => {
                    // The external bus is owned by the DMA engine: every read
                    // observes the byte it is currently fetching.
                    return self.dma_bus_byte();
                }
                _ => {}
            }
        }

        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                self.cart.as_mut().map(|c| c.read(addr)).unwrap_or(0xFF)
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[(addr - 0x8000) as usize]
                } else {
                    0xFF
                }
            }
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize],
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize],
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize]
                } else {
                    0xFF
                }
            }
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00 => self.joypad.read(),
            0xFF01 | 0xFF02 => self.serial.read(addr),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.interrupts.read_if(),
            0xFF10..=0xFF3F => self.apu.read_reg(addr),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B => self.ppu.read_reg(addr),
            0xFF46 => self.dma.reg,
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.interrupts.read_ie(),
            _ => 0xFF,
        }
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        if self.dma_blocking() {
            match addr {
                0xFE00..=0xFEFF => return,
                // The DMA register itself stays reachable so an active
                // transfer can be restarted.
                0xFF46 | 0xFF80..=0xFFFE => {}
                _ if !self.dma_source_in_vram() => return,
                _ => {}
            }
        }

        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val);
                }
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[(addr - 0x8000) as usize] = val;
                }
            }
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize] = val,
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize] = val,
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize] = val;
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00 => self.joypad.write(val, &mut self.interrupts),
            0xFF01 | 0xFF02 => self.serial.write(addr, val),
            0xFF04..=0xFF07 => self.timer.write(addr, val, &mut self.interrupts),
            0xFF0F => self.interrupts.write_if(val),
            0xFF10..=0xFF3F => self.apu.write_reg(addr, val),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B => self.ppu.write_reg(addr, val),
            0xFF46 => self.start_dma(val),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.interrupts.write_ie(val),
            _ => {}
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
