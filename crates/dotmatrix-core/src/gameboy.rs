use crate::{
    bus::Bus,
    cartridge::{Cartridge, CartridgeError, MapperMetadata},
    cpu::Cpu,
    diagnostics::Snapshot,
    joypad::Button,
    ppu::{SCREEN_HEIGHT, SCREEN_WIDTH},
};

/// Cycles per full frame (456 dots x 154 lines).
const FRAME_CYCLES: u64 = 70_224;

pub type FrameBuffer = [u32; SCREEN_WIDTH * SCREEN_HEIGHT];
pub type FrameObserver = Box<dyn FnMut(&FrameBuffer)>;

pub struct GameBoy {
    pub cpu: Cpu,
    pub bus: Bus,
    frame_observers: Vec<FrameObserver>,
}

impl GameBoy {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            frame_observers: Vec::new(),
        }
    }

    /// Install a cartridge image, replacing any prior installation.
    pub fn load_rom(&mut self, data: Vec<u8>) -> Result<(), CartridgeError> {
        let cart = Cartridge::load(data)?;
        self.bus.load_cart(cart);
        Ok(())
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.bus.load_cart(cart);
    }

    /// Reset to the documented DMG power-on state while preserving the loaded
    /// cartridge and registered frame observers.
    pub fn reset(&mut self) {
        let cart = self.bus.cart.take();
        let sample_rate = self.bus.apu.sample_rate();
        self.cpu = Cpu::new();
        self.bus = Bus::new();
        self.bus.apu.set_sample_rate(sample_rate);
        if let Some(cart) = cart {
            self.bus.load_cart(cart);
        }
    }

    /// Run one CPU step and fan the cycles out to every subsystem. Returns
    /// the number of cycles the step consumed.
    pub fn step(&mut self) -> u64 {
        let before = self.cpu.cycles;
        self.cpu.step(&mut self.bus);
        self.service_frame();
        self.cpu.cycles - before
    }

    /// Drive the machine for at least `cycles` cycles. The final instruction
    /// may run past the budget; a partial instruction never occurs.
    pub fn run_for(&mut self, cycles: u64) {
        let target = self.cpu.cycles + cycles;
        while self.cpu.cycles < target {
            self.cpu.step(&mut self.bus);
            self.service_frame();
        }
    }

    /// Drive the machine until the pixel unit signals a completed frame.
    /// Bounded to two frames' worth of cycles so a disabled LCD cannot spin
    /// forever.
    pub fn step_frame(&mut self) {
        let start = self.cpu.cycles;
        loop {
            self.cpu.step(&mut self.bus);
            if self.service_frame() {
                break;
            }
            if self.cpu.cycles - start >= FRAME_CYCLES * 2 {
                break;
            }
        }
    }

    fn service_frame(&mut self) -> bool {
        if !self.bus.ppu.frame_ready() {
            return false;
        }
        self.bus.ppu.clear_frame_flag();
        for observer in &mut self.frame_observers {
            observer(self.bus.ppu.framebuffer());
        }
        true
    }

    /// Register a callback invoked with the 160x144 ARGB buffer at each
    /// frame boundary.
    pub fn add_frame_observer(&mut self, observer: FrameObserver) {
        self.frame_observers.push(observer);
    }

    pub fn framebuffer(&self) -> &FrameBuffer {
        self.bus.ppu.framebuffer()
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.bus.set_button(button, pressed);
    }

    /// Configure the audio output rate (frames per second of host audio).
    pub fn set_sample_rate(&mut self, rate: u32) {
        self.bus.apu.set_sample_rate(rate);
    }

    /// Move up to `out.len() / 2` frames of interleaved stereo audio into
    /// `out`; returns the frame count.
    pub fn drain_audio(&mut self, out: &mut [f32]) -> usize {
        self.bus.apu.samples().drain_into(out)
    }

    /// Cumulative ASCII transcript of the serial port's transmitted bytes.
    pub fn serial_output(&self) -> String {
        self.bus.serial.output_string()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.cpu, &self.bus)
    }

    /// Export battery RAM and mapper metadata for the save-persistence
    /// collaborator.
    pub fn export_save(&mut self) -> (Option<Vec<u8>>, Option<MapperMetadata>) {
        match self.bus.cart.as_mut() {
            Some(cart) => (cart.export_ram(), cart.export_metadata()),
            None => (None, None),
        }
    }

    pub fn import_save(&mut self, ram: Option<&[u8]>, metadata: Option<&MapperMetadata>) {
        if let Some(cart) = self.bus.cart.as_mut() {
            if let Some(ram) = ram {
                cart.import_ram(ram);
            }
            if let Some(meta) = metadata {
                cart.import_metadata(meta);
            }
        }
    }

    /// Persist battery RAM / RTC sidecars for file-loaded cartridges.
    pub fn save_ram(&mut self) {
        self.bus.save_cart_ram();
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}
