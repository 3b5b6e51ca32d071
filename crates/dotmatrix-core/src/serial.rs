use crate::interrupts::{Interrupt, Interrupts};

/// CPU cycles for a full 8-bit transfer on the internal 8192 Hz clock.
const TRANSFER_CYCLES: u32 = 4096;

/// Serial port registers (SB/SC) and transfer scheduling.
///
/// No link partner is modeled: the receive line is held high, so a completed
/// transfer always shifts in 0xFF. Transfers clocked externally never make
/// progress.
pub struct Serial {
    sb: u8,
    sc: u8,
    out_buf: Vec<u8>,
    transfer: Option<TransferState>,
}

struct TransferState {
    remaining: u32,
    outgoing: u8,
    internal_clock: bool,
}

impl Serial {
    pub fn new() -> Self {
        Self {
            sb: 0,
            sc: 0x7E,
            out_buf: Vec::new(),
            transfer: None,
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF01 => self.sb,
            0xFF02 => self.sc | 0x7E,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF01 => self.sb = val,
            0xFF02 => {
                self.sc = val;
                if val & 0x80 != 0 {
                    // A write with the start bit set (re)arms the transfer
                    // using the current SB contents.
                    self.transfer = Some(TransferState {
                        remaining: TRANSFER_CYCLES,
                        outgoing: self.sb,
                        internal_clock: val & 0x01 != 0,
                    });
                } else {
                    self.transfer = None;
                }
            }
            _ => {}
        }
    }

    /// Advance an in-flight transfer by `cycles` CPU cycles.
    pub fn step(&mut self, cycles: u16, ints: &mut Interrupts) {
        let Some(state) = self.transfer.as_mut() else {
            return;
        };
        if !state.internal_clock {
            // External clock: no partner supplies pulses, so the start bit
            // stays asserted indefinitely.
            return;
        }
        state.remaining = state.remaining.saturating_sub(cycles as u32);
        if state.remaining > 0 {
            return;
        }

        let state = self.transfer.take().unwrap();
        self.out_buf.push(state.outgoing);
        // Disconnected receive shifts in all ones.
        self.sb = 0xFF;
        self.sc &= 0x7F;
        ints.request(Interrupt::Serial);
    }

    /// Cumulative log of transmitted bytes rendered as ASCII.
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.out_buf).into_owned()
    }

    pub fn peek_output(&self) -> &[u8] {
        &self.out_buf
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out_buf)
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}
