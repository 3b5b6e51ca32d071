use dotmatrix_core::interrupts::Interrupts;
use dotmatrix_core::ppu::Ppu;

const SHADE_0: u32 = 0xFFE0_F8D0;
const SHADE_1: u32 = 0xFF88_C070;
const SHADE_3: u32 = 0xFF08_1820;

fn fresh() -> (Ppu, Interrupts) {
    let mut ints = Interrupts::new();
    ints.write_if(0);
    (Ppu::new(), ints)
}

#[test]
fn mode_sequence_from_reset() {
    let (mut ppu, mut ints) = fresh();
    ppu.step(79, &mut ints);
    assert_eq!(ppu.mode(), 2);
    ppu.step(1, &mut ints);
    assert_eq!(ppu.mode(), 3);
    ppu.step(171, &mut ints);
    assert_eq!(ppu.mode(), 3);
    ppu.step(1, &mut ints);
    assert_eq!(ppu.mode(), 0);
}

#[test]
fn line_advances_every_456_cycles() {
    let (mut ppu, mut ints) = fresh();
    ppu.step(456, &mut ints);
    assert_eq!(ppu.ly(), 1);
    ppu.step(456 * 9, &mut ints);
    assert_eq!(ppu.ly(), 10);
}

#[test]
fn vblank_interrupt_and_frame_flag() {
    let (mut ppu, mut ints) = fresh();
    ppu.step(456 * 144, &mut ints);
    assert_eq!(ppu.mode(), 1);
    assert_eq!(ppu.ly(), 144);
    assert!(ppu.frame_ready());
    assert_ne!(ints.read_if() & 0x01, 0);
}

#[test]
fn frame_wraps_after_154_lines() {
    let (mut ppu, mut ints) = fresh();
    ppu.step(456 * 154, &mut ints);
    assert_eq!(ppu.ly(), 0);
    assert_eq!(ppu.mode(), 2);
}

#[test]
fn lyc_coincidence_is_delayed_one_cycle() {
    let (mut ppu, mut ints) = fresh();
    ppu.write_reg(0xFF45, 2);
    ppu.write_reg(0xFF41, 0x40); // LYC source enabled

    ppu.step(456 * 2, &mut ints);
    assert_eq!(ppu.ly(), 2);
    // The comparison result is not visible yet.
    assert_eq!(ppu.read_reg(0xFF41) & 0x04, 0);
    assert_eq!(ints.read_if() & 0x02, 0);

    ppu.step(1, &mut ints);
    assert_ne!(ppu.read_reg(0xFF41) & 0x04, 0);
    assert_ne!(ints.read_if() & 0x02, 0);
}

#[test]
fn stat_interrupt_fires_on_rising_edge_only() {
    let (mut ppu, mut ints) = fresh();
    ppu.write_reg(0xFF41, 0x08); // mode-0 source

    ppu.step(80 + 172, &mut ints);
    assert_eq!(ppu.mode(), 0);
    assert_ne!(ints.read_if() & 0x02, 0);

    // The line stays asserted through HBlank: no second request.
    ints.write_if(0);
    ppu.step(100, &mut ints);
    assert_eq!(ints.read_if() & 0x02, 0);
}

#[test]
fn vblank_entry_pulses_mode2_stat_source() {
    let (mut ppu, mut ints) = fresh();
    // Enable only the mode-2 source, then cross into VBlank mid-line so the
    // OAM-scan edge of line 143 has long passed.
    ppu.write_reg(0xFF41, 0x20);
    ppu.step(456 * 143 + 300, &mut ints);
    ints.write_if(0);
    ppu.step(456 - 300 + 4, &mut ints);
    assert_eq!(ppu.mode(), 1);
    assert_ne!(ints.read_if() & 0x02, 0);
}

#[test]
fn oam_and_vram_gating_follows_mode() {
    let (mut ppu, mut ints) = fresh();
    assert_eq!(ppu.mode(), 2);
    assert!(!ppu.oam_accessible());
    assert!(ppu.vram_accessible());

    ppu.step(80, &mut ints);
    assert!(!ppu.oam_accessible());
    assert!(!ppu.vram_accessible());

    ppu.step(172, &mut ints);
    assert!(ppu.oam_accessible());
    assert!(ppu.vram_accessible());
}

#[test]
fn oam_blocks_one_cycle_before_next_line_scan() {
    let (mut ppu, mut ints) = fresh();
    // Run to one cycle before the end of line 0's HBlank.
    ppu.step(455, &mut ints);
    assert_eq!(ppu.mode(), 0);
    assert!(
        !ppu.oam_accessible(),
        "OAM must close during the final HBlank cycle"
    );
    ppu.step(1, &mut ints);
    assert_eq!(ppu.mode(), 2);
}

#[test]
fn lcd_disable_zeroes_line_and_emits_frame() {
    let (mut ppu, mut ints) = fresh();
    ppu.step(456 * 20 + 100, &mut ints);
    ppu.write_reg(0xFF40, 0x11); // bit 7 clear
    assert_eq!(ppu.ly(), 0);
    assert_eq!(ppu.read_reg(0xFF41) & 0x03, 0);
    assert!(ppu.frame_ready());

    // Frozen while disabled.
    ppu.step(10_000, &mut ints);
    assert_eq!(ppu.ly(), 0);
}

#[test]
fn lcd_reenable_shortens_first_line_by_two() {
    let (mut ppu, mut ints) = fresh();
    ppu.write_reg(0xFF40, 0x11);
    ppu.write_reg(0xFF40, 0x91);
    assert_eq!(ppu.ly(), 0);
    assert_eq!(ppu.mode(), 2);

    // Mode 3 runs one cycle short on the startup line.
    ppu.step(80, &mut ints);
    assert_eq!(ppu.mode(), 3);
    ppu.step(171, &mut ints);
    assert_eq!(ppu.mode(), 0);

    // Mode 0 is also one short: the line ends at 454 cycles.
    ppu.step(203, &mut ints);
    assert_eq!(ppu.ly(), 1);

    // The following line is back to the nominal budget.
    ppu.step(80, &mut ints);
    assert_eq!(ppu.mode(), 3);
    ppu.step(171, &mut ints);
    assert_eq!(ppu.mode(), 3);
    ppu.step(1, &mut ints);
    assert_eq!(ppu.mode(), 0);
}

#[test]
fn background_scanline_renders_through_bgp() {
    let (mut ppu, mut ints) = fresh();
    // Tile 1: solid color 3. Map cell (0,0) selects it.
    for row in 0..8 {
        ppu.vram[0x10 + row * 2] = 0xFF;
        ppu.vram[0x10 + row * 2 + 1] = 0xFF;
    }
    ppu.vram[0x1800] = 1;
    ppu.write_reg(0xFF47, 0xE4); // identity palette

    ppu.step(80 + 172, &mut ints); // render line 0
    let fb = ppu.framebuffer();
    assert_eq!(fb[0], SHADE_3);
    assert_eq!(fb[7], SHADE_3);
    // Neighboring map cell is tile 0 (all zero) -> shade 0.
    assert_eq!(fb[8], SHADE_0);
}

#[test]
fn sprite_renders_over_background_zero() {
    let (mut ppu, mut ints) = fresh();
    // Tile 2: solid color 1.
    for row in 0..8 {
        ppu.vram[0x20 + row * 2] = 0xFF;
    }
    // Sprite 0 at screen (0,0).
    ppu.oam[0] = 16;
    ppu.oam[1] = 8;
    ppu.oam[2] = 2;
    ppu.oam[3] = 0x00;
    ppu.write_reg(0xFF47, 0xE4);
    ppu.write_reg(0xFF48, 0xE4);

    ppu.step(80 + 172, &mut ints);
    let fb = ppu.framebuffer();
    assert_eq!(fb[0], SHADE_1);
    assert_eq!(fb[8], SHADE_0);
}

#[test]
fn behind_flag_hides_sprite_over_nonzero_background() {
    let (mut ppu, mut ints) = fresh();
    // Background: tile 1 solid color 3 in the first map cell.
    for row in 0..8 {
        ppu.vram[0x10 + row * 2] = 0xFF;
        ppu.vram[0x10 + row * 2 + 1] = 0xFF;
    }
    ppu.vram[0x1800] = 1;
    // Sprite tile 2: solid color 1, behind-BG flag set.
    for row in 0..8 {
        ppu.vram[0x20 + row * 2] = 0xFF;
    }
    // Sprite straddles the tile boundary: pixels 4..=11.
    ppu.oam[0] = 16;
    ppu.oam[1] = 12;
    ppu.oam[2] = 2;
    ppu.oam[3] = 0x80;
    ppu.write_reg(0xFF47, 0xE4);
    ppu.write_reg(0xFF48, 0xE4);

    ppu.step(80 + 172, &mut ints);
    let fb = ppu.framebuffer();
    // BG color 3 wins over a behind-BG sprite...
    assert_eq!(fb[4], SHADE_3);
    // ...but the sprite shows where BG color is 0 (second map cell).
    assert_eq!(fb[8], SHADE_1);
}

#[test]
fn sprite_priority_lower_x_wins() {
    let (mut ppu, mut ints) = fresh();
    // Tile 2: solid color 1; tile 3: solid color 3.
    for row in 0..8 {
        ppu.vram[0x20 + row * 2] = 0xFF;
        ppu.vram[0x30 + row * 2] = 0xFF;
        ppu.vram[0x30 + row * 2 + 1] = 0xFF;
    }
    // Sprite 0 (tile 3) at x=12, sprite 1 (tile 2) at x=8: sprite 1 sits
    // left and wins the overlap despite the higher OAM index.
    ppu.oam[0] = 16;
    ppu.oam[1] = 12;
    ppu.oam[2] = 3;
    ppu.oam[3] = 0;
    ppu.oam[4] = 16;
    ppu.oam[5] = 8;
    ppu.oam[6] = 2;
    ppu.oam[7] = 0;
    ppu.write_reg(0xFF47, 0xE4);
    ppu.write_reg(0xFF48, 0xE4);

    ppu.step(80 + 172, &mut ints);
    let fb = ppu.framebuffer();
    assert_eq!(fb[0], SHADE_1); // only sprite 1
    assert_eq!(fb[5], SHADE_1); // overlap: lower X wins
    assert_eq!(fb[9], SHADE_3); // past sprite 1's right edge
}

#[test]
fn at_most_ten_sprites_per_line() {
    let (mut ppu, mut ints) = fresh();
    for row in 0..8 {
        ppu.vram[0x20 + row * 2] = 0xFF;
    }
    // Twelve sprites on line 0, spaced 8px apart.
    for i in 0..12 {
        ppu.oam[i * 4] = 16;
        ppu.oam[i * 4 + 1] = 8 + (i as u8) * 8;
        ppu.oam[i * 4 + 2] = 2;
        ppu.oam[i * 4 + 3] = 0;
    }
    ppu.write_reg(0xFF47, 0xE4);
    ppu.write_reg(0xFF48, 0xE4);

    ppu.step(80 + 172, &mut ints);
    let fb = ppu.framebuffer();
    assert_eq!(fb[9 * 8], SHADE_1); // tenth sprite drawn
    assert_eq!(fb[10 * 8], SHADE_0); // eleventh dropped
}

#[test]
fn window_overlays_background() {
    let (mut ppu, mut ints) = fresh();
    // BG map all tile 1 (color 3); window map (bit 6 -> 0x1C00) tile 0.
    for row in 0..8 {
        ppu.vram[0x10 + row * 2] = 0xFF;
        ppu.vram[0x10 + row * 2 + 1] = 0xFF;
    }
    for cell in 0..32 {
        ppu.vram[0x1800 + cell] = 1;
    }
    ppu.write_reg(0xFF47, 0xE4);
    // Window enabled, window map at 0x1C00, starting at x=80 (WX=87).
    ppu.write_reg(0xFF40, 0xF1);
    ppu.write_reg(0xFF4A, 0);
    ppu.write_reg(0xFF4B, 87);

    ppu.step(80 + 172, &mut ints);
    let fb = ppu.framebuffer();
    assert_eq!(fb[79], SHADE_3);
    assert_eq!(fb[80], SHADE_0);
}
