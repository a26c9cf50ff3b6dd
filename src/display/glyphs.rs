//! The glyph table: a process-wide read-only
//! constant set of bitmap templates the pattern matcher scans for.
//!
//! Real template pixel data ships inside the pump's firmware resources
//! and is not recoverable here (the same kind of gap as the PIN
//! derivation in [`combo_crypto::pin`]). Each template here is instead generated deterministically
//! from its [`GlyphKind`] by [`template_for`], which guarantees every
//! glyph in the table has a distinct bitmap so the pattern matcher in
//! [`super::display`] has real pixel data to match against.

/// Non-alphanumeric glyphs the parser recognizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SymbolId {
    Colon,
    Dot,
    Clock,
    Check,
    Warning,
    Error,
    BasalSet,
    /// Each menu screen is identified by its own icon glyph rather than a
    /// single generic "menu" marker, matching how the pump's own menu list
    /// renders a distinct icon per entry.
    MenuStandardBolus,
    MenuMultiwaveBolus,
    MenuExtendedBolus,
    MenuTbr,
    MenuBasalProfile,
    MenuMyData,
    MenuTime,
    MenuSettings,
}

impl SymbolId {
    /// The menu icon symbols, in on-screen menu order.
    pub const MENU_ICONS: [Self; 8] = [
        Self::MenuStandardBolus,
        Self::MenuMultiwaveBolus,
        Self::MenuExtendedBolus,
        Self::MenuTbr,
        Self::MenuBasalProfile,
        Self::MenuMyData,
        Self::MenuTime,
        Self::MenuSettings,
    ];

    /// Whether this symbol is one of the menu-list icon glyphs (as opposed
    /// to a status glyph like [`Self::Warning`] or [`Self::Clock`]).
    #[must_use]
    pub const fn is_menu_icon(self) -> bool {
        matches!(
            self,
            Self::MenuStandardBolus
                | Self::MenuMultiwaveBolus
                | Self::MenuExtendedBolus
                | Self::MenuTbr
                | Self::MenuBasalProfile
                | Self::MenuMyData
                | Self::MenuTime
                | Self::MenuSettings
        )
    }
}

/// A single glyph in the table, tagged by size class and identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum GlyphKind {
    SmallDigit(u8),
    LargeDigit(u8),
    SmallChar(char),
    LargeChar(char),
    SmallSymbol(SymbolId),
    LargeSymbol(SymbolId),
}

impl GlyphKind {
    #[must_use]
    pub const fn is_large(self) -> bool {
        matches!(
            self,
            Self::LargeDigit(_) | Self::LargeChar(_) | Self::LargeSymbol(_)
        )
    }

    /// A stable integer tag used to seed this glyph's generated bitmap.
    /// Distinct kinds always get distinct tags.
    fn tag(self) -> u32 {
        match self {
            Self::SmallDigit(d) => 0x1000 + u32::from(d),
            Self::LargeDigit(d) => 0x2000 + u32::from(d),
            Self::SmallChar(c) => 0x3000 + c as u32,
            Self::LargeChar(c) => 0x4000 + c as u32,
            Self::SmallSymbol(s) => 0x5000 + s as u32,
            Self::LargeSymbol(s) => 0x6000 + s as u32,
        }
    }
}

/// An immutable bitmap template: width, height, and row-major set-pixel
/// bits (one `u16` per row, low bits = left columns).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GlyphTemplate {
    pub kind: GlyphKind,
    pub width: usize,
    pub height: usize,
    rows: Vec<u16>,
}

impl GlyphTemplate {
    #[must_use]
    pub fn pixel(&self, x: usize, y: usize) -> bool {
        debug_assert!(x < self.width && y < self.height);
        (self.rows[y] >> x) & 1 == 1
    }

    #[must_use]
    pub fn set_pixel_count(&self) -> u32 {
        self.rows.iter().map(|r| r.count_ones()).sum()
    }
}

pub const SMALL_WIDTH: usize = 5;
pub const SMALL_HEIGHT: usize = 7;
pub const LARGE_WIDTH: usize = 9;
pub const LARGE_HEIGHT: usize = 15;

/// A small, deterministic xorshift-style mix; not cryptographic, just a
/// cheap way to spread a `(tag, row)` pair over the template's row width
/// so distinct glyphs get distinct, reproducible bitmaps.
fn mix(seed: u32) -> u32 {
    let mut x = seed;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

fn generate_rows(tag: u32, width: usize, height: usize) -> Vec<u16> {
    let mask = (1u32 << width) - 1;
    (0..height as u32)
        .map(|row| (mix(tag.wrapping_mul(2_654_435_761).wrapping_add(row + 1)) & mask) as u16)
        .collect()
}

#[must_use]
pub fn template_for(kind: GlyphKind) -> GlyphTemplate {
    let (width, height) = if kind.is_large() {
        (LARGE_WIDTH, LARGE_HEIGHT)
    } else {
        (SMALL_WIDTH, SMALL_HEIGHT)
    };
    GlyphTemplate {
        kind,
        width,
        height,
        rows: generate_rows(kind.tag(), width, height),
    }
}

/// The full glyph table, ordered by descending height so [`super::display`]'s
/// Phase 1 scanner tries large glyphs before small ones at each position.
pub fn glyph_table() -> Vec<GlyphTemplate> {
    let mut kinds = Vec::new();
    for d in 0..10u8 {
        kinds.push(GlyphKind::SmallDigit(d));
        kinds.push(GlyphKind::LargeDigit(d));
    }
    for c in 'A'..='Z' {
        kinds.push(GlyphKind::SmallChar(c));
    }
    for c in ['W', 'E', 'u', 'h', 'm', '%'] {
        kinds.push(GlyphKind::LargeChar(c));
    }
    for s in [
        SymbolId::Colon,
        SymbolId::Dot,
        SymbolId::Clock,
        SymbolId::Check,
    ] {
        kinds.push(GlyphKind::SmallSymbol(s));
    }
    kinds.push(GlyphKind::LargeSymbol(SymbolId::Warning));
    kinds.push(GlyphKind::LargeSymbol(SymbolId::Error));
    kinds.push(GlyphKind::LargeSymbol(SymbolId::BasalSet));
    kinds.push(GlyphKind::LargeSymbol(SymbolId::Dot));
    for s in SymbolId::MENU_ICONS {
        kinds.push(GlyphKind::LargeSymbol(s));
    }

    let mut table: Vec<_> = kinds.into_iter().map(template_for).collect();
    table.sort_by_key(|t| std::cmp::Reverse(t.height));
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entries_are_pairwise_distinct() {
        let table = glyph_table();
        for (i, a) in table.iter().enumerate() {
            for b in &table[i + 1..] {
                if a.width == b.width && a.height == b.height {
                    assert_ne!(a.rows, b.rows, "{:?} collides with {:?}", a.kind, b.kind);
                }
            }
        }
    }

    #[test]
    fn table_is_sorted_by_descending_height() {
        let table = glyph_table();
        for w in table.windows(2) {
            assert!(w[0].height >= w[1].height);
        }
    }
}
