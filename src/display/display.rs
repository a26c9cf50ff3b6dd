//! Display-frame parser: two-dimensional template
//! matching over a 96x32 monochrome bitmap, followed by token-stream
//! parsing of the resulting glyph positions into a typed [`ParsedScreen`].

pub mod glyphs;
pub mod locale;

use glyphs::{GlyphKind, SymbolId};
use locale::{resolve_title, TitleContext, TitleId};

use crate::error::FrameParseError;
use crate::Error;

/// On-screen bitmap width, in pixels.
pub const FRAME_WIDTH: usize = 96;
/// On-screen bitmap height, in pixels.
pub const FRAME_HEIGHT: usize = 32;

/// A 96x32 monochrome bitmap, as redrawn by the pump each time its RT
/// display changes. Compared pixel-for-pixel only as
/// the last-resort equality used by the screen stream's dedup filter
/// when both frames parse as [`ParsedScreen::Unrecognized`].
#[derive(Clone, Eq, PartialEq)]
pub struct DisplayFrame {
    pixels: Vec<bool>,
}

impl DisplayFrame {
    /// An all-off frame.
    #[must_use]
    pub fn blank() -> Self {
        Self {
            pixels: vec![false; FRAME_WIDTH * FRAME_HEIGHT],
        }
    }

    /// Builds a frame from a row-major pixel vector.
    ///
    /// # Panics
    /// Panics if `pixels.len() != FRAME_WIDTH * FRAME_HEIGHT`.
    #[must_use]
    pub fn from_pixels(pixels: Vec<bool>) -> Self {
        assert_eq!(pixels.len(), FRAME_WIDTH * FRAME_HEIGHT, "frame size mismatch");
        Self { pixels }
    }

    /// Reconstructs a frame from the reassembled RT_DISPLAY wire payload:
    /// row-major, MSB-first packed bits, `FRAME_WIDTH / 8` bytes per row
    /// (this follows the pump's otherwise-consistent big-endian-bit
    /// convention -- see `DESIGN.md`).
    pub fn from_packed_bits(bytes: &[u8]) -> crate::Result<Self> {
        let row_bytes = FRAME_WIDTH / 8;
        if bytes.len() < row_bytes * FRAME_HEIGHT {
            return Err(Error::Protocol("RT_DISPLAY payload too short".into()));
        }
        let mut pixels = vec![false; FRAME_WIDTH * FRAME_HEIGHT];
        for y in 0..FRAME_HEIGHT {
            for x in 0..FRAME_WIDTH {
                let byte = bytes[y * row_bytes + x / 8];
                let bit = 7 - (x % 8);
                pixels[y * FRAME_WIDTH + x] = (byte >> bit) & 1 == 1;
            }
        }
        Ok(Self { pixels })
    }

    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> bool {
        self.pixels[y * FRAME_WIDTH + x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: bool) {
        self.pixels[y * FRAME_WIDTH + x] = value;
    }

    /// ORs a glyph template's pixels into the frame at `(x, y)`, used by
    /// tests to build synthetic screens out of the glyph table.
    ///
    /// # Panics
    /// Panics if the template does not fit within the frame at `(x, y)`.
    pub fn stamp(&mut self, template: &glyphs::GlyphTemplate, x: usize, y: usize) {
        assert!(x + template.width <= FRAME_WIDTH && y + template.height <= FRAME_HEIGHT);
        for row in 0..template.height {
            for col in 0..template.width {
                if template.pixel(col, row) {
                    self.set(x + col, y + row, true);
                }
            }
        }
    }
}

impl std::fmt::Debug for DisplayFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "DisplayFrame {{")?;
        for y in 0..FRAME_HEIGHT {
            for x in 0..FRAME_WIDTH {
                write!(f, "{}", if self.get(x, y) { '#' } else { '.' })?;
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

/// One resolved template match: a glyph identity at a
/// top-left position, with the size metadata needed for overlap
/// resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PatternMatch {
    pub kind: GlyphKind,
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
    pub set_pixels: u32,
}

fn template_matches_at(frame: &DisplayFrame, template: &glyphs::GlyphTemplate, x: usize, y: usize) -> bool {
    for row in 0..template.height {
        for col in 0..template.width {
            if frame.get(x + col, y + row) != template.pixel(col, row) {
                return false;
            }
        }
    }
    true
}

/// Phase 1: scans `frame` left-to-right,
/// top-to-bottom, trying the glyph table (already ordered by descending
/// height) at every position; on a pixel-exact match, records it and
/// advances past the matched glyph's width. Overlaps between the raw
/// matches are then resolved by [`resolve_overlaps`].
#[must_use]
pub fn scan(frame: &DisplayFrame) -> Vec<PatternMatch> {
    let table = glyphs::glyph_table();
    let mut raw = Vec::new();
    for y in 0..FRAME_HEIGHT {
        let mut x = 0;
        while x < FRAME_WIDTH {
            let mut advance = 1;
            for template in &table {
                if x + template.width <= FRAME_WIDTH
                    && y + template.height <= FRAME_HEIGHT
                    && template_matches_at(frame, template, x, y)
                {
                    raw.push(PatternMatch {
                        kind: template.kind,
                        x,
                        y,
                        width: template.width,
                        height: template.height,
                        set_pixels: template.set_pixel_count(),
                    });
                    advance = template.width.saturating_sub(1).max(1);
                    break;
                }
            }
            x += advance;
        }
    }
    resolve_overlaps(raw)
}

fn boxes_overlap(a: &PatternMatch, b: &PatternMatch) -> bool {
    a.x < b.x + b.width && b.x < a.x + a.width && a.y < b.y + b.height && b.y < a.y + a.height
}

/// `(is_large, set_pixels)`, used so a larger priority tuple always wins:
/// large beats small regardless of pixel count; among equal size, more set
/// pixels wins.
fn overlap_priority(m: &PatternMatch) -> (u8, u32) {
    (u8::from(m.kind.is_large()), m.set_pixels)
}

/// Resolves overlapping raw matches by a two-rule priority policy, keeping
/// the highest-priority match at each contested position and returning the
/// survivors ordered by `(y, x)`.
#[must_use]
pub fn resolve_overlaps(matches: Vec<PatternMatch>) -> Vec<PatternMatch> {
    let mut order: Vec<usize> = (0..matches.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(overlap_priority(&matches[i])));
    let mut kept: Vec<PatternMatch> = Vec::new();
    for i in order {
        let candidate = matches[i];
        if !kept.iter().any(|k| boxes_overlap(&candidate, k)) {
            kept.push(candidate);
        }
    }
    kept.sort_by_key(|m| (m.y, m.x));
    kept
}

/// Which insulin reservoir band a quickinfo reading falls into. The pump
/// distinguishes these with a dedicated icon this corpus cannot recover
/// (see `DESIGN.md`); derived here from the parsed unit count instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReservoirState {
    Full,
    Low,
    Empty,
}

impl ReservoirState {
    const FULL_THRESHOLD: u32 = 200;
    const LOW_THRESHOLD: u32 = 50;

    fn from_units(units: u32) -> Self {
        if units >= Self::FULL_THRESHOLD {
            Self::Full
        } else if units >= Self::LOW_THRESHOLD {
            Self::Low
        } else {
            Self::Empty
        }
    }
}

/// What the pump's main (home) screen currently shows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MainScreen {
    Normal,
    Stopped,
    Tbr,
}

/// A recognized RT menu-list entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MenuId {
    StandardBolus,
    MultiwaveBolus,
    ExtendedBolus,
    Tbr,
    /// Basal rate profile 1-5, as selected by the large digit following
    /// the profile menu icon.
    BasalRateProfile(u8),
    MyData,
    Time,
    Settings,
}

impl MenuId {
    const fn from_symbol(symbol: SymbolId) -> Option<Self> {
        Some(match symbol {
            SymbolId::MenuStandardBolus => Self::StandardBolus,
            SymbolId::MenuMultiwaveBolus => Self::MultiwaveBolus,
            SymbolId::MenuExtendedBolus => Self::ExtendedBolus,
            SymbolId::MenuTbr => Self::Tbr,
            SymbolId::MenuMyData => Self::MyData,
            SymbolId::MenuTime => Self::Time,
            SymbolId::MenuSettings => Self::Settings,
            SymbolId::MenuBasalProfile => return None, // needs the trailing digit
            _ => return None,
        })
    }
}

/// A fully recognized RT screen. `Unrecognized` is the
/// fallback when none of the Phase 2 parsers matches the token stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParsedScreen {
    Main(MainScreen),
    AlertWarning(u32),
    AlertError(u32),
    BasalRateTotal(u32),
    BasalRateFactorSetting { begin_hour: u8, end_hour: u8, units: u32 },
    TbrPercentage(Option<u16>),
    TbrDuration { hours: u8, minutes: u8 },
    QuickinfoMain { units: u32, reservoir: ReservoirState },
    TimeAndDateHour(u8),
    TimeAndDateMinute(u8),
    TimeAndDateYear(u16),
    TimeAndDateMonth(u8),
    TimeAndDateDay(u8),
    MenuScreen(MenuId),
    Unrecognized,
}

/// Parses an integer decimal string: `"12" -> 12000`, `"0.22" -> 220`,
/// `"4.11" -> 4110`. Insulin units are
/// integer-encoded with an implicit 3-digit fraction; a value with no dot
/// is multiplied by 1000, and a fractional part shorter than 3 digits is
/// zero-padded on the right.
#[must_use]
pub fn parse_decimal(s: &str) -> Option<u32> {
    if let Some((int_part, frac_part)) = s.split_once('.') {
        let int_val: u32 = int_part.parse().ok()?;
        if frac_part.len() > 3 || !frac_part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let mut frac = frac_part.to_string();
        while frac.len() < 3 {
            frac.push('0');
        }
        let frac_val: u32 = frac.parse().ok()?;
        Some(int_val * 1000 + frac_val)
    } else {
        s.parse::<u32>().ok().map(|v| v * 1000)
    }
}

/// Parses `"HH:MM"`, `"HH:MM(AM|PM)"`, or `"HH(AM|PM)"` into 24-hour
/// `(hour, minute)`: 12 AM is hour 0,
/// 12 PM is hour 12, otherwise PM adds 12.
#[must_use]
pub fn parse_time(s: &str) -> Option<(u8, u8)> {
    let upper = s.to_ascii_uppercase();
    let (digits, meridiem) = if let Some(rest) = upper.strip_suffix("AM") {
        (rest, Some(false))
    } else if let Some(rest) = upper.strip_suffix("PM") {
        (rest, Some(true))
    } else {
        (upper.as_str(), None)
    };
    let (h_str, m_str) = digits.split_once(':').unwrap_or((digits, "0"));
    let mut hour: u32 = h_str.parse().ok()?;
    let minute: u32 = m_str.parse().ok()?;
    if let Some(is_pm) = meridiem {
        hour %= 12;
        if is_pm {
            hour += 12;
        }
    }
    Some((u8::try_from(hour).ok()?, u8::try_from(minute).ok()?))
}

/// Renders a run of matches into an uppercased string, inserting a space
/// wherever the gap between consecutive matches exceeds one pattern width
/// or the row changes.
fn matches_to_string(matches: &[PatternMatch]) -> String {
    let mut out = String::new();
    let mut prev: Option<&PatternMatch> = None;
    for m in matches {
        if let Some(p) = prev {
            let gap = i64::try_from(m.x).unwrap_or(0) - i64::try_from(p.x + p.width).unwrap_or(0);
            if m.y != p.y || gap > i64::try_from(p.width).unwrap_or(0) {
                out.push(' ');
            }
        }
        match m.kind {
            GlyphKind::SmallDigit(d) | GlyphKind::LargeDigit(d) => {
                out.push(char::from(b'0' + d));
            }
            GlyphKind::SmallChar(c) | GlyphKind::LargeChar(c) => out.push(c.to_ascii_uppercase()),
            GlyphKind::SmallSymbol(SymbolId::Colon) | GlyphKind::LargeSymbol(SymbolId::Colon) => {
                out.push(':');
            }
            GlyphKind::SmallSymbol(SymbolId::Dot) | GlyphKind::LargeSymbol(SymbolId::Dot) => {
                out.push('.');
            }
            _ => {}
        }
        prev = Some(m);
    }
    out
}

/// Splits a leading run of [`GlyphKind::SmallChar`] matches off `matches`,
/// returning the uppercased title text and the remaining (unconsumed)
/// matches.
fn split_leading_title(matches: &[PatternMatch]) -> (String, &[PatternMatch]) {
    let count = matches
        .iter()
        .take_while(|m| matches!(m.kind, GlyphKind::SmallChar(_)))
        .count();
    (matches_to_string(&matches[..count]), &matches[count..])
}

fn validation_error(frame: &DisplayFrame, reason: impl Into<String>) -> FrameParseError {
    FrameParseError {
        reason: reason.into(),
        frame: frame.clone(),
    }
}

/// Tries each screen parser in the documented order; the first to
/// recognize the token stream wins. Returns `Unrecognized` if none
/// match, or a [`FrameParseError`] if a recognized screen carries an
/// out-of-range value (reservoir > 350 IU, basal profile number outside
/// 1..=5).
///
/// `title_context` disambiguates a title string that the locale table
/// maps to more than one [`TitleId`]; pass the context of whatever field
/// the caller is currently navigating toward, or `None` when the caller
/// isn't mid-navigation (e.g. while just observing the screen stream).
pub fn parse_screen(
    frame: &DisplayFrame,
    title_context: Option<TitleContext>,
) -> Result<ParsedScreen, FrameParseError> {
    let matches = scan(frame);
    if matches.is_empty() {
        return Ok(ParsedScreen::Unrecognized);
    }

    if matches[0].kind == GlyphKind::SmallSymbol(SymbolId::Clock) {
        if let Some(screen) = try_basal_rate_factor_setting(&matches)? {
            return Ok(screen);
        }
        return Ok(try_main_screen(&matches));
    }

    if let Some(screen) = try_menu_screen(&matches, frame)? {
        return Ok(screen);
    }
    if let Some(screen) = try_title_screen(&matches, frame, title_context)? {
        return Ok(screen);
    }
    if let Some(screen) = try_warning_error_screen(&matches) {
        return Ok(screen);
    }
    if let Some(screen) = try_basal_rate_total(&matches) {
        return Ok(screen);
    }
    Ok(ParsedScreen::Unrecognized)
}

/// Rule 1b: a clock-prefixed screen with no IU indicator is the main/home
/// screen. A trailing `%` glyph marks an active TBR; a spelled-out "STOP"
/// marks the pump as stopped; otherwise it is the normal running state.
fn try_main_screen(matches: &[PatternMatch]) -> ParsedScreen {
    let text = matches_to_string(matches);
    if text.contains("STOP") {
        ParsedScreen::Main(MainScreen::Stopped)
    } else if matches.iter().any(|m| m.kind == GlyphKind::LargeChar('%')) {
        ParsedScreen::Main(MainScreen::Tbr)
    } else {
        ParsedScreen::Main(MainScreen::Normal)
    }
}

/// Rule 1a: clock-prefixed screen carrying a large `u` (IU) glyph is a
/// basal-rate factor setting screen: two `HH:MM` time readings (begin,
/// end) followed by a decimal insulin-per-hour rate.
fn try_basal_rate_factor_setting(
    matches: &[PatternMatch],
) -> Result<Option<ParsedScreen>, FrameParseError> {
    if !matches.iter().any(|m| m.kind == GlyphKind::LargeChar('u')) {
        return Ok(None);
    }
    // Each of the begin/end time readings is itself clock-prefixed, so
    // splitting the token stream on the clock glyph isolates them.
    let mut groups: Vec<&[PatternMatch]> = Vec::new();
    let mut start = 0;
    for (i, m) in matches.iter().enumerate() {
        if m.kind == GlyphKind::SmallSymbol(SymbolId::Clock) {
            if i > start {
                groups.push(&matches[start..i]);
            }
            start = i + 1;
        }
    }
    if start < matches.len() {
        groups.push(&matches[start..]);
    }
    // Each group may trail into the large-font decimal rate (no further
    // clock delimiter separates the second time from it); the time itself
    // is always the leading run of small-font digit/colon glyphs.
    let times: Vec<(u8, u8)> = groups
        .iter()
        .filter_map(|g| {
            let time_run: Vec<PatternMatch> = g
                .iter()
                .copied()
                .take_while(|m| {
                    matches!(m.kind, GlyphKind::SmallDigit(_))
                        || m.kind == GlyphKind::SmallSymbol(SymbolId::Colon)
                })
                .collect();
            parse_time(&matches_to_string(&time_run))
        })
        .collect();
    let Some((&begin, &end)) = times.first().zip(times.get(1)) else {
        return Ok(None);
    };
    let decimal_run: Vec<PatternMatch> = matches
        .iter()
        .copied()
        .filter(|m| {
            matches!(m.kind, GlyphKind::LargeDigit(_))
                || m.kind == GlyphKind::LargeSymbol(SymbolId::Dot)
        })
        .collect();
    let Some(units) = parse_decimal(&matches_to_string(&decimal_run)) else {
        return Ok(None);
    };
    Ok(Some(ParsedScreen::BasalRateFactorSetting {
        begin_hour: begin.0,
        end_hour: end.0,
        units,
    }))
}

/// Rule 2: a menu icon glyph anywhere in the token stream identifies a
/// menu-list screen; the basal rate profile icon is followed by a large
/// digit 1-5 naming the profile.
fn try_menu_screen(
    matches: &[PatternMatch],
    frame: &DisplayFrame,
) -> Result<Option<ParsedScreen>, FrameParseError> {
    let Some(pos) = matches.iter().position(|m| {
        matches!(m.kind, GlyphKind::LargeSymbol(s) if s.is_menu_icon())
    }) else {
        return Ok(None);
    };
    let GlyphKind::LargeSymbol(symbol) = matches[pos].kind else {
        unreachable!()
    };
    if symbol == SymbolId::MenuBasalProfile {
        let Some(&next) = matches.get(pos + 1) else {
            return Ok(None);
        };
        let GlyphKind::LargeDigit(n) = next.kind else {
            return Ok(None);
        };
        if !(1..=5).contains(&n) {
            return Err(validation_error(frame, format!("basal profile number {n} out of range 1..=5")));
        }
        return Ok(Some(ParsedScreen::MenuScreen(MenuId::BasalRateProfile(n))));
    }
    Ok(MenuId::from_symbol(symbol).map(ParsedScreen::MenuScreen))
}

/// Rule 3: a leading small-character title, resolved through the
/// multi-locale table, dispatches to the remaining-token parser for that
/// title's screen kind.
fn try_title_screen(
    matches: &[PatternMatch],
    frame: &DisplayFrame,
    title_context: Option<TitleContext>,
) -> Result<Option<ParsedScreen>, FrameParseError> {
    let (title, rest) = split_leading_title(matches);
    if title.is_empty() {
        return Ok(None);
    }
    let Some(title_id) = resolve_title(&title, title_context) else {
        return Ok(None);
    };
    let body = matches_to_string(rest);
    Ok(match title_id {
        TitleId::Quickinfo => {
            let units = parse_int_token(rest).ok_or_else(|| validation_error(frame, "unreadable quickinfo units"))?;
            if units > 350 {
                return Err(validation_error(frame, format!("reservoir reading {units} IU exceeds 350 IU maximum")));
            }
            Some(ParsedScreen::QuickinfoMain {
                units,
                reservoir: ReservoirState::from_units(units),
            })
        }
        TitleId::TbrPercentage => Some(ParsedScreen::TbrPercentage(
            parse_int_token(rest).map(|v| u16::try_from(v).unwrap_or(u16::MAX)),
        )),
        TitleId::TbrDuration => {
            let (h, m) = parse_time(&body).unwrap_or((0, 0));
            Some(ParsedScreen::TbrDuration { hours: h, minutes: m })
        }
        TitleId::Hour => parse_int_token(rest).map(|v| ParsedScreen::TimeAndDateHour(u8::try_from(v).unwrap_or(0))),
        TitleId::Minute => parse_int_token(rest).map(|v| ParsedScreen::TimeAndDateMinute(u8::try_from(v).unwrap_or(0))),
        TitleId::Year => parse_int_token(rest).map(|v| ParsedScreen::TimeAndDateYear(u16::try_from(v).unwrap_or(0))),
        TitleId::Month => parse_int_token(rest).map(|v| ParsedScreen::TimeAndDateMonth(u8::try_from(v).unwrap_or(0))),
        TitleId::Day => parse_int_token(rest).map(|v| ParsedScreen::TimeAndDateDay(u8::try_from(v).unwrap_or(0))),
    })
}

fn parse_int_token(matches: &[PatternMatch]) -> Option<u32> {
    let digits: String = matches
        .iter()
        .filter_map(|m| match m.kind {
            GlyphKind::SmallDigit(d) | GlyphKind::LargeDigit(d) => Some(char::from(b'0' + d)),
            _ => None,
        })
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Rule 4: a large warning/error symbol, the matching large `W`/`E`
/// letter, a decimal code number, then a small check mark.
fn try_warning_error_screen(matches: &[PatternMatch]) -> Option<ParsedScreen> {
    let symbol = matches.iter().find_map(|m| match m.kind {
        GlyphKind::LargeSymbol(s @ (SymbolId::Warning | SymbolId::Error)) => Some(s),
        _ => None,
    })?;
    if !matches.iter().any(|m| m.kind == GlyphKind::SmallSymbol(SymbolId::Check)) {
        return None;
    }
    let code = parse_int_token(matches)?;
    Some(match symbol {
        SymbolId::Warning => ParsedScreen::AlertWarning(code),
        SymbolId::Error => ParsedScreen::AlertError(code),
        _ => unreachable!(),
    })
}

/// Rule 5: a large "basal set" symbol, a decimal number, and a large `u`.
fn try_basal_rate_total(matches: &[PatternMatch]) -> Option<ParsedScreen> {
    if !matches.iter().any(|m| m.kind == GlyphKind::LargeSymbol(SymbolId::BasalSet)) {
        return None;
    }
    if !matches.iter().any(|m| m.kind == GlyphKind::LargeChar('u')) {
        return None;
    }
    let decimal_run: Vec<PatternMatch> = matches
        .iter()
        .copied()
        .filter(|m| matches!(m.kind, GlyphKind::LargeDigit(_)) || m.kind == GlyphKind::LargeSymbol(SymbolId::Dot))
        .collect();
    parse_decimal(&matches_to_string(&decimal_run)).map(ParsedScreen::BasalRateTotal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glyphs::{glyph_table, template_for};

    fn template(kind: GlyphKind) -> glyphs::GlyphTemplate {
        template_for(kind)
    }

    fn stamp_row(frame: &mut DisplayFrame, kinds: &[GlyphKind], mut x: usize, y: usize) {
        for &kind in kinds {
            let t = template(kind);
            frame.stamp(&t, x, y);
            x += t.width;
        }
    }

    #[test]
    fn packed_bits_round_trip_through_pixels() {
        let mut frame = DisplayFrame::blank();
        frame.set(0, 0, true);
        frame.set(95, 0, true);
        frame.set(3, 31, true);

        let row_bytes = FRAME_WIDTH / 8;
        let mut packed = vec![0u8; row_bytes * FRAME_HEIGHT];
        for y in 0..FRAME_HEIGHT {
            for x in 0..FRAME_WIDTH {
                if frame.get(x, y) {
                    packed[y * row_bytes + x / 8] |= 1 << (7 - (x % 8));
                }
            }
        }
        let decoded = DisplayFrame::from_packed_bits(&packed).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn packed_bits_rejects_short_payload() {
        assert!(DisplayFrame::from_packed_bits(&[0u8; 4]).is_err());
    }

    #[test]
    fn parse_decimal_examples() {
        assert_eq!(parse_decimal("12"), Some(12000));
        assert_eq!(parse_decimal("0.22"), Some(220));
        assert_eq!(parse_decimal("4.11"), Some(4110));
    }

    #[test]
    fn parse_time_examples() {
        assert_eq!(parse_time("09PM"), Some((21, 0)));
        assert_eq!(parse_time("12AM"), Some((0, 0)));
        assert_eq!(parse_time("12:00PM"), Some((12, 0)));
        assert_eq!(parse_time("14:00"), Some((14, 0)));
    }

    #[test]
    fn overlap_resolution_prefers_large_over_small() {
        let large = PatternMatch {
            kind: GlyphKind::LargeDigit(1),
            x: 0,
            y: 0,
            width: 9,
            height: 15,
            set_pixels: 10,
        };
        let small = PatternMatch {
            kind: GlyphKind::SmallDigit(2),
            x: 2,
            y: 2,
            width: 5,
            height: 7,
            set_pixels: 100,
        };
        let resolved = resolve_overlaps(vec![large, small]);
        assert_eq!(resolved, vec![large]);
    }

    #[test]
    fn overlap_resolution_prefers_more_set_pixels_at_equal_size() {
        let a = PatternMatch {
            kind: GlyphKind::SmallDigit(1),
            x: 0,
            y: 0,
            width: 5,
            height: 7,
            set_pixels: 5,
        };
        let b = PatternMatch {
            kind: GlyphKind::SmallDigit(2),
            x: 1,
            y: 1,
            width: 5,
            height: 7,
            set_pixels: 20,
        };
        let resolved = resolve_overlaps(vec![a, b]);
        assert_eq!(resolved, vec![b]);
    }

    #[test]
    fn scan_finds_every_stamped_glyph() {
        let mut frame = DisplayFrame::blank();
        stamp_row(
            &mut frame,
            &[GlyphKind::SmallDigit(2), GlyphKind::SmallDigit(1), GlyphKind::SmallDigit(3)],
            0,
            0,
        );
        let matches = scan(&frame);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].kind, GlyphKind::SmallDigit(2));
        assert_eq!(matches[1].kind, GlyphKind::SmallDigit(1));
        assert_eq!(matches[2].kind, GlyphKind::SmallDigit(3));
    }

    fn title_kinds(title: &str) -> Vec<GlyphKind> {
        title.chars().map(GlyphKind::SmallChar).collect()
    }

    #[test]
    fn quickinfo_screen_parses_units_and_reservoir_band() {
        let mut frame = DisplayFrame::blank();
        let mut kinds = title_kinds("QUICKINFO");
        kinds.extend([GlyphKind::SmallDigit(2), GlyphKind::SmallDigit(1), GlyphKind::SmallDigit(3)]);
        stamp_row(&mut frame, &kinds, 0, 0);
        let screen = parse_screen(&frame, None).unwrap();
        assert_eq!(
            screen,
            ParsedScreen::QuickinfoMain {
                units: 213,
                reservoir: ReservoirState::Full,
            }
        );
    }

    #[test]
    fn quickinfo_screen_rejects_reservoir_above_350() {
        let mut frame = DisplayFrame::blank();
        let mut kinds = title_kinds("QUICKINFO");
        kinds.extend([GlyphKind::SmallDigit(4), GlyphKind::SmallDigit(0), GlyphKind::SmallDigit(0)]);
        stamp_row(&mut frame, &kinds, 0, 0);
        let err = parse_screen(&frame, None).unwrap_err();
        assert!(err.reason.contains("350"));
    }

    #[test]
    fn menu_screen_recognizes_basal_profile_with_digit() {
        let mut frame = DisplayFrame::blank();
        stamp_row(
            &mut frame,
            &[GlyphKind::LargeSymbol(SymbolId::MenuBasalProfile), GlyphKind::LargeDigit(3)],
            0,
            0,
        );
        assert_eq!(
            parse_screen(&frame, None).unwrap(),
            ParsedScreen::MenuScreen(MenuId::BasalRateProfile(3))
        );
    }

    #[test]
    fn menu_screen_rejects_out_of_range_basal_profile() {
        let mut frame = DisplayFrame::blank();
        stamp_row(
            &mut frame,
            &[GlyphKind::LargeSymbol(SymbolId::MenuBasalProfile), GlyphKind::LargeDigit(7)],
            0,
            0,
        );
        assert!(parse_screen(&frame, None).unwrap_err().reason.contains("1..=5"));
    }

    #[test]
    fn menu_screen_recognizes_standard_bolus() {
        let mut frame = DisplayFrame::blank();
        stamp_row(&mut frame, &[GlyphKind::LargeSymbol(SymbolId::MenuStandardBolus)], 0, 0);
        assert_eq!(
            parse_screen(&frame, None).unwrap(),
            ParsedScreen::MenuScreen(MenuId::StandardBolus)
        );
    }

    #[test]
    fn warning_screen_recognized() {
        let mut frame = DisplayFrame::blank();
        stamp_row(
            &mut frame,
            &[
                GlyphKind::LargeSymbol(SymbolId::Warning),
                GlyphKind::LargeChar('W'),
                GlyphKind::LargeDigit(6),
                GlyphKind::SmallSymbol(SymbolId::Check),
            ],
            0,
            0,
        );
        assert_eq!(parse_screen(&frame, None).unwrap(), ParsedScreen::AlertWarning(6));
    }

    #[test]
    fn basal_rate_total_screen_recognized() {
        let mut frame = DisplayFrame::blank();
        stamp_row(
            &mut frame,
            &[
                GlyphKind::LargeSymbol(SymbolId::BasalSet),
                GlyphKind::LargeDigit(1),
                GlyphKind::LargeSymbol(SymbolId::Dot),
                GlyphKind::LargeDigit(3),
                GlyphKind::LargeDigit(7),
                GlyphKind::LargeChar('u'),
            ],
            0,
            0,
        );
        assert_eq!(parse_screen(&frame, None).unwrap(), ParsedScreen::BasalRateTotal(1370));
    }

    #[test]
    fn unrecognized_blank_frame() {
        let frame = DisplayFrame::blank();
        assert_eq!(parse_screen(&frame, None).unwrap(), ParsedScreen::Unrecognized);
    }

    #[test]
    fn glyph_table_used_by_scan_is_nonempty() {
        assert!(!glyph_table().is_empty());
    }
}
