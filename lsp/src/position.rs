//! Offset conversion between display and wire coordinates.
//!
//! Display positions are one-based and count columns in Unicode scalar
//! values. Wire positions are zero-based and count UTF-16 code units. When
//! the document text is unknown the conversion is plain ±1 arithmetic.

use crate::protocol::WirePosition;
use crate::types::{Position, Range};

fn nth_line(text: &str, line: u32) -> Option<&str> {
    text.split('\n')
        .nth(line as usize)
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
}

/// Display position → wire position. Zero line/column saturate to the first.
pub(crate) fn to_wire(text: Option<&str>, position: Position) -> WirePosition {
    let line = position.line.saturating_sub(1);
    let column = position.column.saturating_sub(1);

    let Some(line_text) = text.and_then(|t| nth_line(t, line)) else {
        return WirePosition {
            line,
            character: column,
        };
    };

    let mut units = 0u32;
    let mut chars = 0u32;
    for ch in line_text.chars() {
        if chars == column {
            break;
        }
        units = units.saturating_add(ch.len_utf16() as u32);
        chars += 1;
    }
    // Past end of line: keep the overshoot so servers can clamp it themselves.
    units = units.saturating_add(column - chars);

    WirePosition {
        line,
        character: units,
    }
}

/// Wire position → display position.
pub(crate) fn from_wire(text: Option<&str>, position: WirePosition) -> Position {
    let line = position.line.saturating_add(1);

    let Some(line_text) = text.and_then(|t| nth_line(t, position.line)) else {
        return Position::new(line, position.character.saturating_add(1));
    };

    let mut units = 0u32;
    let mut chars = 0u32;
    for ch in line_text.chars() {
        if units >= position.character {
            break;
        }
        units = units.saturating_add(ch.len_utf16() as u32);
        chars += 1;
    }
    let overshoot = position.character.saturating_sub(units);

    Position::new(line, chars.saturating_add(overshoot).saturating_add(1))
}

pub(crate) fn range_from_wire(text: Option<&str>, start: WirePosition, end: WirePosition) -> Range {
    Range {
        start: from_wire(text, start),
        end: from_wire(text, end),
    }
}
