//! Side-by-side hex/ASCII rendering of two byte strings around their first
//! difference, for assertion failure messages.

use owo_colors::OwoColorize;

/// Bytes shown around the first difference.
const WINDOW_BYTES: usize = 100;
const BYTES_PER_ROW: usize = 20;
/// Visible width of the hex column, including padding.
const HEX_COLUMN_WIDTH: usize = 60;

#[derive(Debug, Clone, Copy)]
enum Side {
    Expected,
    Actual,
}

impl Side {
    fn label(self) -> &'static str {
        match self {
            Self::Expected => "Expected",
            Self::Actual => "Actual",
        }
    }

    fn highlight(self, token: &str) -> String {
        match self {
            Self::Expected => token.bright_green().to_string(),
            Self::Actual => token.bright_red().to_string(),
        }
    }
}

/// Lines describing how `actual` differs from `expected`; empty when they
/// are equal.
///
/// Shows up to 100 bytes starting 50 bytes before the first differing byte,
/// 20 per row, as hex and as ASCII (`.` for non-printable bytes). The first
/// differing byte is coloured in both blocks. Lines contain ANSI escapes.
pub fn visualize_byte_diff(actual: &[u8], expected: &[u8]) -> Vec<String> {
    if actual == expected {
        return Vec::new();
    }

    let first_diff = actual
        .iter()
        .zip(expected)
        .position(|(a, e)| a != e)
        .unwrap_or_else(|| actual.len().min(expected.len()));

    let start = first_diff.saturating_sub(WINDOW_BYTES / 2);
    let end = (start + WINDOW_BYTES).min(actual.len().max(expected.len()));

    let mut lines = render_block(Side::Expected, expected, start, end, first_diff);
    lines.push(String::new());
    lines.extend(render_block(Side::Actual, actual, start, end, first_diff));
    lines
}

fn render_block(side: Side, bytes: &[u8], start: usize, end: usize, first_diff: usize) -> Vec<String> {
    let header = format!("{} (bytes {start}-{end}), hexadecimal:", side.label());
    let mut lines = vec![format!("{}| ASCII:", pad_right(&header, header.len()))];

    let stop = end.min(bytes.len());
    for row_start in (start..stop).step_by(BYTES_PER_ROW) {
        let row_end = (row_start + BYTES_PER_ROW).min(stop);
        lines.push(render_row(side, bytes, row_start..row_end, first_diff));
    }

    lines
}

fn render_row(side: Side, bytes: &[u8], range: std::ops::Range<usize>, first_diff: usize) -> String {
    let count = range.len();
    let mut hex = Vec::with_capacity(count);
    let mut ascii = String::with_capacity(count);

    for index in range {
        let byte = bytes[index];
        let hex_token = format!("{byte:02x}");
        let ascii_token = printable(byte).to_string();

        if index == first_diff {
            hex.push(side.highlight(&hex_token));
            ascii.push_str(&side.highlight(&ascii_token));
        } else {
            hex.push(hex_token);
            ascii.push_str(&ascii_token);
        }
    }

    let visible_width = (3 * count).saturating_sub(1);
    format!("{}| {ascii}", pad_right(&hex.join(" "), visible_width))
}

/// Pad `text` (of `visible_width` printable columns) to the hex column.
fn pad_right(text: &str, visible_width: usize) -> String {
    let padding = HEX_COLUMN_WIDTH.saturating_sub(visible_width).max(1);
    format!("{text}{}", " ".repeat(padding))
}

fn printable(byte: u8) -> char {
    if (32..=126).contains(&byte) {
        byte as char
    } else {
        '.'
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
