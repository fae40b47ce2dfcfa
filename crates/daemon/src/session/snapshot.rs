//! Replayable screen snapshots.
//!
//! A snapshot is a byte stream that, written into a fresh terminal of the
//! same geometry, reproduces the visible grid, cursor and color overrides:
//!
//! ```text
//! ESC c                       full reset
//! OSC 4 ; n ; spec BEL        each overridden palette entry
//! OSC 10/11 ; spec BEL        dynamic foreground / background
//! <grid, attributes, cursor, input modes>
//! CSI Ps SP q                 cursor shape
//! ```

use super::terminal::{DynamicColor, TerminalState};

const FULL_RESET: &[u8] = b"\x1bc";

/// Renders the current state of `term` as escape sequences.
pub fn render(term: &TerminalState) -> Vec<u8> {
    let screen = term.screen().state_formatted();
    let mut out = Vec::with_capacity(screen.len() + 256);

    out.extend_from_slice(FULL_RESET);

    let colors = term.colors();
    for (index, spec) in &colors.palette {
        out.extend_from_slice(format!("\x1b]4;{};{}\x07", index, spec).as_bytes());
    }
    let dynamic = [
        (DynamicColor::Foreground, &colors.foreground),
        (DynamicColor::Background, &colors.background),
    ];
    for (target, spec) in dynamic {
        if let Some(spec) = spec {
            out.extend_from_slice(format!("\x1b]{};{}\x07", target.osc_code(), spec).as_bytes());
        }
    }

    out.extend_from_slice(&screen);
    out.extend_from_slice(term.cursor_style().restore_sequence().as_bytes());
    out
}
