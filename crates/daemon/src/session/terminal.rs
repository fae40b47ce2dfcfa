//! Per-session terminal emulator state.
//!
//! The grid, scrollback, cursor and modes live in a `vt100` emulator. The
//! out-of-band signals it does not surface (window title, working directory,
//! desktop notifications, palette and dynamic colors, cursor shape) are picked
//! up by a `vte` scanner that sees the same byte stream.

use std::collections::BTreeMap;

use vte::{Params, Perform};

/// Out-of-band signal a session broadcasts to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalSignal {
    Title(String),
    Cwd(String),
    Notify { title: String, body: String },
}

/// Dynamic color targets a session remembers across snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicColor {
    Foreground,
    Background,
}

impl DynamicColor {
    fn from_osc(code: u16) -> Option<Self> {
        match code {
            10 => Some(DynamicColor::Foreground),
            11 => Some(DynamicColor::Background),
            _ => None,
        }
    }

    pub fn osc_code(self) -> u16 {
        match self {
            DynamicColor::Foreground => 10,
            DynamicColor::Background => 11,
        }
    }
}

/// A color change requested by the program running in the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorOperation {
    SetPalette { index: u8, spec: String },
    /// `None` resets the whole palette.
    ResetPalette(Option<u8>),
    SetDynamic { target: DynamicColor, spec: String },
    ResetDynamic(DynamicColor),
}

/// Color overrides applied on top of the emulator's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorState {
    pub palette: BTreeMap<u8, String>,
    pub foreground: Option<String>,
    pub background: Option<String>,
}

/// Shape of a cursor set explicitly with DECSCUSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorShape {
    Block,
    Underline,
    Bar,
}

/// The cursor style record used to restore the cursor after a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorStyle {
    #[default]
    Default,
    Explicit { shape: CursorShape, blinking: bool },
}

impl CursorStyle {
    /// Interprets a DECSCUSR parameter.
    pub fn from_decscusr(ps: u16) -> Option<Self> {
        let (shape, blinking) = match ps {
            0 => return Some(CursorStyle::Default),
            1 => (CursorShape::Block, true),
            2 => (CursorShape::Block, false),
            3 => (CursorShape::Underline, true),
            4 => (CursorShape::Underline, false),
            5 => (CursorShape::Bar, true),
            6 => (CursorShape::Bar, false),
            _ => return None,
        };
        Some(CursorStyle::Explicit { shape, blinking })
    }

    /// The DECSCUSR parameter that reproduces this style.
    pub fn decscusr(self) -> u16 {
        match self {
            CursorStyle::Default => 0,
            CursorStyle::Explicit { shape, blinking } => {
                let base = match shape {
                    CursorShape::Block => 1,
                    CursorShape::Underline => 3,
                    CursorShape::Bar => 5,
                };
                if blinking {
                    base
                } else {
                    base + 1
                }
            }
        }
    }

    /// The escape sequence that sets this style.
    pub fn restore_sequence(self) -> String {
        format!("\x1b[{} q", self.decscusr())
    }
}

/// Emulator plus the metadata tracked alongside it.
pub struct TerminalState {
    emulator: vt100::Parser,
    scanner: vte::Parser,
    title: Option<String>,
    cwd: Option<String>,
    colors: ColorState,
    cursor: CursorStyle,
}

impl TerminalState {
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Self {
        Self {
            emulator: vt100::Parser::new(rows, cols, scrollback),
            scanner: vte::Parser::new(),
            title: None,
            cwd: None,
            colors: ColorState::default(),
            cursor: CursorStyle::Default,
        }
    }

    /// Feeds PTY output through the emulator.
    ///
    /// Color, cursor and reset requests are applied immediately; title, cwd
    /// and notification requests are returned for the session to broadcast.
    pub fn process(&mut self, bytes: &[u8]) -> Vec<TerminalSignal> {
        self.emulator.process(bytes);

        let mut scanner = SignalScanner::default();
        self.scanner.advance(&mut scanner, bytes);

        let mut signals = Vec::new();
        for action in scanner.actions {
            match action {
                ScanAction::Signal(signal) => signals.push(signal),
                ScanAction::Color(op) => self.apply_color_operation(op),
                ScanAction::Cursor(style) => self.cursor = style,
                ScanAction::Reset => {
                    self.colors = ColorState::default();
                    self.cursor = CursorStyle::Default;
                }
            }
        }
        signals
    }

    /// Resizes the grid; a no-op when the size is unchanged.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if self.size() != (cols, rows) {
            self.emulator.screen_mut().set_size(rows, cols);
        }
    }

    /// Current geometry as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.emulator.screen().size();
        (cols, rows)
    }

    pub fn screen(&self) -> &vt100::Screen {
        self.emulator.screen()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn colors(&self) -> &ColorState {
        &self.colors
    }

    pub fn cursor_style(&self) -> CursorStyle {
        self.cursor
    }

    /// Stores a new title. Returns `false` when it matches the current one.
    pub fn set_title(&mut self, title: &str) -> bool {
        replace_if_changed(&mut self.title, title)
    }

    /// Stores a new working directory. Returns `false` when unchanged.
    pub fn set_cwd(&mut self, cwd: &str) -> bool {
        replace_if_changed(&mut self.cwd, cwd)
    }

    /// Applies a color change to the stored overrides.
    pub fn apply_color_operation(&mut self, op: ColorOperation) {
        match op {
            ColorOperation::SetPalette { index, spec } => {
                self.colors.palette.insert(index, spec);
            }
            ColorOperation::ResetPalette(Some(index)) => {
                self.colors.palette.remove(&index);
            }
            ColorOperation::ResetPalette(None) => self.colors.palette.clear(),
            ColorOperation::SetDynamic { target, spec } => {
                *self.dynamic_slot(target) = Some(spec);
            }
            ColorOperation::ResetDynamic(target) => {
                *self.dynamic_slot(target) = None;
            }
        }
    }

    fn dynamic_slot(&mut self, target: DynamicColor) -> &mut Option<String> {
        match target {
            DynamicColor::Foreground => &mut self.colors.foreground,
            DynamicColor::Background => &mut self.colors.background,
        }
    }
}

fn replace_if_changed(slot: &mut Option<String>, value: &str) -> bool {
    if slot.as_deref() == Some(value) {
        return false;
    }
    *slot = Some(value.to_string());
    true
}

/// Something the scanner saw, in stream order.
#[derive(Debug, PartialEq)]
enum ScanAction {
    Signal(TerminalSignal),
    Color(ColorOperation),
    Cursor(CursorStyle),
    Reset,
}

#[derive(Default)]
struct SignalScanner {
    actions: Vec<ScanAction>,
}

impl SignalScanner {
    fn push_signal(&mut self, signal: TerminalSignal) {
        self.actions.push(ScanAction::Signal(signal));
    }

    fn push_color(&mut self, op: ColorOperation) {
        self.actions.push(ScanAction::Color(op));
    }

    fn palette_set(&mut self, params: &[&[u8]]) {
        for pair in params.chunks(2) {
            let [index, spec] = pair else { break };
            let (Some(index), spec) = (parse_number::<u8>(index), text(spec)) else {
                continue;
            };
            if is_color_spec(&spec) {
                self.push_color(ColorOperation::SetPalette { index, spec });
            }
        }
    }

    fn palette_reset(&mut self, params: &[&[u8]]) {
        let indices: Vec<u8> = params.iter().filter_map(|p| parse_number(p)).collect();
        if indices.is_empty() {
            self.push_color(ColorOperation::ResetPalette(None));
        }
        for index in indices {
            self.push_color(ColorOperation::ResetPalette(Some(index)));
        }
    }

    /// OSC 10/11 with several specs assign consecutive targets (10, 11, 12...).
    fn dynamic_set(&mut self, first: u16, specs: &[&[u8]]) {
        for (offset, spec) in specs.iter().enumerate() {
            let Some(target) = DynamicColor::from_osc(first + offset as u16) else {
                break;
            };
            let spec = text(spec);
            if is_color_spec(&spec) {
                self.push_color(ColorOperation::SetDynamic { target, spec });
            }
        }
    }

    fn notification(&mut self, params: &[&[u8]]) {
        // ConEmu-style subcommands (`9;4;...` progress and friends) are not notifications.
        if params.len() > 1 && params[0].iter().all(u8::is_ascii_digit) {
            return;
        }
        let body = join(params);
        if !body.is_empty() {
            self.push_signal(TerminalSignal::Notify {
                title: String::new(),
                body,
            });
        }
    }
}

impl Perform for SignalScanner {
    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        let Some((code, rest)) = params.split_first() else {
            return;
        };
        let Some(code) = parse_number::<u16>(code) else {
            return;
        };

        match code {
            0 | 2 => self.push_signal(TerminalSignal::Title(join(rest))),
            7 => {
                if let Some(cwd) = parse_cwd(&join(rest)) {
                    self.push_signal(TerminalSignal::Cwd(cwd));
                }
            }
            9 => self.notification(rest),
            777 => {
                if let Some((kind, fields)) = rest.split_first() {
                    if *kind == b"notify" {
                        let title = fields.first().map(|f| text(f)).unwrap_or_default();
                        let body = fields.get(1..).map(join).unwrap_or_default();
                        self.push_signal(TerminalSignal::Notify { title, body });
                    }
                }
            }
            4 => self.palette_set(rest),
            104 => self.palette_reset(rest),
            10 | 11 => self.dynamic_set(code, rest),
            110 => self.push_color(ColorOperation::ResetDynamic(DynamicColor::Foreground)),
            111 => self.push_color(ColorOperation::ResetDynamic(DynamicColor::Background)),
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        if action != 'q' || intermediates != b" " {
            return;
        }
        let ps = params
            .iter()
            .next()
            .and_then(|p| p.first().copied())
            .unwrap_or(0);
        if let Some(style) = CursorStyle::from_decscusr(ps) {
            self.actions.push(ScanAction::Cursor(style));
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        if intermediates.is_empty() && byte == b'c' {
            self.actions.push(ScanAction::Reset);
        }
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Rejoins OSC parameters that were split on `;`.
fn join(params: &[&[u8]]) -> String {
    params.iter().map(|p| text(p)).collect::<Vec<_>>().join(";")
}

fn parse_number<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn is_color_spec(spec: &str) -> bool {
    !spec.is_empty() && spec != "?"
}

/// Extracts a path from an OSC 7 payload (`file://host/path` or a bare path).
fn parse_cwd(value: &str) -> Option<String> {
    let path = match value.strip_prefix("file://") {
        Some(rest) => &rest[rest.find('/')?..],
        None if value.starts_with('/') => value,
        None => return None,
    };
    Some(percent_decode(path))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TerminalState {
        TerminalState::new(80, 24, 100)
    }

    #[test]
    fn test_plain_output_updates_grid() {
        let mut term = state();
        let signals = term.process(b"hello\r\nworld");
        assert!(signals.is_empty());
        assert_eq!(term.screen().contents(), "hello\nworld");
        assert_eq!(term.screen().cursor_position(), (1, 5));
    }

    #[test]
    fn test_resize_to_same_size_is_idempotent() {
        for (cols, rows) in [(1, 1), (80, 24), (132, 50), (7, 300)] {
            let mut term = TerminalState::new(cols, rows, 0);
            term.process(b"some text\r\nmore");
            let before = term.screen().contents_formatted();

            term.resize(cols, rows);

            assert_eq!(term.size(), (cols, rows));
            assert_eq!(term.screen().contents_formatted(), before);
        }
    }

    #[test]
    fn test_resize_changes_geometry() {
        let mut term = state();
        term.resize(100, 40);
        assert_eq!(term.size(), (100, 40));
    }

    #[test]
    fn test_title_sequences() {
        let mut term = state();
        assert_eq!(
            term.process(b"\x1b]0;vim main.rs\x07"),
            vec![TerminalSignal::Title("vim main.rs".to_string())]
        );
        assert_eq!(
            term.process(b"\x1b]2;a;b\x1b\\"),
            vec![TerminalSignal::Title("a;b".to_string())]
        );
    }

    #[test]
    fn test_title_split_across_chunks() {
        let mut term = state();
        assert!(term.process(b"\x1b]2;long ti").is_empty());
        assert_eq!(
            term.process(b"tle\x07"),
            vec![TerminalSignal::Title("long title".to_string())]
        );
    }

    #[test]
    fn test_set_title_dedup() {
        let mut term = state();
        assert!(term.set_title("x"));
        assert!(!term.set_title("x"));
        assert!(term.set_title("y"));
        assert_eq!(term.title(), Some("y"));
    }

    #[test]
    fn test_cwd_from_file_url() {
        let mut term = state();
        assert_eq!(
            term.process(b"\x1b]7;file://host/home/me/My%20Projects\x07"),
            vec![TerminalSignal::Cwd("/home/me/My Projects".to_string())]
        );
    }

    #[test]
    fn test_cwd_rejects_non_path() {
        let mut term = state();
        assert!(term.process(b"\x1b]7;not-a-path\x07").is_empty());
    }

    #[test]
    fn test_percent_decode_edges() {
        assert_eq!(percent_decode("/a%2"), "/a%2");
        assert_eq!(percent_decode("/a%zz"), "/a%zz");
        assert_eq!(percent_decode("/%41%42"), "/AB");
    }

    #[test]
    fn test_osc9_notification() {
        let mut term = state();
        assert_eq!(
            term.process(b"\x1b]9;build done\x07"),
            vec![TerminalSignal::Notify {
                title: String::new(),
                body: "build done".to_string()
            }]
        );
        assert!(term.process(b"\x1b]9;4;1;50\x07").is_empty());
    }

    #[test]
    fn test_osc777_notification_rejoins_body() {
        let mut term = state();
        assert_eq!(
            term.process(b"\x1b]777;notify;Tests;3 passed; 0 failed\x07"),
            vec![TerminalSignal::Notify {
                title: "Tests".to_string(),
                body: "3 passed; 0 failed".to_string()
            }]
        );
    }

    #[test]
    fn test_palette_set_and_reset() {
        let mut term = state();
        term.process(b"\x1b]4;1;rgb:ff/00/00;2;#00ff00;3;?\x07");
        assert_eq!(term.colors().palette.len(), 2);
        assert_eq!(term.colors().palette[&1], "rgb:ff/00/00");

        term.process(b"\x1b]104;1\x07");
        assert_eq!(term.colors().palette.len(), 1);

        term.process(b"\x1b]104\x07");
        assert!(term.colors().palette.is_empty());
    }

    #[test]
    fn test_dynamic_colors() {
        let mut term = state();
        term.process(b"\x1b]10;#ffffff;#000000\x07");
        assert_eq!(term.colors().foreground.as_deref(), Some("#ffffff"));
        assert_eq!(term.colors().background.as_deref(), Some("#000000"));

        term.process(b"\x1b]10;?\x07");
        assert_eq!(term.colors().foreground.as_deref(), Some("#ffffff"));

        term.process(b"\x1b]110\x07\x1b]111\x07");
        assert_eq!(term.colors(), &ColorState::default());
    }

    #[test]
    fn test_cursor_style_decscusr() {
        let mut term = state();
        term.process(b"\x1b[6 q");
        assert_eq!(
            term.cursor_style(),
            CursorStyle::Explicit {
                shape: CursorShape::Bar,
                blinking: false
            }
        );
        term.process(b"\x1b[0 q");
        assert_eq!(term.cursor_style(), CursorStyle::Default);
    }

    #[test]
    fn test_decscusr_roundtrip_codes() {
        for ps in 1..=6 {
            let style = CursorStyle::from_decscusr(ps).unwrap();
            assert_eq!(style.decscusr(), ps);
        }
        assert_eq!(CursorStyle::from_decscusr(9), None);
        assert_eq!(CursorStyle::Default.restore_sequence(), "\x1b[0 q");
    }

    #[test]
    fn test_full_reset_clears_overrides() {
        let mut term = state();
        term.process(b"\x1b]4;5;#123456\x07\x1b]11;#222222\x07\x1b[3 q");
        term.process(b"\x1bc");
        assert_eq!(term.colors(), &ColorState::default());
        assert_eq!(term.cursor_style(), CursorStyle::Default);
    }

    #[test]
    fn test_other_csi_q_ignored() {
        let mut term = state();
        term.process(b"\x1b[2q");
        assert_eq!(term.cursor_style(), CursorStyle::Default);
    }
}
