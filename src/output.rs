//! Output rendering for relayed server logs.
//!
//! Every relayed line is shown as `[name] text`. This module owns that
//! convention, the optional elapsed-time prefix, and the text sanitising
//! applied before a line reaches the translator.

use std::time::Instant;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Formats relayed lines for the console.
#[derive(Debug, Clone)]
pub struct Printer {
    timestamp: bool,
    start: Instant,
}

impl Printer {
    pub fn new(timestamp: bool) -> Self {
        Self {
            timestamp,
            start: Instant::now(),
        }
    }

    /// Renders one line of server output.
    pub fn format_line(&self, name: &str, text: &str) -> String {
        let line = format_prefixed(name, text);
        if self.timestamp {
            format!("{} {}", self.elapsed(), line)
        } else {
            line
        }
    }

    /// Renders a message produced by craftrack itself rather than the server.
    pub fn format_notice(&self, name: &str, text: &str) -> String {
        self.format_line(name, &format!("-- {}", text))
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

/// The `[name] text` convention shared by every sink.
pub fn format_prefixed(name: &str, text: &str) -> String {
    format!("[{}] {}", name, text)
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Tabs survive stripping,
/// so indented stack trace lines keep their shape.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi || !text.contains('\u{1b}') {
        return text.to_string();
    }
    // `strip` drops every control character, tabs included.
    text.split('\t')
        .map(|part| String::from_utf8_lossy(&strip(part.as_bytes())).into_owned())
        .collect::<Vec<_>>()
        .join("\t")
}

/// Decodes one raw line read from a pipe, dropping the line terminator.
pub fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_with_display_name() {
        let printer = Printer::new(false);
        assert_eq!(printer.format_line("lobby", "hello"), "[lobby] hello");
        assert_eq!(
            printer.format_notice("lobby", "process ended"),
            "[lobby] -- process ended"
        );
    }

    #[test]
    fn timestamp_prefix_precedes_name() {
        let printer = Printer::new(true);
        let line = printer.format_line("lobby", "hello");
        assert!(line.starts_with("00:00 [lobby]"), "{}", line);
    }

    #[test]
    fn sanitize_strips_color_codes() {
        let colored = "\u{1b}[32mDone (3.2s)!\u{1b}[0m";
        assert_eq!(sanitize_text(colored, true), "Done (3.2s)!");
        assert_eq!(sanitize_text(colored, false), colored);
    }

    #[test]
    fn sanitize_keeps_tabs() {
        assert_eq!(
            sanitize_text("a\tb 玩家 \u{1b}[31mred\u{1b}[0m é", true),
            "a\tb 玩家 red é"
        );
        assert_eq!(
            sanitize_text("\tat net.minecraft.server.Main.main(Main.java:42)", true),
            "\tat net.minecraft.server.Main.main(Main.java:42)"
        );
    }

    #[test]
    fn decode_line_handles_crlf_and_invalid_utf8() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"tail"), "tail");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }
}
