//! tmux control-mode protocol decoding.
//!
//! A control-mode client (`tmux -C attach`) prints one notification per line.
//! Pane output arrives as `%output %<pane> <data>` where bytes below 0x20 and
//! the backslash are written as three-digit octal escapes.

/// One decoded control-mode line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// Output written by a pane.
    Output { pane: String, data: Vec<u8> },
    /// The client is detaching; the optional reason comes from tmux.
    Exit(Option<String>),
    /// Any other notification or command reply.
    Other,
}

/// Decode one line (without its trailing newline).
#[must_use]
pub fn parse_line(line: &[u8]) -> ControlLine {
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    if let Some(rest) = line.strip_prefix(b"%output ") {
        let (pane, data) = split_once(rest, b' ').unwrap_or((rest, &[]));
        return ControlLine::Output {
            pane: String::from_utf8_lossy(pane).into_owned(),
            data: unescape(data),
        };
    }

    if line == b"%exit" {
        return ControlLine::Exit(None);
    }
    if let Some(reason) = line.strip_prefix(b"%exit ") {
        return ControlLine::Exit(Some(String::from_utf8_lossy(reason).into_owned()));
    }

    ControlLine::Other
}

/// Undo tmux's octal escaping.
#[must_use]
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\\' {
            if let Some(byte) = octal(&data[i + 1..]) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

fn octal(digits: &[u8]) -> Option<u8> {
    let digits = digits.get(..3)?;
    let mut value: u16 = 0;
    for d in digits {
        if !(b'0'..=b'7').contains(d) {
            return None;
        }
        value = value * 8 + u16::from(d - b'0');
    }
    u8::try_from(value).ok()
}

fn split_once(data: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    let pos = data.iter().position(|b| *b == sep)?;
    Some((&data[..pos], &data[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_output_with_escapes() {
        let line = br"%output %3 hello\015\012a\134b";
        assert_eq!(
            parse_line(line),
            ControlLine::Output {
                pane: "%3".to_string(),
                data: b"hello\r\na\\b".to_vec(),
            }
        );
    }

    #[test]
    fn passes_utf8_through() {
        let line = "%output %1 caf\u{e9}".as_bytes();
        let ControlLine::Output { data, .. } = parse_line(line) else {
            panic!("expected output");
        };
        assert_eq!(String::from_utf8(data).unwrap(), "caf\u{e9}");
    }

    #[test]
    fn recognizes_exit_and_ignores_the_rest() {
        assert_eq!(parse_line(b"%exit"), ControlLine::Exit(None));
        assert_eq!(
            parse_line(b"%exit server exited"),
            ControlLine::Exit(Some("server exited".to_string()))
        );
        assert_eq!(parse_line(b"%begin 1 2 0"), ControlLine::Other);
        assert_eq!(parse_line(b"%session-changed $1 adj-app"), ControlLine::Other);
    }

    #[test]
    fn malformed_escape_is_kept_verbatim() {
        assert_eq!(unescape(br"a\9zz"), br"a\9zz".to_vec());
        assert_eq!(unescape(br"tail\01"), br"tail\01".to_vec());
    }
}
