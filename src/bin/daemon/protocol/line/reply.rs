/// Prompt printed by the controller once a command has been accepted
pub const PROMPT: u8 = b'>';
/// Sentinel printed by the controller when a command is rejected
pub const SENTINEL: u8 = b'?';

/// Parsed controller reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineReply {
    /// Command accepted; the payload without echo, prompt or terminators
    Payload(String),
    /// Command rejected with the sentinel; the text that preceded it, without echo
    Rejected(String),
}

impl LineReply {
    /// Parse the raw bytes received after sending `command`
    ///
    /// # Arguments
    /// * `command` - The command as written, without terminator
    /// * `raw` - Every byte received for it
    ///
    /// # Returns
    /// * `LineReply` - Payload or rejection
    pub fn parse(command: &str, raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut rejected = false;
        let mut parts: Vec<&str> = Vec::new();

        for line in text.split(['\r', '\n']) {
            let mut line = line.trim();
            if let Some(index) = line.find(SENTINEL as char) {
                rejected = true;
                line = line[..index].trim();
            }
            let line = line.trim_end_matches(PROMPT as char).trim();
            if !line.is_empty() {
                parts.push(line);
            }
        }

        strip_echo(command.trim(), &mut parts);
        let body = parts.join(" ");

        if rejected {
            LineReply::Rejected(body)
        } else {
            LineReply::Payload(body)
        }
    }
}

/// Remove the echoed command, whether it arrived on its own line or ahead of the payload
fn strip_echo<'a>(command: &str, parts: &mut Vec<&'a str>) {
    let Some(first) = parts.first().copied() else {
        return;
    };
    if command.is_empty() {
        return;
    }

    if first.eq_ignore_ascii_case(command) {
        parts.remove(0);
    } else if let Some(prefix) = first.get(..command.len()) {
        if prefix.eq_ignore_ascii_case(command) {
            let rest = first[command.len()..].trim();
            if rest.is_empty() {
                parts.remove(0);
            } else {
                parts[0] = rest;
            }
        }
    }
}

/// Whether the bytes received so far form a complete reply
pub fn is_complete(raw: &[u8]) -> bool {
    if raw.contains(&SENTINEL) {
        return true;
    }
    raw.iter()
        .rev()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|&byte| byte == PROMPT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_without_echo() {
        let reply = LineReply::parse("PR P", b"PR P\r\n1200\r\n>");
        assert_eq!(reply, LineReply::Payload("1200".to_string()));
    }

    #[test]
    fn test_echo_on_payload_line() {
        let reply = LineReply::parse("PR P", b"PR P 1200\r\n>");
        assert_eq!(reply, LineReply::Payload("1200".to_string()));
    }

    #[test]
    fn test_acknowledge_only() {
        let reply = LineReply::parse("MA 100", b"MA 100\r\n>");
        assert_eq!(reply, LineReply::Payload(String::new()));
    }

    #[test]
    fn test_rejected_with_fragment() {
        let reply = LineReply::parse("XX", b"XX\r\n?");
        assert_eq!(reply, LineReply::Rejected(String::new()));

        let reply = LineReply::parse("MA 1", b"MA 1\r\nHOLD?");
        assert_eq!(reply, LineReply::Rejected("HOLD".to_string()));
    }

    #[test]
    fn test_completion() {
        assert!(!is_complete(b"PR P\r\n12"));
        assert!(is_complete(b"PR P\r\n12\r\n>"));
        assert!(is_complete(b"PR P\r\n>\r\n"));
        assert!(is_complete(b"XX\r\n?"));
    }
}
