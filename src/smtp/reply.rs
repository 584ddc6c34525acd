use std::fmt;

/// An SMTP server reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Encode with `-` continuation markers and CRLF line endings.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        out
    }

    pub fn ok(text: impl Into<String>) -> Self {
        Self::new(250, text)
    }

    pub fn bad_sequence(text: impl Into<String>) -> Self {
        Self::new(503, text)
    }

    pub fn syntax_error(text: impl Into<String>) -> Self {
        Self::new(501, text)
    }

    pub fn local_error() -> Self {
        Self::new(451, "4.3.0 Error: internal server error, try again later")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_wire_format() {
        assert_eq!(Reply::ok("2.0.0 OK").to_wire(), "250 2.0.0 OK\r\n");
    }

    #[test]
    fn test_multiline_wire_format() {
        let reply = Reply::multiline(
            250,
            vec!["mx.example.com".to_string(), "8BITMIME".to_string(), "SIZE 10".to_string()],
        );
        assert_eq!(reply.to_wire(), "250-mx.example.com\r\n250-8BITMIME\r\n250 SIZE 10\r\n");
    }

    #[test]
    fn test_classes() {
        assert!(Reply::ok("x").is_positive());
        assert!(Reply::local_error().is_transient());
        assert!(Reply::new(550, "x").is_permanent());
        assert!(!Reply::new(354, "x").is_transient());
    }
}
