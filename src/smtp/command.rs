use regex::Regex;
use std::sync::LazyLock;

/// `MAIL FROM:` / `RCPT TO:` argument: a bracketed path or a bare address,
/// followed by ESMTP parameters.
static PATH_ARGUMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*:\s*(?:<([^<>]*)>|([^\s<>]+))\s*(.*)$").expect("valid path regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Mail { from: String, params: Vec<String> },
    Rcpt { to: String, params: Vec<String> },
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Help,
    Auth { mechanism: String, initial: Option<String> },
    StartTls,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("{0} requires an argument")]
    MissingArgument(&'static str),

    #[error("bad address syntax in {0}")]
    BadPath(&'static str),
}

impl Command {
    /// `SIZE=` parameter of a MAIL command, if present and numeric.
    pub fn declared_size(&self) -> Option<usize> {
        let Command::Mail { params, .. } = self else {
            return None;
        };
        params.iter().find_map(|p| {
            let (key, value) = p.split_once('=')?;
            key.eq_ignore_ascii_case("SIZE")
                .then(|| value.parse().ok())
                .flatten()
        })
    }
}

/// Parse one command line (without its line ending).
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (verb, rest) = match line.find(|c: char| c == ' ' || c == ':') {
        Some(idx) => (&line[..idx], &line[idx..]),
        None => (line, ""),
    };
    let argument = rest.trim();

    match verb.to_ascii_uppercase().as_str() {
        "HELO" => non_empty(argument, "HELO").map(Command::Helo),
        "EHLO" => non_empty(argument, "EHLO").map(Command::Ehlo),
        "MAIL" => {
            let rest = strip_keyword(rest, "FROM").ok_or(ParseError::BadPath("MAIL"))?;
            let (from, params) = parse_path(rest, "MAIL")?;
            Ok(Command::Mail { from, params })
        }
        "RCPT" => {
            let rest = strip_keyword(rest, "TO").ok_or(ParseError::BadPath("RCPT"))?;
            let (to, params) = parse_path(rest, "RCPT")?;
            if to.is_empty() {
                return Err(ParseError::BadPath("RCPT"));
            }
            Ok(Command::Rcpt { to, params })
        }
        "DATA" => Ok(Command::Data),
        "RSET" => Ok(Command::Rset),
        "NOOP" => Ok(Command::Noop),
        "QUIT" => Ok(Command::Quit),
        "HELP" => Ok(Command::Help),
        "STARTTLS" => Ok(Command::StartTls),
        "VRFY" => non_empty(argument, "VRFY").map(Command::Vrfy),
        "AUTH" => {
            let mut parts = argument.split_whitespace();
            let mechanism = parts
                .next()
                .ok_or(ParseError::MissingArgument("AUTH"))?
                .to_ascii_uppercase();
            let initial = parts.next().map(|s| s.to_string());
            Ok(Command::Auth { mechanism, initial })
        }
        _ => Ok(Command::Unknown(line.to_string())),
    }
}

fn non_empty(argument: &str, verb: &'static str) -> Result<String, ParseError> {
    if argument.is_empty() {
        Err(ParseError::MissingArgument(verb))
    } else {
        Ok(argument.to_string())
    }
}

/// Strip ` FROM` / ` TO` (case-insensitive) leaving the `:...` part.
fn strip_keyword<'a>(rest: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = rest.trim_start();
    let head = rest.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &rest[keyword.len()..])
}

fn parse_path(rest: &str, verb: &'static str) -> Result<(String, Vec<String>), ParseError> {
    let captures = PATH_ARGUMENT
        .captures(rest)
        .ok_or(ParseError::BadPath(verb))?;

    let path = captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().trim())
        .unwrap_or_default();

    // drop an obsolete source route: <@a,@b:user@host>
    let address = match path.strip_prefix('@') {
        Some(route) => route
            .split_once(':')
            .map(|(_, addr)| addr)
            .ok_or(ParseError::BadPath(verb))?,
        None => path,
    };

    let params = captures
        .get(3)
        .map(|m| m.as_str().split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    Ok((address.to_string(), params))
}
