//! The Bayeux error string, `"<code>:<arg1>,<arg2>:<description>"`.

use std::fmt;

/// A protocol-level error carried in a response's `error` field.
///
/// Parsed from the colon-delimited wire form; [`fmt::Display`] re-renders it,
/// so the surfaced error string equals what the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub code: u16,
    pub args: Vec<String>,
    pub description: String,
}

impl ResponseError {
    /// Parses the wire form. A string that does not split into exactly three
    /// colon-delimited parts (or whose code is not numeric) is kept whole as
    /// the description with code 0.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(3, ':');
        let (code, args, description) = match (parts.next(), parts.next(), parts.next()) {
            (Some(code), Some(args), Some(description)) => match code.parse::<u16>() {
                Ok(code) => (code, args, description),
                Err(_) => return Self::opaque(raw),
            },
            _ => return Self::opaque(raw),
        };
        let args = args
            .split(',')
            .filter(|a| !a.is_empty())
            .map(str::to_owned)
            .collect();
        Self {
            code,
            args,
            description: description.to_owned(),
        }
    }

    fn opaque(raw: &str) -> Self {
        Self {
            code: 0,
            args: Vec::new(),
            description: raw.to_owned(),
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.code,
            self.args.join(","),
            self.description
        )
    }
}

impl std::error::Error for ResponseError {}
