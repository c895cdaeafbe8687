// Text command protocol: one line per command, addressed to a module by name
//
//   <module> <command> [p1,p2,...]
//   <module> set <key> <value>
//   <drive> <number>             legacy form of `<drive> speed <number>`

/// Protocol errors; the router logs them and carries on
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Empty command line")]
    Empty,

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unknown parameter key: {0}")]
    UnknownKey(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid number for {name}: {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub params: String,
}

impl Command {
    pub fn new(name: &str, params: &str) -> Self {
        Self {
            name: name.to_string(),
            params: params.trim().to_string(),
        }
    }

    /// The legacy bare-number form (`<number>[,curvature]`) as an explicit `speed` command
    pub fn bare_number_as_speed(&self) -> Option<Self> {
        if !starts_like_number(&self.name) {
            return None;
        }
        let params = if self.params.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.params)
        };
        Some(Self::new("speed", &params))
    }

    pub fn args(&self) -> Args<'_> {
        Args::new(&self.params)
    }
}

fn starts_like_number(word: &str) -> bool {
    word.chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+' || c == '.')
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Command(Command),
    Set { key: String, value: String },
}

/// A parsed line: target module plus what to do with it
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub module: String,
    pub request: Request,
}

pub fn parse_line(line: &str) -> Result<Line> {
    let (module, rest) = split_word(line.trim());
    if module.is_empty() {
        return Err(CommandError::Empty);
    }
    let (command, params) = split_word(rest);
    if command.is_empty() {
        return Err(CommandError::MissingParameter("command"));
    }

    let request = if command == "set" {
        let (key, value) = split_word(params);
        if key.is_empty() {
            return Err(CommandError::MissingParameter("key"));
        }
        Request::Set {
            key: key.to_string(),
            value: value.trim().to_string(),
        }
    } else {
        Request::Command(Command::new(command, params))
    };

    Ok(Line {
        module: module.to_string(),
        request,
    })
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(i) => (&text[..i], text[i..].trim_start()),
        None => (text, ""),
    }
}

/// Comma-separated command arguments
pub struct Args<'a> {
    parts: Vec<&'a str>,
    next: usize,
}

impl<'a> Args<'a> {
    pub fn new(text: &'a str) -> Self {
        let text = text.trim();
        let parts = if text.is_empty() {
            Vec::new()
        } else {
            text.split(',').map(str::trim).collect()
        };
        Self { parts, next: 0 }
    }

    pub fn optional_f64(&mut self, name: &'static str) -> Result<Option<f64>> {
        let Some(part) = self.parts.get(self.next).copied() else {
            return Ok(None);
        };
        self.next += 1;
        if part.is_empty() {
            return Ok(None);
        }
        parse_f64(name, part).map(Some)
    }

    pub fn f64(&mut self, name: &'static str) -> Result<f64> {
        self.optional_f64(name)?
            .ok_or(CommandError::MissingParameter(name))
    }
}

pub fn parse_f64(name: &'static str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| CommandError::InvalidNumber {
            name,
            value: value.to_string(),
        })
}

/// A finite, nonzero number (scale factors and lengths)
pub fn parse_nonzero(name: &'static str, value: &str) -> Result<f64> {
    let number = parse_f64(name, value)?;
    if number == 0.0 || !number.is_finite() {
        return Err(CommandError::InvalidNumber {
            name,
            value: value.to_string(),
        });
    }
    Ok(number)
}

pub fn parse_u64(name: &'static str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| CommandError::InvalidNumber {
            name,
            value: value.to_string(),
        })
}

pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "on")
}
