//! Dialog requests
//!
//! Library code never talks to a terminal. Whenever it needs a decision it
//! builds an [`Ask`], hands it to the registered [`AskHandler`] and reads the
//! answer back out of the same value.

use crate::error::{Error, Result};
use crate::size::parse_size;
use std::fmt;

/// Request kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskKind {
    Number,
    /// A number that may be given relative to a base (`+size`)
    Offset,
    String,
    YesNo,
    Menu,
    Info,
    Warn,
    WarnX,
}

/// Numeric request
#[derive(Debug, Clone, Default)]
pub struct NumberAsk {
    pub query: String,
    /// Human readable description of the accepted values
    pub range: String,
    pub low: u64,
    pub high: u64,
    pub default: u64,
    /// Reference point for relative answers
    pub base: u64,
    /// Bytes per unit of the answer, for answers with a size suffix
    pub unit: u64,
    pub result: u64,
    /// Set by the handler when the answer was relative to `base`
    pub relative: bool,
    /// Values are shown as letters (`a` = 0)
    pub inchars: bool,
    /// `-N` counts back from `high` instead of from `base`
    pub wrap_negative: bool,
}

impl NumberAsk {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            unit: 1,
            ..Default::default()
        }
    }

    pub fn with_range(mut self, low: u64, high: u64) -> Self {
        self.low = low;
        self.high = high;
        self
    }

    pub fn with_default(mut self, default: u64) -> Self {
        self.default = default;
        self.result = default;
        self
    }

    pub fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    pub fn with_unit(mut self, unit: u64) -> Self {
        self.unit = unit.max(1);
        self
    }

    pub fn with_range_text(mut self, range: impl Into<String>) -> Self {
        self.range = range.into();
        self
    }

    pub fn inchars(mut self) -> Self {
        self.inchars = true;
        self
    }

    /// Range description, generated from the bounds when not set explicitly
    pub fn range_text(&self) -> String {
        if !self.range.is_empty() {
            return self.range.clone();
        }
        if self.inchars {
            format!("{}-{}", num_to_char(self.low), num_to_char(self.high))
        } else {
            format!("{}-{}", self.low, self.high)
        }
    }

    /// Interpret a typed answer the way the usual front ends do
    ///
    /// Empty text takes the default. For offset requests `+N` is relative to
    /// the base (a size, so the result is one past the last unit) and `-N`
    /// counts back; a size suffix converts bytes into units.
    pub fn parse_answer(&mut self, text: &str, kind: AskKind) -> Result<()> {
        let text = text.trim();
        self.relative = false;
        if text.is_empty() {
            self.result = self.default;
            return Ok(());
        }
        if self.inchars {
            let mut chars = text.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if c.is_ascii_lowercase() {
                    return self.set_result(c as u64 - 'a' as u64);
                }
            }
            return Err(Error::invalid_argument(format!("'{}' is not a letter", text)));
        }

        let (sign, digits) = match kind {
            AskKind::Offset => match text.as_bytes()[0] {
                b'+' | b'-' => (Some(text.as_bytes()[0]), &text[1..]),
                _ => (None, text),
            },
            _ => (None, text),
        };
        let (mut num, suffixed) = parse_size(digits)?;
        if suffixed {
            num /= self.unit.max(1);
        }
        let value = match sign {
            Some(b'+') => self.base.saturating_add(num),
            Some(_) if self.wrap_negative => self.high.saturating_sub(num),
            Some(_) => self.base.saturating_sub(num),
            None => num,
        };
        self.set_result(value)?;
        self.relative = sign == Some(b'+');
        Ok(())
    }

    /// Store a result after checking it against the bounds
    pub fn set_result(&mut self, value: u64) -> Result<()> {
        if value < self.low || value > self.high {
            return Err(Error::out_of_range(format!(
                "value {} out of range {}",
                value,
                self.range_text()
            )));
        }
        self.result = value;
        Ok(())
    }
}

fn num_to_char(n: u64) -> char {
    char::from(b'a' + (n % 26) as u8)
}

/// Free-form text request
#[derive(Debug, Clone, Default)]
pub struct StringAsk {
    pub query: String,
    pub default: Option<String>,
    pub result: Option<String>,
}

/// Yes/no request
#[derive(Debug, Clone, Default)]
pub struct YesNoAsk {
    pub query: String,
    pub result: bool,
}

/// One menu entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    pub key: char,
    pub name: String,
    pub desc: String,
}

/// Menu request
#[derive(Debug, Clone, Default)]
pub struct MenuAsk {
    pub query: String,
    pub items: Vec<MenuItem>,
    pub default: char,
    pub result: Option<char>,
}

impl MenuAsk {
    pub fn new(query: impl Into<String>, default: char) -> Self {
        Self {
            query: query.into(),
            default,
            ..Default::default()
        }
    }

    pub fn add_item(mut self, key: char, name: impl Into<String>, desc: impl Into<String>) -> Self {
        self.items.push(MenuItem {
            key,
            name: name.into(),
            desc: desc.into(),
        });
        self
    }

    pub fn get_item(&self, key: char) -> Option<&MenuItem> {
        self.items.iter().find(|i| i.key == key)
    }
}

/// A pending dialog request and, once answered, its result
#[derive(Debug, Clone)]
pub enum Ask {
    Number(NumberAsk),
    Offset(NumberAsk),
    String(StringAsk),
    YesNo(YesNoAsk),
    Menu(MenuAsk),
    Info(String),
    /// Warning with the OS error code that caused it
    Warn { message: String, errno: Option<i32> },
    WarnX(String),
}

impl Ask {
    pub fn kind(&self) -> AskKind {
        match self {
            Ask::Number(_) => AskKind::Number,
            Ask::Offset(_) => AskKind::Offset,
            Ask::String(_) => AskKind::String,
            Ask::YesNo(_) => AskKind::YesNo,
            Ask::Menu(_) => AskKind::Menu,
            Ask::Info(_) => AskKind::Info,
            Ask::Warn { .. } => AskKind::Warn,
            Ask::WarnX(_) => AskKind::WarnX,
        }
    }

    /// Question or message text
    pub fn query(&self) -> &str {
        match self {
            Ask::Number(n) | Ask::Offset(n) => &n.query,
            Ask::String(s) => &s.query,
            Ask::YesNo(y) => &y.query,
            Ask::Menu(m) => &m.query,
            Ask::Info(msg) | Ask::WarnX(msg) => msg,
            Ask::Warn { message, .. } => message,
        }
    }

    /// True for messages that need no answer
    pub fn is_passive(&self) -> bool {
        matches!(self, Ask::Info(_) | Ask::Warn { .. } | Ask::WarnX(_))
    }

    pub fn number(&self) -> Option<&NumberAsk> {
        match self {
            Ask::Number(n) | Ask::Offset(n) => Some(n),
            _ => None,
        }
    }

    pub fn number_mut(&mut self) -> Option<&mut NumberAsk> {
        match self {
            Ask::Number(n) | Ask::Offset(n) => Some(n),
            _ => None,
        }
    }

    /// Fill in the default answer
    pub fn answer_default(&mut self) -> Result<()> {
        match self {
            Ask::Number(n) | Ask::Offset(n) => {
                n.result = n.default;
                n.relative = false;
            }
            Ask::String(s) => match s.default.clone() {
                Some(d) => s.result = Some(d),
                None => return Err(Error::aborted(format!("no default for '{}'", s.query))),
            },
            Ask::YesNo(y) => y.result = false,
            Ask::Menu(m) => m.result = Some(m.default),
            Ask::Info(_) | Ask::Warn { .. } | Ask::WarnX(_) => {}
        }
        Ok(())
    }
}

impl fmt::Display for Ask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ask::Warn {
                message,
                errno: Some(errno),
            } => write!(f, "{}: {}", message, std::io::Error::from_raw_os_error(*errno)),
            other => f.write_str(other.query()),
        }
    }
}

/// Receiver of dialog requests
///
/// The handler fills in the result of interactive requests and displays
/// passive ones. Returning an error aborts the operation that asked.
pub trait AskHandler {
    fn ask(&mut self, ask: &mut Ask) -> Result<()>;
}

impl<F> AskHandler for F
where
    F: FnMut(&mut Ask) -> Result<()>,
{
    fn ask(&mut self, ask: &mut Ask) -> Result<()> {
        self(ask)
    }
}

/// Handler taking the default for every question and logging messages
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAnswers;

impl AskHandler for DefaultAnswers {
    fn ask(&mut self, ask: &mut Ask) -> Result<()> {
        match ask {
            Ask::Info(msg) => tracing::info!("{}", msg),
            Ask::Warn { .. } | Ask::WarnX(_) => tracing::warn!("{}", ask),
            _ => ask.answer_default()?,
        }
        Ok(())
    }
}

/// Send `ask` to `handler` and validate the answer
///
/// Without a handler passive messages go to the log and questions fail.
pub fn do_ask(handler: Option<&mut (dyn AskHandler + '_)>, ask: &mut Ask) -> Result<()> {
    let Some(handler) = handler else {
        return match ask {
            Ask::Info(msg) => {
                tracing::info!("{}", msg);
                Ok(())
            }
            Ask::Warn { .. } | Ask::WarnX(_) => {
                tracing::warn!("{}", ask);
                Ok(())
            }
            _ => Err(Error::aborted(format!(
                "no dialog handler to answer '{}'",
                ask.query()
            ))),
        };
    };

    tracing::trace!(kind = ?ask.kind(), query = ask.query(), "asking");
    handler.ask(ask)?;

    match ask {
        Ask::Number(n) | Ask::Offset(n) => {
            if n.result < n.low || n.result > n.high {
                return Err(Error::out_of_range(format!(
                    "answer {} out of range {}",
                    n.result,
                    n.range_text()
                )));
            }
        }
        Ask::String(s) if s.result.is_none() => {
            return Err(Error::aborted(format!("no answer to '{}'", s.query)));
        }
        Ask::Menu(m) => match m.result {
            Some(key) if m.get_item(key).is_some() => {}
            _ => return Err(Error::aborted(format!("no valid choice for '{}'", m.query))),
        },
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_answers() {
        let mut ask = Ask::Number(NumberAsk::new("Partition number").with_range(1, 4).with_default(2));
        do_ask(Some(&mut DefaultAnswers), &mut ask).unwrap();
        assert_eq!(ask.number().unwrap().result, 2);

        let mut ask = Ask::String(StringAsk {
            query: "Name".into(),
            ..Default::default()
        });
        assert!(matches!(do_ask(Some(&mut DefaultAnswers), &mut ask), Err(Error::Aborted(_))));
    }

    #[test]
    fn test_no_handler() {
        let mut info = Ask::Info("Syncing disks.".into());
        do_ask(None, &mut info).unwrap();

        let mut yn = Ask::YesNo(YesNoAsk {
            query: "Continue?".into(),
            ..Default::default()
        });
        assert!(do_ask(None, &mut yn).is_err());
    }

    #[test]
    fn test_closure_handler_range_check() {
        let mut handler = |ask: &mut Ask| -> Result<()> {
            if let Some(n) = ask.number_mut() {
                n.result = 99;
            }
            Ok(())
        };
        let mut ask = Ask::Number(NumberAsk::new("Sector").with_range(1, 10));
        let err = do_ask(Some(&mut handler), &mut ask).unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn test_parse_offset_answer() {
        let mut n = NumberAsk::new("Last sector")
            .with_range(2048, 1_048_542)
            .with_default(1_048_542)
            .with_base(2048)
            .with_unit(512);

        n.parse_answer("+100000", AskKind::Offset).unwrap();
        assert_eq!(n.result, 102_048);
        assert!(n.relative);

        n.parse_answer("+1M", AskKind::Offset).unwrap();
        assert_eq!(n.result, 2048 + 2048);
        assert!(n.relative);

        n.parse_answer("4095", AskKind::Offset).unwrap();
        assert_eq!(n.result, 4095);
        assert!(!n.relative);

        n.parse_answer("", AskKind::Offset).unwrap();
        assert_eq!(n.result, 1_048_542);

        assert!(n.parse_answer("10", AskKind::Offset).is_err());
    }

    #[test]
    fn test_parse_inchars_answer() {
        let mut n = NumberAsk::new("Partition").with_range(0, 15).inchars();
        n.parse_answer("c", AskKind::Number).unwrap();
        assert_eq!(n.result, 2);
        assert_eq!(n.range_text(), "a-p");
    }

    #[test]
    fn test_menu() {
        let mut ask = Ask::Menu(
            MenuAsk::new("Partition type", 'p')
                .add_item('p', "primary", "0 primary, 0 extended, 4 free")
                .add_item('e', "extended", "container for logical partitions"),
        );
        do_ask(Some(&mut DefaultAnswers), &mut ask).unwrap();
        match ask {
            Ask::Menu(m) => assert_eq!(m.result, Some('p')),
            _ => unreachable!(),
        }
    }
}
