/// Core value types: tokens, tags, contexts and edge records.
///
/// Tokens and tags are opaque to the store. Everything is ordered and
/// serializable so that contexts can be used as table keys and hashed from
/// their canonical byte form.
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single chain token.
///
/// `Start` pads a context before the first real token and `End` terminates a
/// sequence. Everything else is caller data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Token {
    /// Padding before the first real token
    Start,
    /// Terminal marker
    End,
    /// Free text (a word, a character, ...)
    Text(String),
    /// A symbolic atom
    Symbol(String),
    /// An integer
    Int(i64),
    /// A structured term
    List(Vec<Token>),
}

impl Token {
    /// Build a text token.
    pub fn text(value: impl Into<String>) -> Self {
        Token::Text(value.into())
    }

    /// Build a symbol token.
    pub fn symbol(value: impl Into<String>) -> Self {
        Token::Symbol(value.into())
    }

    /// True for `Start` and `End`.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Token::Start | Token::End)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token::Text(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token::Text(value)
    }
}

impl From<i64> for Token {
    fn from(value: i64) -> Self {
        Token::Int(value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Start => write!(f, "<start>"),
            Token::End => write!(f, "<end>"),
            Token::Text(s) => write!(f, "{}", s),
            Token::Symbol(s) => write!(f, ":{}", s),
            Token::Int(i) => write!(f, "{}", i),
            Token::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Label attached to training data.
///
/// Untagged training records edges under `Tag::Default`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Reserved tag used when training without tags
    Default,
    /// Caller-supplied tag
    Value(Token),
}

impl Tag {
    /// Shorthand for a symbolic tag such as `:noun`.
    pub fn symbol(value: impl Into<String>) -> Self {
        Tag::Value(Token::Symbol(value.into()))
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Tag::symbol(value)
    }
}

impl From<Token> for Tag {
    fn from(value: Token) -> Self {
        Tag::Value(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Default => write!(f, "<default>"),
            Tag::Value(token) => write!(f, "{}", token),
        }
    }
}

/// The sliding window of `order` tokens used as a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Context(Vec<Token>);

impl Context {
    /// Wrap a token window.
    pub fn new(tokens: Vec<Token>) -> Self {
        Self(tokens)
    }

    /// The initial context: `order` copies of `Start`.
    pub fn start(order: usize) -> Self {
        Self(vec![Token::Start; order])
    }

    /// Drop the oldest token and append `next`.
    pub fn slide(&mut self, next: Token) {
        if !self.0.is_empty() {
            self.0.remove(0);
            self.0.push(next);
        }
    }

    /// Tokens in window order.
    pub fn tokens(&self) -> &[Token] {
        &self.0
    }

    /// Window length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-order context.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical byte form used for hashing onto the ring.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Vec<Token> has no failure modes under bincode's default config.
        bincode::serialize(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, token) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", token)?;
        }
        write!(f, ")")
    }
}

/// One stored edge, as returned by partition dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Lookup key
    pub context: Context,
    /// Tag the edge was trained under
    pub tag: Tag,
    /// Next token
    pub target: Token,
    /// Occurrence count, always >= 1
    pub weight: u64,
}

/// Default token sanitizer applied to context tokens when
/// `sanitize_tokens` is enabled.
///
/// Text tokens are lowercased and stripped of everything that is not
/// alphanumeric. Other tokens pass through unchanged.
pub fn sanitize(token: &Token) -> Token {
    match token {
        Token::Text(s) => Token::Text(
            s.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect(),
        ),
        other => other.clone(),
    }
}
