//! Lexer for hot-accept call arguments.
//!
//! Extracts accepted-dep URL literals from a `hot.accept(...)` call without a
//! full JavaScript parse. The grammar is exactly two levels deep (an optional
//! array of string literals), so the machine needs no stack: string states
//! remember whether they were entered from the call or from the array.
//!
//! Valid forms: `accept()`, `accept(cb)`, `accept("dep", cb)`,
//! `accept(["a", "b", ...], cb)`. Anything non-literal is an error; the lexer
//! is permissive about whitespace and nothing else.

use crate::error::LexError;

/// One accepted dep literal with its byte span in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedDep {
    pub url: String,
    /// Byte offset of the first character inside the quotes.
    pub start: usize,
    /// Byte offset of the closing quote.
    pub end: usize,
}

/// Result of lexing one accept call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcceptedDeps {
    pub self_accepts: bool,
    pub deps: Vec<AcceptedDep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    Call,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    InCall,
    InArray,
    InString { quote: char, prev: Prev },
}

/// Lex the arguments of a hot-accept call.
///
/// `start` must be the byte index just past the opening `(`.
pub fn lex_accepted_deps(code: &str, start: usize) -> Result<AcceptedDeps, LexError> {
    let mut deps = Vec::new();
    let mut current = String::new();
    let mut current_start = 0usize;
    let mut state = State::InCall;

    let mut chars = code[start..].char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        let pos = start + i;
        match state {
            State::InCall => match ch {
                c if c.is_whitespace() => {}
                '\'' | '"' | '`' => {
                    state = State::InString {
                        quote: ch,
                        prev: Prev::Call,
                    };
                    current.clear();
                    current_start = pos + ch.len_utf8();
                }
                '[' => state = State::InArray,
                // a callback, a closing paren, anything else: the module
                // accepts itself
                _ => {
                    return Ok(AcceptedDeps {
                        self_accepts: true,
                        deps: Vec::new(),
                    })
                }
            },
            State::InArray => match ch {
                c if c.is_whitespace() => {}
                ',' => {}
                ']' => {
                    return Ok(AcceptedDeps {
                        self_accepts: false,
                        deps,
                    })
                }
                '\'' | '"' | '`' => {
                    state = State::InString {
                        quote: ch,
                        prev: Prev::Array,
                    };
                    current.clear();
                    current_start = pos + ch.len_utf8();
                }
                other => return Err(LexError::UnexpectedChar { ch: other, pos }),
            },
            State::InString { quote, prev } => {
                if ch == quote {
                    deps.push(AcceptedDep {
                        url: std::mem::take(&mut current),
                        start: current_start,
                        end: pos,
                    });
                    match prev {
                        // accept("dep", cb): a single literal ends the lex
                        Prev::Call => {
                            return Ok(AcceptedDeps {
                                self_accepts: false,
                                deps,
                            })
                        }
                        Prev::Array => state = State::InArray,
                    }
                } else if quote == '`'
                    && ch == '$'
                    && chars.peek().is_some_and(|&(_, next)| next == '{')
                {
                    return Err(LexError::TemplateInterpolation { pos });
                } else {
                    current.push(ch);
                }
            }
        }
    }
    Err(LexError::Unterminated { pos: start })
}
