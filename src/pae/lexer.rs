use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Token {
    Ident(String),
    Str(String),
    Number { value: f32, integral: bool },
    Equals,
    Comma,
    Plus,
    LBrace,
    RBrace,
    LParen,
    RParen,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier `{name}`"),
            Token::Str(text) => format!("string \"{text}\""),
            Token::Number { value, .. } => format!("number {value}"),
            Token::Equals => "`=`".to_string(),
            Token::Comma => "`,`".to_string(),
            Token::Plus => "`+`".to_string(),
            Token::LBrace => "`{`".to_string(),
            Token::RBrace => "`}`".to_string(),
            Token::LParen => "`(`".to_string(),
            Token::RParen => "`)`".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct Lexed {
    pub token: Token,
    pub offset: usize,
    pub line: usize,
}

fn is_punct(c: char) -> bool {
    matches!(c, '=' | ',' | '+' | '{' | '}' | '(' | ')' | '"')
}

/// Splits a script into tokens, dropping whitespace and `//` comments.
pub(super) fn tokenize(source: &str) -> Result<Vec<Lexed>, ScriptError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    let mut line = 1;

    while let Some(&(offset, c)) = chars.peek() {
        if c == '\n' {
            line += 1;
            chars.next();
            continue;
        }
        if c.is_whitespace() || c == '\u{feff}' {
            chars.next();
            continue;
        }
        if source[offset..].starts_with("//") {
            while let Some(&(_, c)) = chars.peek() {
                if c == '\n' {
                    break;
                }
                chars.next();
            }
            continue;
        }

        let simple = match c {
            '=' => Some(Token::Equals),
            ',' => Some(Token::Comma),
            '+' => Some(Token::Plus),
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            _ => None,
        };
        if let Some(token) = simple {
            chars.next();
            tokens.push(Lexed {
                token,
                offset,
                line,
            });
            continue;
        }

        if c == '"' {
            chars.next();
            let start = offset + 1;
            let mut end = None;
            for (i, c) in chars.by_ref() {
                if c == '"' {
                    end = Some(i);
                    break;
                }
                if c == '\n' {
                    break;
                }
            }
            let Some(end) = end else {
                return Err(ScriptError::new(source, offset, line, "unterminated string"));
            };
            tokens.push(Lexed {
                token: Token::Str(source[start..end].to_string()),
                offset,
                line,
            });
            continue;
        }

        // Numbers and identifiers run until whitespace or punctuation.
        let mut end = offset;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() || is_punct(c) || source[i..].starts_with("//") {
                break;
            }
            end = i + c.len_utf8();
            chars.next();
        }
        let word = &source[offset..end];
        let token = if looks_numeric(word) {
            let value = word.parse::<f32>().map_err(|_| {
                ScriptError::new(source, offset, line, format!("malformed number `{word}`"))
            })?;
            Token::Number {
                value,
                integral: !word.contains(['.', 'e', 'E']),
            }
        } else {
            Token::Ident(word.to_string())
        };
        tokens.push(Lexed {
            token,
            offset,
            line,
        });
    }
    Ok(tokens)
}

fn looks_numeric(word: &str) -> bool {
    let digits = word.strip_prefix('-').unwrap_or(word);
    digits
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|lexed| lexed.token)
            .collect()
    }

    #[test]
    fn splits_punctuation_and_words() {
        assert_eq!(
            kinds("サイズ = 2.0, -3"),
            vec![
                Token::Ident("サイズ".into()),
                Token::Equals,
                Token::Number {
                    value: 2.0,
                    integral: false
                },
                Token::Comma,
                Token::Number {
                    value: -3.0,
                    integral: true
                },
            ]
        );
    }

    #[test]
    fn skips_comments_and_counts_lines() {
        let tokens = tokenize("// header\nobject // trailing\n\"a b\"").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].line, 2);
        assert_eq!(tokens[1].token, Token::Str("a b".into()));
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("テクスチャ = \"abc").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.context.starts_with("\"abc"));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        assert!(tokenize("1.2.3").is_err());
    }
}
