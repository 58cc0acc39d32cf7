// Shell-style glob matching for object names plus the prefix/glob split used for listing.

/// Characters that start glob syntax in an object path.
pub const GLOB_CHARACTERS: [char; 4] = ['*', '?', '[', ']'];

/// Splits `path` at its first glob character.
///
/// Returns the literal prefix for server-side listing and, when the path has any
/// glob syntax, the full path as the client-side pattern.
pub fn split_glob(path: &str) -> (String, Option<String>) {
    match path.find(GLOB_CHARACTERS) {
        Some(pos) => (path[..pos].to_string(), Some(path.to_string())),
        None => (path.to_string(), None),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

impl Token {
    fn matches(&self, ch: char) -> bool {
        match self {
            Token::Literal(lit) => *lit == ch,
            Token::AnyChar => true,
            Token::AnyRun => false,
            Token::Class { negated, ranges } => {
                let hit = ranges.iter().any(|(lo, hi)| *lo <= ch && ch <= *hi);
                hit != *negated
            }
        }
    }
}

fn compile(pattern: &str) -> Vec<Token> {
    let chars = pattern.chars().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if tokens.last() != Some(&Token::AnyRun) {
                    tokens.push(Token::AnyRun);
                }
                i += 1;
            }
            '?' => {
                tokens.push(Token::AnyChar);
                i += 1;
            }
            '[' => match compile_class(&chars, i + 1) {
                Some((token, next)) => {
                    tokens.push(token);
                    i = next;
                }
                None => {
                    tokens.push(Token::Literal('['));
                    i += 1;
                }
            },
            ch => {
                tokens.push(Token::Literal(ch));
                i += 1;
            }
        }
    }
    tokens
}

/// Parses a `[...]` class starting after the `[`; `None` when it never closes.
fn compile_class(chars: &[char], start: usize) -> Option<(Token, usize)> {
    let mut i = start;
    let negated = chars.get(i) == Some(&'!');
    if negated {
        i += 1;
    }
    let body_start = i;
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    while i < chars.len() && chars[i] != ']' {
        i += 1;
    }
    if i >= chars.len() {
        return None;
    }
    let body = &chars[body_start..i];
    let mut ranges = Vec::new();
    let mut j = 0;
    while j < body.len() {
        if j + 2 < body.len() && body[j + 1] == '-' {
            if body[j] <= body[j + 2] {
                ranges.push((body[j], body[j + 2]));
            }
            j += 3;
        } else {
            ranges.push((body[j], body[j]));
            j += 1;
        }
    }
    Some((Token::Class { negated, ranges }, i + 1))
}

/// Case-sensitive shell glob match; `*` also crosses `/`.
pub fn fnmatch(name: &str, pattern: &str) -> bool {
    let tokens = compile(pattern);
    let chars = name.chars().collect::<Vec<_>>();
    let (mut t, mut c) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < chars.len() {
        match tokens.get(t) {
            Some(Token::AnyRun) => {
                backtrack = Some((t, c));
                t += 1;
                continue;
            }
            Some(token) if token.matches(chars[c]) => {
                t += 1;
                c += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, from)) => {
                t = star + 1;
                c = from + 1;
                backtrack = Some((star, from + 1));
            }
            None => return false,
        }
    }
    tokens[t..].iter().all(|token| *token == Token::AnyRun)
}
