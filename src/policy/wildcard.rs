//! Pattern matching for selection rules, operations and resources.
//!
//! | Pattern | Semantics |
//! |---------|-----------|
//! | `"*"` | matches everything |
//! | `"prefix*"` | prefix match |
//! | `"*suffix"` | suffix match |
//! | `"*contains*"` | contains match |
//! | `"exact"` | exact match |
//!
//! Resources use a full glob instead ([`resource_matches`]): any number of
//! `*` anywhere, plus MQTT `+` (one topic level) and `#` (remaining levels)
//! when they occupy a whole level.

// ─────────────────────────────────────────────────────────────────────────────
// Simple glob
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled glob pattern supporting `*`, `prefix*`, `*suffix`, `*mid*`,
/// and exact matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobPattern {
    /// `*`
    Wildcard,
    /// No `*` at either end.
    Exact(String),
    /// Trailing `*`.
    Prefix(String),
    /// Leading `*`.
    Suffix(String),
    /// Leading and trailing `*`.
    Contains(String),
}

impl GlobPattern {
    /// Compile `s`. Only a leading and a trailing `*` are special.
    #[must_use]
    pub fn new(s: &str) -> Self {
        if s == "*" {
            return Self::Wildcard;
        }
        let inner_start = usize::from(s.starts_with('*'));
        let inner_end = s.len() - usize::from(s.ends_with('*') && s.len() > inner_start);
        let inner = s[inner_start..inner_end].to_string();
        match (inner_start == 1, inner_end < s.len()) {
            (true, true) if inner.is_empty() => Self::Wildcard,
            (true, true) => Self::Contains(inner),
            (true, false) => Self::Suffix(inner),
            (false, true) => Self::Prefix(inner),
            (false, false) => Self::Exact(inner),
        }
    }

    /// Whether `name` matches.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(e) => name == e,
            Self::Prefix(p) => name.starts_with(p.as_str()),
            Self::Suffix(s) => name.ends_with(s.as_str()),
            Self::Contains(c) => name.contains(c.as_str()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a granted operation covers the requested one.
///
/// `mqtt:publish` is covered by itself, by a trailing-wildcard pattern such
/// as `mqtt:*` or `mqtt:pub*`, and by `*`.
#[must_use]
pub fn operation_matches(granted: &str, requested: &str) -> bool {
    match granted.strip_suffix('*') {
        Some(prefix) => requested.starts_with(prefix),
        None => granted == requested,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resources
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Char(char),
    /// `*`: any run of characters
    Any,
    /// `+`: exactly one topic level
    Level,
    /// `#`: all remaining topic levels
    Rest,
}

fn is_level_start(prev: Option<char>) -> bool {
    matches!(prev, None | Some('/' | ':'))
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    for (i, &c) in chars.iter().enumerate() {
        let prev = i.checked_sub(1).map(|p| chars[p]);
        let next = chars.get(i + 1).copied();
        let token = match c {
            // collapse runs of `*`
            '*' if tokens.last() == Some(&Token::Any) => continue,
            '*' => Token::Any,
            '+' if is_level_start(prev) && matches!(next, None | Some('/')) => Token::Level,
            '#' if is_level_start(prev) && next.is_none() => Token::Rest,
            c => Token::Char(c),
        };
        tokens.push(token);
    }
    tokens
}

/// Whether the granted resource pattern covers `resource`.
///
/// A granted `+` covers one concrete level or a requested `+`, never a
/// requested `#`.
///
/// Runs in `O(pattern × resource)`.
#[must_use]
pub fn resource_matches(pattern: &str, resource: &str) -> bool {
    if pattern == resource {
        return true;
    }
    let tokens = tokenize(pattern);
    let text: Vec<char> = resource.chars().collect();
    let (p_len, t_len) = (tokens.len(), text.len());

    // row p: does tokens[p..] match text[t..] for every t
    let mut next_row = vec![false; t_len + 1];
    next_row[t_len] = true;
    let mut row = vec![false; t_len + 1];

    for p in (0..p_len).rev() {
        for t in (0..=t_len).rev() {
            row[t] = match tokens[p] {
                Token::Any => next_row[t] || (t < t_len && row[t + 1]),
                Token::Level => {
                    let end = text[t..]
                        .iter()
                        .position(|&c| c == '/')
                        .map_or(t_len, |i| t + i);
                    // a requested `#` spans levels; only a granted `#` covers it
                    let is_rest = end == t + 1 && text[t] == '#';
                    !is_rest && next_row[end]
                }
                Token::Rest => true,
                Token::Char(c) => {
                    let parent_of_rest = c == '/' && t == t_len && tokens.get(p + 1) == Some(&Token::Rest);
                    parent_of_rest || (t < t_len && text[t] == c && next_row[t + 1])
                }
            };
        }
        std::mem::swap(&mut row, &mut next_row);
    }
    next_row[0]
}
