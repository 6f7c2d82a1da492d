//! Minimal front-end for DVM-BASIC contract source.
//!
//! Extracts function signatures and whether a function body reads the value
//! sent with the call (`DEROVALUE`) or the asset amount (`ASSETVALUE`).
//! Comments and string literals are removed before scanning, so a token
//! mentioned in either does not count.

use serde::Serialize;

pub const INITIALIZE: &str = "Initialize";
pub const INITIALIZE_PRIVATE: &str = "InitializePrivate";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DvmError {
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("function {function}: unsupported parameter type {ty}")]
    UnknownType { function: String, ty: String },
    #[error("function {0} has no End Function")]
    Unterminated(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ParamType {
    String,
    Uint64,
}

impl ParamType {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Some(ParamType::String),
            "uint64" => Some(ParamType::Uint64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Param {
    pub name: String,
    pub ty: ParamType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: String,
    /// Reads `DEROVALUE()`; the caller should offer a native burn input.
    pub uses_dero_value: bool,
    /// Reads `ASSETVALUE(..)`; the caller should offer an asset burn input.
    pub uses_asset_value: bool,
}

impl Function {
    /// Callable from a transaction: capitalized and not an initializer.
    pub fn is_exported(&self) -> bool {
        self.name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
            && self.name != INITIALIZE
            && self.name != INITIALIZE_PRIVATE
    }
}

/// Remove `//` and `/* */` comments and the contents of string literals,
/// keeping newlines so line numbers stay valid.
pub fn strip_comments_and_strings(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                out.push(' ');
            }
            '"' => {
                out.push('"');
                let mut escaped = false;
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                    }
                    if escaped {
                        escaped = false;
                    } else if n == '\\' {
                        escaped = true;
                    } else if n == '"' {
                        break;
                    }
                }
                out.push('"');
            }
            other => out.push(other),
        }
    }
    out
}

fn has_token(text: &str, token: &str) -> bool {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|t| t.eq_ignore_ascii_case(token))
}

fn is_keyword(line: &str, keyword: &str) -> bool {
    line.get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
        && line[keyword.len()..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace())
}

fn is_end_function(line: &str) -> bool {
    let mut words = line.split_whitespace();
    matches!(
        (words.next(), words.next()),
        (Some(a), Some(b)) if a.eq_ignore_ascii_case("end") && b.eq_ignore_ascii_case("function")
    )
}

fn parse_header(line: &str, lineno: usize) -> Result<(String, Vec<Param>, String), DvmError> {
    let syntax = |msg: &str| DvmError::Syntax {
        line: lineno,
        msg: msg.to_string(),
    };
    let rest = line["function".len()..].trim_start();
    let open = rest.find('(').ok_or_else(|| syntax("missing '('"))?;
    let close = rest.rfind(')').ok_or_else(|| syntax("missing ')'"))?;
    if close < open {
        return Err(syntax("mismatched parentheses"));
    }
    let name = rest[..open].trim().to_string();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(syntax("invalid function name"));
    }
    let mut params = Vec::new();
    for raw in rest[open + 1..close].split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let mut parts = raw.split_whitespace();
        let (pname, ty) = match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(t), None) => (n, t),
            _ => return Err(syntax("parameter must be `name Type`")),
        };
        let ty = ParamType::parse(ty).ok_or_else(|| DvmError::UnknownType {
            function: name.clone(),
            ty: ty.to_string(),
        })?;
        params.push(Param {
            name: pname.to_string(),
            ty,
        });
    }
    let returns = rest[close + 1..].trim().to_string();
    Ok((name, params, returns))
}

/// Every function declared in `code`, in source order.
pub fn parse(code: &str) -> Result<Vec<Function>, DvmError> {
    let clean = strip_comments_and_strings(code);
    let mut functions = Vec::new();
    let mut current: Option<(String, Vec<Param>, String, String)> = None;

    for (idx, line) in clean.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_end_function(line) {
            let (name, params, returns, body) = current.take().ok_or(DvmError::Syntax {
                line: idx + 1,
                msg: "End Function without Function".into(),
            })?;
            functions.push(Function {
                uses_dero_value: has_token(&body, "DEROVALUE"),
                uses_asset_value: has_token(&body, "ASSETVALUE"),
                name,
                params,
                returns,
            });
        } else if is_keyword(line, "function") {
            if let Some((name, ..)) = current {
                return Err(DvmError::Unterminated(name));
            }
            let (name, params, returns) = parse_header(line, idx + 1)?;
            current = Some((name, params, returns, String::new()));
        } else if let Some((_, _, _, body)) = current.as_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    if let Some((name, ..)) = current {
        return Err(DvmError::Unterminated(name));
    }
    Ok(functions)
}

/// Functions a user may invoke.
pub fn exported_functions(code: &str) -> Result<Vec<Function>, DvmError> {
    Ok(parse(code)?.into_iter().filter(Function::is_exported).collect())
}
