//! Source rewriting applied before a module is evaluated.
//!
//! TypeScript sources have their type syntax erased first. Every module then has its ES module
//! syntax rewritten into the CommonJS `exports`/`require` form the runtime provides. Only the
//! built-in `dgate` modules may be imported.
//!
//! Both passes work on a light tokenizer that understands strings, template literals, regex
//! literals and comments, so rewriting never touches text inside them. Type erasure covers
//! annotations, return types, `as`/`satisfies` casts, generics on declarations and calls,
//! `interface`/`type`/`declare` statements, access modifiers and non-null assertions. Enums
//! and namespaces are left untouched and fail at evaluation.
use crate::{
    core::resources::ModuleType,
    ports::scripting::{ScriptError, ScriptResult},
};

/// Module specifiers resolvable by `require`.
pub const BUILTIN_MODULES: [&str; 2] = ["dgate", "dgate/storage"];

/// Rewrite `source` into plain JavaScript with CommonJS exports.
pub fn transpile(source: &str, module_type: ModuleType) -> ScriptResult<String> {
    match module_type {
        ModuleType::Typescript => rewrite_modules(&strip_types(source)?),
        ModuleType::Javascript => rewrite_modules(source),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Space,
    Comment,
    Ident,
    Number,
    Str,
    Template,
    Regex,
    Punct,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: Kind,
    text: &'a str,
}

const SEMI: Token<'static> = Token {
    kind: Kind::Punct,
    text: ";",
};

// Longest first.
const PUNCTUATORS: [&str; 32] = [
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "?.",
    "??", "==", "!=", "<=", ">=", "&&", "||", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<",
];

const EXPRESSION_KEYWORDS: [&str; 16] = [
    "return",
    "typeof",
    "instanceof",
    "in",
    "of",
    "new",
    "delete",
    "void",
    "throw",
    "case",
    "do",
    "else",
    "yield",
    "await",
    "export",
    "default",
];

const CONTROL_KEYWORDS: [&str; 8] = [
    "if", "for", "while", "switch", "with", "return", "typeof", "await",
];

const MODIFIERS: [&str; 7] = [
    "public",
    "private",
    "protected",
    "readonly",
    "abstract",
    "override",
    "declare",
];

impl Token<'_> {
    fn is_trivia(&self) -> bool {
        matches!(self.kind, Kind::Space | Kind::Comment)
    }

    fn is(&self, text: &str) -> bool {
        matches!(self.kind, Kind::Ident | Kind::Punct) && self.text == text
    }

    fn is_ident(&self) -> bool {
        self.kind == Kind::Ident
    }

    fn has_newline(&self) -> bool {
        self.is_trivia() && self.text.contains('\n')
    }

    fn ends_expression(&self) -> bool {
        match self.kind {
            Kind::Number | Kind::Str | Kind::Template | Kind::Regex => true,
            Kind::Ident => !EXPRESSION_KEYWORDS.contains(&self.text),
            Kind::Punct => matches!(self.text, ")" | "]" | "}"),
            Kind::Space | Kind::Comment => false,
        }
    }
}

fn unterminated(what: &str) -> ScriptError {
    ScriptError::Transpile(format!("unterminated {what}"))
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$' || c == b'#' || c >= 0x80
}

fn is_ident_part(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c >= 0x80
}

fn skip_string(bytes: &[u8], start: usize) -> ScriptResult<usize> {
    let quote = bytes[start];
    let mut i = start + 1;
    loop {
        match bytes.get(i) {
            None | Some(b'\n') => return Err(unterminated("string")),
            Some(b'\\') => i += 2,
            Some(&c) if c == quote => return Ok(i + 1),
            Some(_) => i += 1,
        }
    }
}

fn skip_template(bytes: &[u8], start: usize) -> ScriptResult<usize> {
    let mut i = start + 1;
    loop {
        match bytes.get(i) {
            None => return Err(unterminated("template literal")),
            Some(b'\\') => i += 2,
            Some(b'`') => return Ok(i + 1),
            Some(b'$') if bytes.get(i + 1) == Some(&b'{') => {
                i = skip_substitution(bytes, i + 2)?;
            }
            Some(_) => i += 1,
        }
    }
}

fn skip_substitution(bytes: &[u8], start: usize) -> ScriptResult<usize> {
    let mut depth = 1usize;
    let mut i = start;
    loop {
        match bytes.get(i) {
            None => return Err(unterminated("template substitution")),
            Some(b'{') => {
                depth += 1;
                i += 1;
            }
            Some(b'}') => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            Some(b'"' | b'\'') => i = skip_string(bytes, i)?,
            Some(b'`') => i = skip_template(bytes, i)?,
            Some(_) => i += 1,
        }
    }
}

fn skip_regex(bytes: &[u8], start: usize) -> ScriptResult<usize> {
    let mut i = start + 1;
    let mut in_class = false;
    loop {
        match bytes.get(i) {
            None | Some(b'\n') => return Err(unterminated("regular expression")),
            Some(b'\\') => i += 2,
            Some(b'[') => {
                in_class = true;
                i += 1;
            }
            Some(b']') => {
                in_class = false;
                i += 1;
            }
            Some(b'/') if !in_class => {
                i += 1;
                break;
            }
            Some(_) => i += 1,
        }
    }
    while i < bytes.len() && is_ident_part(bytes[i]) {
        i += 1;
    }
    Ok(i)
}

fn tokenize(src: &str) -> ScriptResult<Vec<Token<'_>>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut prev: Option<Token<'_>> = None;
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        let kind = if c.is_ascii_whitespace() {
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            Kind::Space
        } else if c == b'/' && next == Some(b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            Kind::Comment
        } else if c == b'/' && next == Some(b'*') {
            let end = src[i + 2..]
                .find("*/")
                .ok_or_else(|| unterminated("comment"))?;
            i += 2 + end + 2;
            Kind::Comment
        } else if c == b'"' || c == b'\'' {
            i = skip_string(bytes, i)?;
            Kind::Str
        } else if c == b'`' {
            i = skip_template(bytes, i)?;
            Kind::Template
        } else if c == b'/' && !prev.is_some_and(|t| t.ends_expression()) {
            i = skip_regex(bytes, i)?;
            Kind::Regex
        } else if is_ident_start(c) {
            i += 1;
            while i < bytes.len() && is_ident_part(bytes[i]) {
                i += 1;
            }
            Kind::Ident
        } else if c.is_ascii_digit() || (c == b'.' && next.is_some_and(|n| n.is_ascii_digit())) {
            i += 1;
            while i < bytes.len() && (is_ident_part(bytes[i]) || bytes[i] == b'.') {
                i += 1;
            }
            Kind::Number
        } else {
            let rest = &src[i..];
            i += PUNCTUATORS
                .iter()
                .find(|p| rest.starts_with(**p))
                .map_or(1, |p| p.len());
            Kind::Punct
        };
        let token = Token {
            kind,
            text: &src[start..i],
        };
        if !token.is_trivia() {
            prev = Some(token);
        }
        tokens.push(token);
    }
    Ok(tokens)
}

fn next_sig(toks: &[Token<'_>], from: usize) -> Option<usize> {
    (from..toks.len()).find(|&j| !toks[j].is_trivia())
}

fn sig_is(toks: &[Token<'_>], idx: Option<usize>, text: &str) -> bool {
    idx.is_some_and(|j| toks[j].is(text))
}

/// Index of the bracket closing the one at `open`.
fn matching(toks: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (j, t) in toks.iter().enumerate().skip(open) {
        if t.kind != Kind::Punct {
            continue;
        }
        match t.text {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
    }
    None
}

fn continues_type(last: &str, next: Option<&Token<'_>>) -> bool {
    matches!(last, "|" | "&" | "=>" | ":" | "?" | "keyof" | "typeof" | "=" | ",")
        || next.is_some_and(|t| t.is("|") || t.is("&") || t.is("=>"))
}

/// Index just past the last token of a type starting at `from`.
///
/// The type ends before a depth-0 token matching `stop`, before an unbalanced closing
/// bracket, or at a line break that cannot continue a type.
fn skip_type(toks: &[Token<'_>], from: usize, stop: &dyn Fn(&Token<'_>) -> bool) -> usize {
    let mut depth = 0usize;
    let mut end = from;
    let mut last: Option<&str> = None;
    let mut i = from;
    while i < toks.len() {
        let t = toks[i];
        if t.is_trivia() {
            if depth == 0
                && t.has_newline()
                && let Some(last) = last
                && !continues_type(last, next_sig(toks, i).map(|j| &toks[j]))
            {
                break;
            }
            i += 1;
            continue;
        }
        if depth == 0 && stop(&t) {
            break;
        }
        if t.kind == Kind::Punct {
            match t.text {
                "(" | "[" | "{" | "<" => depth += 1,
                ")" | "]" | "}" => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                ">" | ">>" | ">>>" => {
                    if depth == 0 {
                        break;
                    }
                    depth = depth.saturating_sub(t.text.len());
                }
                _ => {}
            }
        }
        last = Some(t.text);
        i += 1;
        end = i;
    }
    end
}

/// End of a return type annotation whose `:` sits at `colon`, and the token that follows it.
fn return_type(toks: &[Token<'_>], colon: usize) -> (usize, Option<usize>) {
    let mut from = colon + 1;
    // an object type literal can start a return type; consume it before looking for `{`
    if let Some(first) = next_sig(toks, from)
        && toks[first].is("{")
        && let Some(close) = matching(toks, first)
    {
        from = close + 1;
    }
    let end = skip_type(toks, from, &|t| {
        t.is("{") || t.is("=>") || t.is(";") || t.is(",")
    });
    let end = end.max(from);
    (end, next_sig(toks, end))
}

/// Index of the `>` closing type arguments opened at `open`, when they are followed by a call
/// or a declaration body.
fn generic_args_end(toks: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut nest = 0usize;
    for (j, t) in toks.iter().enumerate().skip(open).take(96) {
        if t.is_trivia() {
            continue;
        }
        let type_like = match t.kind {
            Kind::Ident | Kind::Str | Kind::Number => true,
            Kind::Punct => matches!(
                t.text,
                "<" | ">" | ">>" | "," | "." | "[" | "]" | "|" | "&" | "{" | "}" | ":" | "?"
                    | "(" | ")" | "=>" | "="
            ),
            _ => false,
        };
        if !type_like {
            return None;
        }
        match t.text {
            "(" | "[" | "{" => nest += 1,
            ")" | "]" | "}" => nest = nest.checked_sub(1)?,
            "<" => depth += 1,
            ">" | ">>" if nest == 0 => {
                depth = depth.checked_sub(t.text.len())?;
                if depth == 0 {
                    let after = next_sig(toks, j + 1).map(|k| toks[k]);
                    return after
                        .filter(|a| {
                            a.is("(") || a.is("{") || a.is("extends") || a.is("implements")
                        })
                        .map(|_| j);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Paren { params: bool, in_default: bool },
    Brace { class: bool, in_init: bool },
    Bracket,
}

fn trim_spaces(out: &mut String) {
    let len = out.trim_end_matches([' ', '\t']).len();
    out.truncate(len);
}

fn is_param_list(
    toks: &[Token<'_>],
    open: usize,
    prev: Option<Token<'_>>,
    prev2: Option<Token<'_>>,
) -> bool {
    let Some(close) = matching(toks, open) else {
        return false;
    };
    let after = next_sig(toks, close + 1);
    if let Some(p) = prev {
        if p.is("function") || p.is("catch") {
            return true;
        }
        if p.is_ident() && prev2.is_some_and(|p2| p2.is("function")) {
            return true;
        }
        if sig_is(toks, after, "=>") {
            return true;
        }
        let method_like = p.is_ident() && !CONTROL_KEYWORDS.contains(&p.text);
        if method_like && sig_is(toks, after, "{") {
            return true;
        }
        if let Some(colon) = after.filter(|&j| toks[j].is(":")) {
            let (_, follow) = return_type(toks, colon);
            return sig_is(toks, follow, "=>") || (method_like && sig_is(toks, follow, "{"));
        }
        return false;
    }
    sig_is(toks, after, "=>")
}

/// Erase TypeScript-only syntax, keeping everything else byte for byte.
fn strip_types(source: &str) -> ScriptResult<String> {
    let toks = tokenize(source)?;
    let mut out = String::with_capacity(source.len());
    let mut frames: Vec<Frame> = Vec::new();
    let mut prev: Option<Token<'_>> = None;
    let mut prev2: Option<Token<'_>> = None;
    let mut newline = false;
    let mut pending_class = false;
    let mut i = 0;

    while i < toks.len() {
        let t = toks[i];
        if t.is_trivia() {
            newline |= t.has_newline();
            out.push_str(t.text);
            i += 1;
            continue;
        }
        let next = next_sig(&toks, i + 1);
        let next_tok = next.map(|j| toks[j]);
        let at_stmt = match prev {
            None => true,
            Some(p) => p.is(";") || p.is("{") || p.is("}") || (newline && p.ends_expression()),
        };
        let top = frames.last().copied();

        // whole statements that only exist at the type level
        if at_stmt && t.is("export") && next_tok.is_some_and(|n| n.is("interface") || n.is("declare"))
        {
            i += 1;
            continue;
        }
        if at_stmt
            && t.is("export")
            && next_tok.is_some_and(|n| n.is("type"))
            && next_sig(&toks, next.map_or(i, |j| j + 1)).is_some_and(|k| !toks[k].is("="))
        {
            if sig_is(&toks, next.and_then(|j| next_sig(&toks, j + 1)), "{") {
                i = skip_statement(&toks, i + 1);
                continue;
            }
            i += 1;
            continue;
        }
        if at_stmt && t.is("interface") && next_tok.is_some_and(|n| n.is_ident()) {
            let body = (i..toks.len()).find(|&j| toks[j].is("{"));
            match body.and_then(|b| matching(&toks, b)) {
                Some(close) => {
                    i = close + 1;
                    prev = Some(SEMI);
                    newline = false;
                    continue;
                }
                None => return Err(unterminated("interface")),
            }
        }
        if at_stmt
            && t.is("type")
            && next_tok.is_some_and(|n| n.is_ident())
            && let Some(name) = next
        {
            let mut k = next_sig(&toks, name + 1);
            if sig_is(&toks, k, "<") {
                k = k
                    .map(|lt| skip_type(&toks, lt, &|t| t.is("=")))
                    .and_then(|end| next_sig(&toks, end));
            }
            if let Some(eq) = k.filter(|&e| toks[e].is("=")) {
                let end = skip_type(&toks, eq + 1, &|t| t.is(";"));
                i = if sig_is(&toks, next_sig(&toks, end), ";") {
                    next_sig(&toks, end).map_or(end, |s| s + 1)
                } else {
                    end
                };
                prev = Some(SEMI);
                newline = false;
                continue;
            }
        }
        if at_stmt && t.is("declare") && next_tok.is_some_and(|n| n.is_ident()) {
            i = skip_statement(&toks, i + 1);
            prev = Some(SEMI);
            newline = false;
            continue;
        }
        if at_stmt && t.is("import") && next_tok.is_some_and(|n| n.is("type")) {
            i = skip_statement(&toks, i + 1);
            prev = Some(SEMI);
            newline = false;
            continue;
        }
        // import/export clauses are copied verbatim so `as` renames survive
        if at_stmt
            && (t.is("import") && !next_tok.is_some_and(|n| n.is("(") || n.is("."))
                || t.is("export") && next_tok.is_some_and(|n| n.is("{") || n.is("*")))
        {
            let end = clause_end(&toks, i);
            for tok in &toks[i..end] {
                out.push_str(tok.text);
            }
            i = end;
            prev = Some(SEMI);
            newline = false;
            continue;
        }

        if t.is_ident()
            && MODIFIERS.contains(&t.text)
            && next_tok.is_some_and(|n| n.is_ident() || n.is("["))
            && prev.is_none_or(|p| p.is("{") || p.is(";") || p.is("}") || p.is("(") || p.is(",") || newline)
        {
            i = next.unwrap_or(i + 1);
            continue;
        }

        if (t.is("as") || t.is("satisfies"))
            && prev.is_some_and(|p| p.ends_expression())
            && next_tok.is_some_and(|n| {
                n.is_ident() || n.kind == Kind::Str || n.is("{") || n.is("[") || n.is("(")
            })
        {
            trim_spaces(&mut out);
            i = skip_type(&toks, i + 1, &|t| {
                t.kind == Kind::Punct
                    && !matches!(
                        t.text,
                        "." | "<" | ">" | ">>" | "|" | "&" | "[" | "(" | "{" | "=>"
                    )
            });
            continue;
        }

        if t.is("<")
            && prev.is_some_and(|p| p.is_ident() && !EXPRESSION_KEYWORDS.contains(&p.text))
            && let Some(close) = generic_args_end(&toks, i)
        {
            i = close + 1;
            continue;
        }

        if t.is("implements") && pending_class {
            i = (i..toks.len()).find(|&j| toks[j].is("{")).unwrap_or(toks.len());
            continue;
        }

        if t.is("!")
            && i > 0
            && !toks[i - 1].is_trivia()
            && prev.is_some_and(|p| p.ends_expression())
            && toks.get(i + 1).is_none_or(|n| {
                n.is_trivia()
                    || n.is(".")
                    || n.is("?.")
                    || n.is(")")
                    || n.is("]")
                    || n.is(";")
                    || n.is(",")
                    || n.is("[")
                    || n.is(":")
            })
        {
            i += 1;
            continue;
        }

        if t.is("?") && sig_is(&toks, next, ":") {
            let optional = match top {
                Some(Frame::Paren {
                    params: true,
                    in_default: false,
                }) => true,
                Some(Frame::Brace {
                    class: true,
                    in_init: false,
                }) => prev.is_some_and(|p| p.is_ident()),
                _ => false,
            };
            if optional {
                i += 1;
                continue;
            }
        }

        if t.is(":") {
            let annotation = match top {
                Some(Frame::Paren {
                    params: true,
                    in_default: false,
                }) => true,
                Some(Frame::Brace {
                    class: true,
                    in_init: false,
                }) => prev.is_some_and(|p| p.is_ident()),
                _ => {
                    prev.is_some_and(|p| p.is_ident())
                        && prev2.is_some_and(|p| p.is("let") || p.is("const") || p.is("var"))
                }
            };
            if annotation {
                trim_spaces(&mut out);
                i = skip_type(&toks, i + 1, &|t| {
                    t.is(",") || t.is("=") || t.is(";") || t.is("in") || t.is("of")
                });
                continue;
            }
        }

        match t.text {
            "(" if t.kind == Kind::Punct => {
                frames.push(Frame::Paren {
                    params: is_param_list(&toks, i, prev, prev2),
                    in_default: false,
                });
            }
            "{" if t.kind == Kind::Punct => {
                frames.push(Frame::Brace {
                    class: pending_class,
                    in_init: false,
                });
                pending_class = false;
            }
            "[" if t.kind == Kind::Punct => frames.push(Frame::Bracket),
            "}" | "]" if t.kind == Kind::Punct => {
                frames.pop();
            }
            "=" => match frames.last_mut() {
                Some(Frame::Paren {
                    params: true,
                    in_default,
                }) => *in_default = true,
                Some(Frame::Brace {
                    class: true,
                    in_init,
                }) => *in_init = true,
                _ => {}
            },
            "," => {
                if let Some(Frame::Paren { in_default, .. }) = frames.last_mut() {
                    *in_default = false;
                }
            }
            ";" => {
                if let Some(Frame::Brace { in_init, .. }) = frames.last_mut() {
                    *in_init = false;
                }
            }
            "class" if t.is_ident() => pending_class = true,
            _ => {}
        }

        if newline
            && t.is_ident()
            && let Some(Frame::Brace {
                class: true,
                in_init,
            }) = frames.last_mut()
        {
            *in_init = false;
        }

        out.push_str(t.text);
        prev2 = prev;
        prev = Some(t);
        newline = false;
        i += 1;

        if t.is(")") && t.kind == Kind::Punct {
            if let Some(Frame::Paren { params: true, .. }) = frames.pop()
                && let Some(colon) = next.filter(|&j| toks[j].is(":"))
            {
                let (end, _) = return_type(&toks, colon);
                trim_spaces(&mut out);
                i = end;
            }
        }
    }
    Ok(out)
}

/// Index past a statement starting at `from`, including its `;`.
fn skip_statement(toks: &[Token<'_>], from: usize) -> usize {
    let end = skip_type(toks, from, &|t| t.is(";"));
    match next_sig(toks, end) {
        Some(semi) if toks[semi].is(";") => semi + 1,
        _ => end,
    }
}

/// Index past an import or re-export clause: the module specifier string, or the closing
/// brace of a local export list.
fn clause_end(toks: &[Token<'_>], start: usize) -> usize {
    let mut i = start + 1;
    while i < toks.len() {
        let t = toks[i];
        if t.kind == Kind::Str {
            return i + 1;
        }
        if t.is("}") {
            let after = next_sig(toks, i + 1);
            if sig_is(toks, after, "from") {
                i += 1;
                continue;
            }
            return i + 1;
        }
        if t.is(";") {
            return i;
        }
        i += 1;
    }
    i
}

fn malformed(what: &str) -> ScriptError {
    ScriptError::Transpile(format!("malformed {what} statement"))
}

fn module_specifier<'a>(tok: &Token<'a>) -> ScriptResult<&'a str> {
    if tok.kind != Kind::Str || tok.text.len() < 2 {
        return Err(malformed("import"));
    }
    let spec = &tok.text[1..tok.text.len() - 1];
    if BUILTIN_MODULES.contains(&spec) {
        Ok(spec)
    } else {
        Err(ScriptError::UnsupportedImport(spec.to_string()))
    }
}

fn expect_sig(toks: &[Token<'_>], from: usize, what: &str) -> ScriptResult<usize> {
    next_sig(toks, from).ok_or_else(|| malformed(what))
}

fn rewrite_import(toks: &[Token<'_>], start: usize, out: &mut String) -> ScriptResult<usize> {
    let mut j = expect_sig(toks, start + 1, "import")?;
    if toks[j].kind == Kind::Str {
        module_specifier(&toks[j])?;
        out.push_str(&format!("require({})", toks[j].text));
        return Ok(j + 1);
    }

    let mut default = None;
    let mut namespace = None;
    let mut named: Vec<(&str, &str)> = Vec::new();

    if toks[j].is_ident() && !toks[j].is("from") {
        default = Some(toks[j].text);
        j = expect_sig(toks, j + 1, "import")?;
        if toks[j].is(",") {
            j = expect_sig(toks, j + 1, "import")?;
        }
    }
    if toks[j].is("*") {
        let as_kw = expect_sig(toks, j + 1, "import")?;
        let name = expect_sig(toks, as_kw + 1, "import")?;
        if !toks[as_kw].is("as") || !toks[name].is_ident() {
            return Err(malformed("import"));
        }
        namespace = Some(toks[name].text);
        j = expect_sig(toks, name + 1, "import")?;
    } else if toks[j].is("{") {
        j = expect_sig(toks, j + 1, "import")?;
        while !toks[j].is("}") {
            if !toks[j].is_ident() {
                return Err(malformed("import"));
            }
            let imported = toks[j].text;
            let mut local = imported;
            j = expect_sig(toks, j + 1, "import")?;
            if toks[j].is("as") {
                let alias = expect_sig(toks, j + 1, "import")?;
                local = toks[alias].text;
                j = expect_sig(toks, alias + 1, "import")?;
            }
            named.push((imported, local));
            if toks[j].is(",") {
                j = expect_sig(toks, j + 1, "import")?;
            }
        }
        j = expect_sig(toks, j + 1, "import")?;
    }
    if !toks[j].is("from") {
        return Err(malformed("import"));
    }
    let spec = expect_sig(toks, j + 1, "import")?;
    module_specifier(&toks[spec])?;
    let require = format!("require({})", toks[spec].text);

    let mut parts = Vec::new();
    if let Some(name) = default {
        parts.push(format!("const {name} = {require}"));
    }
    if let Some(name) = namespace {
        parts.push(format!("const {name} = {require}"));
    }
    if !named.is_empty() {
        let bindings = named
            .iter()
            .map(|(imported, local)| {
                if imported == local {
                    (*imported).to_string()
                } else {
                    format!("{imported}: {local}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("const {{ {bindings} }} = {require}"));
    }
    out.push_str(&parts.join("; "));
    Ok(spec + 1)
}

fn declared_name<'a>(toks: &[Token<'a>], from: usize) -> ScriptResult<&'a str> {
    let mut j = expect_sig(toks, from, "export")?;
    if toks[j].is("*") {
        j = expect_sig(toks, j + 1, "export")?;
    }
    if toks[j].is_ident() {
        Ok(toks[j].text)
    } else {
        Err(ScriptError::Transpile("unsupported export form".into()))
    }
}

fn rewrite_export<'a>(
    toks: &[Token<'a>],
    start: usize,
    out: &mut String,
    exports: &mut Vec<(String, String)>,
) -> ScriptResult<usize> {
    let j = expect_sig(toks, start + 1, "export")?;
    let t = toks[j];

    if t.is("default") {
        let k = expect_sig(toks, j + 1, "export")?;
        let decl = if toks[k].is("async") {
            next_sig(toks, k + 1).filter(|&f| toks[f].is("function"))
        } else {
            Some(k).filter(|&f| toks[f].is("function") || toks[f].is("class"))
        };
        if let Some(keyword) = decl
            && let Ok(name) = declared_name(toks, keyword + 1)
        {
            exports.push(("default".into(), name.to_string()));
            return Ok(k);
        }
        out.push_str("exports.default = ");
        return Ok(k);
    }

    if t.is("function") || t.is("class") || t.is("async") {
        let keyword = if t.is("async") {
            expect_sig(toks, j + 1, "export")?
        } else {
            j
        };
        let name = declared_name(toks, keyword + 1)?;
        exports.push((name.to_string(), name.to_string()));
        return Ok(j);
    }

    if t.is("const") || t.is("let") || t.is("var") {
        let name = declared_name(toks, j + 1)?;
        exports.push((name.to_string(), name.to_string()));
        return Ok(j);
    }

    if t.is("{") {
        let mut k = expect_sig(toks, j + 1, "export")?;
        let mut specs = Vec::new();
        while !toks[k].is("}") {
            if !toks[k].is_ident() {
                return Err(malformed("export"));
            }
            let local = toks[k].text;
            let mut exported = local;
            k = expect_sig(toks, k + 1, "export")?;
            if toks[k].is("as") {
                let alias = expect_sig(toks, k + 1, "export")?;
                exported = toks[alias].text;
                k = expect_sig(toks, alias + 1, "export")?;
            }
            specs.push((exported.to_string(), local.to_string()));
            if toks[k].is(",") {
                k = expect_sig(toks, k + 1, "export")?;
            }
        }
        let after = next_sig(toks, k + 1);
        if sig_is(toks, after, "from") {
            return Err(ScriptError::Transpile("re-exports are not supported".into()));
        }
        exports.extend(specs);
        return Ok(match after {
            Some(semi) if toks[semi].is(";") => semi + 1,
            _ => k + 1,
        });
    }

    if t.is("*") {
        return Err(ScriptError::Transpile("re-exports are not supported".into()));
    }
    Err(ScriptError::Transpile("unsupported export form".into()))
}

/// Rewrite top-level `import`/`export` statements into CommonJS.
fn rewrite_modules(source: &str) -> ScriptResult<String> {
    let toks = tokenize(source)?;
    let mut out = String::with_capacity(source.len() + 64);
    let mut exports: Vec<(String, String)> = Vec::new();
    let mut depth = 0usize;
    let mut prev: Option<Token<'_>> = None;
    let mut newline = false;
    let mut i = 0;

    while i < toks.len() {
        let t = toks[i];
        if t.is_trivia() {
            newline |= t.has_newline();
            out.push_str(t.text);
            i += 1;
            continue;
        }
        let at_stmt = depth == 0
            && match prev {
                None => true,
                Some(p) => p.is(";") || p.is("}") || (newline && !p.is(".") && !p.is("?.")),
            };
        let next = next_sig(&toks, i + 1);

        if at_stmt && t.is("import") && !sig_is(&toks, next, "(") && !sig_is(&toks, next, ".") {
            i = rewrite_import(&toks, i, &mut out)?;
            prev = Some(SEMI);
        } else if at_stmt && t.is("export") {
            i = rewrite_export(&toks, i, &mut out, &mut exports)?;
            prev = Some(SEMI);
        } else {
            if t.kind == Kind::Punct {
                match t.text {
                    "{" | "(" | "[" => depth += 1,
                    "}" | ")" | "]" => depth = depth.saturating_sub(1),
                    _ => {}
                }
            }
            out.push_str(t.text);
            prev = Some(t);
            i += 1;
        }
        newline = false;
    }

    for (exported, local) in &exports {
        out.push_str(&format!("\nexports.{exported} = {local};"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(src: &str) -> String {
        transpile(src, ModuleType::Typescript).unwrap()
    }

    fn js(src: &str) -> String {
        transpile(src, ModuleType::Javascript).unwrap()
    }

    #[test]
    fn test_plain_script_untouched() {
        let src = "function requestModifier(ctx) {\n  const re = /a\\/b/g;\n  return `x${ctx}`;\n}\n";
        assert_eq!(js(src), src);
    }

    #[test]
    fn test_exported_function_becomes_commonjs() {
        let out = js("export function requestModifier(ctx) { return 1; }");
        assert_eq!(
            out,
            "function requestModifier(ctx) { return 1; }\nexports.requestModifier = requestModifier;"
        );

        let out = js("const a = 1;\nexport { a as fetchUpstream };\n");
        assert_eq!(out, "const a = 1;\n\n\nexports.fetchUpstream = a;");

        let out = js("export default function handler(ctx) {}");
        assert!(out.ends_with("exports.default = handler;"));
    }

    #[test]
    fn test_builtin_imports_only() {
        let out = js("import { sleep as nap } from 'dgate';\nimport * as storage from \"dgate/storage\";");
        assert_eq!(
            out,
            "const { sleep: nap } = require('dgate');\nconst storage = require(\"dgate/storage\");"
        );

        let err = transpile("import fs from 'fs';", ModuleType::Javascript).unwrap_err();
        assert_eq!(err, ScriptError::UnsupportedImport("fs".into()));

        let err = transpile("export * from 'dgate';", ModuleType::Javascript).unwrap_err();
        assert!(matches!(err, ScriptError::Transpile(_)));
    }

    #[test]
    fn test_strip_function_types() {
        let out = ts(
            "export async function requestModifier(ctx: any): Promise<void> { const x: number = 1; return; }",
        );
        assert_eq!(
            out,
            "async function requestModifier(ctx) { const x = 1; return; }\nexports.requestModifier = requestModifier;"
        );
    }

    #[test]
    fn test_strip_arrow_and_casts() {
        assert_eq!(
            ts("const f = (a: string, b?: number): string => a;"),
            "const f = (a, b) => a;"
        );
        assert_eq!(
            ts("const n = (value as number) + 1;"),
            "const n = (value) + 1;"
        );
        assert_eq!(ts("const x = cond ? (a) : b;"), "const x = cond ? (a) : b;");
        assert_eq!(ts("const v = obj!.field;"), "const v = obj.field;");
    }

    #[test]
    fn test_strip_declarations() {
        let out = ts(
            "interface Foo { a: string }\ntype Bar = { b: number } | null;\nimport type { X } from 'dgate';\nconst y = 2;",
        );
        assert_eq!(out.trim(), "const y = 2;");
    }

    #[test]
    fn test_strip_class_members() {
        let out = ts(
            "class Counter<T> implements Thing {\n  private count: number = 0;\n  inc(by: number): number { return this.count += by; }\n}",
        );
        assert_eq!(
            out,
            "class Counter {\n  count = 0;\n  inc(by) { return this.count += by; }\n}"
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = transpile("const a = 'oops;\n", ModuleType::Javascript).unwrap_err();
        assert!(matches!(err, ScriptError::Transpile(_)));
    }
}
