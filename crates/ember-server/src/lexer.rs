//! Static scanner for ES module records.
//!
//! Extracts import specifiers, exported names, re-export markers, and
//! hot-accept call sites from JavaScript source without building an AST.
//! The scanner is comment- and string-aware; it does not validate syntax
//! beyond what it needs to walk the file safely.
//!
//! The JSX loader is lenient: constructs the strict scan rejects (an
//! unterminated string is the only fatal case) end the scan early instead of
//! failing, returning everything collected up to that point.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unterminated string literal at byte {pos}")]
    UnterminatedString { pos: usize },
}

/// How strictly to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loader {
    #[default]
    Default,
    /// Lenient scan for JSX-flavored sources.
    Jsx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Static,
    Dynamic,
    ExportFrom,
}

/// One import specifier with its byte span (inside the quotes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub specifier: String,
    pub start: usize,
    pub end: usize,
    pub kind: ImportKind,
}

/// Everything the scanner extracts from one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleRecords {
    pub imports: Vec<ImportRecord>,
    /// Exported binding names; re-exported names included, `default` spelled
    /// literally.
    pub exports: Vec<String>,
    /// True when an `export * from` form is present.
    pub has_re_exports: bool,
    /// Byte offsets just past the `(` of each `hot.accept(` call site.
    pub hot_accepts: Vec<usize>,
}

impl ModuleRecords {
    pub fn has_imports(&self) -> bool {
        !self.imports.is_empty()
    }
}

/// Scan a module with the default strict loader.
pub fn parse_module_records(code: &str) -> Result<ModuleRecords, ParseError> {
    parse_module_records_with(code, Loader::Default)
}

/// Scan a module with an explicit loader.
pub fn parse_module_records_with(code: &str, loader: Loader) -> Result<ModuleRecords, ParseError> {
    let lenient = matches!(loader, Loader::Jsx);
    let mut scanner = Scanner {
        code,
        bytes: code.as_bytes(),
        pos: 0,
        records: ModuleRecords::default(),
    };
    match scanner.run() {
        Ok(()) => Ok(scanner.records),
        Err(_) if lenient => Ok(scanner.records),
        Err(err) => Err(err),
    }
}

/// Convenience: just the import records.
pub fn parse_imports(code: &str) -> Result<Vec<ImportRecord>, ParseError> {
    Ok(parse_module_records(code)?.imports)
}

const HOT_ACCEPT: &str = "hot.accept(";

struct Scanner<'a> {
    code: &'a str,
    bytes: &'a [u8],
    pos: usize,
    records: ModuleRecords,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

impl<'a> Scanner<'a> {
    fn run(&mut self) -> Result<(), ParseError> {
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            match b {
                b'/' if self.peek(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment(),
                b'\'' | b'"' => {
                    self.skip_string(b)?;
                }
                b'`' => self.skip_template()?,
                _ if is_ident_byte(b) && !b.is_ascii_digit() && self.at_word_boundary() => {
                    self.scan_word()?;
                }
                _ => self.pos += 1,
            }
        }
        Ok(())
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn at_word_boundary(&self) -> bool {
        self.pos == 0 || !is_ident_byte(self.bytes[self.pos - 1])
    }

    fn scan_word(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        while self.pos < self.bytes.len() && is_ident_byte(self.bytes[self.pos]) {
            self.pos += 1;
        }
        let word = &self.code[start..self.pos];
        match word {
            // member access like `foo.import(...)` is not an import
            "import" if start == 0 || self.bytes[start.saturating_sub(1)] != b'.' => {
                self.scan_import()?;
            }
            "export" if start == 0 || self.bytes[start.saturating_sub(1)] != b'.' => {
                self.scan_export()?;
            }
            "hot" if self.code[start..].starts_with(HOT_ACCEPT) => {
                self.records.hot_accepts.push(start + HOT_ACCEPT.len());
                self.pos = start + HOT_ACCEPT.len();
            }
            _ => {}
        }
        Ok(())
    }

    fn skip_line_comment(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) {
        self.pos += 2;
        while self.pos + 1 < self.bytes.len() {
            if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                self.pos += 2;
                return;
            }
            self.pos += 1;
        }
        self.pos = self.bytes.len();
    }

    /// Skip a quoted string starting at `self.pos`; returns the content span.
    fn skip_string(&mut self, quote: u8) -> Result<(usize, usize), ParseError> {
        let opened = self.pos;
        self.pos += 1;
        let content_start = self.pos;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => self.pos += 2,
                b if b == quote => {
                    let span = (content_start, self.pos);
                    self.pos += 1;
                    return Ok(span);
                }
                _ => self.pos += 1,
            }
        }
        Err(ParseError::UnterminatedString { pos: opened })
    }

    fn skip_template(&mut self) -> Result<(), ParseError> {
        let opened = self.pos;
        self.pos += 1;
        let mut interp_depth = 0usize;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => self.pos += 2,
                b'$' if self.peek(1) == Some(b'{') => {
                    interp_depth += 1;
                    self.pos += 2;
                }
                b'}' if interp_depth > 0 => {
                    interp_depth -= 1;
                    self.pos += 1;
                }
                b'`' if interp_depth == 0 => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => self.pos += 1,
            }
        }
        Err(ParseError::UnterminatedString { pos: opened })
    }

    fn skip_trivia(&mut self) {
        loop {
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.bytes.get(self.pos) == Some(&b'/') {
                match self.peek(1) {
                    Some(b'/') => {
                        self.skip_line_comment();
                        continue;
                    }
                    Some(b'*') => {
                        self.skip_block_comment();
                        continue;
                    }
                    _ => {}
                }
            }
            break;
        }
    }

    fn read_word(&mut self) -> &'a str {
        let start = self.pos;
        while self.pos < self.bytes.len() && is_ident_byte(self.bytes[self.pos]) {
            self.pos += 1;
        }
        &self.code[start..self.pos]
    }

    fn record_specifier(&mut self, quote: u8, kind: ImportKind) -> Result<(), ParseError> {
        let (start, end) = self.skip_string(quote)?;
        self.records.imports.push(ImportRecord {
            specifier: self.code[start..end].to_string(),
            start,
            end,
            kind,
        });
        Ok(())
    }

    fn scan_import(&mut self) -> Result<(), ParseError> {
        self.skip_trivia();
        match self.bytes.get(self.pos).copied() {
            // dynamic import
            Some(b'(') => {
                self.pos += 1;
                self.skip_trivia();
                match self.bytes.get(self.pos).copied() {
                    Some(q @ (b'\'' | b'"')) => self.record_specifier(q, ImportKind::Dynamic)?,
                    // non-literal dynamic import: nothing to record
                    _ => {}
                }
            }
            // import.meta
            Some(b'.') => {}
            // side-effect import
            Some(q @ (b'\'' | b'"')) => self.record_specifier(q, ImportKind::Static)?,
            // import clause ... from "specifier"
            _ => self.scan_from_clause(ImportKind::Static)?,
        }
        Ok(())
    }

    /// Walk an import/export clause until `from "<spec>"` or statement end.
    fn scan_from_clause(&mut self, kind: ImportKind) -> Result<(), ParseError> {
        let mut brace_depth = 0usize;
        while self.pos < self.bytes.len() {
            self.skip_trivia();
            match self.bytes.get(self.pos).copied() {
                None => break,
                Some(b'{') => {
                    brace_depth += 1;
                    self.pos += 1;
                }
                Some(b'}') => {
                    brace_depth = brace_depth.saturating_sub(1);
                    self.pos += 1;
                }
                Some(b';') | Some(b')') => break,
                Some(q @ (b'\'' | b'"')) => {
                    // a bare string here can only be the specifier
                    self.record_specifier(q, kind)?;
                    break;
                }
                Some(b) if is_ident_byte(b) => {
                    let word = self.read_word();
                    if word == "from" && brace_depth == 0 {
                        self.skip_trivia();
                        if let Some(q @ (b'\'' | b'"')) = self.bytes.get(self.pos).copied() {
                            self.record_specifier(q, kind)?;
                        }
                        break;
                    }
                }
                _ => self.pos += 1,
            }
        }
        Ok(())
    }

    fn scan_export(&mut self) -> Result<(), ParseError> {
        self.skip_trivia();
        match self.bytes.get(self.pos).copied() {
            Some(b'*') => {
                self.records.has_re_exports = true;
                self.pos += 1;
                self.scan_from_clause(ImportKind::ExportFrom)?;
            }
            Some(b'{') => {
                self.pos += 1;
                self.scan_export_names()?;
            }
            Some(b) if is_ident_byte(b) => {
                let word = self.read_word().to_string();
                match word.as_str() {
                    "default" => self.records.exports.push("default".to_string()),
                    "const" | "let" | "var" => {
                        self.skip_trivia();
                        if self
                            .bytes
                            .get(self.pos)
                            .is_some_and(|&b| is_ident_byte(b) && !b.is_ascii_digit())
                        {
                            let name = self.read_word().to_string();
                            self.records.exports.push(name);
                        }
                    }
                    "function" | "class" => {
                        self.skip_trivia();
                        if self.bytes.get(self.pos) == Some(&b'*') {
                            self.pos += 1;
                            self.skip_trivia();
                        }
                        if self
                            .bytes
                            .get(self.pos)
                            .is_some_and(|&b| is_ident_byte(b) && !b.is_ascii_digit())
                        {
                            let name = self.read_word().to_string();
                            self.records.exports.push(name);
                        }
                    }
                    "async" => {
                        self.skip_trivia();
                        if self.read_word() == "function" {
                            self.skip_trivia();
                            if self
                                .bytes
                                .get(self.pos)
                                .is_some_and(|&b| is_ident_byte(b) && !b.is_ascii_digit())
                            {
                                let name = self.read_word().to_string();
                                self.records.exports.push(name);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse `{ a, b as c, default as d }` after an `export {`, then an
    /// optional `from "spec"`.
    fn scan_export_names(&mut self) -> Result<(), ParseError> {
        let mut pending: Option<String> = None;
        loop {
            self.skip_trivia();
            match self.bytes.get(self.pos).copied() {
                None => return Ok(()),
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                Some(b',') => {
                    if let Some(name) = pending.take() {
                        self.records.exports.push(name);
                    }
                    self.pos += 1;
                }
                Some(b) if is_ident_byte(b) => {
                    let word = self.read_word().to_string();
                    if word == "as" {
                        self.skip_trivia();
                        // the alias is the exported name
                        pending = Some(self.read_word().to_string());
                    } else if pending.is_none() {
                        pending = Some(word);
                    }
                }
                Some(q @ (b'\'' | b'"')) => {
                    // string export names: export { "a-b" as x }; rare,
                    // keep the raw content
                    let (start, end) = self.skip_string(q)?;
                    if pending.is_none() {
                        pending = Some(self.code[start..end].to_string());
                    }
                }
                _ => self.pos += 1,
            }
        }
        if let Some(name) = pending.take() {
            self.records.exports.push(name);
        }
        self.skip_trivia();
        let before = self.pos;
        if self
            .bytes
            .get(self.pos)
            .is_some_and(|&b| is_ident_byte(b) && !b.is_ascii_digit())
        {
            if self.read_word() == "from" {
                self.skip_trivia();
                if let Some(q @ (b'\'' | b'"')) = self.bytes.get(self.pos).copied() {
                    self.record_specifier(q, ImportKind::ExportFrom)?;
                }
            } else {
                self.pos = before;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specifiers(code: &str) -> Vec<String> {
        parse_imports(code)
            .unwrap()
            .into_iter()
            .map(|r| r.specifier)
            .collect()
    }

    #[test]
    fn test_static_imports() {
        let code = r#"
            import dft from './a.js';
            import { one, two } from "./b.js";
            import * as ns from './c.js';
            import './side-effect.css';
        "#;
        assert_eq!(specifiers(code), vec!["./a.js", "./b.js", "./c.js", "./side-effect.css"]);
    }

    #[test]
    fn test_named_import_containing_from_binding() {
        let code = r#"import { from as origin } from './deps.js';"#;
        assert_eq!(specifiers(code), vec!["./deps.js"]);
    }

    #[test]
    fn test_dynamic_imports() {
        let code = r#"const mod = await import('./lazy.js'); import(variable);"#;
        let records = parse_module_records(code).unwrap();
        assert_eq!(records.imports.len(), 1);
        assert_eq!(records.imports[0].kind, ImportKind::Dynamic);
        assert_eq!(records.imports[0].specifier, "./lazy.js");
    }

    #[test]
    fn test_imports_in_comments_and_strings_ignored() {
        let code = r#"
            // import fake from './comment.js'
            /* import fake2 from './block.js' */
            const s = "import nope from './string.js'";
            import real from './real.js';
        "#;
        assert_eq!(specifiers(code), vec!["./real.js"]);
    }

    #[test]
    fn test_member_access_import_ignored() {
        let code = r#"loader.import('./not-counted.js'); import './counted.js';"#;
        assert_eq!(specifiers(code), vec!["./counted.js"]);
    }

    #[test]
    fn test_exports_collected() {
        let code = r#"
            export const alpha = 1;
            export function beta() {}
            export class Gamma {}
            export default function () {}
            export { delta, epsilon as zeta };
        "#;
        let records = parse_module_records(code).unwrap();
        assert_eq!(
            records.exports,
            vec!["alpha", "beta", "Gamma", "default", "delta", "zeta"]
        );
        assert!(!records.has_re_exports);
    }

    #[test]
    fn test_re_export_star() {
        let code = r#"export * from './base.js'; export { named } from './named.js';"#;
        let records = parse_module_records(code).unwrap();
        assert!(records.has_re_exports);
        let froms: Vec<_> = records
            .imports
            .iter()
            .filter(|r| r.kind == ImportKind::ExportFrom)
            .map(|r| r.specifier.as_str())
            .collect();
        assert_eq!(froms, vec!["./base.js", "./named.js"]);
        assert_eq!(records.exports, vec!["named"]);
    }

    #[test]
    fn test_hot_accept_sites() {
        let code = r#"
            import.meta.hot.accept(['./a.js'], () => {});
            const h = import.meta.hot; h.accept;
        "#;
        let records = parse_module_records(code).unwrap();
        assert_eq!(records.hot_accepts.len(), 1);
        let pos = records.hot_accepts[0];
        assert!(code[..pos].ends_with("hot.accept("));
    }

    #[test]
    fn test_template_with_interpolation_skipped() {
        let code = "const t = `prefix ${ { nested: '}' } } import './x.js'`; import './real.js';";
        assert_eq!(specifiers(code), vec!["./real.js"]);
    }

    #[test]
    fn test_unterminated_string_strict_vs_jsx() {
        let code = "import './ok.js';\nconst broken = 'oops";
        assert!(parse_module_records(code).is_err());
        let records = parse_module_records_with(code, Loader::Jsx).unwrap();
        assert_eq!(records.imports.len(), 1);
    }
}
