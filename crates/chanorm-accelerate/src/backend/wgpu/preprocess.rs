//! `-D` option handling for WGSL sources: line-based `#ifdef`, `#ifndef`,
//! `#else` and `#endif`, plus whole-identifier substitution of valued
//! defines.

use chanorm_accelerate_api::BuildOptions;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("line {line}: {directive} without a matching #ifdef/#ifndef")]
    Unmatched { line: usize, directive: &'static str },
    #[error("line {line}: duplicate #else")]
    DuplicateElse { line: usize },
    #[error("line {line}: unknown directive '{directive}'")]
    UnknownDirective { line: usize, directive: String },
    #[error("line {line}: {directive} needs a name")]
    MissingName { line: usize, directive: &'static str },
    #[error("{open} conditional block(s) left open at end of source")]
    Unterminated { open: usize },
}

#[derive(Debug, Clone, Default)]
pub struct Defines {
    entries: BTreeMap<String, Option<String>>,
}

impl Defines {
    pub fn from_options(options: &BuildOptions) -> Self {
        let mut defines = Self::default();
        for (name, value) in options.defines() {
            defines
                .entries
                .insert(name.to_string(), value.map(str::to_string));
        }
        defines
    }

    pub fn insert(&mut self, name: &str, value: Option<&str>) {
        self.entries
            .insert(name.to_string(), value.map(str::to_string));
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn substitutions(&self) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .filter_map(|(name, value)| value.as_deref().map(|v| (name.as_str(), v)))
            .collect()
    }
}

struct Frame {
    parent_active: bool,
    condition: bool,
    in_else: bool,
}

impl Frame {
    fn active(&self) -> bool {
        self.parent_active && (self.condition != self.in_else)
    }
}

/// Inactive lines are blanked so shader diagnostics keep their line numbers.
pub fn preprocess(source: &str, defines: &Defines) -> Result<String, PreprocessError> {
    let substitutions = defines.substitutions();
    let mut stack: Vec<Frame> = Vec::new();
    let mut out = String::with_capacity(source.len());

    for (number, line) in source.lines().enumerate() {
        let line_no = number + 1;
        let active = stack.last().map_or(true, Frame::active);
        let trimmed = line.trim_start();
        if let Some(directive) = trimmed.strip_prefix('#') {
            let mut parts = directive.split_whitespace();
            let keyword = parts.next().unwrap_or("");
            let name = parts.next();
            match keyword {
                "ifdef" | "ifndef" => {
                    let directive = if keyword == "ifdef" { "#ifdef" } else { "#ifndef" };
                    let name = name.ok_or(PreprocessError::MissingName {
                        line: line_no,
                        directive,
                    })?;
                    let defined = defines.is_defined(name);
                    stack.push(Frame {
                        parent_active: active,
                        condition: if keyword == "ifdef" { defined } else { !defined },
                        in_else: false,
                    });
                }
                "else" => {
                    let frame = stack.last_mut().ok_or(PreprocessError::Unmatched {
                        line: line_no,
                        directive: "#else",
                    })?;
                    if frame.in_else {
                        return Err(PreprocessError::DuplicateElse { line: line_no });
                    }
                    frame.in_else = true;
                }
                "endif" => {
                    stack.pop().ok_or(PreprocessError::Unmatched {
                        line: line_no,
                        directive: "#endif",
                    })?;
                }
                other => {
                    return Err(PreprocessError::UnknownDirective {
                        line: line_no,
                        directive: other.to_string(),
                    })
                }
            }
            out.push('\n');
            continue;
        }
        if active {
            out.push_str(&substitute_identifiers(line, &substitutions));
        }
        out.push('\n');
    }

    if !stack.is_empty() {
        return Err(PreprocessError::Unterminated { open: stack.len() });
    }
    Ok(out)
}

/// Replace identifiers that exactly match a name in `substitutions`.
pub fn substitute_identifiers(text: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = start + c.len_utf8();
            while let Some(&(idx, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    end = idx + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let ident = &text[start..end];
            match substitutions.iter().find(|(name, _)| *name == ident) {
                Some((_, value)) => out.push_str(value),
                None => out.push_str(ident),
            }
        } else if c.is_ascii_digit() {
            // numeric literals such as 1e4 or 0x1f are not identifiers
            out.push(c);
            while let Some(&(_, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' || next == '.' {
                    out.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defines(pairs: &[(&str, Option<&str>)]) -> Defines {
        let mut defines = Defines::default();
        for (name, value) in pairs {
            defines.insert(name, *value);
        }
        defines
    }

    #[test]
    fn conditionals_select_branches() {
        let source = "a\n#ifdef X\nb\n#else\nc\n#endif\n#ifndef Y\nd\n#endif\n";
        let out = preprocess(source, &defines(&[("X", None)])).expect("preprocess");
        let kept: Vec<&str> = out.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(kept, vec!["a", "b", "d"]);
        assert_eq!(out.lines().count(), source.lines().count());
    }

    #[test]
    fn nested_blocks_respect_the_outer_condition() {
        let source = "#ifdef OUTER\n#ifdef INNER\nx\n#else\ny\n#endif\n#endif\n";
        let out = preprocess(source, &defines(&[("INNER", None)])).expect("preprocess");
        assert!(out.trim().is_empty());
    }

    #[test]
    fn values_replace_whole_identifiers_only() {
        let out = substitute_identifiers(
            "var<storage> x: array<IN_DATA_TYPE>; fn softmax(){} softmax_2 1e4",
            &[("IN_DATA_TYPE", "f16"), ("softmax", "k0123"), ("e4", "bad")],
        );
        assert_eq!(out, "var<storage> x: array<f16>; fn k0123(){} softmax_2 1e4");
    }

    #[test]
    fn unbalanced_directives_are_errors() {
        assert_eq!(
            preprocess("#endif\n", &Defines::default()),
            Err(PreprocessError::Unmatched {
                line: 1,
                directive: "#endif"
            })
        );
        assert_eq!(
            preprocess("#ifdef A\n", &Defines::default()),
            Err(PreprocessError::Unterminated { open: 1 })
        );
        assert!(matches!(
            preprocess("#ifdef A\n#else\n#else\n#endif\n", &Defines::default()),
            Err(PreprocessError::DuplicateElse { line: 3 })
        ));
        assert!(matches!(
            preprocess("#define A 1\n", &Defines::default()),
            Err(PreprocessError::UnknownDirective { .. })
        ));
    }

    #[test]
    fn build_options_become_defines() {
        let mut options = BuildOptions::new();
        options.define("OUT_DATA_TYPE", "f32");
        options.flag("OUT_OF_RANGE_CHECK");
        let defines = Defines::from_options(&options);
        assert!(defines.is_defined("OUT_OF_RANGE_CHECK"));
        let out = preprocess(
            "#ifdef OUT_OF_RANGE_CHECK\ny: OUT_DATA_TYPE\n#endif",
            &defines,
        )
        .expect("preprocess");
        assert_eq!(out.trim(), "y: f32");
    }
}
