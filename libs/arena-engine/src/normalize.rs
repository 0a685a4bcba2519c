// Entry-point normalization for languages whose run command names a fixed class.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PACKAGE: Regex = Regex::new(r"(?m)^[ \t]*package[ \t]+[\w.]+[ \t]*;[ \t]*\r?$\n?").unwrap();
    static ref IMPORT: Regex =
        Regex::new(r"(?m)^[ \t]*import[ \t]+(?:static[ \t]+)?[\w.]+(?:\.\*)?[ \t]*;[ \t]*\r?$").unwrap();
    static ref PUBLIC_CLASS: Regex = Regex::new(
        r"\bpublic\s+(?:(?:final|abstract|strictfp)\s+)*class\s+([A-Za-z_$][\w$]*)"
    )
    .unwrap();
    static ref CLASS: Regex = Regex::new(r"\bclass\s+([A-Za-z_$][\w$]*)").unwrap();
    static ref MAIN: Regex =
        Regex::new(r"\bstatic\s+(?:final\s+)?void\s+main\s*\(").unwrap();
}

/// Rewrites submitted source so the run command's fixed entry point exists.
pub trait EntryPointNormalizer: Send + Sync {
    fn normalize(&self, source: &str, entry: &str) -> String;
}

/// Regex-based Java normalizer.
///
/// 1. drops `package` lines and hoists `import` lines to the top
/// 2. renames the public class to `entry`
/// 3. otherwise renames the class declaring `main` and makes it public
/// 4. otherwise wraps a bare `main` method in `public class <entry>`
/// 5. otherwise wraps the whole body in a synthetic `main`
///
/// Output is deterministic and normalizing twice changes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexJavaNormalizer;

impl EntryPointNormalizer for RegexJavaNormalizer {
    fn normalize(&self, source: &str, entry: &str) -> String {
        let without_package = PACKAGE.replace_all(source, "");

        let imports: Vec<&str> = IMPORT
            .find_iter(&without_package)
            .map(|m| m.as_str().trim())
            .collect();
        let body = IMPORT.replace_all(&without_package, "");
        let body = body.trim();

        let class_text = if let Some(caps) = PUBLIC_CLASS.captures(body) {
            rename_identifier(body, &caps[1], entry)
        } else if let Some(main) = MAIN.find(body) {
            match CLASS
                .captures_iter(&body[..main.start()])
                .last()
                .and_then(|caps| caps.get(0).zip(caps.get(1)))
            {
                Some((decl, name)) => {
                    let public = format!("{}public {}", &body[..decl.start()], &body[decl.start()..]);
                    rename_identifier(&public, name.as_str(), entry)
                }
                None => format!("public class {} {{\n{}\n}}", entry, indent(body)),
            }
        } else if let Some(caps) = CLASS.captures(body) {
            let decl = caps.get(0).map(|m| m.start()).unwrap_or(0);
            let public = format!("{}public {}", &body[..decl], &body[decl..]);
            rename_identifier(&public, &caps[1], entry)
        } else {
            format!(
                "public class {} {{\n    public static void main(String[] args) throws Exception {{\n{}\n    }}\n}}",
                entry,
                indent(&indent(body))
            )
        };

        if imports.is_empty() {
            format!("{}\n", class_text.trim())
        } else {
            format!("{}\n\n{}\n", imports.join("\n"), class_text.trim())
        }
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("    {}", line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Clone, Copy, PartialEq)]
enum Scan {
    Code,
    LineComment,
    BlockComment,
    Str,
    TextBlock,
    Char,
}

/// Replace whole-word occurrences of `from` with `to`, leaving string and
/// char literals and comments alone.
pub fn rename_identifier(source: &str, from: &str, to: &str) -> String {
    if from == to {
        return source.to_string();
    }

    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut state = Scan::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            Scan::Code => {
                if c == '/' && next == Some('/') {
                    state = Scan::LineComment;
                } else if c == '/' && next == Some('*') {
                    state = Scan::BlockComment;
                    out.push_str("/*");
                    i += 2;
                    continue;
                } else if c == '"' && next == Some('"') && chars.get(i + 2) == Some(&'"') {
                    state = Scan::TextBlock;
                    out.push_str("\"\"\"");
                    i += 3;
                    continue;
                } else if c == '"' {
                    state = Scan::Str;
                } else if c == '\'' {
                    state = Scan::Char;
                } else if is_ident(c) && (i == 0 || !is_ident(chars[i - 1])) {
                    let end = chars[i..]
                        .iter()
                        .position(|&ch| !is_ident(ch))
                        .map(|p| i + p)
                        .unwrap_or(chars.len());
                    let word: String = chars[i..end].iter().collect();
                    out.push_str(if word == from { to } else { &word });
                    i = end;
                    continue;
                }
                out.push(c);
            }
            Scan::LineComment => {
                if c == '\n' {
                    state = Scan::Code;
                }
                out.push(c);
            }
            Scan::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = Scan::Code;
                    out.push_str("*/");
                    i += 2;
                    continue;
                }
                out.push(c);
            }
            Scan::TextBlock => {
                if c == '"' && next == Some('"') && chars.get(i + 2) == Some(&'"') {
                    state = Scan::Code;
                    out.push_str("\"\"\"");
                    i += 3;
                    continue;
                }
                out.push(c);
            }
            Scan::Str | Scan::Char => {
                let quote = if state == Scan::Str { '"' } else { '\'' };
                if c == '\\' {
                    out.push(c);
                    if let Some(escaped) = next {
                        out.push(escaped);
                    }
                    i += 2;
                    continue;
                }
                if c == quote || c == '\n' {
                    state = Scan::Code;
                }
                out.push(c);
            }
        }
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(source: &str) -> String {
        RegexJavaNormalizer.normalize(source, "Solution")
    }

    #[test]
    fn test_renames_public_class_and_its_references() {
        let source = r#"
public class Main {
    private static Main instance = new Main();
    public static void main(String[] args) {
        System.out.println("Main says hi"); // Main
    }
}
"#;
        let out = normalize(source);
        assert!(out.contains("public class Solution {"));
        assert!(out.contains("private static Solution instance = new Solution();"));
        assert!(out.contains("\"Main says hi\""));
        assert!(out.contains("// Main"));
        assert!(!out.contains("class Main"));
    }

    #[test]
    fn test_hoists_imports_and_strips_package() {
        let source = "package com.example.app;\n\nimport java.util.*;\nimport static java.lang.Math.max;\n\npublic class App {\n    public static void main(String[] a) { System.out.println(max(1, 2)); }\n}\n";
        let out = normalize(source);
        assert!(out.starts_with("import java.util.*;\nimport static java.lang.Math.max;\n\npublic class Solution"));
        assert!(!out.contains("package"));
    }

    #[test]
    fn test_non_public_class_with_main_becomes_public() {
        let source = "class Helper { int v; }\nfinal class Runner {\n    public static void main(String[] args) {}\n}\n";
        let out = normalize(source);
        assert!(out.contains("class Helper { int v; }"));
        assert!(out.contains("final public class Solution {"));
        assert!(!out.contains("Runner"));
    }

    #[test]
    fn test_wraps_bare_main_method() {
        let source = "public static void main(String[] args) {\n    System.out.println(42);\n}";
        let out = normalize(source);
        assert!(out.starts_with("public class Solution {\n    public static void main"));
        assert!(out.trim_end().ends_with('}'));
    }

    #[test]
    fn test_wraps_plain_statements_in_synthetic_main() {
        let out = normalize("import java.util.List;\nSystem.out.println(List.of(1).size());");
        assert!(out.starts_with("import java.util.List;\n\npublic class Solution {"));
        assert!(out.contains("public static void main(String[] args) throws Exception {"));
        assert!(out.contains("        System.out.println(List.of(1).size());"));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let inputs = [
            "public class Main { public static void main(String[] a) {} }",
            "import java.io.*;\nclass X { public static void main(String[] a) {} }",
            "System.out.println(1);",
            "static void main(String[] a) { System.out.println(2); }",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "input: {}", input);
        }
    }

    #[test]
    fn test_rename_respects_word_boundaries_and_literals() {
        let out = rename_identifier("Main MainHelper xMain 'M' \"Main\" /* Main */ Main.run()", "Main", "Solution");
        assert_eq!(out, "Solution MainHelper xMain 'M' \"Main\" /* Main */ Solution.run()");
    }
}
