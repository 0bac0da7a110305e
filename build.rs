use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Source roots of the crate. Build output and the reference pack are never scanned.
const SOURCE_DIRS: [&str; 4] = ["engine", "cli", "tests", "benches"];

/// One repository rule: a line pattern, a filter that keeps the real violations among
/// the matched lines, and the advice printed when the build is refused.
struct Policy {
    name: &'static str,
    pattern: &'static str,
    keep: fn(&str) -> bool,
    advice: &'static str,
}

const POLICIES: [Policy; 5] = [
    Policy {
        name: "underscore-prefixed bindings",
        pattern: r"\b_[a-zA-Z0-9_]+\b",
        keep: outside_comments_and_strings,
        advice: "use the binding under its real name or remove it",
    },
    Policy {
        name: "revision markers in comments",
        pattern: r"(//|/\*).*(FIXED|FIXES|FIX|CORRECTED|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        keep: always,
        advice: "comments describe the code as it is, not its history",
    },
    Policy {
        name: "emphasis in plain comments",
        pattern: r"(//|/\*).*\*\*",
        keep: plain_comment,
        advice: "`**` is only allowed in doc comments",
    },
    Policy {
        name: "all-caps comments",
        pattern: r"(//|/\*)",
        keep: shouted_comment,
        advice: "write the comment in sentence case or delete it",
    },
    Policy {
        name: "dead-code allowances",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        keep: always,
        advice: "use the item or remove it",
    },
];

fn always(_: &str) -> bool {
    true
}

fn outside_comments_and_strings(line: &str) -> bool {
    if line.trim_start().starts_with("//") || line.contains("/*") {
        return false;
    }
    !line
        .split('"')
        .skip(1)
        .step_by(2)
        .any(|quoted| quoted.contains('_'))
}

fn plain_comment(line: &str) -> bool {
    !line.trim_start().starts_with("///")
}

fn shouted_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    let text = if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(start) = line.find("/*") {
        let rest = &line[start + 2..];
        rest.find("*/").map_or(rest, |end| &rest[..end])
    } else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

/// Collects `line:text` for every matched line the policy keeps.
struct Violations {
    keep: fn(&str) -> bool,
    lines: Vec<String>,
}

impl Sink for Violations {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let text = String::from_utf8_lossy(mat.bytes());
        let text = text.trim_end();
        if (self.keep)(text) {
            let line = mat.line_number().unwrap_or(0);
            self.lines.push(format!("{line}:{text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).sort_by_file_name())
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check(policy: &Policy, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(policy.pattern)?;
    let mut searcher = Searcher::new();
    let mut report = String::new();
    for path in sources {
        let mut found = Violations {
            keep: policy.keep,
            lines: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut found)?;
        if !found.lines.is_empty() {
            report.push_str(&format!("\n  {}:\n", path.display()));
            for line in &found.lines {
                report.push_str(&format!("     {line}\n"));
            }
        }
    }
    if report.is_empty() {
        Ok(())
    } else {
        Err(format!("\n❌ shardfit refuses {}:{report}\n⚠️ {}\n", policy.name, policy.advice).into())
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let sources = rust_sources();
    for policy in &POLICIES {
        if let Err(e) = check(policy, &sources) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
