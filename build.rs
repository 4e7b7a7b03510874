use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

// Source policy enforced on every crate file before compilation.
// Each rule pairs a line regex with a filter deciding whether a matched line
// really violates the rule, and a message shown when it does.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    accept: fn(&str) -> bool,
    advice: &'static str,
}

const FORBIDDEN_WORDS: &[&str] = &[
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

const RULES: &[Rule] = &[
    Rule {
        name: "underscore-prefixed bindings",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        accept: is_underscore_binding,
        advice: "Use the binding (dropping the underscore) or remove it completely.",
    },
    Rule {
        name: "forbidden comment markers",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        accept: any_match,
        advice: "Comments describe the code as it is, not its edit history. Remove the marker.",
    },
    Rule {
        name: "'**' in plain comments",
        pattern: r"(//|/\*).*\*\*",
        accept: is_plain_stars,
        advice: "Emphasis markers belong in doc comments only.",
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"(//|/\*).*",
        accept: is_shouting_comment,
        advice: "Rewrite the comment in normal case or delete it.",
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        accept: any_match,
        advice: "Either use the code or remove it completely.",
    },
];

struct Collector {
    accept: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for Collector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn any_match(_: &str) -> bool {
    true
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// Matches inside comments or string literals are not bindings.
fn is_underscore_binding(line: &str) -> bool {
    if is_comment_line(line) {
        return false;
    }
    let quoted = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !quoted
}

fn is_plain_stars(line: &str) -> bool {
    !is_doc_comment(line) || FORBIDDEN_WORDS.iter().any(|w| line.contains(w))
}

fn is_shouting_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    let text = if let Some(rest) = trimmed.strip_prefix("///").or(trimmed.strip_prefix("//!")) {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        rest.find("*/").map_or(rest, |end| &rest[..end])
    } else {
        return false;
    };
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

fn crate_sources() -> Vec<PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_entry(|e| {
            let path = e.path();
            !path.starts_with("./target") && !path.starts_with("./examples")
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "build.rs")
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_rule(rule: &Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = Collector {
            accept: rule.accept,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            return Err(report(rule, path, &collector.violations).into());
        }
    }
    Ok(())
}

fn report(rule: &Rule, path: &Path, violations: &[String]) -> String {
    let mut msg = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        violations.len(),
        rule.name,
        path.display()
    );
    for violation in violations {
        msg.push_str(&format!("   {violation}\n"));
    }
    msg.push_str(&format!("\n⚠️ {}\n", rule.advice));
    msg
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SIEVE_RELEASE_TAG");

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=SIEVE_BUILD_TIMESTAMP={timestamp}");

    let files = crate_sources();
    for rule in RULES {
        if let Err(e) = check_rule(rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
