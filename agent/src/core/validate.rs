//! Cheap structural checks run on an extracted diff before touching the worktree.
//!
//! Checks are advisory: they reject obviously malformed output early so the
//! loop can re-prompt without paying for an apply. Passing every check does not
//! mean the diff applies.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::MalformedPatchError;
use super::extract::DIFF_START_MARKER;

/// A single structural heuristic.
pub trait StructuralCheck {
    /// Stable name reported in [`MalformedPatchError::check`].
    fn name(&self) -> &'static str;
    fn check(&self, diff: &str) -> Result<(), MalformedPatchError>;
}

/// Ordered list of structural checks; the first failure wins.
pub struct PatchValidator {
    checks: Vec<Box<dyn StructuralCheck>>,
}

impl PatchValidator {
    pub fn new(checks: Vec<Box<dyn StructuralCheck>>) -> Self {
        Self { checks }
    }

    /// Minimum-length check followed by balanced-marker check.
    pub fn standard(min_bytes: usize, rules: &[MarkerRule]) -> Result<Self, regex::Error> {
        Ok(Self::new(vec![
            Box::new(MinimumLength { min_bytes }),
            Box::new(BalancedMarkers::new(rules)?),
        ]))
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn validate(&self, diff: &str) -> Result<(), MalformedPatchError> {
        for check in &self.checks {
            check.check(diff)?;
        }
        Ok(())
    }
}

/// Rejects truncated or empty diffs.
#[derive(Debug, Clone)]
pub struct MinimumLength {
    pub min_bytes: usize,
}

impl StructuralCheck for MinimumLength {
    fn name(&self) -> &'static str {
        "minimum_length"
    }

    fn check(&self, diff: &str) -> Result<(), MalformedPatchError> {
        let len = diff.trim().len();
        if len < self.min_bytes {
            return Err(MalformedPatchError {
                check: self.name(),
                detail: format!(
                    "diff is {len} bytes, expected at least {} (truncated output?)",
                    self.min_bytes
                ),
            });
        }
        Ok(())
    }
}

/// Open/close marker pair that must stay balanced in files with matching extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRule {
    /// File extensions without the leading dot (e.g. `csproj`).
    pub extensions: Vec<String>,
    pub open: String,
    pub close: String,
}

impl MarkerRule {
    pub fn new(extensions: &[&str], open: &str, close: &str) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            open: open.to_string(),
            close: close.to_string(),
        }
    }

    fn matches_path(&self, path: &str) -> bool {
        let Some((_, ext)) = path.rsplit_once('.') else {
            return false;
        };
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// Default rules for MSBuild project files.
pub fn default_marker_rules() -> Vec<MarkerRule> {
    const PROJECT_FILES: [&str; 3] = ["csproj", "props", "targets"];
    ["Project", "ItemGroup", "PropertyGroup"]
        .iter()
        .map(|tag| MarkerRule::new(&PROJECT_FILES, &format!("<{tag}"), &format!("</{tag}>")))
        .collect()
}

struct CompiledRule {
    rule: MarkerRule,
    open: Regex,
    close: Regex,
}

/// Net open-marker and close-marker counts must match per touched file.
///
/// Counts are taken over hunk lines only: added lines count positive, removed
/// lines negative. A new file therefore has to be balanced on its own, and an
/// edit has to preserve whatever balance the file already had.
pub struct BalancedMarkers {
    rules: Vec<CompiledRule>,
}

impl BalancedMarkers {
    pub fn new(rules: &[MarkerRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    rule: rule.clone(),
                    open: marker_regex(&rule.open)?,
                    close: marker_regex(&rule.close)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }
}

impl StructuralCheck for BalancedMarkers {
    fn name(&self) -> &'static str {
        "balanced_markers"
    }

    fn check(&self, diff: &str) -> Result<(), MalformedPatchError> {
        for section in file_sections(diff) {
            for compiled in &self.rules {
                if !compiled.rule.matches_path(&section.path) {
                    continue;
                }
                let opens = section.net_count(|line| count_open(&compiled.open, line));
                let closes = section.net_count(|line| compiled.close.find_iter(line).count());
                if opens != closes {
                    return Err(MalformedPatchError {
                        check: self.name(),
                        detail: format!(
                            "{}: unbalanced `{}` (net {opens:+}) vs `{}` (net {closes:+})",
                            section.path, compiled.rule.open, compiled.rule.close
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A marker ending in an identifier character must not run into another one,
/// so `<Project` does not match `<ProjectReference`.
fn marker_regex(marker: &str) -> Result<Regex, regex::Error> {
    let mut pattern = regex::escape(marker);
    if marker
        .chars()
        .last()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
    {
        pattern.push_str(r"\b");
    }
    Regex::new(&pattern)
}

/// Self-closing elements (`<ItemGroup />`) open and close in place.
fn count_open(re: &Regex, line: &str) -> usize {
    re.find_iter(line)
        .filter(|m| {
            let rest = &line[m.end()..];
            match rest.find('>') {
                Some(idx) => !rest[..idx].ends_with('/'),
                None => true,
            }
        })
        .count()
}

struct FileSection<'a> {
    path: String,
    added: Vec<&'a str>,
    removed: Vec<&'a str>,
}

impl FileSection<'_> {
    fn net_count(&self, count: impl Fn(&str) -> usize) -> i64 {
        let added: usize = self.added.iter().map(|l| count(l)).sum();
        let removed: usize = self.removed.iter().map(|l| count(l)).sum();
        added as i64 - removed as i64
    }
}

fn file_sections(diff: &str) -> Vec<FileSection<'_>> {
    let mut sections: Vec<FileSection<'_>> = Vec::new();
    let mut in_hunk = false;
    for line in diff.lines() {
        if let Some(header) = line.strip_prefix(DIFF_START_MARKER) {
            in_hunk = false;
            sections.push(FileSection {
                path: header_path(header),
                added: Vec::new(),
                removed: Vec::new(),
            });
            continue;
        }
        let Some(section) = sections.last_mut() else {
            continue;
        };
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            continue;
        }
        if let Some(added) = line.strip_prefix('+') {
            section.added.push(added);
        } else if let Some(removed) = line.strip_prefix('-') {
            section.removed.push(removed);
        }
    }
    sections
}

/// Post-image path from ` a/old b/new`.
fn header_path(header: &str) -> String {
    let header = header.trim();
    match header.rsplit_once(" b/") {
        Some((_, path)) => path.to_string(),
        None => header.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_file_diff(path: &str, body: &[&str]) -> String {
        let mut diff = format!(
            "diff --git a/{path} b/{path}\nnew file mode 100644\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{} @@\n",
            body.len()
        );
        for line in body {
            diff.push('+');
            diff.push_str(line);
            diff.push('\n');
        }
        diff
    }

    fn standard() -> PatchValidator {
        PatchValidator::standard(32, &default_marker_rules()).expect("validator")
    }

    #[test]
    fn rejects_short_diff() {
        let err = standard().validate("diff --git a/x b/x\n").expect_err("short");
        assert_eq!(err.check, "minimum_length");
    }

    #[test]
    fn accepts_balanced_project_file() {
        let diff = new_file_diff(
            "core/Sim/Sim.csproj",
            &[
                "<Project Sdk=\"Microsoft.NET.Sdk\">",
                "  <PropertyGroup>",
                "    <TargetFramework>net8.0</TargetFramework>",
                "  </PropertyGroup>",
                "  <ItemGroup>",
                "    <ProjectReference Include=\"../Core/Core.csproj\" />",
                "  </ItemGroup>",
                "</Project>",
            ],
        );
        standard().validate(&diff).expect("balanced");
    }

    #[test]
    fn rejects_two_opens_and_one_close() {
        let diff = new_file_diff(
            "Sim.csproj",
            &[
                "<Project Sdk=\"Microsoft.NET.Sdk\">",
                "  <ItemGroup>",
                "  <ItemGroup>",
                "  </ItemGroup>",
                "</Project>",
            ],
        );
        let err = standard().validate(&diff).expect_err("unbalanced");
        assert_eq!(err.check, "balanced_markers");
        assert!(err.detail.contains("Sim.csproj"));
        assert!(err.detail.contains("<ItemGroup"));
    }

    #[test]
    fn edits_must_preserve_balance() {
        let balanced_edit = "diff --git a/A.props b/A.props\n--- a/A.props\n+++ b/A.props\n@@ -1,3 +1,3 @@\n <Project>\n-  <ItemGroup>\n+  <ItemGroup Condition=\"true\">\n   </ItemGroup>\n";
        standard().validate(balanced_edit).expect("balanced edit");

        let dropped_close = "diff --git a/A.props b/A.props\n--- a/A.props\n+++ b/A.props\n@@ -1,3 +1,2 @@\n <Project>\n   <ItemGroup>\n-  </ItemGroup>\n";
        let err = standard().validate(dropped_close).expect_err("dropped close");
        assert!(err.detail.contains("</ItemGroup>"));
    }

    #[test]
    fn ignores_files_without_rules() {
        let diff = new_file_diff("src/Clamp.cs", &["<Project", "<Project", "class Clamp {}"]);
        standard().validate(&diff).expect("not a project file");
    }

    #[test]
    fn self_closing_and_prefixed_tags_do_not_count_as_open() {
        let diff = new_file_diff(
            "B.targets",
            &["<Project>", "  <ItemGroup />", "  <ProjectReference Include=\"x\" />", "</Project>"],
        );
        standard().validate(&diff).expect("balanced");
    }

    #[test]
    fn custom_check_runs_in_order() {
        struct Reject;
        impl StructuralCheck for Reject {
            fn name(&self) -> &'static str {
                "reject"
            }
            fn check(&self, _diff: &str) -> Result<(), MalformedPatchError> {
                Err(MalformedPatchError {
                    check: self.name(),
                    detail: "always".to_string(),
                })
            }
        }

        let validator = PatchValidator::new(vec![
            Box::new(MinimumLength { min_bytes: 1 }),
            Box::new(Reject),
        ]);
        assert_eq!(validator.check_names(), vec!["minimum_length", "reject"]);
        let err = validator.validate("diff --git a/x b/x\n").expect_err("reject");
        assert_eq!(err.check, "reject");
    }
}
