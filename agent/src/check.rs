//! `patch-agent check`: run extraction and validation over a saved model response.

use anyhow::{Context, Result};

use crate::core::error::AttemptError;
use crate::core::extract::extract_diff;
use crate::core::validate::PatchValidator;
use crate::io::config::ValidatorConfig;

/// Extract and validate `response`. The outer `Result` covers rule compilation.
pub fn check_response(
    response: &str,
    config: &ValidatorConfig,
) -> Result<Result<String, AttemptError>> {
    let validator = PatchValidator::standard(config.min_patch_bytes, &config.balanced)
        .context("compile validator rules")?;
    let diff = match extract_diff(response) {
        Ok(diff) => diff,
        Err(err) => return Ok(Err(err.into())),
    };
    Ok(validator.validate(&diff).map(|()| diff).map_err(Into::into))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_prose_wrapped_diff() {
        let response = "Sure!\n\ndiff --git a/README.md b/README.md\n--- a/README.md\n+++ b/README.md\n@@ -1 +1 @@\n-hi\n+hello\n\n\n";
        let diff = check_response(response, &ValidatorConfig::default())
            .expect("rules")
            .expect("valid");
        assert!(diff.starts_with("diff --git"));
        assert!(diff.ends_with("+hello\n"));
    }

    #[test]
    fn reports_unbalanced_project_file() {
        let response = "diff --git a/core/CoreSim/CoreSim.csproj b/core/CoreSim/CoreSim.csproj\n--- a/core/CoreSim/CoreSim.csproj\n+++ b/core/CoreSim/CoreSim.csproj\n@@ -1,3 +1,4 @@\n+<ItemGroup>\n <Project Sdk=\"Microsoft.NET.Sdk\">\n";
        let err = check_response(response, &ValidatorConfig::default())
            .expect("rules")
            .expect_err("unbalanced");
        assert_eq!(err.kind(), "malformed");
        assert!(err.to_string().contains("CoreSim.csproj"));
    }

    #[test]
    fn reports_missing_diff() {
        let err = check_response("I could not do it.", &ValidatorConfig::default())
            .expect("rules")
            .expect_err("no diff");
        assert_eq!(err.kind(), "extraction");
    }
}
