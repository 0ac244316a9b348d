//! Publication controller: commit, push, and optionally open an auto-merging PR.
//!
//! Runs only after the repair loop succeeded. Failures never undo the local commit.

use tracing::{info, instrument, warn};

use crate::core::error::PublicationError;
use crate::io::config::PublishConfig;
use crate::io::git::VersionControl;
use crate::io::hosting::{CodeHost, PullRequest, PullRequestRequest};

/// What was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub branch: String,
    pub pull_request: Option<PullRequest>,
}

/// Commit the verified worktree and push `branch`; open a PR when `host` is given.
#[instrument(skip_all, fields(branch = %branch))]
pub fn publish<V, C>(
    vcs: &V,
    host: Option<&C>,
    config: &PublishConfig,
    branch: &str,
) -> Result<Publication, PublicationError>
where
    V: VersionControl + ?Sized,
    C: CodeHost + ?Sized,
{
    let committed = vcs
        .stage_and_commit(&config.commit_message)
        .map_err(PublicationError::Commit)?;
    if !committed {
        return Err(PublicationError::NothingToCommit);
    }
    info!(branch, "committed verified change");

    vcs.push(&config.remote, branch)
        .map_err(|err| PublicationError::Push {
            branch: branch.to_string(),
            detail: format!("{err:#}"),
        })?;

    let Some(host) = host else {
        return Ok(Publication {
            branch: branch.to_string(),
            pull_request: None,
        });
    };

    let pr = host
        .open_pull_request(&PullRequestRequest {
            branch: branch.to_string(),
            base: config.base.clone(),
            title: config.pr_title.clone(),
            body: config.pr_body.clone(),
        })
        .map_err(|err| PublicationError::PullRequest {
            branch: branch.to_string(),
            detail: format!("{err:#}"),
        })?;

    if config.auto_merge {
        if let Err(err) = host.enable_auto_merge(&pr, config.merge_method) {
            warn!(url = %pr.url, "auto-merge request failed");
            return Err(PublicationError::AutoMerge {
                url: pr.url,
                detail: format!("{err:#}"),
            });
        }
    }

    Ok(Publication {
        branch: branch.to_string(),
        pull_request: Some(pr),
    })
}
