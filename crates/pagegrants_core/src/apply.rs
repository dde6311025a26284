use anyhow::{Result, bail};
use serde::Serialize;

use crate::client::SecurityApi;
use crate::manifest::PageDirective;
use crate::security::{merge_security, replacement_security};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Read the current security document, merge, and `POST` it back.
    #[default]
    Merge,
    /// `PUT` a freshly built document, replacing existing grants.
    Replace,
}

impl UpdateMode {
    pub fn parse(value: &str) -> Result<Self> {
        if value.eq_ignore_ascii_case("merge") {
            return Ok(Self::Merge);
        }
        if value.eq_ignore_ascii_case("replace") {
            return Ok(Self::Replace);
        }
        bail!("unsupported update mode: {value} (expected merge|replace)")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub mode: UpdateMode,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageAction {
    Updated,
    Planned,
    Failed,
}

impl PageAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Planned => "planned",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageResult {
    pub path: String,
    pub action: PageAction,
    pub cascade: String,
    pub detail: Option<String>,
    /// Document that was (or in a dry run would have been) sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub mode: UpdateMode,
    pub dry_run: bool,
    pub updated: usize,
    pub planned: usize,
    pub failed: usize,
    pub request_count: usize,
    pub results: Vec<PageResult>,
}

/// Apply every directive in order. A failing page is recorded and logged; it never
/// stops the pages after it.
pub fn apply_directives<A: SecurityApi>(
    api: &mut A,
    directives: &[PageDirective],
    options: &ApplyOptions,
) -> ApplyReport {
    let mut results = Vec::with_capacity(directives.len());

    for directive in directives {
        tracing::debug!(page = %directive.path, "processing page");
        let cascade = directive.effective_cascade();
        let result = match apply_one(api, directive, options) {
            Ok(outcome) => PageResult {
                path: directive.path.clone(),
                action: if options.dry_run {
                    PageAction::Planned
                } else {
                    PageAction::Updated
                },
                cascade: cascade.as_str().to_string(),
                detail: outcome.detail,
                document: Some(outcome.document),
            },
            Err(error) => {
                tracing::warn!(page = %directive.path, "processing of page {} failed", directive.path);
                tracing::debug!(page = %directive.path, "{error:?}");
                PageResult {
                    path: directive.path.clone(),
                    action: PageAction::Failed,
                    cascade: cascade.as_str().to_string(),
                    detail: Some(format!("{error:#}")),
                    document: None,
                }
            }
        };
        results.push(result);
    }

    let count = |action: PageAction| results.iter().filter(|item| item.action == action).count();
    ApplyReport {
        mode: options.mode,
        dry_run: options.dry_run,
        updated: count(PageAction::Updated),
        planned: count(PageAction::Planned),
        failed: count(PageAction::Failed),
        request_count: api.request_count(),
        results,
    }
}

struct Outcome {
    document: String,
    detail: Option<String>,
}

fn apply_one<A: SecurityApi>(
    api: &mut A,
    directive: &PageDirective,
    options: &ApplyOptions,
) -> Result<Outcome> {
    let cascade = directive.effective_cascade();
    match options.mode {
        UpdateMode::Merge => {
            let current = api.get_page_security(&directive.path)?;
            let merged = merge_security(&current, directive)?;
            let detail = (directive.restriction.is_some() && !merged.restriction_applied).then(|| {
                tracing::warn!(
                    page = %directive.path,
                    "security document has no permissions.page/restriction; restriction left unchanged"
                );
                "restriction element missing; restriction left unchanged".to_string()
            });
            if options.dry_run {
                tracing::debug!(page = %directive.path, document = %merged.document, "dry run; not posting");
            } else {
                api.post_page_security(&directive.path, cascade, &merged.document)?;
            }
            Ok(Outcome {
                document: merged.document,
                detail,
            })
        }
        UpdateMode::Replace => {
            let document = replacement_security(directive);
            if options.dry_run {
                tracing::debug!(page = %directive.path, document = %document, "dry run; not putting");
            } else {
                api.put_page_security(&directive.path, cascade, &document)?;
            }
            Ok(Outcome {
                document,
                detail: None,
            })
        }
    }
}
