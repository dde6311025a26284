use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use roxmltree::{Document, Node};
use serde::Serialize;

const SNIPPET_MAX_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeMode {
    None,
    Delta,
    Absolute,
}

impl CascadeMode {
    /// Accepts the wire names as well as the boolean spellings older manifests use.
    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "true" | "yes" | "1" | "delta" => Ok(Self::Delta),
            "false" | "no" | "0" | "none" => Ok(Self::None),
            "absolute" => Ok(Self::Absolute),
            _ => bail!(
                "unsupported cascade value: {} (expected true|false|none|delta|absolute)",
                value.trim()
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Delta => "delta",
            Self::Absolute => "absolute",
        }
    }

    pub fn cascades(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Verbatim source text of one `<grant>` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct GrantFragment(String);

impl GrantFragment {
    pub fn new(xml: impl Into<String>) -> Self {
        Self(xml.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageDirective {
    pub path: String,
    pub restriction: Option<String>,
    pub cascade: Option<CascadeMode>,
    pub grants: Vec<GrantFragment>,
}

impl PageDirective {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            restriction: None,
            cascade: None,
            grants: Vec::new(),
        }
    }

    pub fn effective_cascade(&self) -> CascadeMode {
        self.cascade.unwrap_or(CascadeMode::None)
    }
}

impl fmt::Display for PageDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Page path: {}", self.path)?;
        writeln!(
            f,
            "Restriction: {}",
            self.restriction.as_deref().unwrap_or("<unchanged>")
        )?;
        writeln!(
            f,
            "Cascade: {}",
            if self.effective_cascade().cascades() {
                "yes"
            } else {
                "no"
            }
        )?;
        write!(f, "Grants: {}", self.grants.len())?;
        for grant in &self.grants {
            write!(f, "\n\n{}", grant.as_str())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPage {
    /// 1-based position among all `page` elements in the document.
    pub position: usize,
    pub reason: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub directives: Vec<PageDirective>,
    pub skipped: Vec<SkippedPage>,
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        bail!("could not find file: {}", path.display());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_manifest(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_manifest(text: &str) -> Result<Manifest> {
    let document = Document::parse(text).context("manifest is not well-formed XML")?;

    let mut manifest = Manifest::default();
    let pages = document
        .descendants()
        .filter(|node| node.has_tag_name("page"));
    for (index, page) in pages.enumerate() {
        match parse_page(text, page) {
            Ok(directive) => manifest.directives.push(directive),
            Err(error) => manifest.skipped.push(SkippedPage {
                position: index + 1,
                reason: error.to_string(),
                snippet: snippet(&text[page.range()]),
            }),
        }
    }
    Ok(manifest)
}

fn parse_page(text: &str, page: Node<'_, '_>) -> Result<PageDirective> {
    let path = child_text(page, "path")
        .or_else(|| non_blank(page.attribute("path")))
        .ok_or_else(|| anyhow::anyhow!("page path was not specified"))?;

    let cascade = match non_blank(page.attribute("cascade")).or_else(|| child_text(page, "cascade"))
    {
        Some(value) => Some(CascadeMode::parse(&value)?),
        None => None,
    };

    let grants = page
        .descendants()
        .filter(|node| node.has_tag_name("grant"))
        .map(|node| GrantFragment::new(&text[node.range()]))
        .collect();

    Ok(PageDirective {
        path,
        restriction: child_text(page, "restriction"),
        cascade,
        grants,
    })
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    let child = node.children().find(|child| child.has_tag_name(name))?;
    let text: String = child
        .descendants()
        .filter(Node::is_text)
        .filter_map(|item| item.text())
        .collect();
    non_blank(Some(text.as_str()))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn snippet(source: &str) -> String {
    let trimmed = source.trim();
    if trimmed.chars().count() <= SNIPPET_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(SNIPPET_MAX_CHARS).collect();
    out.push_str("...");
    out
}
