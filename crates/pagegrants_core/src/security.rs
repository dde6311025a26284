use anyhow::{Context, Result, bail};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, BytesText, Event};

use crate::manifest::PageDirective;

const SECURITY_ROOT: &[u8] = b"security";
const RESTRICTION_PATH: [&[u8]; 3] = [b"security", b"permissions.page", b"restriction"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedSecurity {
    pub document: String,
    /// `false` when a restriction was requested but the document had no
    /// `permissions.page/restriction` element to carry it.
    pub restriction_applied: bool,
}

/// Apply a directive on top of the page's current security document.
///
/// The restriction text is replaced in place and every grant is appended under a
/// trailing `grants.added` element. Anything else in the document passes through
/// untouched.
pub fn merge_security(document: &str, directive: &PageDirective) -> Result<MergedSecurity> {
    let mut reader = Reader::from_str(document);
    let mut writer = Writer::new(Vec::with_capacity(document.len() + 256));
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut saw_root = false;
    let mut restriction_applied = false;
    let restriction = directive.restriction.as_deref();

    loop {
        let event = reader
            .read_event()
            .context("failed to parse page security document")?;
        match event {
            Event::Start(start) => {
                if stack.is_empty() {
                    ensure_security_root(&start, saw_root)?;
                    saw_root = true;
                }
                stack.push(start.name().as_ref().to_vec());
                if let Some(value) = restriction
                    && is_restriction_path(&stack)
                {
                    writer.write_event(Event::Start(start.clone()))?;
                    writer.write_event(Event::Text(BytesText::new(value)))?;
                    reader
                        .read_to_end(start.name())
                        .context("failed to parse restriction element")?;
                    writer.write_event(Event::End(start.to_end()))?;
                    stack.pop();
                    restriction_applied = true;
                    continue;
                }
                writer.write_event(Event::Start(start))?;
            }
            Event::Empty(start) => {
                if stack.is_empty() {
                    ensure_security_root(&start, saw_root)?;
                    saw_root = true;
                    writer.write_event(Event::Start(start.clone()))?;
                    write_grants_block(&mut writer, "grants.added", directive);
                    writer.write_event(Event::End(start.to_end()))?;
                    continue;
                }
                stack.push(start.name().as_ref().to_vec());
                if let Some(value) = restriction
                    && is_restriction_path(&stack)
                {
                    writer.write_event(Event::Start(start.clone()))?;
                    writer.write_event(Event::Text(BytesText::new(value)))?;
                    writer.write_event(Event::End(start.to_end()))?;
                    restriction_applied = true;
                } else {
                    writer.write_event(Event::Empty(start))?;
                }
                stack.pop();
            }
            Event::End(end) => {
                if stack.len() == 1 {
                    write_grants_block(&mut writer, "grants.added", directive);
                }
                stack.pop();
                writer.write_event(Event::End(end))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    if !saw_root {
        bail!("page security document has no root element");
    }
    let document =
        String::from_utf8(writer.into_inner()).context("merged security document is not UTF-8")?;
    Ok(MergedSecurity {
        document,
        restriction_applied: restriction.is_some() && restriction_applied,
    })
}

/// Build a complete security document for a replacing `PUT`.
pub fn replacement_security(directive: &PageDirective) -> String {
    let mut out = String::from("<security>");
    if let Some(restriction) = directive.restriction.as_deref() {
        out.push_str("<permissions.page><restriction>");
        out.push_str(&escape(restriction));
        out.push_str("</restriction></permissions.page>");
    }
    if directive.grants.is_empty() {
        out.push_str("<grants />");
    } else {
        out.push_str("<grants>");
        for grant in &directive.grants {
            out.push_str(grant.as_str());
        }
        out.push_str("</grants>");
    }
    out.push_str("</security>");
    out
}

fn ensure_security_root(start: &BytesStart<'_>, saw_root: bool) -> Result<()> {
    if saw_root {
        bail!("page security document has more than one root element");
    }
    if start.name().as_ref() != SECURITY_ROOT {
        bail!(
            "unexpected root element <{}> in page security document (expected <security>)",
            String::from_utf8_lossy(start.name().as_ref())
        );
    }
    Ok(())
}

fn is_restriction_path(stack: &[Vec<u8>]) -> bool {
    stack.len() == RESTRICTION_PATH.len()
        && stack
            .iter()
            .zip(RESTRICTION_PATH)
            .all(|(name, expected)| name.as_slice() == expected)
}

fn write_grants_block(writer: &mut Writer<Vec<u8>>, element: &str, directive: &PageDirective) {
    let out = writer.get_mut();
    if directive.grants.is_empty() {
        out.extend_from_slice(format!("<{element} />").as_bytes());
        return;
    }
    out.extend_from_slice(format!("<{element}>").as_bytes());
    for grant in &directive.grants {
        out.extend_from_slice(grant.as_str().as_bytes());
    }
    out.extend_from_slice(format!("</{element}>").as_bytes());
}
