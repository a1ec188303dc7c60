//! Role prompts rendered with minijinja and fitted to a byte budget.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt is over budget, droppable sections go first (in
//! each template's drop order), then the largest remaining section is cut.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::capability::{ImplementerBrief, ReviewBrief, TesterBrief};

const TESTER_TEMPLATE: &str = include_str!("prompts/tester.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const IMPLEMENTER_TEMPLATE: &str = include_str!("prompts/implementer.md");

const TESTER_DROP_ORDER: &[&str] = &["fixtures", "signatures", "feedback"];
const IMPLEMENTER_DROP_ORDER: &[&str] = &["feedback"];

const TRUNCATED: &str = "\n[truncated]";

pub struct PromptEngine {
    env: Environment<'static>,
    budget: usize,
}

impl PromptEngine {
    pub fn new(budget: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("tester", TESTER_TEMPLATE)
            .context("load tester template")?;
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .context("load reviewer template")?;
        env.add_template("implementer", IMPLEMENTER_TEMPLATE)
            .context("load implementer template")?;
        Ok(Self { env, budget })
    }

    pub fn render_tester(&self, brief: &TesterBrief) -> Result<String> {
        let rendered = self.env.get_template("tester")?.render(context! {
            requirement => &brief.requirement,
            signatures => &brief.public_signatures,
            fixtures => &brief.fixtures,
            feedback => brief.feedback.as_deref().and_then(non_empty),
            tests_dir => &brief.tests_dir,
        })?;
        Ok(self.fit(&rendered, TESTER_DROP_ORDER))
    }

    pub fn render_reviewer(&self, brief: &ReviewBrief) -> Result<String> {
        let rendered = self.env.get_template("reviewer")?.render(context! {
            requirement => &brief.requirement,
            test => &brief.test,
        })?;
        Ok(self.fit(&rendered, &[]))
    }

    pub fn render_implementer(&self, brief: &ImplementerBrief, tests_dir: &str) -> Result<String> {
        let rendered = self.env.get_template("implementer")?.render(context! {
            failure => brief.failure_message.trim(),
            feedback => brief.feedback.as_deref().and_then(non_empty),
            tests_dir => tests_dir,
        })?;
        Ok(self.fit(&rendered, IMPLEMENTER_DROP_ORDER))
    }

    fn fit(&self, rendered: &str, drop_order: &[&str]) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget, drop_order);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section marker pattern is valid")
});

/// Split rendered output at section markers. Empty droppable sections
/// (a template `if` that rendered nothing) are left out.
fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if required || !content.is_empty() {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize, drop_order: &[&str]) {
    for key in drop_order {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(section = %dropped.key, bytes = dropped.content.len(), "dropped prompt section");
        }
    }

    let over = total_len(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len()) else {
        return;
    };
    let before = largest.content.len();
    let mut keep = before.saturating_sub(over + TRUNCATED.len());
    while keep > 0 && !largest.content.is_char_boundary(keep) {
        keep -= 1;
    }
    largest.content.truncate(keep);
    largest.content.push_str(TRUNCATED);
    debug!(section = %largest.key, before, after = largest.content.len(), "truncated prompt section");
}
