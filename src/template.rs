//! Prompt rendering for the generation backend.

use minijinja::Environment;
use serde::Serialize;

const TEMPLATES: &[(&str, &str)] = &[
    ("spec", include_str!("templates/spec.md.jinja")),
    ("spec-review", include_str!("templates/spec-review.md.jinja")),
    ("tests", include_str!("templates/tests.md.jinja")),
    ("implement", include_str!("templates/implement.md.jinja")),
    ("review", include_str!("templates/review.md.jinja")),
];

/// Which prompt to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    Spec,
    SpecReview,
    Tests,
    Implement,
    Review,
}

impl Prompt {
    const fn name(self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::SpecReview => "spec-review",
            Self::Tests => "tests",
            Self::Implement => "implement",
            Self::Review => "review",
        }
    }
}

/// Everything a prompt may refer to. Unused fields are simply absent from the output.
#[derive(Debug, Default, Serialize)]
pub struct PromptContext<'a> {
    pub repo: &'a str,
    pub number: Option<u64>,
    pub title: Option<&'a str>,
    pub story: Option<&'a str>,
    pub spec: Option<&'a str>,
    pub current: Option<&'a str>,
    pub feedback: Option<&'a str>,
    pub test_dir: Option<&'a str>,
    pub diff: Option<&'a str>,
}

pub fn render(prompt: Prompt, ctx: &PromptContext<'_>) -> anyhow::Result<String> {
    let mut env = Environment::new();
    for &(name, source) in TEMPLATES {
        env.add_template(name, source)?;
    }
    let template = env.get_template(prompt.name())?;
    Ok(template.render(ctx)?)
}
