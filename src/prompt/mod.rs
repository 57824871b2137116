//! Prompt rendering.
//!
//! Templates use `tera` syntax. Two named templates are registered:
//!
//! - `system`: rendered once per conversation from the persona. Variables:
//!   `persona_id`, `persona_name`, `demographics`, `prior_responses`.
//! - `turn`: rendered per turn from the questions it covers. Variables:
//!   `instrument`, `scale`, `scale_description`, `single`, and `questions`,
//!   a list of `{id, text, min, max, scale_description}`.
//!
//! Multi-question turns list each question as `[id] text` on its own line
//! and ask for `id: number` replies, which is what the reply parser's
//! labelled pass looks for.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tera::{Context, Tera};

use crate::errors::TemplateError;
use crate::instrument::{Instrument, QuestionRef};
use crate::persona::{Persona, PersonaStore};

pub const SYSTEM_TEMPLATE: &str = "system";
pub const TURN_TEMPLATE: &str = "turn";

pub const DEFAULT_SYSTEM_TEMPLATE: &str = "\
You are taking part in a psychological survey as persona {{ persona_id }}\
{% if persona_name %} ({{ persona_name }}){% endif %}.
{% if demographics %}
Your characteristics:
{% for key, value in demographics %}- {{ key }}: {{ value }}
{% endfor %}{% endif %}{% if prior_responses %}
Things you have said before:
{% for text in prior_responses %}- {{ text }}
{% endfor %}{% endif %}
Answer every question as this person would. Respond only with numbers.";

pub const DEFAULT_TURN_TEMPLATE: &str = "\
{% if single %}{% set q = questions | first %}\
Please rate the following statement on a scale from {{ q.scale_description }}.

\"{{ q.text }}\"

Reply with a single number between {{ q.min }} and {{ q.max }}.\
{% else %}\
Please rate each of the following statements from \"{{ scale }}\"\
{% if scale_description %} on a scale from {{ scale_description }}{% endif %}.

{% for q in questions %}[{{ q.id }}] {{ q.text }} ({{ q.min }} to {{ q.max }})
{% endfor %}
Reply with one line per statement in the form \"ID: number\", \
for example \"{{ questions.0.id }}: {{ questions.0.min }}\".\
{% endif %}";

// ---------------------------------------------------------------------------
// Template variables
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct QuestionVars<'a> {
    id: &'a str,
    text: &'a str,
    min: i64,
    max: i64,
    scale_description: String,
}

/// Variables for the `system` template.
pub fn persona_context(persona: &Persona) -> Context {
    let prior: Vec<&str> = persona
        .prior_responses
        .iter()
        .filter_map(|r| {
            r.revised_response
                .as_deref()
                .or(r.original_response.as_deref())
        })
        .filter(|text| !text.trim().is_empty())
        .collect();

    let mut context = Context::new();
    context.insert("persona_id", &persona.persona_id);
    context.insert("persona_name", &persona.name.clone().unwrap_or_default());
    context.insert("demographics", &persona.demographics);
    context.insert("prior_responses", &prior);
    context
}

/// Variables for the `turn` template.
pub fn turn_context(instrument: &Instrument, questions: &[QuestionRef<'_>]) -> Context {
    let vars: Vec<QuestionVars<'_>> = questions
        .iter()
        .map(|q| QuestionVars {
            id: &q.question.id,
            text: &q.question.text,
            min: q.question.response_scale.min,
            max: q.question.response_scale.max,
            scale_description: q.question.response_scale.describe(),
        })
        .collect();

    let first = questions.first();
    let same_scale = questions
        .iter()
        .all(|q| first.is_some_and(|f| f.scale.name == q.scale.name));
    let scale = match first {
        Some(f) if same_scale => f.scale.name.as_str(),
        _ => instrument.name.as_str(),
    };
    let same_range = questions
        .iter()
        .all(|q| first.is_some_and(|f| f.question.response_scale == q.question.response_scale));
    let scale_description = match first {
        Some(f) if same_range => f.question.response_scale.describe(),
        _ => String::new(),
    };

    let mut context = Context::new();
    context.insert("instrument", &instrument.name);
    context.insert("scale", scale);
    context.insert("scale_description", &scale_description);
    context.insert("single", &(questions.len() == 1));
    context.insert("questions", &vars);
    context
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Flatten a tera error and its sources into one line.
fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Render a template string once. Pure: no registry, no file access.
pub fn render_template(template: &str, variables: &Context) -> Result<String, TemplateError> {
    Tera::one_off(template, variables, false).map_err(|e| TemplateError::Render {
        name: "inline".into(),
        message: describe(&e),
    })
}

/// Registry holding the parsed `system` and `turn` templates.
#[derive(Debug, Clone)]
pub struct PromptRenderer {
    tera: Tera,
}

impl PromptRenderer {
    /// Renderer with the built-in templates.
    pub fn new() -> Result<Self, TemplateError> {
        Self::with_templates(DEFAULT_SYSTEM_TEMPLATE, DEFAULT_TURN_TEMPLATE)
    }

    pub fn with_templates(system: &str, turn: &str) -> Result<Self, TemplateError> {
        let mut tera = Tera::default();
        for (name, source) in [(SYSTEM_TEMPLATE, system), (TURN_TEMPLATE, turn)] {
            tera.add_raw_template(name, source)
                .map_err(|e| TemplateError::Parse {
                    name: name.to_string(),
                    message: describe(&e),
                })?;
        }
        Ok(Self { tera })
    }

    /// Built-in turn template with the system template read from `path`.
    pub fn with_system_file(path: &Path) -> Result<Self, TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::with_templates(&source, DEFAULT_TURN_TEMPLATE)
    }

    /// Renderer for a run: the configured system template if any, else the
    /// built-in one.
    pub fn from_path(system_template: Option<&Path>) -> Result<Self, TemplateError> {
        match system_template {
            Some(path) => Self::with_system_file(path),
            None => Self::new(),
        }
    }

    fn render(&self, name: &str, context: &Context) -> Result<String, TemplateError> {
        self.tera
            .render(name, context)
            .map_err(|e| TemplateError::Render {
                name: name.to_string(),
                message: describe(&e),
            })
    }

    pub fn render_system(&self, persona: &Persona) -> Result<String, TemplateError> {
        self.render(SYSTEM_TEMPLATE, &persona_context(persona))
    }

    pub fn render_turn(
        &self,
        instrument: &Instrument,
        questions: &[QuestionRef<'_>],
    ) -> Result<String, TemplateError> {
        self.render(TURN_TEMPLATE, &turn_context(instrument, questions))
    }
}

/// Write `persona_{id}_prompt.txt` for every persona into `out_dir`.
///
/// Returns the paths written, in store order.
pub fn render_persona_prompts(
    renderer: &PromptRenderer,
    personas: &PersonaStore,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, TemplateError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| TemplateError::Io { path, source }
    };

    std::fs::create_dir_all(out_dir).map_err(io_err(out_dir))?;
    let mut written = Vec::with_capacity(personas.len());
    for persona in personas.iter() {
        let text = renderer.render_system(persona)?;
        let path = out_dir.join(format!("persona_{}_prompt.txt", persona.persona_id));
        std::fs::write(&path, text).map_err(io_err(&path))?;
        tracing::debug!(persona_id = persona.persona_id, path = %path.display(), "rendered prompt");
        written.push(path);
    }
    tracing::info!(count = written.len(), dir = %out_dir.display(), "rendered persona prompts");
    Ok(written)
}
