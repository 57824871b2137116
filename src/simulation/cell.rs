//! Execution of a single (persona, model, condition, instrument) cell.
//!
//! Turns run in plan order on one conversation. Failure handling:
//!
//! - `AuthFailure` is returned to the driver, which aborts the run.
//! - `InvalidResponse` marks the turn's questions and the cell continues.
//!   The failed user message is not kept, so roles keep alternating.
//! - Any other backend error (after retries) marks the turn's questions and
//!   every later question with that error and ends the cell.
//! - A template error marks every remaining question `template_error`.

use crate::condition::{derive_seed, Condition, Turn};
use crate::conversation::Conversation;
use crate::errors::{BackendError, ResponseError};
use crate::instrument::{Instrument, QuestionRef};
use crate::llms::backend::ModelBackend;
use crate::llms::retry::{complete_with_retry, RetryPolicy};
use crate::persona::Persona;
use crate::prompt::PromptRenderer;
use crate::results::{CellKey, ResponseRecord};
use crate::simulation::parser::parse_turn;

/// Everything a cell needs besides the backend.
pub struct CellInput<'a> {
    pub persona: &'a Persona,
    pub instrument: &'a Instrument,
    pub condition: Condition,
    pub renderer: &'a PromptRenderer,
    pub retry: &'a RetryPolicy,
    /// Run-wide base seed.
    pub seed: u64,
}

fn fail_all<'t, 'a: 't>(
    cell: &CellKey,
    questions: impl IntoIterator<Item = &'t QuestionRef<'a>>,
    error: ResponseError,
    records: &mut Vec<ResponseRecord>,
) {
    records.extend(
        questions
            .into_iter()
            .map(|q| ResponseRecord::failed(cell, q, error)),
    );
}

fn remaining<'t, 'a>(turns: &'t [Turn<'a>], from: usize) -> impl Iterator<Item = &'t QuestionRef<'a>> {
    turns[from..].iter().flat_map(|t| t.questions.iter())
}

/// Run one cell to completion.
///
/// Returns one record per planned question, or the fatal error that must
/// abort the run.
pub async fn run_cell(
    input: CellInput<'_>,
    backend: &dyn ModelBackend,
) -> Result<Vec<ResponseRecord>, BackendError> {
    let CellInput {
        persona,
        instrument,
        condition,
        renderer,
        retry,
        seed,
    } = input;

    let cell = CellKey::new(persona.persona_id, backend.name(), condition);
    let order_seed = derive_seed(seed, persona.persona_id, backend.name(), &instrument.name);
    let turns = condition.plan(instrument, order_seed);
    let mut records = Vec::with_capacity(instrument.question_count());

    let system = match renderer.render_system(persona) {
        Ok(system) => system,
        Err(err) => {
            tracing::warn!(error = %err, "system prompt failed to render");
            fail_all(&cell, remaining(&turns, 0), ResponseError::TemplateError, &mut records);
            return Ok(records);
        }
    };

    let mut conversation = Conversation::with_system(system.as_str());
    for (index, turn) in turns.iter().enumerate() {
        if turn.reset {
            conversation = Conversation::with_system(system.as_str());
        }

        let prompt = match renderer.render_turn(instrument, &turn.questions) {
            Ok(prompt) => prompt,
            Err(err) => {
                tracing::warn!(turn = index, error = %err, "turn prompt failed to render");
                fail_all(&cell, remaining(&turns, index), ResponseError::TemplateError, &mut records);
                break;
            }
        };

        let mut request = conversation.clone();
        request.push_user(prompt);

        let reply = match complete_with_retry(backend, &request, retry).await {
            Ok(reply) => reply,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                let error = err.response_error().unwrap_or(ResponseError::ServerError);
                if error == ResponseError::InvalidResponse {
                    tracing::warn!(turn = index, error = %err, "invalid response, skipping turn");
                    fail_all(&cell, &turn.questions, error, &mut records);
                    continue;
                }
                tracing::warn!(turn = index, error = %err, "backend failed, marking cell failed");
                fail_all(&cell, remaining(&turns, index), error, &mut records);
                break;
            }
        };

        let expected: Vec<_> = turn
            .questions
            .iter()
            .map(|q| (q.question.id.as_str(), &q.question.response_scale))
            .collect();
        for (question, parsed) in turn.questions.iter().zip(parse_turn(&reply, &expected)) {
            records.push(match parsed {
                Ok(value) => ResponseRecord::answered(&cell, question, value),
                Err(err) => {
                    tracing::debug!(question = %question.question.id, error = %err, reply = %reply, "unusable answer");
                    ResponseRecord::failed(&cell, question, err.into())
                }
            });
        }

        conversation = request;
        conversation.push_assistant(reply);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::fixtures::{battery, big_five};
    use crate::conversation::Role;
    use crate::testing::ScriptedBackend;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    async fn run(
        instrument: &Instrument,
        condition: Condition,
        backend: &ScriptedBackend,
    ) -> Result<Vec<ResponseRecord>, BackendError> {
        let persona = Persona::new(1).with_demographic("age", "25");
        let renderer = PromptRenderer::new().unwrap();
        let retry = fast();
        let input = CellInput {
            persona: &persona,
            instrument,
            condition,
            renderer: &renderer,
            retry: &retry,
            seed: 42,
        };
        run_cell(input, backend).await
    }

    fn values(records: &[ResponseRecord]) -> Vec<(String, Option<i64>, Option<ResponseError>)> {
        records
            .iter()
            .map(|r| (r.question_id.clone(), r.value(), r.error()))
            .collect()
    }

    #[tokio::test]
    async fn test_question_level_resets_each_turn() {
        let backend = ScriptedBackend::new("gpt-4").then_ok("4").then_ok("3");
        let records = run(&big_five(), Condition::QuestionLevel, &backend).await.unwrap();
        assert_eq!(
            values(&records),
            vec![("Q1".into(), Some(4), None), ("Q2".into(), Some(3), None)]
        );
        for conversation in backend.conversations() {
            assert_eq!(conversation.len(), 2);
            assert_eq!(conversation.messages()[0].role, Role::System);
        }
    }

    #[tokio::test]
    async fn test_scale_level_positional_reply() {
        let backend = ScriptedBackend::new("gpt-4").then_ok("I'd say 4 and 3");
        let records = run(&big_five(), Condition::ScaleLevel, &backend).await.unwrap();
        assert_eq!(
            values(&records),
            vec![("Q1".into(), Some(4), None), ("Q2".into(), Some(3), None)]
        );
    }

    #[tokio::test]
    async fn test_ambiguous_reply_is_unparseable() {
        let backend = ScriptedBackend::new("gpt-4").then_ok("4, 3 or maybe 2");
        let records = run(&big_five(), Condition::ScaleLevel, &backend).await.unwrap();
        assert!(records
            .iter()
            .all(|r| r.value().is_none() && r.error() == Some(ResponseError::Unparseable)));
    }

    #[tokio::test]
    async fn test_full_context_single_call() {
        let backend = ScriptedBackend::new("gpt-4").responding(|conversation| {
            let prompt = conversation.last_user_message().unwrap_or_default();
            Ok(prompt
                .lines()
                .filter_map(|l| l.strip_prefix('['))
                .filter_map(|l| l.split(']').next())
                .map(|id| format!("{}: 2", id))
                .collect::<Vec<_>>()
                .join("\n"))
        });
        let records = run(&battery(), Condition::FullContext, &backend).await.unwrap();
        assert_eq!(backend.calls(), 1);
        assert_eq!(records.len(), 12);
        assert!(records.iter().all(|r| r.value() == Some(2)));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_rest_of_cell() {
        let limited = || BackendError::RateLimited {
            provider: "scripted".into(),
            retry_after: None,
        };
        let backend = ScriptedBackend::new("gpt-4")
            .then_ok("5")
            .then_err(limited())
            .then_err(limited())
            .then_err(limited());
        let records = run(&battery(), Condition::QuestionLevel, &backend).await.unwrap();
        assert_eq!(backend.calls(), 4);
        assert_eq!(records.len(), 12);
        assert_eq!(records[0].value(), Some(5));
        assert!(records[1..]
            .iter()
            .all(|r| r.error() == Some(ResponseError::RateLimited)));
    }

    #[tokio::test]
    async fn test_invalid_response_only_affects_its_turn() {
        let backend = ScriptedBackend::new("gpt-4")
            .then_err(BackendError::InvalidResponse {
                provider: "scripted".into(),
                message: "empty content".into(),
            })
            .then_ok("2");
        let records = run(&big_five(), Condition::QuestionLevel, &backend).await.unwrap();
        assert_eq!(
            values(&records),
            vec![
                ("Q1".into(), None, Some(ResponseError::InvalidResponse)),
                ("Q2".into(), Some(2), None)
            ]
        );
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_is_returned() {
        let backend = ScriptedBackend::new("gpt-4").then_err(BackendError::AuthFailure {
            provider: "scripted".into(),
            message: "bad key".into(),
        });
        let err = run(&big_five(), Condition::QuestionLevel, &backend).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_template_error_marks_cell() {
        let persona = Persona::new(1);
        let renderer = PromptRenderer::with_templates("{{ demographics.age }}", "x").unwrap();
        let retry = fast();
        let instrument = big_five();
        let backend = ScriptedBackend::new("gpt-4");
        let input = CellInput {
            persona: &persona,
            instrument: &instrument,
            condition: Condition::ScaleLevel,
            renderer: &renderer,
            retry: &retry,
            seed: 0,
        };
        let records = run_cell(input, &backend).await.unwrap();
        assert_eq!(backend.calls(), 0);
        assert!(records
            .iter()
            .all(|r| r.error() == Some(ResponseError::TemplateError)));
        assert_eq!(records.len(), 2);
    }
}
