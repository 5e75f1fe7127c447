//! Prompt templates for the four agents.
//!
//! Templates are compiled once into a shared minijinja environment and
//! rendered with serde contexts. Keeping them here, away from the agent
//! logic, makes prompt changes reviewable without touching control flow.

use minijinja::Environment;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::llm::LlmError;

pub const PLANNER_SYSTEM: &str = "You are the planning agent of a long-form \
fiction engine. You produce structural decisions, not prose. Be concrete and \
deterministic; never hedge.";

pub const WRITER_SYSTEM: &str = "You are the drafting agent of a long-form \
fiction engine. You write vivid, economical scene prose that lands every \
obligatory beat and stays inside the word target.";

pub const EDITOR_SYSTEM: &str = "You are the continuity editor of a long-form \
fiction engine. You assess a draft scene against the narrative state: what it \
newly establishes, which questions it opens or closes, and how characters \
change. You polish sentences but never alter plot events.";

pub const VALIDATOR_SYSTEM: &str = "You are the structural validator of a \
long-form fiction engine. You judge whether structural goals were met and \
report concrete issues.";

static TEMPLATES: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    let add = |env: &mut Environment<'static>, name, source| {
        env.add_template(name, source)
            .unwrap_or_else(|e| panic!("template {name}: {e}"));
    };

    add(
        &mut env,
        "initial_state",
        r#"Derive the thematic spine for a new book.

## Premise
{{ prompt }}

## Genre
{{ genre }}

## Target length
{{ target_length_words }} words across {{ acts_total }} act(s).

Return:
- theme_thesis: one sentence stating the claim the book argues.
- protagonist: the name of the character who will carry that claim.
"#,
    );

    add(
        &mut env,
        "act_outlines",
        r#"Outline every act of the book.

## Premise
{{ prompt }}

## Genre
{{ genre }}

## Theme thesis
{{ theme_thesis }}

## Protagonist
{{ protagonist }}

Produce exactly {{ acts_total }} act outlines, in order. For each act give:
- goal: what the act must accomplish for the book's argument.
- key_beats: 3-6 concrete beats.
- close_conditions: conditions that must be true before the act may end.
- open_questions: questions the act should keep alive for later acts.

Escalate stakes across acts; the final act must pay the theme thesis off.
"#,
    );

    add(
        &mut env,
        "scene_brief",
        r#"Plan the next scene.

## Position
Act {{ act_index }} of {{ acts_total }}, scene {{ scene_index }}. {{ act_words_remaining }} words remain in this act.

## Act outline
{{ act_outline }}

## Act close conditions still open
{% for condition in close_conditions %}- {{ condition }}
{% endfor %}

## Unresolved questions
{% for question in unresolved_questions %}- {{ question }}
{% endfor %}

## Story so far
{{ summary }}

## Forbidden repetitions
The following narrative functions and reveals were already used recently.
The new scene must not repeat them:
{% for item in forbidden_repetitions %}- {{ item }}
{% endfor %}

Plan one scene of about {{ word_target }} words that advances at least one
close condition or opens/resolves an unresolved question. Return goal, pov,
setting, and obligatory_beats.
"#,
    );

    add(
        &mut env,
        "write_scene",
        r#"Write the scene described below.

## Book
{{ genre }}. Theme: {{ theme_thesis }}
{% if voice %}Narration voice: {{ voice }}
{% endif %}
## Story so far
{{ summary }}

## Scene goal
{{ goal }}

## Point of view
{{ pov }}

## Setting
{{ setting }}

## Obligatory beats
{% for beat in obligatory_beats %}- {{ beat }}
{% endfor %}

## Do not repeat
{% for item in forbidden_repetitions %}- {{ item }}
{% endfor %}

Write approximately {{ word_target }} words of finished prose. Return
scene_title and content.
"#,
    );

    add(
        &mut env,
        "rewrite_constraints",
        r#"
## Previous attempt (rejected)
{{ previous_content }}

## What went wrong
{% for constraint in constraints %}- {{ constraint }}
{% endfor %}

Write the scene again from the brief, honoring every correction above.
"#,
    );

    add(
        &mut env,
        "assess_scene",
        r#"Assess this draft scene against the narrative state.

## Draft ({{ word_count }} words, pov {{ pov }})
{{ content }}

## Act close conditions still open
{% for condition in close_conditions %}- {{ condition }}
{% endfor %}

## Unresolved questions
{% for question in unresolved_questions %}- {{ question }}
{% endfor %}

## Characters
{% for character in characters %}- {{ character.name }}: transformation {{ character.transformation }}, irreversible_loss {{ character.irreversible_loss }}
{% endfor %}

## Escalation tokens remaining
{{ escalation_remaining }}

Report:
- fingerprint: narrative_function, new_information (each reveal as a short
  phrase), location_tag, beat_shape_signature.
- advances_close_conditions: which of the open conditions above this scene
  advances (quote them exactly).
- introduces_questions / resolves_questions (quote resolved ones exactly).
- uses_escalation: whether the scene raises stakes a discrete step.
- character_changes: per changed character, the new absolute transformation
  in [0,1], whether an irreversible loss occurs (or is undone), and costs paid.
- act_summary: the story-so-far recap updated with this scene, under 150 words.
- edited_text: the scene with sentence-level polish only. Never change plot
  events, reveals, or who does what.
"#,
    );

    add(
        &mut env,
        "validate_act",
        r#"Judge whether this act met its structural goals.

## Act goal
{{ act_goal }}

## Close conditions left unsatisfied
{% for condition in close_conditions %}- {{ condition }}
{% endfor %}

## Act recap
{{ act_summary }}

Return valid plus a list of concrete issues (empty when valid).
"#,
    );

    add(
        &mut env,
        "validate_book",
        r#"Judge whether the finished book holds together structurally.

## Theme thesis
{{ theme_thesis }}

## Protagonist arc
{{ protagonist }}: transformation {{ transformation }}, irreversible_loss {{ irreversible_loss }}

## Unresolved questions remaining
{% for question in unresolved_questions %}- {{ question }}
{% endfor %}

## Book recap
{{ book_summary }}

Return valid plus a list of concrete issues (empty when valid).
"#,
    );

    add(
        &mut env,
        "front_matter",
        r#"Produce front matter for the finished book.

## Genre
{{ genre }}

## Theme thesis
{{ theme_thesis }}

## Recap
{{ book_summary }}

Return title (no subtitle) and blurb (80-150 words, no spoilers past act one).
"#,
    );

    env
});

/// Render a named template with a serde context.
pub fn render<S: Serialize>(name: &str, ctx: S) -> Result<String, LlmError> {
    TEMPLATES
        .get_template(name)
        .and_then(|t| t.render(ctx))
        .map_err(|e| LlmError::Fatal(format!("prompt template {name}: {e}")))
}
