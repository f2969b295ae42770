//! Prompts for answering multiple-choice questions with retrieved context.

/// Default character budget for the context block.
pub const CONTEXT_CHAR_BUDGET: usize = 2000;

/// Marker appended when the context block is cut.
pub const ELLIPSIS: &str = "...";

/// Collection of prompts used for question answering.
pub struct Prompts;

impl Prompts {
    /// System instruction restricting the answer to a single letter.
    pub fn answer_system() -> &'static str {
        "You are an expert assistant answering Korean Criminal Law KMMLU multiple-choice questions.\n\
Use the provided context if helpful.\n\
Answer strictly with a single uppercase letter: A, B, C, or D.\n\
Do not include any explanation."
    }

    /// Join retrieved passages with blank lines, bounded to `max_chars`.
    ///
    /// Truncated output ends in [`ELLIPSIS`] and is at most `max_chars`
    /// characters long, ellipsis included.
    pub fn format_context<S: AsRef<str>>(contexts: &[S], max_chars: usize) -> String {
        let text = contexts
            .iter()
            .map(|c| c.as_ref())
            .collect::<Vec<_>>()
            .join("\n\n");

        if text.chars().count() <= max_chars {
            return text;
        }

        let keep = max_chars.saturating_sub(ELLIPSIS.chars().count());
        let mut truncated: String = text.chars().take(keep).collect();
        truncated.push_str(ELLIPSIS);
        truncated
    }

    /// User message: question, exactly four labelled choices, then context.
    ///
    /// Missing choices are rendered as empty lines, never omitted.
    pub fn answer_user<S: AsRef<str>, C: AsRef<str>>(
        question: &str,
        choices: &[C],
        contexts: &[S],
        context_budget: usize,
    ) -> String {
        let choice = |i: usize| choices.get(i).map(|c| c.as_ref()).unwrap_or("");
        let context = Self::format_context(contexts, context_budget);

        format!(
            "[Question]\n{}\n\n\
[Choices]\nA. {}\nB. {}\nC. {}\nD. {}\n\n\
[Context]\n{}\n\n\
Return only one letter among: A, B, C, D.",
            question,
            choice(0),
            choice(1),
            choice(2),
            choice(3),
            context
        )
    }
}
