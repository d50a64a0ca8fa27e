//! Model-facing text: system prompts and the turns the loop appends.

use crate::query::parser::clip_chars;
use crate::sandbox::Interpreter;

const PREVIEW_CHARS: usize = 500;

/// System prompt for root turns.
pub fn root_system_prompt(context: &str, interpreter: Interpreter, max_sub_calls: usize) -> String {
    let length = context.chars().count();
    let tools = match interpreter {
        Interpreter::Python => format!(
            "Code in ```repl blocks runs in Python with these names defined:\n\
             - `context`: the full document text\n\
             - `buffers`: a dict that persists between blocks\n\
             - `findings`: a list of evidence strings that persists between blocks\n\
             - `sub_query(prompt, context_slice=None)`: ask a smaller model about a slice of text \
             (at most {max_sub_calls} calls)\n\
             - `FINAL(answer)` / `FINAL_VAR(name)`: finish with an answer\n\
             - `SHOW_VARS()`: print stored buffers and findings"
        ),
        Interpreter::Shell => format!(
            "Code in ```repl blocks runs under `sh`. The document is in the file \
             \"$RLM_CONTEXT_FILE\". Persist state by writing JSON \
             {{\"buffers\": {{..}}, \"findings\": [..]}} to \"$RLM_STATE_FILE\". Ask a smaller \
             model with `rlm-engine sub-query --port \"$RLM_IPC_PORT\" <prompt>` (at most \
             {max_sub_calls} calls). Finish early by writing the answer to \
             \"$RLM_TERMINATION_FILE\"."
        ),
    };

    format!(
        "You answer questions about a document that you cannot see directly. \
         Treat it as an external environment and inspect it with code.\n\n\
         The document is {length} characters long (about {tokens} tokens). It begins:\n\
         ---\n{preview}\n---\n\n\
         {tools}\n\n\
         Base every claim on text you have located. When you are done, reply with:\n\
         FINAL_ANSWER: <answer>\n\
         SOURCE_EVIDENCE: <quoted passage>\n\
         CONFIDENCE: <high|medium|low>\n\
         VERIFICATION_METHOD: <how you checked>",
        tokens = length / 4,
        preview = clip_chars(context, PREVIEW_CHARS),
    )
}

/// System prompt for a sub-query.
pub fn sub_system_prompt(question: &str, context_slice: &str) -> String {
    format!(
        "Answer one question using only the text below. Quote the passage that supports \
         your answer. If the text does not contain the answer, say so plainly.\n\n\
         QUESTION: {question}\n\nTEXT:\n{context_slice}"
    )
}

/// User turn accompanying every sub-query.
pub const SUB_QUERY_INSTRUCTION: &str = "Analyze the text and answer the question.";

/// First user turn of a query.
pub fn initial_turn(question: &str, interpreter: Interpreter) -> String {
    let language = match interpreter {
        Interpreter::Python => "python",
        Interpreter::Shell => "shell",
    };
    format!(
        "Answer this query: {question}\n\n\
         You have not interacted with the REPL environment yet. Explore the context by writing \
         {language} code in ```repl blocks first before generating your final answer."
    )
}

/// Turn appended when a response neither answers nor runs code.
pub const NO_CODE_TURN: &str = "No code was executed. Write ```repl blocks to interact with the document. \
     You must explore the context before providing a final answer.";

/// Observation turn carrying (already truncated) sandbox output.
pub fn observation_turn(output: &str) -> String {
    format!(
        "Code execution output:\n```\n{output}\n```\n\n\
         Continue your analysis. Use FINAL() or write FINAL_ANSWER: when you have your answer."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_prompt_mentions_size_and_preview() {
        let prompt = root_system_prompt("Q3 2024 revenue reached $1.8M.", Interpreter::Python, 50);
        assert!(prompt.contains("30 characters"));
        assert!(prompt.contains("Q3 2024 revenue reached $1.8M."));
        assert!(prompt.contains("at most 50 calls"));
        assert!(prompt.contains("FINAL_ANSWER:"));
    }

    #[test]
    fn test_root_prompt_shell_variant() {
        let prompt = root_system_prompt("", Interpreter::Shell, 3);
        assert!(prompt.contains("$RLM_CONTEXT_FILE"));
        assert!(prompt.contains("sub-query"));
    }

    #[test]
    fn test_preview_is_clipped() {
        let context = "a".repeat(2_000);
        let prompt = root_system_prompt(&context, Interpreter::Python, 1);
        assert!(prompt.contains(&"a".repeat(500)));
        assert!(!prompt.contains(&"a".repeat(501)));
    }

    #[test]
    fn test_initial_turn() {
        let turn = initial_turn("What was Q3 revenue?", Interpreter::Python);
        assert!(turn.starts_with("Answer this query: What was Q3 revenue?\n\n"));
        assert!(turn.contains("python code in ```repl blocks"));
    }

    #[test]
    fn test_observation_turn() {
        let turn = observation_turn("42\n");
        assert!(turn.starts_with("Code execution output:\n```\n42\n\n```"));
    }

    #[test]
    fn test_sub_prompt() {
        let prompt = sub_system_prompt("Is it signed?", "Signed by both parties.");
        assert!(prompt.contains("QUESTION: Is it signed?"));
        assert!(prompt.ends_with("Signed by both parties."));
    }
}
