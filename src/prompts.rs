// Prompt Registry
// Prompt templates addressed by name; selection is a pure lookup with a
// default fallback so callers never fail on an unknown style.

use std::collections::HashMap;

pub const RAG_ANSWER: &str = "rag-answer";
pub const QUERY_REWRITE: &str = "rag-query-rewrite";
pub const TESTSET_GENERATE: &str = "testset-generate";
pub const JUDGE_FAITHFULNESS: &str = "judge-faithfulness";
pub const JUDGE_ANSWER_RELEVANCY: &str = "judge-answer-relevancy";
pub const JUDGE_CONTEXT_RECALL: &str = "judge-context-recall";
pub const JUDGE_CONTEXT_PRECISION: &str = "judge-context-precision";

const RAG_ANSWER_TEMPLATE: &str = "\
You are a helpful assistant. Answer the question using ONLY the context below.
If the context does not contain the answer, say you don't know; do not invent facts.

Context:
{context}

Question: {question}

Answer:";

const QUERY_REWRITE_TEMPLATE: &str = "\
You are a helpful assistant that rewrites a user's question based on the chat
history to make it a standalone question. The rewritten question must
explicitly include the subject referenced in the history.

RULES:
1. Do NOT answer the question.
2. Do NOT add extra information not present in the history or question.
3. Keep the rewritten question concise.
4. If the user's question is already standalone, return it as is.
5. If the user's question is essentially \"Hello\" or \"Thanks\", return it as is.

EXAMPLES:

Chat History:
Human: How to install Docker?
AI: You can install it via apt-get...
User Input: \"What about compose?\"
Rewritten: \"How to install Docker Compose?\"

---

Chat History:
Human: Introduce the Qwen model.
AI: Qwen is a LLM developed by Alibaba...
User Input: \"Is it open source?\"
Rewritten: \"Is the Qwen model open source?\"";

const TESTSET_GENERATE_TEMPLATE: &str = "\
You are generating an evaluation example for a retrieval system.
Given the source passage below, write one specific question that the passage
answers, and the ground-truth answer taken from the passage.

Respond with exactly two lines:
QUESTION: <the question>
GROUND_TRUTH: <the answer>

Source passage:
{context}";

const JUDGE_FAITHFULNESS_TEMPLATE: &str = "\
Judge whether the answer is grounded in the provided context.
Score 1.0 if every claim in the answer is supported by the context,
0.0 if none are, or a value in between for partial support.
Respond with only the numeric score.

Context:
{context}

Question: {question}
Answer: {answer}

Score:";

const JUDGE_ANSWER_RELEVANCY_TEMPLATE: &str = "\
Judge whether the answer actually addresses the question.
Score 1.0 for a direct, on-topic answer, 0.0 for an off-topic or empty one.
Respond with only the numeric score.

Question: {question}
Answer: {answer}

Score:";

const JUDGE_CONTEXT_RECALL_TEMPLATE: &str = "\
Judge whether the retrieved context covers the ground-truth answer.
Score 1.0 if the ground truth can be fully derived from the context,
0.0 if it cannot at all.
Respond with only the numeric score.

Context:
{context}

Ground truth: {ground_truth}

Score:";

const JUDGE_CONTEXT_PRECISION_TEMPLATE: &str = "\
Judge how much of the retrieved context is relevant to answering the question,
using the ground truth as the reference.
Score 1.0 if every passage is relevant, 0.0 if none are.
Respond with only the numeric score.

Context:
{context}

Question: {question}
Ground truth: {ground_truth}

Score:";

/// Look up a prompt template by name. Unknown names fall back to the RAG
/// answer template.
pub fn template(name: &str) -> &'static str {
    match name {
        RAG_ANSWER => RAG_ANSWER_TEMPLATE,
        QUERY_REWRITE => QUERY_REWRITE_TEMPLATE,
        TESTSET_GENERATE => TESTSET_GENERATE_TEMPLATE,
        JUDGE_FAITHFULNESS => JUDGE_FAITHFULNESS_TEMPLATE,
        JUDGE_ANSWER_RELEVANCY => JUDGE_ANSWER_RELEVANCY_TEMPLATE,
        JUDGE_CONTEXT_RECALL => JUDGE_CONTEXT_RECALL_TEMPLATE,
        JUDGE_CONTEXT_PRECISION => JUDGE_CONTEXT_PRECISION_TEMPLATE,
        _ => RAG_ANSWER_TEMPLATE,
    }
}

/// Render a template by substituting `{key}` placeholders.
pub fn render(name: &str, vars: &HashMap<&str, &str>) -> String {
    let mut out = template(name).to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_and_fallback() {
        assert!(template(QUERY_REWRITE).contains("standalone question"));
        // Unknown names fall back rather than failing.
        assert_eq!(template("no-such-prompt"), template(RAG_ANSWER));
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let vars = HashMap::from([("context", "MySQL listens on 3306."), ("question", "port?")]);
        let rendered = render(RAG_ANSWER, &vars);
        assert!(rendered.contains("MySQL listens on 3306."));
        assert!(rendered.contains("Question: port?"));
        assert!(!rendered.contains("{context}"));
    }

    #[test]
    fn test_judge_prompts_ask_for_numeric_score() {
        for name in [
            JUDGE_FAITHFULNESS,
            JUDGE_ANSWER_RELEVANCY,
            JUDGE_CONTEXT_RECALL,
            JUDGE_CONTEXT_PRECISION,
        ] {
            assert!(template(name).contains("numeric score"), "{name}");
        }
    }
}
