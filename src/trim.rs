/// Context-window trimming.
///
/// Pure function: given the fixed token overhead (system prompt + tool
/// schemas) and the full turn history, select the longest contiguous suffix
/// that fits the model's context window. A suffix may only begin at index 0
/// or at a user turn carrying no tool results; cutting anywhere else would
/// split a tool_use from its tool_result and the API would reject the
/// request. Recomputed on every call since history only grows.
use crate::client::{ContentBlock, Role, ToolSpec, Turn};

// ── Token estimation (cheap approximation: 1 token ≈ 4 chars) ─────────────────

pub fn estimate_tokens(s: &str) -> usize {
    // +10 overhead per message for role/formatting
    // chars().count() instead of len() to avoid overcounting multi-byte Unicode
    s.chars().count() / 4 + 10
}

fn estimate_block(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => estimate_tokens(text),
        // Images are billed by tiles, not chars; a flat figure keeps the
        // estimate conservative without decoding anything.
        ContentBlock::Image { .. } => 1600,
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_tokens(name) + estimate_tokens(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => {
            10 + content.iter().map(estimate_block).sum::<usize>()
        }
    }
}

fn estimate_turn(turn: &Turn) -> usize {
    turn.content.iter().map(estimate_block).sum()
}

pub fn estimate_turns(turns: &[Turn]) -> usize {
    turns.iter().map(estimate_turn).sum()
}

pub fn estimate_tools(tools: &[ToolSpec]) -> usize {
    tools
        .iter()
        .map(|t| {
            estimate_tokens(&t.name)
                + estimate_tokens(&t.description)
                + estimate_tokens(&t.input_schema.to_string())
        })
        .sum()
}

// ── Suffix selection ───────────────────────────────────────────────────────────

/// Select the maximal suffix of `turns` such that
/// `fixed_tokens + estimate(suffix) <= budget`, never splitting a tool_use
/// from its paired tool_result. If even the smallest valid suffix exceeds the
/// budget it is returned anyway; the loop must send something.
pub fn trim(turns: &[Turn], fixed_tokens: usize, budget: usize) -> &[Turn] {
    if turns.is_empty() {
        return turns;
    }

    let valid_starts: Vec<usize> = (0..turns.len())
        .filter(|&i| i == 0 || (turns[i].role == Role::User && !turns[i].has_tool_result()))
        .collect();

    for &start in &valid_starts {
        if fixed_tokens + estimate_turns(&turns[start..]) <= budget {
            return &turns[start..];
        }
    }

    // Nothing fits; fall back to the shortest suffix we may legally send.
    let last = *valid_starts.last().unwrap_or(&0);
    &turns[last..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ContentBlock;

    fn text_turn(role: Role, len: usize) -> Turn {
        Turn { role, content: vec![ContentBlock::text("x".repeat(len))] }
    }

    fn tool_pair(id: &str, result_len: usize) -> (Turn, Turn) {
        let assistant = Turn::assistant(vec![ContentBlock::ToolUse {
            id: id.to_string(),
            name: "read_file".to_string(),
            input: serde_json::json!({"path": "a.txt"}),
        }]);
        let user = Turn::user(vec![ContentBlock::tool_result(id, "y".repeat(result_len))]);
        (assistant, user)
    }

    #[test]
    fn large_budget_keeps_everything() {
        let turns = vec![
            text_turn(Role::User, 100),
            text_turn(Role::Assistant, 100),
            text_turn(Role::User, 100),
        ];
        let out = trim(&turns, 50, 100_000);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn trims_to_a_suffix_that_fits() {
        let mut turns = vec![text_turn(Role::User, 4000)];
        for _ in 0..4 {
            turns.push(text_turn(Role::Assistant, 4000));
            turns.push(text_turn(Role::User, 4000));
        }
        let budget = 3000;
        let out = trim(&turns, 100, budget);
        assert!(out.len() < turns.len());
        assert!(100 + estimate_turns(out) <= budget);
        // Suffix, not a subsequence: the kept turns are the trailing ones.
        assert_eq!(out.len() % 2, 1); // starts at a user turn, ends at a user turn
    }

    #[test]
    fn never_splits_a_tool_use_from_its_result() {
        let mut turns = vec![text_turn(Role::User, 2000)];
        let (a1, u1) = tool_pair("t1", 2000);
        let (a2, u2) = tool_pair("t2", 2000);
        turns.extend([a1, u1, a2, u2]);
        turns.push(text_turn(Role::Assistant, 10));
        turns.push(text_turn(Role::User, 10));

        let out = trim(&turns, 0, 1000);
        // The cut point must not be a user turn containing tool results.
        assert!(!out[0].has_tool_result());
    }

    #[test]
    fn trim_is_idempotent() {
        let mut turns = vec![text_turn(Role::User, 4000)];
        for i in 0..6 {
            let (a, u) = tool_pair(&format!("t{i}"), 3000);
            turns.push(a);
            turns.push(u);
            turns.push(text_turn(Role::Assistant, 500));
            turns.push(text_turn(Role::User, 500));
        }
        let once = trim(&turns, 200, 5000);
        let twice = trim(once, 200, 5000);
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn oversized_history_still_returns_something() {
        let (a, u) = tool_pair("t1", 100_000);
        let turns = vec![text_turn(Role::User, 100_000), a, u];
        let out = trim(&turns, 0, 10);
        assert!(!out.is_empty());
        assert!(!out[0].has_tool_result());
    }
}
