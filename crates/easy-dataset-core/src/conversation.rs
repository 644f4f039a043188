//! Conversation turn rules.
//!
//! A valid conversation is at most one leading `system` turn followed by
//! strictly alternating `user` / `assistant` turns starting with `user`.

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Role, Turn};

/// Check turn ordering and reject empty contents.
pub fn validate_turns(turns: &[Turn]) -> PipelineResult<()> {
    let mut rest = turns;
    if let Some(first) = turns.first() {
        if first.role == Role::System {
            rest = &turns[1..];
        }
    }
    if rest.is_empty() {
        return Err(PipelineError::validation(
            "conversation needs at least one user turn",
        ));
    }
    for (i, turn) in rest.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        if turn.role != expected {
            return Err(PipelineError::validation(format!(
                "turn {} has role '{}', expected '{}'",
                i + (turns.len() - rest.len()),
                turn.role.as_str(),
                expected.as_str()
            )));
        }
    }
    if let Some(i) = turns.iter().position(|t| t.content.trim().is_empty()) {
        return Err(PipelineError::validation(format!("turn {} is empty", i)));
    }
    Ok(())
}

/// The default single-turn form of a question/answer pair.
pub fn single_turn(question: &str, answer: &str, system: Option<&str>) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(3);
    if let Some(sys) = system.filter(|s| !s.trim().is_empty()) {
        turns.push(Turn::new(Role::System, sys));
    }
    turns.push(Turn::new(Role::User, question));
    turns.push(Turn::new(Role::Assistant, answer));
    turns
}

/// Keep at most `max_exchanges` user/assistant pairs, preserving a leading
/// system turn and never ending on a dangling user turn.
pub fn truncate_exchanges(mut turns: Vec<Turn>, max_exchanges: usize) -> Vec<Turn> {
    let offset = usize::from(turns.first().map(|t| t.role) == Some(Role::System));
    let body = turns.len() - offset;
    let keep = body.min(max_exchanges * 2);
    let keep = keep - keep % 2;
    turns.truncate(offset + keep);
    turns
}

/// Split a multi-turn conversation into `(system, history, last_user, last_assistant)`.
///
/// `history` holds the completed `[user, assistant]` pairs before the final
/// exchange, which is the shape LLaMA Factory expects.
pub fn split_history(turns: &[Turn]) -> Option<(Option<&str>, Vec<(&str, &str)>, &str, &str)> {
    let (system, body) = match turns.first() {
        Some(t) if t.role == Role::System => (Some(t.content.as_str()), &turns[1..]),
        _ => (None, turns),
    };
    if body.len() < 2 || body.len() % 2 != 0 {
        return None;
    }
    let pairs: Vec<(&str, &str)> = body
        .chunks(2)
        .map(|p| (p[0].content.as_str(), p[1].content.as_str()))
        .collect();
    let (last_q, last_a) = *pairs.last()?;
    Some((system, pairs[..pairs.len() - 1].to_vec(), last_q, last_a))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(role: Role, c: &str) -> Turn {
        Turn::new(role, c)
    }

    #[test]
    fn accepts_valid_shapes() {
        assert!(validate_turns(&single_turn("q", "a", None)).is_ok());
        assert!(validate_turns(&single_turn("q", "a", Some("be brief"))).is_ok());
        assert!(validate_turns(&[t(Role::User, "only a question")]).is_ok());
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(validate_turns(&[]).is_err());
        assert!(validate_turns(&[t(Role::System, "s")]).is_err());
        assert!(validate_turns(&[t(Role::Assistant, "a")]).is_err());
        assert!(validate_turns(&[t(Role::User, "q"), t(Role::User, "q2")]).is_err());
        assert!(validate_turns(&[
            t(Role::User, "q"),
            t(Role::Assistant, "a"),
            t(Role::System, "late system"),
        ])
        .is_err());
        assert!(validate_turns(&[t(Role::User, "q"), t(Role::Assistant, "  ")]).is_err());
    }

    #[test]
    fn truncate_keeps_whole_exchanges() {
        let turns = vec![
            t(Role::System, "s"),
            t(Role::User, "1"),
            t(Role::Assistant, "1"),
            t(Role::User, "2"),
            t(Role::Assistant, "2"),
            t(Role::User, "3"),
        ];
        let out = truncate_exchanges(turns.clone(), 4);
        assert_eq!(out.len(), 5);
        let out = truncate_exchanges(turns, 1);
        assert_eq!(out.len(), 3);
        assert!(validate_turns(&out).is_ok());
    }

    #[test]
    fn split_history_pairs() {
        let turns = vec![
            t(Role::User, "q1"),
            t(Role::Assistant, "a1"),
            t(Role::User, "q2"),
            t(Role::Assistant, "a2"),
        ];
        let (system, history, q, a) = split_history(&turns).unwrap();
        assert!(system.is_none());
        assert_eq!(history, vec![("q1", "a1")]);
        assert_eq!((q, a), ("q2", "a2"));
    }
}
