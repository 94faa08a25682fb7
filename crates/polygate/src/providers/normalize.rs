//! Message-history normalization shared by the adapters.
//!
//! Both passes drop blank messages and merge consecutive messages of the same
//! role. The Gemini pass additionally injects a dummy user message when the
//! first non-system message is from the assistant, since that wire requires
//! user/model alternation. Messages carrying tool calls or tool results are
//! structural and are never dropped or merged. Both passes are idempotent.

use crate::chat::{ChatMessage, ContentPart, MessageContent};

fn is_droppable(msg: &ChatMessage) -> bool {
    if msg.tool_calls.is_some() || msg.tool_call_id.is_some() {
        return false;
    }
    match &msg.content {
        None => true,
        Some(content) => content.is_blank(),
    }
}

fn is_mergeable(msg: &ChatMessage) -> bool {
    msg.tool_calls.is_none() && msg.tool_call_id.is_none()
}

fn to_parts(content: MessageContent) -> Vec<ContentPart> {
    match content {
        MessageContent::Text(text) => vec![ContentPart::text(text)],
        MessageContent::Parts(parts) => parts,
    }
}

/// Joins two content payloads. Plain strings join with a newline; anything
/// multimodal becomes a part list, coalescing the boundary when both sides
/// are text.
fn merge_contents(a: MessageContent, b: MessageContent) -> MessageContent {
    if let (MessageContent::Text(a), MessageContent::Text(b)) = (&a, &b) {
        return MessageContent::Text(format!("{}\n{}", a, b));
    }

    let mut left = to_parts(a);
    let right = to_parts(b);
    let mut right = right.into_iter();

    if let (Some(last), Some(first)) = (left.last(), right.as_slice().first()) {
        if last.kind == "text" && first.kind == "text" {
            let first = right.next().expect("peeked element");
            let last = left.last_mut().expect("non-empty");
            let joined = format!(
                "{}\n{}",
                last.text.as_deref().unwrap_or(""),
                first.text.as_deref().unwrap_or("")
            );
            last.text = Some(joined);
        }
    }
    left.extend(right);
    MessageContent::Parts(left)
}

fn drop_and_merge(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        if is_droppable(&msg) {
            continue;
        }
        match merged.last_mut() {
            Some(last)
                if last.role == msg.role && is_mergeable(last) && is_mergeable(&msg) =>
            {
                let a = last.content.take().expect("non-droppable message has content");
                let b = msg.content.expect("non-droppable message has content");
                last.content = Some(merge_contents(a, b));
            }
            _ => merged.push(msg),
        }
    }
    merged
}

/// Normalization for OpenAI-compatible wires: drop blanks, merge runs.
pub fn normalize_for_openai(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    drop_and_merge(messages)
}

/// Normalization for the Gemini wire: the OpenAI pass plus a dummy user
/// message when the conversation would otherwise open with the assistant.
pub fn normalize_for_gemini(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let merged = drop_and_merge(messages);

    let first_non_system = merged.iter().find(|m| m.role != "system");
    let needs_dummy = matches!(first_non_system, Some(m) if m.role == "assistant");
    if !needs_dummy {
        return merged;
    }

    let mut fixed = Vec::with_capacity(merged.len() + 1);
    let mut injected = false;
    for msg in merged {
        if !injected && msg.role != "system" {
            fixed.push(ChatMessage::user("..."));
            injected = true;
        }
        fixed.push(msg);
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;

    fn text_of(msg: &ChatMessage) -> String {
        msg.content.as_ref().unwrap().as_text()
    }

    #[test]
    fn drops_empty_and_whitespace_messages() {
        let messages = vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("   "),
            ChatMessage {
                content: None,
                ..ChatMessage::assistant("")
            },
            ChatMessage::user("there"),
        ];
        let out = normalize_for_openai(messages);
        assert_eq!(out.len(), 1);
        assert_eq!(text_of(&out[0]), "hello\nthere");
    }

    #[test]
    fn merges_consecutive_same_role_with_newline() {
        let messages = vec![
            ChatMessage::user("a"),
            ChatMessage::user("b"),
            ChatMessage::assistant("c"),
        ];
        let out = normalize_for_openai(messages);
        assert_eq!(out.len(), 2);
        assert_eq!(text_of(&out[0]), "a\nb");
    }

    #[test]
    fn merges_part_lists_by_extension() {
        let messages = vec![
            ChatMessage {
                content: Some(MessageContent::Parts(vec![
                    ContentPart::text("look at"),
                    ContentPart::image("http://img/1.png"),
                ])),
                ..ChatMessage::user("")
            },
            ChatMessage::user("what is it?"),
        ];
        let out = normalize_for_openai(messages);
        assert_eq!(out.len(), 1);
        match out[0].content.as_ref().unwrap() {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[2].text.as_deref(), Some("what is it?"));
            }
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[test]
    fn adjacent_text_parts_coalesce() {
        let messages = vec![
            ChatMessage {
                content: Some(MessageContent::Parts(vec![ContentPart::text("a")])),
                ..ChatMessage::user("")
            },
            ChatMessage::user("b"),
        ];
        let out = normalize_for_openai(messages);
        match out[0].content.as_ref().unwrap() {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                assert_eq!(parts[0].text.as_deref(), Some("a\nb"));
            }
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[test]
    fn tool_messages_survive_untouched() {
        let messages = vec![
            ChatMessage {
                content: None,
                tool_calls: Some(vec![ToolCall::function("c1", "calc", "{}")]),
                ..ChatMessage::assistant("")
            },
            ChatMessage::tool_result("c1", "calc", "{\"x\":1}"),
            ChatMessage::tool_result("c2", "calc", "{\"x\":2}"),
        ];
        let out = normalize_for_openai(messages);
        assert_eq!(out.len(), 3, "tool messages are never merged or dropped");
    }

    #[test]
    fn gemini_injects_dummy_user_before_leading_assistant() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::assistant("I go first"),
        ];
        let out = normalize_for_gemini(messages);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].role, "system");
        assert_eq!(out[1].role, "user");
        assert_eq!(text_of(&out[1]), "...");
        assert_eq!(out[2].role, "assistant");
    }

    #[test]
    fn gemini_leaves_user_first_conversations_alone() {
        let messages = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let out = normalize_for_gemini(messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, "user");
    }

    #[test]
    fn normalization_is_idempotent() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::assistant("leading"),
            ChatMessage::user("a"),
            ChatMessage::user("b"),
            ChatMessage::assistant(" "),
        ];
        let once_openai = normalize_for_openai(messages.clone());
        assert_eq!(
            serde_json::to_value(&normalize_for_openai(once_openai.clone())).unwrap(),
            serde_json::to_value(&once_openai).unwrap()
        );

        let once_gemini = normalize_for_gemini(messages);
        assert_eq!(
            serde_json::to_value(&normalize_for_gemini(once_gemini.clone())).unwrap(),
            serde_json::to_value(&once_gemini).unwrap()
        );
    }
}
