//! Title and summary derivation for sessions.
//!
//! Pure functions over a message sequence. The title comes from an ordered
//! rule table applied to the first user message; the first matching rule
//! wins, no scoring.

use std::sync::LazyLock;

use regex::Regex;

use crate::store::types::{Message, Role};

/// Title used when no user message exists yet.
pub const DEFAULT_TITLE: &str = "新对话";

/// Max chars of content used as a fallback title.
const TITLE_MAX_CHARS: usize = 20;

/// Max chars of a derived summary.
const SUMMARY_MAX_CHARS: usize = 30;

/// Ordered pattern → label rules. Order is significant: the repair rule must
/// precede the elevator rule so "电梯故障" classifies as a repair request.
/// The greeting rule only fires when the whole message is a greeting.
static TITLE_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)^(你好|您好|hi|hello)[\s!！.。,，?？~]*$", "问候对话"),
        (r"故障|维修|保养|检修", "维修服务"),
        (r"电梯|升降机|扶梯|自动扶梯", "电梯咨询"),
        (r"安装|施工|工程", "安装工程"),
        (r"价格|报价|费用|成本", "价格咨询"),
        (r"技术|参数|规格|配置", "技术咨询"),
        (r"预约|约定|安排", "预约服务"),
        (r"投诉|问题|建议", "客户反馈"),
        (r"培训|学习|教程", "培训咨询"),
        (r"怎么|如何|怎样", "操作咨询"),
        (r"什么|啥|哪个", "信息查询"),
        (r"为什么|为啥|原因", "原因分析"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("valid title rule"), label))
    .collect()
});

/// Derive a short label for a session from its messages.
///
/// Scans for the first user message, runs it through the rule table, and
/// falls back to the first [`TITLE_MAX_CHARS`] chars of content (with an
/// ellipsis marker when truncated).
#[must_use]
pub fn derive_title(messages: &[Message]) -> String {
    let Some(first_user) = messages.iter().find(|m| m.role == Role::User) else {
        return DEFAULT_TITLE.to_string();
    };

    let content = first_user.content.trim();
    if content.is_empty() {
        return DEFAULT_TITLE.to_string();
    }

    for (pattern, label) in TITLE_RULES.iter() {
        if pattern.is_match(content) {
            return (*label).to_string();
        }
    }

    truncate_chars(content, TITLE_MAX_CHARS)
}

/// Derive preview text for a session.
///
/// Picks the most recent message, except when the conversation ends with a
/// user message and an assistant reply exists: then the most recent assistant
/// content is used instead, so the preview does not echo the user's own last
/// line back at them.
#[must_use]
pub fn derive_summary(messages: &[Message]) -> String {
    let Some(last) = messages.last() else {
        return String::new();
    };

    let picked = if last.role == Role::User {
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .unwrap_or(last)
    } else {
        last
    };

    truncate_chars(picked.content.trim(), SUMMARY_MAX_CHARS)
}

/// Truncate to `max` chars, appending `...` when content was cut.
///
/// Counts chars, not bytes, so CJK content truncates correctly.
#[must_use]
pub fn truncate_chars(content: &str, max: usize) -> String {
    if content.chars().count() <= max {
        content.to_string()
    } else {
        let mut truncated: String = content.chars().take(max).collect();
        truncated.push_str("...");
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Message {
        Message::user("session_test", content)
    }

    fn assistant(content: &str) -> Message {
        Message::assistant("session_test", content)
    }

    #[test]
    fn no_messages_yields_placeholder() {
        assert_eq!(derive_title(&[]), DEFAULT_TITLE);
    }

    #[test]
    fn no_user_message_yields_placeholder() {
        let messages = vec![assistant("自动回复")];
        assert_eq!(derive_title(&messages), DEFAULT_TITLE);
    }

    #[test]
    fn repair_rule_wins_over_elevator_rule() {
        let messages = vec![user("电梯故障了怎么办")];
        assert_eq!(derive_title(&messages), "维修服务");
    }

    #[test]
    fn elevator_rule_without_repair_keywords() {
        let messages = vec![user("这部电梯多少层")];
        assert_eq!(derive_title(&messages), "电梯咨询");
    }

    #[test]
    fn pure_greeting_matches_greeting_rule() {
        assert_eq!(derive_title(&[user("你好")]), "问候对话");
        assert_eq!(derive_title(&[user("Hello!")]), "问候对话");
    }

    #[test]
    fn greeting_prefix_does_not_capture_longer_messages() {
        let messages = vec![user("hello there, random question")];
        assert_eq!(derive_title(&messages), "hello there, random ...");
    }

    #[test]
    fn price_rule() {
        let messages = vec![user("这个报价多少")];
        // "多少" is not in the what-rule; 报价 hits the price rule first anyway.
        assert_eq!(derive_title(&messages), "价格咨询");
    }

    #[test]
    fn short_unmatched_content_is_title_verbatim() {
        let messages = vec![user("test note")];
        assert_eq!(derive_title(&messages), "test note");
    }

    #[test]
    fn first_user_message_decides_even_after_replies() {
        let messages = vec![
            assistant("欢迎"),
            user("如何保养"),
            assistant("定期检查"),
            user("价格多少"),
        ];
        assert_eq!(derive_title(&messages), "维修服务");
    }

    #[test]
    fn cjk_fallback_truncates_by_chars() {
        let content = "这是一条完全不匹配任何规则的超长中文内容字符串用来测试截断";
        let title = derive_title(&[user(content)]);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), 23);
    }

    #[test]
    fn summary_prefers_assistant_before_trailing_user_message() {
        let messages = vec![user("电梯价格"), assistant("为您查询报价"), user("好的谢谢")];
        assert_eq!(derive_summary(&messages), "为您查询报价");
    }

    #[test]
    fn summary_uses_last_message_when_it_is_a_reply() {
        let messages = vec![user("问题"), assistant("答案")];
        assert_eq!(derive_summary(&messages), "答案");
    }

    #[test]
    fn summary_falls_back_to_user_without_any_reply() {
        let messages = vec![user("只有我自己")];
        assert_eq!(derive_summary(&messages), "只有我自己");
    }

    #[test]
    fn summary_empty_for_no_messages() {
        assert_eq!(derive_summary(&[]), "");
    }

    #[test]
    fn truncate_marks_cut_content() {
        assert_eq!(truncate_chars("abcdef", 4), "abcd...");
        assert_eq!(truncate_chars("abcd", 4), "abcd");
    }
}
