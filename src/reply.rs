//! Reply composition: translation replies, enrollment wording, quota
//! notices. Everything returned here is plain text; the embedding service
//! owns template rendering and delivery.

use crate::models::{LanguageChoice, TranslationResult};

/// Platform ceiling for a single reply message.
pub const MAX_REPLY_LENGTH: usize = 5000;

/// Truncate to a character budget, ellipsis-terminated.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Remove a leading echo of the source text a provider sometimes prepends
/// ("<source> - <translation>", or the source alone).
pub fn strip_source_echo(source_text: &str, translated_text: &str) -> String {
    if source_text.is_empty() || translated_text.is_empty() {
        return translated_text.to_string();
    }

    let source = source_text.trim();
    let candidate = translated_text.trim();

    if candidate.to_lowercase() == source.to_lowercase() {
        return String::new();
    }

    if let Some(prefix) = candidate.get(..source.len()) {
        if prefix.to_lowercase() == source.to_lowercase() {
            let rest = &candidate[source.len()..];
            let separators: &[char] = &[
                ' ', '(', ')', '[', ']', '-', '—', '–', ':', '：', '、', '，', ',', '。',
                '\u{3000}',
            ];
            return rest.trim_start_matches(separators).trim().to_string();
        }
    }

    candidate.to_string()
}

/// Compose the multi-language reply from the returned translations.
pub fn build_translation_reply(original_text: &str, translations: &[TranslationResult]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for item in translations {
        let text = strip_source_echo(original_text, &item.text);
        if !text.is_empty() && !lines.contains(&text) {
            lines.push(text);
        }
    }
    truncate_reply(&lines.join("\n\n"))
}

/// Clamp a reply to the platform ceiling at a character boundary.
pub fn truncate_reply(text: &str) -> String {
    if text.chars().count() <= MAX_REPLY_LENGTH {
        return text.to_string();
    }
    text.chars().take(MAX_REPLY_LENGTH).collect()
}

/// "A", "A and B", "A, B, and C".
fn join_names(names: &[String]) -> String {
    match names.len() {
        0 => String::new(),
        1 => names[0].clone(),
        2 => format!("{} and {}", names[0], names[1]),
        _ => format!(
            "{}, and {}",
            names[..names.len() - 1].join(", "),
            names[names.len() - 1]
        ),
    }
}

fn display_names(languages: &[LanguageChoice]) -> Vec<String> {
    languages
        .iter()
        .filter(|lang| !lang.code.is_empty())
        .map(|lang| {
            if lang.name.is_empty() {
                lang.code.clone()
            } else {
                lang.name.clone()
            }
        })
        .collect()
}

pub fn build_simple_confirm_text(languages: &[LanguageChoice]) -> String {
    let names = display_names(languages);
    if names.is_empty() {
        return "Do you want to enable translation?".to_string();
    }
    format!("Do you want to enable translation for {}?", join_names(&names))
}

pub fn build_completion_message(languages: &[LanguageChoice]) -> String {
    let names = display_names(languages);
    match names.len() {
        0 => "Translation languages have been updated.".to_string(),
        1 => format!("{} has been set as the translation language.", names[0]),
        _ => format!(
            "{} have been set as the translation languages.",
            join_names(&names)
        ),
    }
}

pub fn build_cancel_message() -> String {
    "Language update has been cancelled. Please tell me all languages again.".to_string()
}

pub fn build_language_limit_message(max_languages: usize) -> String {
    format!(
        "You can set up to {} translation languages. Please specify {} or fewer.",
        max_languages, max_languages
    )
}

pub fn build_unsupported_message(unsupported: &[LanguageChoice]) -> String {
    let names = display_names(unsupported);
    format!(
        "The following languages are not supported: {}",
        names.join(", ")
    )
}

/// Notice with an optional checkout link appended. When the link could not
/// be produced for an unpaid tenant, say so instead of going silent.
pub fn build_notice_with_link(
    base_text: &str,
    url: Option<&str>,
    add_missing_link_notice: bool,
) -> String {
    let mut lines = vec![base_text.to_string()];
    match url {
        Some(url) => lines.push(url.to_string()),
        None if add_missing_link_notice => lines.push(
            "(Unable to generate purchase link at this time, please contact administrator.)"
                .to_string(),
        ),
        None => {}
    }
    lines.retain(|l| !l.is_empty());
    truncate_reply(&lines.join("\n\n"))
}

// ---- fixed notice texts ----

pub fn quota_warning_text(paid: bool, limit: i64) -> String {
    if paid {
        format!(
            "You have reached the limit of the Pro plan ({} messages per month).\nTranslation will be paused from the next message in this billing cycle.",
            limit
        )
    } else {
        format!(
            "You have reached the limit of the free plan ({} messages per month).\nStarting with the next message, a paid plan is required. Please complete checkout to continue.",
            limit
        )
    }
}

pub fn over_quota_text(paid: bool, limit: i64) -> String {
    if paid {
        format!(
            "The Pro plan monthly limit ({} messages) has been reached and translation is paused.\nPlease wait for the next monthly cycle or contact the administrator.",
            limit
        )
    } else {
        format!(
            "Free quota ({} messages per month) is exhausted and translation is paused.\nPurchase below to resume the service.",
            limit
        )
    }
}

pub fn pause_notice_text(paid: bool) -> String {
    if paid {
        "Translation is currently paused. Please try again later or contact the administrator."
            .to_string()
    } else {
        "Translation is currently paused, likely because the free quota was exceeded.\nTo continue, please complete the checkout below."
            .to_string()
    }
}

pub const RATE_LIMIT_MESSAGE: &str = "You have reached the rate limit. Please try again later.";

pub const DIRECT_GREETING: &str =
    "Thanks for adding me! Please invite me into a group so I can help with multilingual translation.";

pub const GROUP_PROMPT_MESSAGE: &str = "I'm a multilingual translation bot. Please tell me the languages you want to translate to.\n\n多言語翻訳ボットです。翻訳したい言語を教えてください。\n\n我是一个多语言翻译机器人。请告诉我你想要翻译成哪些语言。\n\nฉันเป็นบอทแปลหลายภาษา กรุณาบอกฉันว่าคุณต้องการแปลเป็นภาษาใดบ้าง\n\nex) English, 中文, 日本語, ไทย";

pub const LANGUAGE_ANALYSIS_FALLBACK: &str = "ごめんなさい、翻訳する言語の確認に失敗しました。数秒おいてから、翻訳したい言語をカンマ区切りで送ってください。\nSorry, I couldn't detect your languages. Please resend after a few seconds (e.g., English, 日本語, 中文, ไทย).\nขออภัย ไม่สามารถระบุภาษาได้ กรุณาลองส่งมาใหม่อีกครั้ง (ตัวอย่าง: English, 日本語, 中文, ไทย)";

pub const HOWTO_MESSAGE: &str = "After setting your languages, chat in any language. I will translate every message into each configured language.";

pub const UNKNOWN_INSTRUCTION_MESSAGE: &str = "To give me an instruction, mention me again with one of the following:\n- change translation languages\n- how to use\n- pause translation\n- resume translation";
