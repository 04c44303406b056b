//! Target-language text filter
//!
//! Decides whether a recognized string counts as target-language text.
//! The policy is a pluggable predicate; the built-in policies cover
//! Chinese localization checks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Predicate applied to every recognized text
pub trait TextFilter: Send + Sync {
    /// Whether `text` passes the filter
    fn accepts(&self, text: &str) -> bool;

    /// Short name for logs and hit reasons
    fn name(&self) -> &str;
}

/// Built-in filter policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterPolicy {
    /// At least one CJK character and no ASCII letter or digit
    ChineseOnly,
    /// At least one CJK character
    #[default]
    ContainsChinese,
    /// Any non-empty text
    None,
}

impl FilterPolicy {
    /// Infer the policy from an engine language code
    pub fn for_language(language: &str) -> Self {
        match language.to_ascii_lowercase().as_str() {
            "ch" | "zh" | "chinese" | "chinese_cht" | "zh-cn" | "zh-tw" => {
                FilterPolicy::ContainsChinese
            }
            _ => FilterPolicy::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterPolicy::ChineseOnly => "chinese_only",
            FilterPolicy::ContainsChinese => "contains_chinese",
            FilterPolicy::None => "none",
        }
    }
}

impl fmt::Display for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TextFilter for FilterPolicy {
    fn accepts(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        match self {
            FilterPolicy::ChineseOnly => {
                text.chars().any(is_cjk) && !text.chars().any(|c| c.is_ascii_alphanumeric())
            }
            FilterPolicy::ContainsChinese => text.chars().any(is_cjk),
            FilterPolicy::None => true,
        }
    }

    fn name(&self) -> &str {
        self.as_str()
    }
}

/// Whether a character is a CJK unified ideograph
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK Unified Ideographs
        | 0x3400..=0x4DBF    // Extension A
        | 0x20000..=0x2A6DF  // Extension B
        | 0x2A700..=0x2EBEF  // Extensions C-F
        | 0xF900..=0xFAFF    // Compatibility Ideographs
        | 0x2F800..=0x2FA1F  // Compatibility Supplement
    )
}
