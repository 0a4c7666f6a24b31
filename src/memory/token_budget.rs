//! Token 预算估算
//!
//! 不依赖具体模型的 tokenizer，用字符计数近似；会话裁剪与子智能体摘要截断都基于它。

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

/// 按字符截断，超出时追加截断标记；结果长度不超过 max_chars + 标记长度
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}\n...[truncated]", head.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_chinese() {
        let text = "你好世界，这是一个测试。";
        assert_eq!(TokenEstimator::estimate(text), 8);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        let long = "a".repeat(50);
        let cut = truncate_chars(&long, 10);
        assert!(cut.starts_with(&"a".repeat(10)));
        assert!(cut.ends_with("[truncated]"));
        assert!(!cut.contains(&"a".repeat(11)));
    }
}
