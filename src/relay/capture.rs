//! # 载荷捕获
//!
//! 每个方向两个存储槽：有界预览（管理端展示）与无界完整载荷
//! （受 `log_details` 保留期约束）。二进制载荷只留占位说明。

/// 预览上限（码点数）
pub const MAX_PREVIEW_CODE_POINTS: usize = 2048;

/// 单方向的载荷捕获缓冲
#[derive(Debug, Default, Clone)]
pub struct PayloadCapture {
    preview: String,
    preview_truncated: bool,
    full: Vec<String>,
    binary_bytes: Option<usize>,
}

fn truncated_suffix(overflow: usize) -> String {
    format!("… [truncated {overflow} chars]")
}

/// 二进制启发式：UTF-8 非法，或前 256 字节中控制字符超过 10%
fn is_binary_payload(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return true;
    };
    let sample_len = data.len().min(256);
    let sample = &text[..floor_char_boundary(text, sample_len)];
    let mut control_count = 0usize;
    for ch in sample.chars() {
        if ch == '\n' || ch == '\r' || ch == '\t' {
            continue;
        }
        if (ch as u32) < 0x20 {
            control_count += 1;
        }
    }
    control_count > sample_len / 10
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn apply_preview_limit(value: &str) -> (String, bool) {
    let count = value.chars().count();
    if count <= MAX_PREVIEW_CODE_POINTS {
        return (value.to_string(), false);
    }
    let trimmed: String = value.chars().take(MAX_PREVIEW_CODE_POINTS).collect();
    (
        trimmed + &truncated_suffix(count - MAX_PREVIEW_CODE_POINTS),
        true,
    )
}

impl PayloadCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 捕获完整字节载荷；仅首次调用生效
    pub fn capture_bytes(&mut self, data: &[u8]) {
        if data.is_empty() || !self.preview.is_empty() || self.binary_bytes.is_some() {
            return;
        }
        if is_binary_payload(data) {
            self.binary_bytes = Some(data.len());
            return;
        }
        // 二进制检查已保证 UTF-8 合法
        let text = String::from_utf8_lossy(data).into_owned();
        let (preview, truncated) = apply_preview_limit(&text);
        self.preview = preview;
        self.preview_truncated = truncated;
        self.full.push(text);
    }

    /// 捕获字符串载荷；仅首次调用生效
    pub fn capture_string(&mut self, value: &str) {
        if value.is_empty() || !self.preview.is_empty() || self.binary_bytes.is_some() {
            return;
        }
        let (preview, truncated) = apply_preview_limit(value);
        self.preview = preview;
        self.preview_truncated = truncated;
        self.full.push(value.to_string());
    }

    /// 追加一个流式事件块。
    ///
    /// 块先去除首尾空白并丢弃 `[DONE]` 哨兵；完整载荷始终追加，
    /// 预览在截断后不再增长。
    pub fn append_chunk(&mut self, chunk: &str) {
        let chunk = chunk.trim();
        if chunk.is_empty() || chunk == "[DONE]" {
            return;
        }

        if self.preview.is_empty() {
            let (preview, truncated) = apply_preview_limit(chunk);
            self.preview = preview;
            self.preview_truncated = truncated;
            self.full.push(chunk.to_string());
            return;
        }

        if self.preview_truncated {
            self.full.push(chunk.to_string());
            return;
        }

        let existing_count = self.preview.chars().count();
        let chunk_count = chunk.chars().count();
        let total = existing_count + chunk_count;
        if total <= MAX_PREVIEW_CODE_POINTS {
            self.preview.push_str(chunk);
            self.full.push(chunk.to_string());
            return;
        }

        let remaining = MAX_PREVIEW_CODE_POINTS.saturating_sub(existing_count);
        if remaining == 0 {
            self.preview.push_str(&truncated_suffix(chunk_count));
        } else {
            let trimmed: String = chunk.chars().take(remaining).collect();
            self.preview.push_str(&trimmed);
            self.preview
                .push_str(&truncated_suffix(total - MAX_PREVIEW_CODE_POINTS));
        }
        self.preview_truncated = true;
        self.full.push(chunk.to_string());
    }

    /// 预览文本；二进制载荷返回占位说明
    #[must_use]
    pub fn preview(&self) -> Option<String> {
        if let Some(bytes) = self.binary_bytes {
            return Some(format!("[binary payload omitted: {bytes} bytes]"));
        }
        if self.preview.is_empty() {
            None
        } else {
            Some(self.preview.clone())
        }
    }

    /// 完整载荷串联；二进制载荷不存储
    #[must_use]
    pub fn full_payload(&self) -> Option<String> {
        if self.full.is_empty() {
            None
        } else {
            Some(self.full.concat())
        }
    }

    /// 完整载荷的段列表（流式时一段一事件）
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.full
    }
}
